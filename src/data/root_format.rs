//! Minimal ROOT file decoding for 2-D histograms.
//!
//! Only what noise files need is understood:
//!
//! - the file header and the top directory record (small and large seek
//!   variants)
//! - the top directory's key list
//! - object payloads, uncompressed or split into `ZL` (zlib) and `L4` (LZ4)
//!   blocks
//! - `TH2C`, `TH2S`, `TH2I`, `TH2F` and `TH2D` objects, whose bin contents
//!   become an [`Image`]
//!
//! ROOT data is big-endian. Base classes are written with a byte count, so
//! everything between the axes and the bin array is skipped without being
//! interpreted.

use crate::error::CygnoError;
use crate::image::Image;
use bytes::Buf;
use std::io::{Cursor, Read, Seek, SeekFrom};

const MAGIC: &[u8; 4] = b"root";
const BYTE_COUNT_MASK: u32 = 0x4000_0000;
/// Header versions above this use 64-bit seek pointers.
const LARGE_FILE_VERSION: i32 = 1_000_000;
const LARGE_RECORD_VERSION: i16 = 1000;
const COMPRESSION_HEADER: usize = 9;
const LZ4_CHECKSUM: usize = 8;

/// Decoding failure, turned into [`CygnoError::Format`] by the caller.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RootFormatError {
    #[error("not a ROOT file (bad magic)")]
    BadMagic,
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("{0} written without a byte count")]
    MissingByteCount(&'static str),
    #[error("unsupported compression algorithm '{0}'")]
    UnsupportedCompression(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("object of class '{0}' is not a 2-D histogram")]
    UnsupportedClass(String),
    #[error("histogram has {found} cells, expected {expected} for {nx}x{ny} bins")]
    CellCount {
        found: usize,
        expected: usize,
        nx: usize,
        ny: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, RootFormatError>;

/// One entry of a directory's key list.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyHeader {
    pub n_bytes: i32,
    pub obj_len: i32,
    pub key_len: i16,
    pub cycle: i16,
    pub seek_key: i64,
    pub class_name: String,
    pub name: String,
}

impl KeyHeader {
    /// Key label as listed by ROOT tooling, `name;cycle`.
    pub fn label(&self) -> String {
        format!("{};{}", self.name, self.cycle)
    }
}

/// Big-endian reader over an in-memory record.
struct RecordReader<'a> {
    cursor: Cursor<&'a [u8]>,
    what: &'static str,
}

impl<'a> RecordReader<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self {
            cursor: Cursor::new(data),
            what,
        }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.cursor.remaining() < n {
            return Err(RootFormatError::Truncated(self.what));
        }
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.cursor.position()
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.cursor.get_ref().len() as u64 {
            return Err(RootFormatError::Truncated(self.what));
        }
        self.cursor.set_position(pos);
        Ok(())
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.cursor.advance(n);
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.cursor.get_u8())
    }

    fn i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.cursor.get_i16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.cursor.get_u32())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.cursor.get_i32())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.cursor.get_i64())
    }

    /// 32- or 64-bit seek pointer.
    fn seek_ptr(&mut self, large: bool) -> Result<i64> {
        if large {
            self.i64()
        } else {
            self.i32().map(i64::from)
        }
    }

    fn string(&mut self) -> Result<String> {
        let len = match self.u8()? {
            255 => self.i32()? as usize,
            n => n as usize,
        };
        self.need(len)?;
        let mut raw = vec![0u8; len];
        self.cursor.copy_to_slice(&mut raw);
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Read a streamer version header. Returns the version and, when the
    /// object carries a byte count, the position just past it.
    fn version(&mut self) -> Result<(i16, Option<u64>)> {
        let start = self.pos();
        let first = self.u32()?;
        if first & BYTE_COUNT_MASK != 0 {
            let end = self.pos() + u64::from(first & !BYTE_COUNT_MASK);
            Ok((self.i16()?, Some(end)))
        } else {
            self.seek(start)?;
            Ok((self.i16()?, None))
        }
    }

    /// Read a version header and return where the object ends.
    fn counted(&mut self, what: &'static str) -> Result<u64> {
        self.version()?
            .1
            .ok_or(RootFormatError::MissingByteCount(what))
    }

    /// Skip a whole object that carries a byte count.
    fn skip_counted(&mut self, what: &'static str) -> Result<()> {
        let end = self.counted(what)?;
        self.seek(end)
    }

    fn key_header(&mut self) -> Result<KeyHeader> {
        let n_bytes = self.i32()?;
        let version = self.i16()?;
        let obj_len = self.i32()?;
        let _datime = self.u32()?;
        let key_len = self.i16()?;
        let cycle = self.i16()?;
        let large = version > LARGE_RECORD_VERSION;
        let seek_key = self.seek_ptr(large)?;
        let _seek_pdir = self.seek_ptr(large)?;
        let class_name = self.string()?;
        let name = self.string()?;
        let _title = self.string()?;
        Ok(KeyHeader {
            n_bytes,
            obj_len,
            key_len,
            cycle,
            seek_key,
            class_name,
            name,
        })
    }
}

fn read_at<R: Read + Seek>(file: &mut R, pos: i64, len: usize) -> Result<Vec<u8>> {
    let pos = u64::try_from(pos).map_err(|_| RootFormatError::Truncated("seek pointer"))?;
    file.seek(SeekFrom::Start(pos))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)
        .map_err(|_| RootFormatError::Truncated("record"))?;
    Ok(buf)
}

fn record_len(n: i32) -> Result<usize> {
    usize::try_from(n).map_err(|_| RootFormatError::Truncated("record length"))
}

/// Read the top directory's keys, in file order.
pub(crate) fn read_keys<R: Read + Seek>(file: &mut R) -> Result<Vec<KeyHeader>> {
    // Large header: 4 + 4 + 4 + 8 + 8 + 4 + 4 + 4 bytes up to fNbytesName.
    let header = read_at(file, 0, 40).map_err(|_| RootFormatError::BadMagic)?;
    if &header[..4] != MAGIC {
        return Err(RootFormatError::BadMagic);
    }
    let mut r = RecordReader::new(&header, "file header");
    r.skip(4)?;
    let version = r.i32()?;
    let begin = r.i32()?;
    let n_bytes_name = if version >= LARGE_FILE_VERSION {
        r.skip(8 + 8 + 4 + 4)?;
        r.i32()?
    } else {
        r.skip(4 * 4)?;
        r.i32()?
    };

    // TDirectory: version, two datimes, fNbytesKeys, fNbytesName, then
    // fSeekDir, fSeekParent and fSeekKeys.
    let dir_pos = i64::from(begin) + i64::from(n_bytes_name);
    let dir = read_at(file, dir_pos, 2 + 4 * 4 + 3 * 8).or_else(|_| {
        // Small files can end right after a compact directory record.
        read_at(file, dir_pos, 2 + 4 * 4 + 3 * 4)
    })?;
    let mut r = RecordReader::new(&dir, "directory record");
    let dir_version = r.i16()?;
    r.skip(8)?;
    let n_bytes_keys = r.i32()?;
    let _n_bytes_name = r.i32()?;
    let large = dir_version > LARGE_RECORD_VERSION;
    let _seek_dir = r.seek_ptr(large)?;
    let _seek_parent = r.seek_ptr(large)?;
    let seek_keys = r.seek_ptr(large)?;
    if seek_keys == 0 {
        return Ok(Vec::new());
    }

    let list = read_at(file, seek_keys, record_len(n_bytes_keys)?)?;
    let mut r = RecordReader::new(&list, "key list");
    let list_key = r.key_header()?;
    r.seek(list_key.key_len as u64)?;
    let n_keys = r.i32()?;
    (0..n_keys.max(0)).map(|_| r.key_header()).collect()
}

/// Read and decompress the payload of `key`.
pub(crate) fn read_object<R: Read + Seek>(file: &mut R, key: &KeyHeader) -> Result<Vec<u8>> {
    let record = read_at(file, key.seek_key, record_len(key.n_bytes)?)?;
    let key_len = usize::try_from(key.key_len)
        .map_err(|_| RootFormatError::Truncated("key header"))?;
    let payload = record
        .get(key_len..)
        .ok_or(RootFormatError::Truncated("key payload"))?;
    let obj_len = record_len(key.obj_len)?;
    if payload.len() >= obj_len {
        return Ok(payload[..obj_len].to_vec());
    }
    decompress(payload, obj_len)
}

fn u24_le(b: &[u8]) -> usize {
    usize::from(b[0]) | usize::from(b[1]) << 8 | usize::from(b[2]) << 16
}

/// Inflate a sequence of compressed blocks into `obj_len` bytes.
fn decompress(mut data: &[u8], obj_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(obj_len);
    while out.len() < obj_len {
        if data.len() < COMPRESSION_HEADER {
            return Err(RootFormatError::Truncated("compression header"));
        }
        let (header, rest) = data.split_at(COMPRESSION_HEADER);
        let c_size = u24_le(&header[3..6]);
        let u_size = u24_le(&header[6..9]);
        if rest.len() < c_size {
            return Err(RootFormatError::Truncated("compressed block"));
        }
        let (block, rest) = rest.split_at(c_size);
        let inflated = match &header[..2] {
            b"ZL" => {
                let mut buf = Vec::with_capacity(u_size);
                flate2::read::ZlibDecoder::new(block)
                    .read_to_end(&mut buf)
                    .map_err(|e| RootFormatError::Decompress(e.to_string()))?;
                buf
            }
            b"L4" => {
                let body = block
                    .get(LZ4_CHECKSUM..)
                    .ok_or(RootFormatError::Truncated("lz4 block"))?;
                lz4_flex::block::decompress(body, u_size)
                    .map_err(|e| RootFormatError::Decompress(e.to_string()))?
            }
            other => {
                return Err(RootFormatError::UnsupportedCompression(
                    String::from_utf8_lossy(other).into_owned(),
                ))
            }
        };
        if inflated.len() != u_size {
            return Err(RootFormatError::Decompress(format!(
                "block inflated to {} bytes, expected {}",
                inflated.len(),
                u_size
            )));
        }
        out.extend_from_slice(&inflated);
        data = rest;
    }
    out.truncate(obj_len);
    Ok(out)
}

#[derive(Clone, Copy)]
enum BinType {
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl BinType {
    fn for_class(class_name: &str) -> Option<Self> {
        match class_name {
            "TH2C" => Some(BinType::I8),
            "TH2S" => Some(BinType::I16),
            "TH2I" => Some(BinType::I32),
            "TH2F" => Some(BinType::F32),
            "TH2D" => Some(BinType::F64),
            _ => None,
        }
    }

    fn width(self) -> usize {
        match self {
            BinType::I8 => 1,
            BinType::I16 => 2,
            BinType::I32 | BinType::F32 => 4,
            BinType::F64 => 8,
        }
    }
}

/// Read `fNbins` out of a streamed `TAxis`, leaving the reader after it.
fn axis_bins(r: &mut RecordReader<'_>) -> Result<usize> {
    let end = r.counted("TAxis")?;
    r.skip_counted("TNamed")?;
    r.skip_counted("TAttAxis")?;
    let n_bins = r.i32()?;
    r.seek(end)?;
    usize::try_from(n_bins).map_err(|_| RootFormatError::Truncated("axis"))
}

/// Decode a 2-D histogram payload into its in-range bin contents.
///
/// The image has shape `(nx, ny)`: row `i` is x bin `i + 1`, column `j` is
/// y bin `j + 1`. Underflow and overflow bins are dropped.
pub(crate) fn decode_th2(class_name: &str, payload: &[u8]) -> Result<Image> {
    let bin_type = BinType::for_class(class_name)
        .ok_or_else(|| RootFormatError::UnsupportedClass(class_name.to_string()))?;
    let mut r = RecordReader::new(payload, "histogram");

    r.counted("TH2 histogram")?;
    let th2_end = r.counted("TH2")?;
    r.counted("TH1")?;
    r.skip_counted("TNamed")?;
    r.skip_counted("TAttLine")?;
    r.skip_counted("TAttFill")?;
    r.skip_counted("TAttMarker")?;
    let _n_cells = r.i32()?;
    let nx = axis_bins(&mut r)?;
    let ny = axis_bins(&mut r)?;
    r.seek(th2_end)?;

    // TArray base: fN then the cells, no version header.
    let n = usize::try_from(r.i32()?).map_err(|_| RootFormatError::Truncated("bin array"))?;
    let stride = nx + 2;
    let expected = stride * (ny + 2);
    if n != expected {
        return Err(RootFormatError::CellCount {
            found: n,
            expected,
            nx,
            ny,
        });
    }
    r.need(n * bin_type.width())?;

    let cell = |x: usize, y: usize| (x + 1) + stride * (y + 1);
    let image = match bin_type {
        BinType::I8 => {
            let cells: Vec<i16> = (0..n).map(|_| i16::from(r.cursor.get_i8())).collect();
            gather(nx, ny, |x, y| cells[cell(x, y)])?
        }
        BinType::I16 => {
            let cells: Vec<i16> = (0..n).map(|_| r.cursor.get_i16()).collect();
            gather(nx, ny, |x, y| cells[cell(x, y)])?
        }
        BinType::I32 => {
            let cells: Vec<i32> = (0..n).map(|_| r.cursor.get_i32()).collect();
            gather(nx, ny, |x, y| cells[cell(x, y)])?
        }
        BinType::F32 => {
            let cells: Vec<f32> = (0..n).map(|_| r.cursor.get_f32()).collect();
            gather(nx, ny, |x, y| cells[cell(x, y)])?
        }
        BinType::F64 => {
            let cells: Vec<f64> = (0..n).map(|_| r.cursor.get_f64()).collect();
            gather(nx, ny, |x, y| cells[cell(x, y)])?
        }
    };
    Ok(image)
}

fn gather<T: crate::image::Pixel>(
    nx: usize,
    ny: usize,
    at: impl Fn(usize, usize) -> T,
) -> Result<Image> {
    let data = (0..nx)
        .flat_map(|x| (0..ny).map(move |y| (x, y)))
        .map(|(x, y)| at(x, y))
        .collect();
    Image::from_shape_vec((nx, ny), data)
        .map_err(|_| RootFormatError::Truncated("histogram shape"))
}

/// Map a decoding failure onto the crate error for `path`.
pub(crate) fn format_error(path: &std::path::Path, err: RootFormatError) -> CygnoError {
    match err {
        RootFormatError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
            CygnoError::NotFound(path.to_path_buf())
        }
        other => CygnoError::format(path, "root", other),
    }
}


#[cfg(test)]
mod tests {
    use super::fixture::{root_file, Cells, Compression, Hist};
    use super::*;

    fn keys_of(bytes: &[u8]) -> Vec<KeyHeader> {
        read_keys(&mut Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_reads_top_level_keys_in_order() {
        let bytes = root_file(
            &[
                Hist::th2f("pic_run1_ev0", 2, 3, |_, _| 0.0),
                Hist::th2f("pic_run1_ev1", 2, 3, |_, _| 0.0),
            ],
            Compression::None,
        );
        let keys = keys_of(&bytes);
        let labels: Vec<String> = keys.iter().map(KeyHeader::label).collect();
        assert_eq!(labels, vec!["pic_run1_ev0;1", "pic_run1_ev1;1"]);
        assert!(keys.iter().all(|k| k.class_name == "TH2F"));
    }

    #[test]
    fn test_th2_contents_drop_flow_bins() {
        for compression in [Compression::None, Compression::Zlib, Compression::Lz4] {
            let bytes = root_file(
                &[Hist::th2f("h", 3, 2, |x, y| (10 * x + y) as f32)],
                compression,
            );
            let mut cursor = Cursor::new(&bytes[..]);
            let key = read_keys(&mut cursor).unwrap().remove(0);
            let payload = read_object(&mut cursor, &key).unwrap();
            let image = decode_th2(&key.class_name, &payload).unwrap();

            assert_eq!(image.shape(), (3, 2));
            let view = image.view::<f32>().unwrap();
            assert_eq!(view[[0, 0]], 0.0);
            assert_eq!(view[[0, 1]], 1.0);
            assert_eq!(view[[2, 0]], 20.0);
            assert_eq!(view[[2, 1]], 21.0);
            assert_eq!(image.sum(), 0.0 + 1.0 + 10.0 + 11.0 + 20.0 + 21.0);
        }
    }

    #[test]
    fn test_th2d_and_th2s_keep_bin_type() {
        let cells = |v: f64| vec![v; 4 * 4];
        let bytes = root_file(
            &[
                Hist {
                    name: "d".into(),
                    nx: 2,
                    ny: 2,
                    cells: Cells::F64(cells(2.5)),
                },
                Hist {
                    name: "s".into(),
                    nx: 2,
                    ny: 2,
                    cells: Cells::I16(vec![3; 16]),
                },
            ],
            Compression::Zlib,
        );
        let mut cursor = Cursor::new(&bytes[..]);
        let keys = read_keys(&mut cursor).unwrap();

        let d = decode_th2(&keys[0].class_name, &read_object(&mut cursor, &keys[0]).unwrap())
            .unwrap();
        assert_eq!(d.dtype(), crate::image::Dtype::F64);
        assert_eq!(d.sum(), 10.0);

        let s = decode_th2(&keys[1].class_name, &read_object(&mut cursor, &keys[1]).unwrap())
            .unwrap();
        assert_eq!(s.dtype(), crate::image::Dtype::I16);
        assert_eq!(s.sum(), 12.0);
    }

    #[test]
    fn test_rejects_non_histogram_class() {
        let err = decode_th2("TTree", &[]).unwrap_err();
        assert!(matches!(err, RootFormatError::UnsupportedClass(c) if c == "TTree"));
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let err = read_keys(&mut Cursor::new(&b"no ROOT magic here"[..])).unwrap_err();
        assert!(matches!(err, RootFormatError::BadMagic));

        let bytes = root_file(&[Hist::th2f("h", 2, 2, |_, _| 1.0)], Compression::None);
        let mut cursor = Cursor::new(&bytes[..]);
        let key = read_keys(&mut cursor).unwrap().remove(0);
        let payload = read_object(&mut cursor, &key).unwrap();
        let err = decode_th2("TH2F", &payload[..payload.len() - 3]).unwrap_err();
        assert!(matches!(err, RootFormatError::Truncated(_)));
    }

    #[test]
    fn test_unsupported_compression() {
        let mut block = b"ZS\x05".to_vec();
        block.extend([4, 0, 0, 16, 0, 0, 1, 2, 3, 4]);
        let err = decompress(&block, 16).unwrap_err();
        assert!(matches!(err, RootFormatError::UnsupportedCompression(a) if a == "ZS"));
    }
}
