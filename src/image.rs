//! Image primitive for detector frames.
//!
//! An [`Image`] is a 2-D intensity grid tagged with its element type. Like the
//! DAQ `PixelBuffer`, it keeps native formats (`i16`/`u16` camera counts) and
//! only widens when an operation needs it. Every augmentation returns a new
//! image and never touches the source.
//!
//! Axis convention: axis 0 is `x` (rows), axis 1 is `y` (columns), so
//! `cut_edges(xmin, xmax, ymin, ymax)` selects `[xmin..xmax, ymin..ymax]`.

use crate::error::{CygnoError, CygnoResult};
use ndarray::{s, Array2, ArrayView2, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// 8-bit unsigned integer
    U8,
    /// 16-bit signed integer (simulation output)
    I16,
    /// 16-bit unsigned integer (camera counts)
    U16,
    /// 32-bit signed integer
    I32,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl Dtype {
    /// Smallest type able to hold the sum of `self` and `other` elements.
    ///
    /// Follows the usual numeric promotion rules: `i16 + u16 -> i32`,
    /// `i32 + f32 -> f64`, integers mixed with `f32` otherwise go to `f32`.
    pub fn promote(self, other: Dtype) -> Dtype {
        use Dtype::*;
        if self == other {
            return self;
        }
        match (self, other) {
            (F64, _) | (_, F64) => F64,
            (F32, I32) | (I32, F32) => F64,
            (F32, _) | (_, F32) => F32,
            (I32, _) | (_, I32) => I32,
            (I16, U16) | (U16, I16) => I32,
            (U8, wider) | (wider, U8) => wider,
            _ => F64,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Dtype::U8 => "u8",
            Dtype::I16 => "i16",
            Dtype::U16 => "u16",
            Dtype::I32 => "i32",
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
        };
        write!(f, "{}", label)
    }
}

/// Scalar element that can live inside an [`Image`].
pub trait Pixel: Copy + PartialOrd + Default + Send + Sync + fmt::Debug + 'static {
    /// Runtime tag for this element type.
    const DTYPE: Dtype;

    /// Lossless (or nearest) conversion to `f64`.
    fn to_f64(self) -> f64;

    /// Conversion from `f64` with `as` semantics (truncating, saturating).
    fn from_f64(value: f64) -> Self;

    /// Addition that saturates for integer types.
    fn add_saturating(self, rhs: Self) -> Self;

    /// Wrap a typed array into the tagged storage.
    fn into_pixels(array: Array2<Self>) -> PixelArray;

    /// Borrow the typed array if the tag matches.
    fn view(pixels: &PixelArray) -> Option<ArrayView2<'_, Self>>;
}

macro_rules! impl_pixel {
    (@common $t:ty, $variant:ident) => {
        impl From<Array2<$t>> for Image {
            fn from(array: Array2<$t>) -> Self {
                Image::new(array)
            }
        }
    };
    ($t:ty, $variant:ident, int) => {
        impl_pixel!(@common $t, $variant);
        impl Pixel for $t {
            const DTYPE: Dtype = Dtype::$variant;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(value: f64) -> Self {
                value as $t
            }
            fn add_saturating(self, rhs: Self) -> Self {
                self.saturating_add(rhs)
            }
            fn into_pixels(array: Array2<Self>) -> PixelArray {
                PixelArray::$variant(array)
            }
            fn view(pixels: &PixelArray) -> Option<ArrayView2<'_, Self>> {
                match pixels {
                    PixelArray::$variant(a) => Some(a.view()),
                    _ => None,
                }
            }
        }
    };
    ($t:ty, $variant:ident, float) => {
        impl_pixel!(@common $t, $variant);
        impl Pixel for $t {
            const DTYPE: Dtype = Dtype::$variant;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(value: f64) -> Self {
                value as $t
            }
            fn add_saturating(self, rhs: Self) -> Self {
                self + rhs
            }
            fn into_pixels(array: Array2<Self>) -> PixelArray {
                PixelArray::$variant(array)
            }
            fn view(pixels: &PixelArray) -> Option<ArrayView2<'_, Self>> {
                match pixels {
                    PixelArray::$variant(a) => Some(a.view()),
                    _ => None,
                }
            }
        }
    };
}

impl_pixel!(u8, U8, int);
impl_pixel!(i16, I16, int);
impl_pixel!(u16, U16, int);
impl_pixel!(i32, I32, int);
impl_pixel!(f32, F32, float);
impl_pixel!(f64, F64, float);

/// Dtype-tagged 2-D pixel storage.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelArray {
    /// 8-bit unsigned pixels
    U8(Array2<u8>),
    /// 16-bit signed pixels
    I16(Array2<i16>),
    /// 16-bit unsigned pixels
    U16(Array2<u16>),
    /// 32-bit signed pixels
    I32(Array2<i32>),
    /// 32-bit float pixels
    F32(Array2<f32>),
    /// 64-bit float pixels
    F64(Array2<f64>),
}

/// Run `$body` with `$arr` bound to the typed array, whatever the dtype.
macro_rules! dispatch {
    ($pixels:expr, $arr:ident => $body:expr) => {
        match $pixels {
            PixelArray::U8($arr) => $body,
            PixelArray::I16($arr) => $body,
            PixelArray::U16($arr) => $body,
            PixelArray::I32($arr) => $body,
            PixelArray::F32($arr) => $body,
            PixelArray::F64($arr) => $body,
        }
    };
}
#[cfg(feature = "storage_hdf5")]
pub(crate) use dispatch;

fn wrap<T: Pixel>(array: Array2<T>) -> PixelArray {
    T::into_pixels(array)
}

/// Rectangular bounding box `[xmin, xmax) x [ymin, ymax)` applied to every
/// image entering a composite sum.
///
/// Serializes as the 4-element list `[xmin, xmax, ymin, ymax]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[usize; 4]", into = "[usize; 4]")]
pub struct CropBox {
    /// First row (inclusive)
    pub xmin: usize,
    /// Last row (exclusive)
    pub xmax: usize,
    /// First column (inclusive)
    pub ymin: usize,
    /// Last column (exclusive)
    pub ymax: usize,
}

impl CropBox {
    /// Create a crop box from its four edges.
    pub fn new(xmin: usize, xmax: usize, ymin: usize, ymax: usize) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// `(rows, cols)` of an image cropped by this box, assuming it fits.
    pub fn shape(&self) -> (usize, usize) {
        (
            self.xmax.saturating_sub(self.xmin),
            self.ymax.saturating_sub(self.ymin),
        )
    }

    /// True when either axis has `max < min`.
    pub fn is_inverted(&self) -> bool {
        self.xmax < self.xmin || self.ymax < self.ymin
    }
}

impl From<[usize; 4]> for CropBox {
    fn from(edges: [usize; 4]) -> Self {
        Self::new(edges[0], edges[1], edges[2], edges[3])
    }
}

impl From<CropBox> for [usize; 4] {
    fn from(crop: CropBox) -> Self {
        [crop.xmin, crop.xmax, crop.ymin, crop.ymax]
    }
}

/// A materialized detector image.
///
/// Images are extracted from a file accessor (never a live file handle) and
/// consumed immutably by the augmentation operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: PixelArray,
}

impl Image {
    /// Wrap a typed 2-D array.
    pub fn new<T: Pixel>(array: Array2<T>) -> Self {
        Self { pixels: wrap(array) }
    }

    /// Build an image from row-major data.
    pub fn from_shape_vec<T: Pixel>(shape: (usize, usize), data: Vec<T>) -> CygnoResult<Self> {
        let len = data.len();
        Array2::from_shape_vec(shape, data)
            .map(Self::new)
            .map_err(|e| {
                CygnoError::Domain(format!(
                    "cannot shape {} values as {}x{}: {}",
                    len, shape.0, shape.1, e
                ))
            })
    }

    /// All-zero image of the given shape and type.
    pub fn zeros(shape: (usize, usize), dtype: Dtype) -> Self {
        Self::from_f64_array(Array2::zeros(shape), dtype)
    }

    fn from_f64_array(array: Array2<f64>, dtype: Dtype) -> Self {
        let pixels = match dtype {
            Dtype::U8 => wrap(array.mapv(<u8 as Pixel>::from_f64)),
            Dtype::I16 => wrap(array.mapv(<i16 as Pixel>::from_f64)),
            Dtype::U16 => wrap(array.mapv(<u16 as Pixel>::from_f64)),
            Dtype::I32 => wrap(array.mapv(<i32 as Pixel>::from_f64)),
            Dtype::F32 => wrap(array.mapv(<f32 as Pixel>::from_f64)),
            Dtype::F64 => wrap(array),
        };
        Self { pixels }
    }

    /// Tagged pixel storage.
    pub fn pixels(&self) -> &PixelArray {
        &self.pixels
    }

    /// Consume the image and return its storage.
    pub fn into_pixels(self) -> PixelArray {
        self.pixels
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        dispatch!(&self.pixels, a => a.dim())
    }

    /// Element type.
    pub fn dtype(&self) -> Dtype {
        match &self.pixels {
            PixelArray::U8(_) => Dtype::U8,
            PixelArray::I16(_) => Dtype::I16,
            PixelArray::U16(_) => Dtype::U16,
            PixelArray::I32(_) => Dtype::I32,
            PixelArray::F32(_) => Dtype::F32,
            PixelArray::F64(_) => Dtype::F64,
        }
    }

    /// Borrow the typed array, or `None` if `T` is not the image's dtype.
    pub fn view<T: Pixel>(&self) -> Option<ArrayView2<'_, T>> {
        T::view(&self.pixels)
    }

    /// Copy of the pixels widened to `f64`.
    pub fn to_f64(&self) -> Array2<f64> {
        dispatch!(&self.pixels, a => a.mapv(|v| v.to_f64()))
    }

    /// Sum of all pixel values.
    pub fn sum(&self) -> f64 {
        dispatch!(&self.pixels, a => a.iter().map(|v| v.to_f64()).sum::<f64>())
    }

    /// Convert to another element type with `as` semantics.
    pub fn cast(&self, dtype: Dtype) -> Image {
        if dtype == self.dtype() {
            return self.clone();
        }
        Self::from_f64_array(self.to_f64(), dtype)
    }

    /// Shift every strictly positive pixel by `(dx, dy)`.
    ///
    /// Destinations are clamped to the image edges, so pixels pushed past a
    /// border pile up on it. Sources are visited in row-major order and the
    /// later write wins on a collision. Pixels `<= 0` never move and the
    /// background is zero.
    pub fn translate(&self, dx: isize, dy: isize) -> Image {
        let pixels = dispatch!(&self.pixels, a => wrap(translate_array(a, dx, dy)));
        Image { pixels }
    }

    /// Translate by offsets drawn uniformly from `[-max_shift, max_shift)`.
    ///
    /// The x offset is drawn first. `max_shift == 0` draws nothing and
    /// returns an unchanged copy.
    pub fn random_translate<R: Rng + ?Sized>(&self, max_shift: usize, rng: &mut R) -> Image {
        if max_shift == 0 {
            return self.clone();
        }
        let bound = max_shift as isize;
        let dx = rng.gen_range(-bound..bound);
        let dy = rng.gen_range(-bound..bound);
        self.translate(dx, dy)
    }

    /// Sub-region `[xmin..xmax, ymin..ymax]`.
    ///
    /// Bounds are clamped to the image like array slicing: an edge past the
    /// end stops at the end, and `max < min` gives an empty axis. This never
    /// fails; callers that need an exact shape compare against
    /// [`CropBox::shape`].
    pub fn cut_edges(&self, xmin: usize, xmax: usize, ymin: usize, ymax: usize) -> Image {
        let (rows, cols) = self.shape();
        let x0 = xmin.min(rows);
        let x1 = xmax.min(rows).max(x0);
        let y0 = ymin.min(cols);
        let y1 = ymax.min(cols).max(y0);
        let pixels = dispatch!(&self.pixels, a => wrap(a.slice(s![x0..x1, y0..y1]).to_owned()));
        Image { pixels }
    }

    /// [`cut_edges`](Self::cut_edges) with a [`CropBox`].
    pub fn crop(&self, crop: &CropBox) -> Image {
        self.cut_edges(crop.xmin, crop.xmax, crop.ymin, crop.ymax)
    }

    /// Clip to `[imin, imax]`, rescale to `[0, 1]` and cast to `dtype`.
    ///
    /// Integer targets truncate, so only values at `imax` survive as `1`.
    pub fn scale(&self, imin: f64, imax: f64, dtype: Dtype) -> CygnoResult<Image> {
        if !imin.is_finite() || !imax.is_finite() {
            return Err(CygnoError::Domain(format!(
                "scale bounds must be finite, got [{}, {}]",
                imin, imax
            )));
        }
        if imax <= imin {
            return Err(CygnoError::Domain(format!(
                "scale requires imax > imin, got [{}, {}]",
                imin, imax
            )));
        }
        let span = imax - imin;
        let scaled = self.to_f64().mapv(|v| (v.clamp(imin, imax) - imin) / span);
        Ok(Self::from_f64_array(scaled, dtype))
    }

    /// Rotate by `k * 90` degrees counter-clockwise.
    pub fn rotate90(&self, k: usize) -> Image {
        let pixels = dispatch!(&self.pixels, a => wrap(rotate_array(a, k)));
        Image { pixels }
    }

    /// Rotate by 0, 90 or 180 degrees, chosen uniformly.
    pub fn random_rotate<R: Rng + ?Sized>(&self, rng: &mut R) -> Image {
        self.rotate90(rng.gen_range(0..3))
    }

    /// Element-wise sum with dtype promotion.
    pub fn try_add(&self, other: &Image) -> CygnoResult<Image> {
        if self.shape() != other.shape() {
            return Err(CygnoError::ShapeMismatch {
                expected: self.shape(),
                found: other.shape(),
            });
        }
        let dtype = self.dtype().promote(other.dtype());
        let lhs = self.cast(dtype);
        let rhs = other.cast(dtype);
        let pixels = match (&lhs.pixels, &rhs.pixels) {
            (PixelArray::U8(a), PixelArray::U8(b)) => wrap(add_arrays(a, b)),
            (PixelArray::I16(a), PixelArray::I16(b)) => wrap(add_arrays(a, b)),
            (PixelArray::U16(a), PixelArray::U16(b)) => wrap(add_arrays(a, b)),
            (PixelArray::I32(a), PixelArray::I32(b)) => wrap(add_arrays(a, b)),
            (PixelArray::F32(a), PixelArray::F32(b)) => wrap(add_arrays(a, b)),
            (PixelArray::F64(a), PixelArray::F64(b)) => wrap(add_arrays(a, b)),
            _ => {
                return Err(CygnoError::Domain(format!(
                    "cannot add {} and {} images",
                    lhs.dtype(),
                    rhs.dtype()
                )))
            }
        };
        Ok(Image { pixels })
    }
}

/// Element-wise sum of a non-empty sequence of images.
pub fn sum_images<I>(images: I) -> CygnoResult<Image>
where
    I: IntoIterator<Item = Image>,
{
    let mut iter = images.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| CygnoError::Domain("cannot sum an empty image list".to_string()))?;
    iter.try_fold(first, |acc, img| acc.try_add(&img))
}

fn clamp_index(index: usize, shift: isize, len: usize) -> usize {
    (index as isize + shift).clamp(0, len as isize - 1) as usize
}

fn translate_array<T: Pixel>(src: &Array2<T>, dx: isize, dy: isize) -> Array2<T> {
    let (rows, cols) = src.dim();
    let mut out = Array2::<T>::default((rows, cols));
    if rows == 0 || cols == 0 {
        return out;
    }
    let zero = T::default();
    for ((x, y), &value) in src.indexed_iter() {
        if value > zero {
            out[[clamp_index(x, dx, rows), clamp_index(y, dy, cols)]] = value;
        }
    }
    out
}

fn rotate_array<T: Pixel>(src: &Array2<T>, k: usize) -> Array2<T> {
    match k % 4 {
        0 => src.clone(),
        1 => src.slice(s![.., ..;-1]).reversed_axes().to_owned(),
        2 => src.slice(s![..;-1, ..;-1]).to_owned(),
        _ => src.t().slice(s![.., ..;-1]).to_owned(),
    }
}

fn add_arrays<T: Pixel>(a: &Array2<T>, b: &Array2<T>) -> Array2<T> {
    Zip::from(a).and(b).map_collect(|&x, &y| x.add_saturating(y))
}
