//! Concurrent composite-event synthesis.
//!
//! One synthesis task builds one training sample:
//!
//! 1. draw `k` from `[1, max_signal_count)`
//! 2. draw `k` signal aliases (with replacement) and one noise alias
//! 3. for each signal alias read a frame at a random valid index, translate
//!    it randomly, crop it
//! 4. read one noise frame at a random valid index and crop it
//! 5. sum everything element-wise
//!
//! [`synthesize_events`] runs `event_count` tasks on the tokio blocking pool,
//! bounded by a semaphore, and labels results `part-0000000`, `part-0000001`,
//! ... in completion order (or submission order, see [`PartitionOrder`]).
//!
//! # Randomness
//!
//! Every task owns a [`ChaCha8Rng`]. With a seed, task `i` uses stream `i` of
//! that seed, so each task's draws are reproducible regardless of thread
//! scheduling. Without a seed each task seeds from OS entropy.
//!
//! # Failure
//!
//! The first failing task aborts the batch: the shared cancel flag is raised,
//! pending tasks are aborted and the error is returned. No partial batch is
//! produced.

use crate::data::collection::Collection;
use crate::error::{CygnoError, CygnoResult};
use crate::image::{CropBox, Image};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// How partition ids are assigned to finished tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionOrder {
    /// In the order tasks finish.
    #[default]
    Completion,
    /// In the order tasks were submitted.
    Submission,
}

/// Parameters of one synthesis batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisParams {
    /// Exclusive upper bound on signal frames per sample; must be at least 2.
    pub max_signal_count: usize,
    /// Frame indexes that may be drawn from a signal file.
    pub valid_signal_indexes: Vec<usize>,
    /// Frame indexes that may be drawn from a noise file.
    pub valid_noise_indexes: Vec<usize>,
    /// Number of samples to produce.
    pub event_count: usize,
    /// Translation offsets are drawn from `[-max_translation, max_translation)`.
    pub max_translation: usize,
    /// Crop applied to every frame before summation.
    pub crop_box: CropBox,
    /// Base seed; `None` seeds every task from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Partition id assignment order.
    #[serde(default)]
    pub ordering: PartitionOrder,
    /// Concurrent tasks; `None` uses the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,
}

impl SynthesisParams {
    /// Set the base seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the partition order.
    pub fn with_ordering(mut self, ordering: PartitionOrder) -> Self {
        self.ordering = ordering;
        self
    }

    /// Bound the number of concurrent tasks.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Worker pool size for this batch.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        })
    }

    /// Check the parameters alone.
    pub fn validate(&self) -> CygnoResult<()> {
        if self.max_signal_count < 2 {
            return Err(CygnoError::Configuration(format!(
                "max_signal_count must be at least 2 (got {})",
                self.max_signal_count
            )));
        }
        if self.valid_signal_indexes.is_empty() {
            return Err(CygnoError::Configuration(
                "valid_signal_indexes cannot be empty".to_string(),
            ));
        }
        if self.valid_noise_indexes.is_empty() {
            return Err(CygnoError::Configuration(
                "valid_noise_indexes cannot be empty".to_string(),
            ));
        }
        if self.crop_box.is_inverted() {
            return Err(CygnoError::Configuration(format!(
                "crop box {:?} is inverted",
                <[usize; 4]>::from(self.crop_box)
            )));
        }
        if self.workers == Some(0) {
            return Err(CygnoError::Configuration(
                "workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Check the parameters against the collections they will sample.
    pub fn validate_for(&self, signal: &Collection, noise: &Collection) -> CygnoResult<()> {
        self.validate()?;
        for (role, collection) in [("signal", signal), ("noise", noise)] {
            if collection.is_empty() {
                return Err(CygnoError::Configuration(format!(
                    "{} collection at {} has no aliases",
                    role,
                    collection.directory().display()
                )));
            }
        }
        Ok(())
    }
}

/// Cooperative cancellation shared between a batch and its tasks.
///
/// A flag created with [`child`](Self::child) also reports its parent's
/// cancellation, but cancelling the child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelFlag {
    /// Fresh, un-cancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.own.store(true, Ordering::Release);
    }

    /// Whether this flag or its parent was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::Acquire))
    }

    /// Flag that observes `self` but can be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.own)),
        }
    }

    fn check(&self) -> CygnoResult<()> {
        if self.is_cancelled() {
            Err(CygnoError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Partition id for the `n`-th result: `part-` plus 7 zero-padded digits.
pub fn partition_id(n: usize) -> String {
    format!("part-{:07}", n)
}

/// Endless sequence of partition ids starting at `part-0000000`.
#[derive(Debug, Clone, Default)]
pub struct PartitionIds {
    next: usize,
}

impl PartitionIds {
    /// Sequence starting at `start`.
    pub fn starting_at(start: usize) -> Self {
        Self { next: start }
    }
}

impl Iterator for PartitionIds {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let id = partition_id(self.next);
        self.next += 1;
        Some(id)
    }
}

/// One synthesized sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// `part-NNNNNNN`.
    pub id: String,
    /// Position of the task in submission order.
    pub submission_index: usize,
    /// Composite image.
    pub image: Image,
}

/// Ordered result of a synthesis batch.
#[derive(Debug, Clone, Default)]
pub struct SampleBatch {
    partitions: Vec<Partition>,
}

impl SampleBatch {
    /// Label `(submission_index, image)` pairs `part-0000000`, ... in the
    /// order given.
    pub fn from_results(results: Vec<(usize, Image)>) -> Self {
        let partitions = results
            .into_iter()
            .zip(PartitionIds::default())
            .map(|((submission_index, image), id)| Partition {
                id,
                submission_index,
                image,
            })
            .collect();
        Self { partitions }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// True if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Image stored under partition `id`.
    pub fn get(&self, id: &str) -> Option<&Image> {
        self.partitions
            .iter()
            .find(|p| p.id == id)
            .map(|p| &p.image)
    }

    /// Partitions in id order.
    pub fn iter(&self) -> std::slice::Iter<'_, Partition> {
        self.partitions.iter()
    }

    /// Partition ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.partitions.iter().map(|p| p.id.as_str())
    }

    /// Drop the bookkeeping and keep `id → image`.
    pub fn into_map(self) -> BTreeMap<String, Image> {
        self.partitions
            .into_iter()
            .map(|p| (p.id, p.image))
            .collect()
    }
}

impl IntoIterator for SampleBatch {
    type Item = Partition;
    type IntoIter = std::vec::IntoIter<Partition>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.into_iter()
    }
}

impl<'a> IntoIterator for &'a SampleBatch {
    type Item = &'a Partition;
    type IntoIter = std::slice::Iter<'a, Partition>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.iter()
    }
}

/// Generator for the task at `index`.
pub fn task_rng(seed: Option<u64>, index: usize) -> ChaCha8Rng {
    match seed {
        Some(seed) => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(index as u64);
            rng
        }
        None => ChaCha8Rng::from_entropy(),
    }
}

fn pick<'a, T, R: Rng + ?Sized>(items: &'a [T], rng: &mut R, what: &str) -> CygnoResult<&'a T> {
    items
        .choose(rng)
        .ok_or_else(|| CygnoError::Configuration(format!("no {} to choose from", what)))
}

/// Build one composite sample.
///
/// Blocking: reads frames through the collections' accessors.
///
/// # Errors
///
/// Lookup and I/O errors from the collections, [`CygnoError::ShapeMismatch`]
/// if the cropped frames differ in shape, [`CygnoError::Cancelled`] if
/// `cancel` is raised between steps.
pub fn synthesize_one<R: Rng + ?Sized>(
    signal: &Collection,
    noise: &Collection,
    params: &SynthesisParams,
    rng: &mut R,
    cancel: &CancelFlag,
) -> CygnoResult<Image> {
    let count = rng.gen_range(1..params.max_signal_count);
    let signal_aliases = (0..count)
        .map(|_| pick(signal.aliases(), rng, "signal aliases"))
        .collect::<CygnoResult<Vec<_>>>()?;
    let noise_alias = pick(noise.aliases(), rng, "noise aliases")?;

    let mut total: Option<Image> = None;
    for alias in signal_aliases {
        cancel.check()?;
        let index = *pick(&params.valid_signal_indexes, rng, "signal indexes")?;
        let frame = signal
            .get(alias)?
            .get_by_index(index)?
            .random_translate(params.max_translation, rng)
            .crop(&params.crop_box);
        total = Some(match total {
            Some(acc) => acc.try_add(&frame)?,
            None => frame,
        });
    }

    cancel.check()?;
    let index = *pick(&params.valid_noise_indexes, rng, "noise indexes")?;
    let background = noise
        .get(noise_alias)?
        .get_by_index(index)?
        .crop(&params.crop_box);

    match total {
        Some(acc) => acc.try_add(&background),
        None => Ok(background),
    }
}

/// Synthesize `params.event_count` samples concurrently.
///
/// # Errors
///
/// [`CygnoError::Configuration`] for invalid parameters, before any task
/// starts. Otherwise the first task error.
pub async fn synthesize_events(
    signal: Arc<Collection>,
    noise: Arc<Collection>,
    params: SynthesisParams,
) -> CygnoResult<SampleBatch> {
    synthesize_events_with_cancel(signal, noise, params, CancelFlag::new()).await
}

/// [`synthesize_events`] that also stops when `cancel` is raised.
pub async fn synthesize_events_with_cancel(
    signal: Arc<Collection>,
    noise: Arc<Collection>,
    params: SynthesisParams,
    cancel: CancelFlag,
) -> CygnoResult<SampleBatch> {
    params.validate_for(&signal, &noise)?;

    let workers = params.worker_count();
    let event_count = params.event_count;
    let ordering = params.ordering;
    let started = Instant::now();
    info!(
        events = event_count,
        workers,
        seed = ?params.seed,
        ?ordering,
        "Starting synthesis batch"
    );

    let batch_cancel = cancel.child();
    let semaphore = Arc::new(Semaphore::new(workers));
    let params = Arc::new(params);
    let mut tasks = JoinSet::new();

    for index in 0..event_count {
        let signal = Arc::clone(&signal);
        let noise = Arc::clone(&noise);
        let params = Arc::clone(&params);
        let cancel = batch_cancel.clone();
        let semaphore = Arc::clone(&semaphore);

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| CygnoError::Task(e.to_string()))?;
            cancel.check()?;
            let image = tokio::task::spawn_blocking(move || {
                let mut rng = task_rng(params.seed, index);
                synthesize_one(&signal, &noise, &params, &mut rng, &cancel)
            })
            .await
            .map_err(|e| CygnoError::Task(e.to_string()))??;
            Ok::<_, CygnoError>((index, image))
        });
    }

    let mut completed: Vec<(usize, Image)> = Vec::with_capacity(event_count);
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| CygnoError::Task(e.to_string()))
            .and_then(|result| result);
        match outcome {
            Ok((index, image)) => {
                debug!(
                    submission_index = index,
                    completed = completed.len() + 1,
                    "Synthesis task finished"
                );
                completed.push((index, image));
            }
            Err(err) => {
                batch_cancel.cancel();
                tasks.abort_all();
                error!(
                    error = %err,
                    completed = completed.len(),
                    events = event_count,
                    "Synthesis task failed, aborting batch"
                );
                return Err(err);
            }
        }
    }

    if ordering == PartitionOrder::Submission {
        completed.sort_by_key(|(index, _)| *index);
    }
    let batch = SampleBatch::from_results(completed);
    info!(
        events = batch.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Synthesis batch complete"
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::accessor::FileFormat;
    use crate::data::collection::{AliasScheme, CollisionPolicy};
    use crate::data::memory::MemoryOpener;
    use crate::image::Dtype;
    use ndarray::Array2;
    use std::path::Path;

    fn params() -> SynthesisParams {
        SynthesisParams {
            max_signal_count: 3,
            valid_signal_indexes: vec![0, 1],
            valid_noise_indexes: vec![0],
            event_count: 4,
            max_translation: 1,
            crop_box: CropBox::new(0, 4, 0, 4),
            seed: None,
            ordering: PartitionOrder::Completion,
            workers: None,
        }
    }

    /// ROOT layouts are scanned from `<tmp>/01_raw`, so `rel` starts at the
    /// `fusion` / `quest` level.
    fn collection(format: FileFormat, files: &[(&str, Vec<Image>)]) -> (tempfile::TempDir, Collection) {
        let dir = tempfile::tempdir().unwrap();
        let root = match format {
            FileFormat::Root => dir.path().join("01_raw"),
            FileFormat::Hdf5 => dir.path().to_path_buf(),
        };
        let opener = Arc::new(MemoryOpener::new(format));
        for (rel, images) in files {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"").unwrap();
            let entries = images
                .iter()
                .enumerate()
                .map(|(i, img)| (format!("evt_{i}"), img.clone()))
                .collect();
            opener.insert(&path, entries);
        }
        let collection = Collection::build_with(
            &root,
            &AliasScheme::for_format(format, None, None).unwrap(),
            opener,
            CollisionPolicy::LastWins,
        )
        .unwrap();
        (dir, collection)
    }

    fn spot(value: i16) -> Image {
        let mut a = Array2::<i16>::zeros((4, 4));
        a[[1, 2]] = value;
        Image::new(a)
    }

    #[test]
    fn test_partition_ids() {
        assert_eq!(partition_id(0), "part-0000000");
        assert_eq!(partition_id(1234567), "part-1234567");
        let ids: Vec<String> = PartitionIds::starting_at(9).take(2).collect();
        assert_eq!(ids, vec!["part-0000009", "part-0000010"]);
    }

    #[test]
    fn test_validation() {
        let mut p = params();
        p.max_signal_count = 1;
        assert!(matches!(p.validate(), Err(CygnoError::Configuration(_))));

        let mut p = params();
        p.valid_noise_indexes.clear();
        assert!(p.validate().is_err());

        let mut p = params();
        p.crop_box = CropBox::new(3, 1, 0, 4);
        assert!(p.validate().is_err());

        assert!(params().with_workers(0).validate().is_err());
        assert!(params().validate().is_ok());
    }

    #[test]
    fn test_cancel_flag_child() {
        let parent = CancelFlag::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_same_seed_same_sample() {
        let (_s, signal) = collection(
            FileFormat::Hdf5,
            &[
                ("sim/ER_6_keV.h5", vec![spot(5), spot(7)]),
                ("sim/NR_20_keV.h5", vec![spot(11), spot(13)]),
            ],
        );
        let (_n, noise) = collection(
            FileFormat::Root,
            &[("fusion/histograms_Run1.root", vec![Image::zeros((4, 4), Dtype::I16)])],
        );
        assert_eq!(noise.aliases(), &["run1".to_string()]);
        let p = params();
        let cancel = CancelFlag::new();

        let a = synthesize_one(&signal, &noise, &p, &mut task_rng(Some(42), 3), &cancel).unwrap();
        let b = synthesize_one(&signal, &noise, &p, &mut task_rng(Some(42), 3), &cancel).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.shape(), (4, 4));
        // Translation moves pixels but never creates intensity.
        assert!(a.sum() >= 5.0);
    }

    #[test]
    fn test_cancelled_before_reading() {
        let (_s, signal) = collection(FileFormat::Hdf5, &[("sim/ER_6_keV.h5", vec![spot(5), spot(5)])]);
        let (_n, noise) = collection(
            FileFormat::Root,
            &[("quest/Run2.root", vec![Image::zeros((4, 4), Dtype::I16)])],
        );
        assert_eq!(noise.len(), 1);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = synthesize_one(&signal, &noise, &params(), &mut task_rng(Some(1), 0), &cancel)
            .unwrap_err();
        assert!(matches!(err, CygnoError::Cancelled));
        assert!(signal.path_of("er_6").is_some_and(Path::exists));
        assert_eq!(signal.opened_count(), 0);
    }

    #[test]
    fn test_batch_helpers() {
        let batch = SampleBatch::from_results(vec![
            (2, Image::zeros((1, 1), Dtype::F32)),
            (0, Image::zeros((2, 2), Dtype::F32)),
        ]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.ids().collect::<Vec<_>>(), vec!["part-0000000", "part-0000001"]);
        assert_eq!(batch.iter().next().unwrap().submission_index, 2);
        assert_eq!(batch.get("part-0000001").unwrap().shape(), (2, 2));
        assert!(batch.get("part-0000002").is_none());
        let map = batch.into_map();
        assert_eq!(map.len(), 2);
    }
}
