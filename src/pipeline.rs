//! Config-driven generation of named splits.
//!
//! [`Generator`] owns the two collections described by a
//! [`GenerationConfig`] and runs one synthesis batch per split. Collections
//! are built once and shared by all splits, so a file opened for `train` is
//! not reopened for `test`. When an `[output]` section is configured each
//! batch is written to `<directory>/<split>.h5`.

use crate::config::GenerationConfig;
use crate::data::accessor::SourceOpener;
use crate::data::collection::Collection;
use crate::error::{CygnoError, CygnoResult};
use crate::synthesis::{synthesize_events_with_cancel, CancelFlag, SampleBatch};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Instrument};

/// Result of one split.
#[derive(Debug)]
pub struct SplitOutput {
    /// Split name.
    pub split: String,
    /// Synthesized samples.
    pub batch: SampleBatch,
    /// File the batch was written to, if output is configured.
    pub written_to: Option<PathBuf>,
}

/// Runs the splits of a generation config.
#[derive(Debug)]
pub struct Generator {
    config: GenerationConfig,
    signal: Arc<Collection>,
    noise: Arc<Collection>,
    cancel: CancelFlag,
}

impl Generator {
    /// Validate `config` and scan both collections with the compiled-in
    /// backends.
    pub fn new(config: GenerationConfig) -> CygnoResult<Self> {
        config.validate().map_err(CygnoError::Configuration)?;
        let signal = config.simulation.build_collection()?;
        let noise = config.noise.build_collection()?;
        Ok(Self::assemble(config, signal, noise))
    }

    /// Like [`new`](Self::new) with explicit backends.
    pub fn with_openers(
        config: GenerationConfig,
        signal_opener: Arc<dyn SourceOpener>,
        noise_opener: Arc<dyn SourceOpener>,
    ) -> CygnoResult<Self> {
        config.validate().map_err(CygnoError::Configuration)?;
        let signal = config.simulation.build_collection_with(signal_opener)?;
        let noise = config.noise.build_collection_with(noise_opener)?;
        Ok(Self::assemble(config, signal, noise))
    }

    fn assemble(config: GenerationConfig, signal: Collection, noise: Collection) -> Self {
        Self {
            config,
            signal: Arc::new(signal),
            noise: Arc::new(noise),
            cancel: CancelFlag::new(),
        }
    }

    /// Loaded configuration.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Signal collection.
    pub fn signal(&self) -> &Arc<Collection> {
        &self.signal
    }

    /// Noise collection.
    pub fn noise(&self) -> &Arc<Collection> {
        &self.noise
    }

    /// Flag that stops running and future batches when raised.
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Synthesize `split` and write it if output is configured.
    pub async fn run_split(&self, split: &str) -> CygnoResult<SplitOutput> {
        let params = self.config.synthesis_params(split)?;
        let span = tracing::info_span!("split", name = split);
        async {
            let batch = synthesize_events_with_cancel(
                Arc::clone(&self.signal),
                Arc::clone(&self.noise),
                params,
                self.cancel.clone(),
            )
            .await?;
            let (batch, written_to) = self.persist(split, batch).await?;
            info!(events = batch.len(), written_to = ?written_to, "Split complete");
            Ok(SplitOutput {
                split: split.to_string(),
                batch,
                written_to,
            })
        }
        .instrument(span)
        .await
    }

    /// Run every configured split in name order, stopping at the first error.
    pub async fn run_all(&self) -> CygnoResult<Vec<SplitOutput>> {
        let mut outputs = Vec::new();
        for split in self.config.split_names() {
            outputs.push(self.run_split(split).await?);
        }
        Ok(outputs)
    }

    /// Close both collections.
    pub fn close(&self) {
        self.signal.close();
        self.noise.close();
    }

    #[cfg(feature = "storage_hdf5")]
    async fn persist(
        &self,
        split: &str,
        batch: SampleBatch,
    ) -> CygnoResult<(SampleBatch, Option<PathBuf>)> {
        use crate::data::sample_writer::Hdf5SampleWriter;

        let Some(output) = &self.config.output else {
            return Ok((batch, None));
        };
        let path = output.path_for(split);
        let writer = Hdf5SampleWriter::new(&path);
        let batch = tokio::task::spawn_blocking(move || writer.write(&batch).map(|_| batch))
            .await
            .map_err(|e| CygnoError::Task(e.to_string()))??;
        Ok((batch, Some(path)))
    }

    #[cfg(not(feature = "storage_hdf5"))]
    async fn persist(
        &self,
        _split: &str,
        batch: SampleBatch,
    ) -> CygnoResult<(SampleBatch, Option<PathBuf>)> {
        match self.config.output {
            Some(_) => Err(CygnoError::FeatureNotEnabled("storage_hdf5".to_string())),
            None => Ok((batch, None)),
        }
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        self.close();
    }
}
