use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::batch::partition;
use crate::config::RunConfig;
use crate::domain::{Batch, FirstBatchPolicy, WriteMode};
use crate::error::IngestError;
use crate::executor::{TaskExecutor, TaskFailure};
use crate::lister::SourceLister;
use crate::merge::BatchMerger;
use crate::normalize::SchemaNormalizer;
use crate::storage::Backends;
use crate::pool::{RetryPolicy, WorkerPool};
use crate::reader::{JsonDatasetReader, SourceReader};
use crate::store::StoreWriter;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub files: usize,
    pub failed: usize,
    pub mode: Option<WriteMode>,
    pub records: usize,
    pub growth_len: usize,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source: String,
    pub store: String,
    pub files_discovered: usize,
    pub batches: Vec<BatchReport>,
    pub failures: Vec<TaskFailure>,
    pub growth_len: usize,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub source: String,
    pub store: String,
    pub files_discovered: usize,
    pub batches: Vec<PlannedBatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedBatch {
    pub index: usize,
    pub mode: WriteMode,
    pub locations: Vec<String>,
}

pub struct Orchestrator {
    config: RunConfig,
    backends: Backends,
    reader: Arc<dyn SourceReader>,
}

impl Orchestrator {
    pub fn new(config: RunConfig, backends: Backends, reader: Arc<dyn SourceReader>) -> Self {
        Self {
            config,
            backends,
            reader,
        }
    }

    pub fn with_json_reader(config: RunConfig, backends: Backends) -> Self {
        let reader = Arc::new(JsonDatasetReader::new(backends.clone()));
        Self::new(config, backends, reader)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn plan(&self) -> Result<Vec<Batch>, IngestError> {
        self.config.validate()?;
        let lister = SourceLister::new(self.backends.clone());
        let mut locations = lister.list(&self.config.source)?;
        if let Some(limit) = self.config.limit {
            locations.truncate(limit);
        }
        partition(locations, self.config.batch_size)
    }

    pub fn plan_report(&self) -> Result<PlanReport, IngestError> {
        let batches = self.plan()?;
        Ok(PlanReport {
            source: self.config.source.clone(),
            store: self.config.store.to_string(),
            files_discovered: batches.iter().map(Batch::len).sum(),
            batches: batches
                .into_iter()
                .map(|batch| PlannedBatch {
                    index: batch.index,
                    mode: if batch.index == 0 {
                        WriteMode::Create
                    } else {
                        WriteMode::Append
                    },
                    locations: batch.locations.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        })
    }

    pub fn run(&self, sink: &dyn ProgressSink) -> Result<RunReport, IngestError> {
        let started = Instant::now();
        let config = &self.config;
        let batches = self.plan()?;
        let total_files: usize = batches.iter().map(Batch::len).sum();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Discover; found {total_files} files to process in batches of {}",
                config.batch_size
            ),
            elapsed: Some(started.elapsed()),
        });

        // Torn down by `Drop` on every exit path below.
        let pool = WorkerPool::new(
            config.workers,
            RetryPolicy::new(config.retries, config.retry_delay),
        )?;
        let normalizer = SchemaNormalizer::new(
            Arc::clone(&self.reader),
            config.allow_list.clone(),
            config.growth_dim.clone(),
        );
        let executor = TaskExecutor::new(normalizer, config.policy);
        let merger = BatchMerger::new(config.growth_dim.clone(), config.geometry.clone());
        let writer = StoreWriter::new(
            self.backends.clone(),
            config.growth_dim.clone(),
            config.compressor,
        );

        let mut report = RunReport {
            source: config.source.clone(),
            store: config.store.to_string(),
            files_discovered: total_files,
            batches: Vec::with_capacity(batches.len()),
            failures: Vec::new(),
            growth_len: 0,
            elapsed_secs: 0.0,
        };
        let mut store_created = false;
        let mut completed = 0usize;

        for batch in &batches {
            let batch_started = Instant::now();
            let outcomes = executor.execute(&pool, batch)?;
            let failures = outcomes.failures();

            if !store_created
                && config.first_batch_policy == FirstBatchPolicy::RequireComplete
                && let Some(first) = failures.first()
            {
                return Err(IngestError::TaskFailed {
                    batch: first.batch,
                    location: first.location.clone(),
                    attempts: first.attempts,
                    reason: first.reason.clone(),
                });
            }
            completed += batch.len();
            let failed = failures.len();
            report.failures.extend(failures);

            if outcomes.success_count() == 0 {
                warn!(batch = batch.index, "no file of the batch could be read; skipping");
                report.batches.push(BatchReport {
                    index: batch.index,
                    files: batch.len(),
                    failed,
                    mode: None,
                    records: 0,
                    growth_len: report.growth_len,
                    elapsed_secs: batch_started.elapsed().as_secs_f64(),
                });
                continue;
            }

            let merged = merger.merge(outcomes).map_err(|err| err.in_batch(batch.index))?;
            let mode = if store_created {
                WriteMode::Append
            } else {
                WriteMode::Create
            };
            let summary = writer
                .write(&merged, &config.store, mode)
                .map_err(|err| err.in_batch(batch.index))?;
            drop(merged);
            store_created = true;

            report.growth_len = summary.growth_len;
            report.batches.push(BatchReport {
                index: batch.index,
                files: batch.len(),
                failed,
                mode: Some(mode),
                records: summary.records,
                growth_len: summary.growth_len,
                elapsed_secs: batch_started.elapsed().as_secs_f64(),
            });
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Write; batch {}/{} ({mode}): finished {completed} out of {total_files} files",
                    batch.index + 1,
                    batches.len()
                ),
                elapsed: Some(started.elapsed()),
            });
        }

        if !store_created {
            return Err(IngestError::NothingWritten);
        }

        report.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            store = %config.store,
            growth_len = report.growth_len,
            failures = report.failures.len(),
            elapsed_secs = report.elapsed_secs,
            "ingestion finished"
        );
        Ok(report)
    }
}
