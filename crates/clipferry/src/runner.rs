//! Delivery-aware runner.
//!
//! The scheduler knows nothing about delivery; this wrapper is the one
//! place where it attaches. A delivery failure is logged and dropped -
//! the download itself succeeded, so the job completes either way and is
//! never retried for delivery's sake.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use clipferry_extractor::{Artifact, ExtractError, JobRunner, ProgressFn, StrategyExecutor};
use clipferry_protocol::Job;

use crate::delivery::{Delivery, DeliverySink};

pub struct DeliveringRunner {
    executor: StrategyExecutor,
    sink: Arc<DeliverySink>,
}

impl DeliveringRunner {
    pub fn new(executor: StrategyExecutor, sink: Arc<DeliverySink>) -> Self {
        Self { executor, sink }
    }
}

#[async_trait]
impl JobRunner for DeliveringRunner {
    async fn run(&self, job: &Job, progress: ProgressFn<'_>) -> Result<Artifact, ExtractError> {
        let artifact = self.executor.execute(job, progress).await?;

        match self.sink.deliver(&artifact).await {
            Ok(Delivery::Inline(path)) => {
                info!(
                    "Job {} ready inline at {} (context: {})",
                    job.tag,
                    path.display(),
                    job.caller_context
                );
            }
            Ok(Delivery::Hosted(link)) => {
                info!("Job {} hosted at {} (context: {})", job.tag, link, job.caller_context);
                // The artifact lives at the host now; reclaim local disk.
                if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
                    warn!("Could not remove uploaded artifact {}: {}", artifact.path.display(), e);
                }
            }
            Err(e) => {
                warn!("Delivery for {} failed (download still counts): {}", job.tag, e);
            }
        }

        Ok(artifact)
    }
}
