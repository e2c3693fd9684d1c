use chrono::{DateTime, Utc};
use pagemill_core::{Batch, Command, CommandOutcome, PoolStats, Result};
use pagemill_parser::parse_batchfile;
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::config::PoolConfig;
use crate::pool::ProcessPool;

/// Summary of one batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_name: String,
    pub stages: usize,
    pub stats: PoolStats,
    pub outcomes: Vec<CommandOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Executes batches through a single shared pool
#[derive(Debug, Clone, Default)]
pub struct BatchRunner {
    config: PoolConfig,
}

impl BatchRunner {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    /// Parse and run a Batchfile
    pub async fn run_batchfile(&self, content: &str) -> Result<BatchReport> {
        let batch = parse_batchfile(content)?;
        self.run(&batch).await
    }

    /// Run every stage in order. A stage with `wait: false` lets the next
    /// stage start launching as soon as its own backlog has drained.
    pub async fn run(&self, batch: &Batch) -> Result<BatchReport> {
        let started_at = Utc::now();
        let mut config = self.config.clone();
        if let Some(dir) = &batch.dir {
            config.working_dir = Some(match &config.working_dir {
                Some(base) if dir.is_relative() => base.join(dir),
                _ => dir.clone(),
            });
        }

        let mut pool = ProcessPool::with_config(Vec::<Command>::new(), config)?;

        info!(
            pool_id = %pool.id(),
            batch = %batch.name,
            stages = batch.stages.len(),
            max_concurrency = pool.max_concurrency(),
            "Starting batch"
        );

        for stage in &batch.stages {
            let span = info_span!("stage", batch = %batch.name, stage = %stage.name);
            async {
                info!(commands = stage.commands.len(), wait = stage.wait, "Starting stage");
                pool.submit(stage.to_commands());
                pool.run().await?;
                if stage.wait {
                    pool.wait().await;
                    info!("Stage completed");
                }
                Ok::<_, pagemill_core::PagemillError>(())
            }
            .instrument(span)
            .await?;
        }
        pool.wait().await;

        let stats = pool.stats();
        info!(
            pool_id = %pool.id(),
            batch = %batch.name,
            launched = stats.launched,
            spawn_failures = stats.spawn_failures,
            "Batch completed"
        );

        Ok(BatchReport {
            batch_name: batch.name.clone(),
            stages: batch.stages.len(),
            stats,
            outcomes: pool.take_outcomes(),
            started_at,
            completed_at: Utc::now(),
        })
    }
}
