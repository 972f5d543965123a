use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};
use uuid::Uuid;

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Wrapper around tokio-cron-scheduler for the polling loops
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    /// Create a new scheduler
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Add a job that fires every `every`, starting one interval from now.
    /// Returns the id needed to remove it again.
    pub async fn add_interval_job<F>(&self, every: Duration, name: &str, task: F) -> Result<Uuid>
    where
        F: Fn() -> JobFuture + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_repeated_async(every, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                debug!("Running scheduled task: {}", name);
                fut.await;
            })
        })
        .with_context(|| format!("Failed to create interval job: {}", name))?;

        let id = self
            .inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled task '{}' every {}s", name, every.as_secs());
        Ok(id)
    }

    pub async fn remove_job(&self, id: &Uuid) -> Result<()> {
        self.inner
            .remove(id)
            .await
            .with_context(|| format!("Failed to remove job {}", id))?;
        debug!("Removed job {}", id);
        Ok(())
    }

    /// Start the scheduler
    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }
}
