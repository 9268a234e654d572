use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Error type for scheduled job runs
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to build job client: {0}")]
    Client(String),

    #[error("Job request failed: {0}")]
    RequestFailed(String),

    #[error("Job command returned status {0}")]
    UnexpectedStatus(StatusCode),
}

/// A unit of work the external scheduler triggers on `spec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandJob {
    pub id: i64,
    pub name: String,
    /// Cron expression, interpreted by the scheduler only.
    pub spec: String,
    /// When set, running the job issues a GET against this URL.
    pub command_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Job has no command; only its execution was logged.
    Logged,
    Completed { body: String },
}

impl CommandJob {
    pub async fn run(&self, client: &Client) -> Result<JobOutcome, JobError> {
        info!(job_id = self.id, name = %self.name, spec = %self.spec, "Running job");

        let Some(url) = self.command_url.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(JobOutcome::Logged);
        };

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| JobError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(JobError::UnexpectedStatus(status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| JobError::RequestFailed(e.to_string()))?;

        info!(
            job_id = self.id,
            name = %self.name,
            body = %body,
            "Job completed"
        );
        Ok(JobOutcome::Completed { body })
    }
}

/// Entry point for the external scheduler: run a job now and account for it
/// while it is in flight.
#[derive(Debug, Clone)]
pub struct JobRunner {
    client: Client,
    in_flight: Arc<AtomicUsize>,
}

impl JobRunner {
    pub fn new(timeout: Duration) -> Result<Self, JobError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JobError::Client(e.to_string()))?;

        Ok(Self {
            client,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn run_now(&self, job: &CommandJob) -> Result<JobOutcome, JobError> {
        let _in_flight = InFlight::enter(&self.in_flight);
        let result = job.run(&self.client).await;

        if let Err(e) = &result {
            error!(job_id = job.id, name = %job.name, error = %e, "Job failed");
        }
        result
    }
}

/// Counts one running job for as long as it lives, including when the
/// caller drops the run before it finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;

    async fn spawn_command_server() -> std::net::SocketAddr {
        let router = Router::new()
            .route("/settle", get(|| async { "settled 12 orders" }))
            .route(
                "/broken",
                get(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "too late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn job(command_url: Option<String>) -> CommandJob {
        CommandJob {
            id: 7,
            name: "daily-settlement".to_string(),
            spec: "0 0 * * *".to_string(),
            command_url,
        }
    }

    #[tokio::test]
    async fn test_job_without_command_only_logs() -> Result<(), JobError> {
        let runner = JobRunner::new(Duration::from_secs(2))?;

        assert_eq!(runner.run_now(&job(None)).await?, JobOutcome::Logged);
        assert_eq!(runner.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_command_body_is_returned() -> Result<(), JobError> {
        let addr = spawn_command_server().await;
        let runner = JobRunner::new(Duration::from_secs(2))?;

        let outcome = runner
            .run_now(&job(Some(format!("http://{addr}/settle"))))
            .await?;
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                body: "settled 12 orders".to_string()
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_non_200_is_an_error() -> Result<(), JobError> {
        let addr = spawn_command_server().await;
        let runner = JobRunner::new(Duration::from_secs(2))?;

        let result = runner
            .run_now(&job(Some(format!("http://{addr}/broken"))))
            .await;
        assert!(matches!(
            result,
            Err(JobError::UnexpectedStatus(StatusCode::INTERNAL_SERVER_ERROR))
        ));
        assert_eq!(runner.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_run_is_no_longer_in_flight() -> Result<(), JobError> {
        let addr = spawn_command_server().await;
        let runner = JobRunner::new(Duration::from_secs(60))?;
        let slow = job(Some(format!("http://{addr}/slow")));

        let mut run = Box::pin(runner.run_now(&slow));
        let abandoned = tokio::time::timeout(Duration::from_millis(100), &mut run).await;
        assert!(abandoned.is_err());
        assert_eq!(runner.in_flight(), 1);

        drop(run);
        assert_eq!(runner.in_flight(), 0);
        Ok(())
    }
}
