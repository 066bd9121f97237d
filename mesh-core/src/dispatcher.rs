//! The dispatcher actually executes delegated compute jobs; out of scope,
//! consumed-only, mirroring the teacher's `DistributedInference` trait plus
//! `SimpleDistributedInference` in-memory default.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub operation: String,
    pub data: Vec<u8>,
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub data: Vec<u8>,
    pub latency: Duration,
    pub error: Option<String>,
}

#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    async fn execute_job(&self, job: Job) -> Result<JobResult>;
}

/// Echoes the job's input back as output after a small simulated latency;
/// lets tests exercise the delegation path without a real compute backend.
pub struct EchoDispatcher {
    pub simulated_latency: Duration,
}

impl Default for EchoDispatcher {
    fn default() -> Self {
        Self {
            simulated_latency: Duration::from_millis(5),
        }
    }
}

#[async_trait::async_trait]
impl Dispatcher for EchoDispatcher {
    async fn execute_job(&self, job: Job) -> Result<JobResult> {
        tokio::time::sleep(self.simulated_latency).await;
        Ok(JobResult {
            success: true,
            data: job.data,
            latency: self.simulated_latency,
            error: None,
        })
    }
}

pub type SharedDispatcher = Arc<dyn Dispatcher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_dispatcher_returns_input() {
        let dispatcher = EchoDispatcher::default();
        let job = Job {
            id: "j1".into(),
            operation: "hash".into(),
            data: b"payload".to_vec(),
            priority: 0,
        };
        let result = dispatcher.execute_job(job).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data, b"payload");
    }
}
