//! Sync job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of remote mutation a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
  Upload,
  Download,
  Delete,
}

/// What callers hand to `enqueue`.
#[derive(Debug, Clone)]
pub struct SyncJobInput {
  pub job_type: JobType,
  pub payload: serde_json::Value,
  /// Overrides the configured retry limit for this job
  pub max_retries: Option<u32>,
}

impl SyncJobInput {
  pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
    Self {
      job_type,
      payload,
      max_retries: None,
    }
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }
}

/// A queued remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
  pub id: String,
  #[serde(rename = "type")]
  pub job_type: JobType,
  pub payload: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub retries: u32,
  pub max_retries: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

/// Where a job goes after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  /// Back to pending, another attempt allowed
  Retry,
  /// Retry budget spent, job leaves the queue for good
  Drop,
}

impl SyncJob {
  pub fn new(input: SyncJobInput, default_max_retries: u32, now: DateTime<Utc>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      job_type: input.job_type,
      payload: input.payload,
      created_at: now,
      retries: 0,
      max_retries: input.max_retries.unwrap_or(default_max_retries),
      last_error: None,
    }
  }

  /// Count a failed attempt.
  pub fn record_failure(&mut self, error: impl Into<String>) -> RetryDecision {
    self.retries += 1;
    self.last_error = Some(error.into());
    if self.retries >= self.max_retries {
      RetryDecision::Drop
    } else {
      RetryDecision::Retry
    }
  }
}

/// A job dropped after exhausting its retries, kept for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
  pub job: SyncJob,
  pub error: String,
  pub dropped_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retry_budget() {
    let mut job = SyncJob::new(
      SyncJobInput::new(JobType::Upload, serde_json::json!({"doc": 1})),
      3,
      Utc::now(),
    );
    assert_eq!(job.retries, 0);
    assert_eq!(job.record_failure("boom"), RetryDecision::Retry);
    assert_eq!(job.record_failure("boom"), RetryDecision::Retry);
    assert_eq!(job.record_failure("boom"), RetryDecision::Drop);
    assert_eq!(job.last_error.as_deref(), Some("boom"));
  }

  #[test]
  fn test_input_overrides_retry_limit() {
    let job = SyncJob::new(
      SyncJobInput::new(JobType::Delete, serde_json::Value::Null).with_max_retries(7),
      3,
      Utc::now(),
    );
    assert_eq!(job.max_retries, 7);
  }

  #[test]
  fn test_wire_shape() {
    let job = SyncJob::new(
      SyncJobInput::new(JobType::Download, serde_json::json!({"table": "laws"})),
      3,
      Utc::now(),
    );
    let value = serde_json::to_value(&job).unwrap();
    assert_eq!(value["type"], "download");
    assert_eq!(value["maxRetries"], 3);
    assert!(value.get("createdAt").is_some());
    assert!(value.get("lastError").is_none());
  }
}
