use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskmill_core::{Job, JobId};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEventKind {
    #[serde(rename = "job.created")]
    Created,
    #[serde(rename = "job.started")]
    Started,
    #[serde(rename = "job.completed")]
    Completed,
    #[serde(rename = "job.failed")]
    Failed,
    #[serde(rename = "job.retrying")]
    Retrying,
    #[serde(rename = "job.expired")]
    Expired,
}

impl JobEventKind {
    /// Stable event name (e.g. "job.completed").
    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Created => "job.created",
            JobEventKind::Started => "job.started",
            JobEventKind::Completed => "job.completed",
            JobEventKind::Failed => "job.failed",
            JobEventKind::Retrying => "job.retrying",
            JobEventKind::Expired => "job.expired",
        }
    }
}

impl core::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// A job lifecycle event.
///
/// Events are facts about transitions that the store already accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "event")]
    pub kind: JobEventKind,
    pub job_id: JobId,
    pub job_type: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    /// Snapshot `job` as an event of `kind`, stamped with the job's `updated_at`.
    pub fn from_job(kind: JobEventKind, job: &Job) -> Self {
        let error = match kind {
            JobEventKind::Failed | JobEventKind::Retrying | JobEventKind::Expired => {
                job.last_error.clone()
            }
            _ => None,
        };
        Self {
            kind,
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempts: job.attempts,
            at: job.updated_at,
            error,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskmill_core::EnqueueOptions;

    #[test]
    fn serializes_with_dotted_name() {
        let job = Job::new("report", json!({}), &EnqueueOptions::new(), 3, Utc::now());
        let event = JobEvent::from_job(JobEventKind::Created, &job);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "job.created");
        assert_eq!(json["job_type"], "report");
        assert_eq!(json["attempts"], 0);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failure_events_carry_last_error() {
        let mut job = Job::new("report", json!({}), &EnqueueOptions::new(), 3, Utc::now());
        job.last_error = Some("smtp timeout".into());

        assert_eq!(
            JobEvent::from_job(JobEventKind::Retrying, &job).error.as_deref(),
            Some("smtp timeout")
        );
        assert_eq!(JobEvent::from_job(JobEventKind::Started, &job).error, None);
    }
}
