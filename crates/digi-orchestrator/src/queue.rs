// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable job queue.
//!
//! Jobs live in the `jobs` table; the row is the only authority. Claiming is
//! a select of the oldest claimable job followed by a conditional update
//! guarded on the status that was observed. A claim that affects no row lost
//! the race to another worker and selection is retried a bounded number of
//! times.
//!
//! Job types form the closed [`JobCommand`] enum: a payload is validated
//! against its type when it is enqueued and again when it is claimed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::persistence::{JobRecord, NewJob, Persistence, StaleJobsOutcome};
use crate::pubsub::{Channels, PubSub};

/// Claims allowed per job before it is failed.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Selection retries when a claim loses the race.
pub const DEFAULT_CLAIM_RETRIES: u32 = 5;

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Provision or re-provision a service.
    Deploy,
    /// Tear a service down.
    Destroy,
    /// Stop or start a service's containers.
    Scale,
    /// Produce a service's image without starting it.
    Build,
}

impl JobKind {
    /// Text stored in the `type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Deploy => "deploy",
            JobKind::Destroy => "destroy",
            JobKind::Scale => "scale",
            JobKind::Build => "build",
        }
    }

    /// Parse a stored job type.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deploy" => Some(JobKind::Deploy),
            "destroy" => Some(JobKind::Destroy),
            "scale" => Some(JobKind::Scale),
            "build" => Some(JobKind::Build),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentPayload {
    service_id: String,
    deployment_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicePayload {
    service_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScalePayload {
    service_id: String,
    replicas: u32,
}

/// A job with its validated payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    /// `{serviceId, deploymentId}`
    Deploy {
        /// Service to deploy.
        service_id: String,
        /// Deployment row tracking this run.
        deployment_id: String,
    },
    /// `{serviceId}`
    Destroy {
        /// Service to destroy.
        service_id: String,
    },
    /// `{serviceId, replicas}`
    Scale {
        /// Service to scale.
        service_id: String,
        /// Desired replicas; 0 stops the service.
        replicas: u32,
    },
    /// `{serviceId, deploymentId}`
    Build {
        /// Service to build.
        service_id: String,
        /// Deployment row receiving the image tag.
        deployment_id: String,
    },
}

impl JobCommand {
    /// Job kind.
    pub fn kind(&self) -> JobKind {
        match self {
            JobCommand::Deploy { .. } => JobKind::Deploy,
            JobCommand::Destroy { .. } => JobKind::Destroy,
            JobCommand::Scale { .. } => JobKind::Scale,
            JobCommand::Build { .. } => JobKind::Build,
        }
    }

    /// Service the job acts on.
    pub fn service_id(&self) -> &str {
        match self {
            JobCommand::Deploy { service_id, .. }
            | JobCommand::Destroy { service_id }
            | JobCommand::Scale { service_id, .. }
            | JobCommand::Build { service_id, .. } => service_id,
        }
    }

    /// Payload as stored in the `payload` column.
    pub fn payload(&self) -> Value {
        match self {
            JobCommand::Deploy {
                service_id,
                deployment_id,
            }
            | JobCommand::Build {
                service_id,
                deployment_id,
            } => json!({ "serviceId": service_id, "deploymentId": deployment_id }),
            JobCommand::Destroy { service_id } => json!({ "serviceId": service_id }),
            JobCommand::Scale {
                service_id,
                replicas,
            } => json!({ "serviceId": service_id, "replicas": replicas }),
        }
    }

    /// Validate `payload` against `job_type`.
    pub fn parse(job_type: &str, payload: &Value) -> Result<Self> {
        let kind =
            JobKind::parse(job_type).ok_or_else(|| Error::UnknownJobType(job_type.to_string()))?;

        let command = match kind {
            JobKind::Deploy => {
                let p: DeploymentPayload = decode(kind, payload)?;
                JobCommand::Deploy {
                    service_id: p.service_id,
                    deployment_id: p.deployment_id,
                }
            }
            JobKind::Build => {
                let p: DeploymentPayload = decode(kind, payload)?;
                JobCommand::Build {
                    service_id: p.service_id,
                    deployment_id: p.deployment_id,
                }
            }
            JobKind::Destroy => {
                let p: ServicePayload = decode(kind, payload)?;
                JobCommand::Destroy {
                    service_id: p.service_id,
                }
            }
            JobKind::Scale => {
                let p: ScalePayload = decode(kind, payload)?;
                JobCommand::Scale {
                    service_id: p.service_id,
                    replicas: p.replicas,
                }
            }
        };

        if command.service_id().trim().is_empty() {
            return Err(Error::InvalidPayload(format!("{} job has an empty serviceId", kind)));
        }
        if let JobCommand::Deploy { deployment_id, .. } | JobCommand::Build { deployment_id, .. } =
            &command
            && deployment_id.trim().is_empty()
        {
            return Err(Error::InvalidPayload(format!(
                "{} job has an empty deploymentId",
                kind
            )));
        }

        Ok(command)
    }

    /// Command carried by a stored job.
    pub fn from_record(job: &JobRecord) -> Result<Self> {
        Self::parse(&job.job_type, &job.payload)
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: JobKind, payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Error::InvalidPayload(format!("{} payload: {}", kind, e)))
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

/// Durable job queue over [`Persistence`].
#[derive(Clone)]
pub struct JobQueue {
    persistence: Arc<dyn Persistence>,
    pubsub: Arc<dyn PubSub>,
    claim_retries: u32,
    max_attempts: i32,
}

impl JobQueue {
    /// Queue over `persistence`, announcing new jobs on `pubsub`.
    pub fn new(persistence: Arc<dyn Persistence>, pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            persistence,
            pubsub,
            claim_retries: DEFAULT_CLAIM_RETRIES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Claims allowed per job.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Enqueue a job. `scheduled_at` defaults to now.
    pub async fn enqueue(
        &self,
        command: &JobCommand,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let job = self
            .persistence
            .insert_job(&NewJob {
                job_type: command.kind().as_str().to_string(),
                payload: command.payload(),
                service_id: Some(command.service_id().to_string()),
                scheduled_at: scheduled_at.unwrap_or_else(Utc::now),
                max_attempts: self.max_attempts,
            })
            .await?;

        info!(job_id = %job.id, job_type = %job.job_type, service_id = %command.service_id(), "Job enqueued");

        let announcement = json!({ "jobId": job.id, "type": job.job_type });
        if let Err(e) = self
            .pubsub
            .publish(Channels::job_new(), &announcement)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to announce job; workers will pick it up on the next poll");
        }

        Ok(job.id)
    }

    /// Enqueue a job given as type string and raw payload.
    pub async fn enqueue_raw(
        &self,
        job_type: &str,
        payload: &Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let command = JobCommand::parse(job_type, payload)?;
        self.enqueue(&command, scheduled_at).await
    }

    /// Claim the oldest claimable job.
    ///
    /// Returns `None` when there is nothing to do, or when every selected
    /// candidate was taken by another worker first.
    pub async fn claim_next(&self) -> Result<Option<JobRecord>> {
        for attempt in 1..=self.claim_retries {
            let now = Utc::now();
            let Some(candidate) = self.persistence.find_claimable_job(now).await? else {
                return Ok(None);
            };

            if let Some(job) = self
                .persistence
                .try_claim_job(&candidate.id, &candidate.status, now)
                .await?
            {
                debug!(job_id = %job.id, attempts = job.attempts, "Job claimed");
                return Ok(Some(job));
            }

            debug!(job_id = %candidate.id, attempt, "Lost claim race");
        }
        Ok(None)
    }

    /// Mark a claimed job completed.
    ///
    /// `complete`, `mark_failed` and `retry_later` act on the claim `job`
    /// came from and return whether it was still held. After a stale
    /// requeue hands the job to another worker, the old claim returns
    /// `false` and the row is left to its new owner.
    pub async fn complete(&self, job: &JobRecord) -> Result<bool> {
        Ok(self
            .persistence
            .complete_job(&job.id, job.attempts, Utc::now())
            .await?)
    }

    /// Mark a claimed job failed.
    pub async fn mark_failed(&self, job: &JobRecord, error: &str) -> Result<bool> {
        Ok(self
            .persistence
            .fail_job(&job.id, job.attempts, error, Utc::now())
            .await?)
    }

    /// Put a claimed job back, claimable after `delay`.
    pub async fn retry_later(&self, job: &JobRecord, error: &str, delay: Duration) -> Result<bool> {
        let run_at = Utc::now() + chrono_delay(delay);
        Ok(self
            .persistence
            .retry_job(&job.id, job.attempts, error, run_at)
            .await?)
    }

    /// Recover jobs that have been `processing` for longer than `older_than`.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<StaleJobsOutcome> {
        let now = Utc::now();
        let outcome = self
            .persistence
            .requeue_stale_jobs(now - chrono_delay(older_than), now)
            .await?;
        if outcome.requeued > 0 || outcome.failed > 0 {
            warn!(
                requeued = outcome.requeued,
                failed = outcome.failed,
                "Recovered stale jobs"
            );
        }
        Ok(outcome)
    }

    /// Fetch a job.
    pub async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.persistence.get_job(job_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_deploy_payload() {
        let command = JobCommand::parse(
            "deploy",
            &json!({ "serviceId": "svc-1", "deploymentId": "dep-1" }),
        )
        .unwrap();
        assert_eq!(
            command,
            JobCommand::Deploy {
                service_id: "svc-1".into(),
                deployment_id: "dep-1".into()
            }
        );
        assert_eq!(command.kind(), JobKind::Deploy);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = JobCommand::parse("migrate", &json!({ "serviceId": "svc-1" })).unwrap_err();
        assert!(matches!(err, Error::UnknownJobType(t) if t == "migrate"));
    }

    #[test]
    fn test_payload_must_match_type() {
        let err = JobCommand::parse("deploy", &json!({ "serviceId": "svc-1" })).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));

        let err = JobCommand::parse("destroy", &json!({ "serviceId": "  " })).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }

    #[test]
    fn test_extra_payload_fields_are_tolerated() {
        let command =
            JobCommand::parse("destroy", &json!({ "serviceId": "svc-1", "reason": "user" }))
                .unwrap();
        assert_eq!(command.service_id(), "svc-1");
    }

    #[test]
    fn test_payload_round_trip_for_scale() {
        let command = JobCommand::Scale {
            service_id: "svc-1".into(),
            replicas: 0,
        };
        assert_eq!(
            JobCommand::parse(command.kind().as_str(), &command.payload()).unwrap(),
            command
        );
    }
}
