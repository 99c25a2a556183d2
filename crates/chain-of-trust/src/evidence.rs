//! Evidence collection for a completed task run.
//!
//! Gathers what the worker knows about a finished task — the artifacts it
//! produced, the task definition, and an allow-listed environment snapshot —
//! into an immutable [`TaskEvidence`] value. Artifact digests are computed
//! by streaming each file through a bounded buffer in a single pass; the
//! bytes are never re-read after collection begins and never loaded whole
//! into memory. Collection failures are fatal to the feature: a certificate
//! over incomplete evidence is worse than no certificate.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::redact::allowlisted_snapshot;

/// Size of the streaming read buffer for artifact digesting.
const DIGEST_BUF_LEN: usize = 64 * 1024;

/// Upper bound on artifacts per certificate.
pub const MAX_ARTIFACTS: usize = 10_000;

/// Length of a SHA-256 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Identifier of the artifact digest algorithm in the published document.
pub const DIGEST_ALGORITHM: &str = "sha256";

/// A task run as reported by the task-execution engine.
#[derive(Debug, Clone)]
pub struct TaskRun {
    /// Task identifier from the task definition.
    pub task_id: String,
    /// Run identifier within the task.
    pub run_id: String,
    /// The opaque structured task definition.
    pub task_definition: serde_json::Value,
}

/// An artifact the task-execution engine claims the task produced.
#[derive(Debug, Clone)]
pub struct ProducedArtifact {
    /// Upload name of the artifact (the name downstream verifiers see).
    pub name: String,
    /// Filesystem location of the artifact bytes.
    pub path: PathBuf,
    /// Declared size in bytes.
    pub size: u64,
}

/// Digest evidence for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEvidence {
    /// Artifact upload name.
    pub name: String,
    /// SHA-256 digest of the artifact bytes.
    pub digest: [u8; DIGEST_LEN],
    /// Size in bytes, verified against the streamed byte count.
    pub size: u64,
}

impl ArtifactEvidence {
    /// Hex rendering of the digest for the published document.
    #[must_use]
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// Everything the certificate attests to, collected once and then immutable.
///
/// Artifacts are ordered by name regardless of input or completion order,
/// and the environment snapshot is ordered by variable name, so equal
/// evidence always canonicalizes to identical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvidence {
    /// Task identifier.
    pub task_id: String,
    /// Run identifier.
    pub run_id: String,
    /// Worker group the run executed in (from the environment snapshot).
    pub worker_group: String,
    /// Worker identifier (from the environment snapshot).
    pub worker_id: String,
    /// The opaque task definition.
    pub task_definition: serde_json::Value,
    /// Per-artifact digests, sorted by artifact name.
    pub artifacts: Vec<ArtifactEvidence>,
    /// Allow-listed environment snapshot.
    pub environment: BTreeMap<String, String>,
}

/// Errors from evidence collection. Always fatal to the feature.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CollectionError {
    /// An artifact disappeared or could not be read after the task claimed
    /// to have produced it.
    #[error("artifact {name:?} unreadable: {message}")]
    ArtifactUnreadable {
        /// Artifact upload name.
        name: String,
        /// OS error text.
        message: String,
    },

    /// The streamed byte count disagrees with the declared size.
    #[error("artifact {name:?} size mismatch: declared {declared}, read {actual}")]
    SizeMismatch {
        /// Artifact upload name.
        name: String,
        /// Size declared by the task-execution engine.
        declared: u64,
        /// Bytes actually streamed.
        actual: u64,
    },

    /// Two artifacts share the same upload name.
    #[error("duplicate artifact name: {name:?}")]
    DuplicateArtifact {
        /// The colliding name.
        name: String,
    },

    /// More artifacts than a certificate may carry.
    #[error("too many artifacts: {count} (max {max})")]
    TooManyArtifacts {
        /// Actual count.
        count: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Internal digest task failure (panic or cancellation).
    #[error("digest worker failed: {message}")]
    DigestWorker {
        /// Join error text.
        message: String,
    },
}

/// Collects [`TaskEvidence`] with bounded-concurrency artifact digesting.
#[derive(Debug, Clone, Copy)]
pub struct EvidenceCollector {
    digest_workers: usize,
}

impl EvidenceCollector {
    /// Creates a collector that digests up to `digest_workers` artifacts
    /// concurrently. A value of zero is clamped to one.
    #[must_use]
    pub const fn new(digest_workers: usize) -> Self {
        Self {
            digest_workers: if digest_workers == 0 {
                1
            } else {
                digest_workers
            },
        }
    }

    /// Collects evidence for a completed task run.
    ///
    /// Artifacts are digested concurrently (bounded by the worker count)
    /// and the final list is sorted by name, not by completion order. The
    /// environment snapshot is restricted to the allow-list before anything
    /// is retained.
    ///
    /// # Errors
    ///
    /// Any [`CollectionError`] aborts the certificate: no partial evidence
    /// is ever returned.
    pub async fn collect(
        &self,
        task: &TaskRun,
        artifacts: &[ProducedArtifact],
        env: &HashMap<String, String>,
    ) -> Result<TaskEvidence, CollectionError> {
        if artifacts.len() > MAX_ARTIFACTS {
            return Err(CollectionError::TooManyArtifacts {
                count: artifacts.len(),
                max: MAX_ARTIFACTS,
            });
        }

        tracing::debug!(
            task_id = %task.task_id,
            run_id = %task.run_id,
            artifact_count = artifacts.len(),
            "collecting task evidence"
        );

        let semaphore = Arc::new(Semaphore::new(self.digest_workers));
        let mut join_set = JoinSet::new();
        for artifact in artifacts.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                // Closing the semaphore is not part of this flow, so the
                // only acquire failure is task abort; surface it as a
                // worker failure either way.
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| CollectionError::DigestWorker {
                        message: e.to_string(),
                    })?;
                digest_artifact(artifact).await
            });
        }

        let mut collected = Vec::with_capacity(artifacts.len());
        while let Some(joined) = join_set.join_next().await {
            let result = joined.map_err(|e| CollectionError::DigestWorker {
                message: e.to_string(),
            })?;
            collected.push(result?);
        }

        // Deterministic ordering: sort by name after collection, never by
        // completion order.
        collected.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in collected.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(CollectionError::DuplicateArtifact {
                    name: pair[0].name.clone(),
                });
            }
        }

        let environment =
            allowlisted_snapshot(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let worker_group = environment.get("WORKER_GROUP").cloned().unwrap_or_default();
        let worker_id = environment.get("WORKER_ID").cloned().unwrap_or_default();

        Ok(TaskEvidence {
            task_id: task.task_id.clone(),
            run_id: task.run_id.clone(),
            worker_group,
            worker_id,
            task_definition: task.task_definition.clone(),
            artifacts: collected,
            environment,
        })
    }
}

/// Streams one artifact through a bounded buffer, producing its evidence.
async fn digest_artifact(artifact: ProducedArtifact) -> Result<ArtifactEvidence, CollectionError> {
    let unreadable = |e: std::io::Error| CollectionError::ArtifactUnreadable {
        name: artifact.name.clone(),
        message: e.to_string(),
    };

    let mut file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(unreadable)?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BUF_LEN];
    let mut streamed: u64 = 0;
    loop {
        let n = file.read(&mut buf).await.map_err(unreadable)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        streamed += n as u64;
    }

    if streamed != artifact.size {
        return Err(CollectionError::SizeMismatch {
            name: artifact.name,
            declared: artifact.size,
            actual: streamed,
        });
    }

    Ok(ArtifactEvidence {
        name: artifact.name,
        digest: hasher.finalize().into(),
        size: streamed,
    })
}
