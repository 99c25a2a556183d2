//! The chain-of-trust task feature.
//!
//! Runs once per completed task on the worker's finalization path:
//!
//! ```text
//! Collecting ‖ KeyRetrieval -> Canonicalizing -> Signing -> Publishing
//! ```
//!
//! Evidence collection and key retrieval have no data dependency and run
//! concurrently; signing waits on both. Collection, canonicalization, and
//! signing failures are deterministic and never retried. Key retrieval is
//! retried once, only when the helper timed out. Publishing retries are
//! owned by [`CertificatePublisher`]; their eventual failure is escalated
//! or downgraded per the `publish_on_failure` policy switch.
//!
//! A certificate signed over incomplete evidence, or with unverified key
//! material, would be worse than no certificate — so every fatal error
//! aborts the whole pipeline before the publisher is ever invoked.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::Instrument as _;

use crate::canonical::{CanonicalError, canonicalize};
use crate::config::ChainOfTrustConfig;
use crate::evidence::{CollectionError, EvidenceCollector, ProducedArtifact, TaskRun};
use crate::process::{CommandRunner, ExecutionError, Platform};
use crate::publish::{ArtifactUploader, CertificatePublisher, PublishError};
use crate::secrets::{SecretAccessor, SecretError, SigningKey};
use crate::signer::{Certificate, EvidenceSigner, SignError};

/// Outcome of a successful feature run.
#[derive(Debug, Clone)]
pub struct CertificateReceipt {
    /// The certificate that was produced.
    pub certificate: Certificate,
    /// Upload attempts made.
    pub attempts: u32,
    /// Whether the certificate reached the upload collaborator. `false`
    /// only under the warn-only publish policy.
    pub published: bool,
}

/// Fatal feature errors, attached to the task result as the structured
/// failure reason. Display strings are secret-free by construction: no key
/// bytes, no raw command environments, no non-allow-listed env values.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChainOfTrustError {
    /// Signing-key retrieval failed.
    #[error("chain of trust: {0}")]
    Secret(#[from] SecretError),

    /// Evidence collection failed.
    #[error("chain of trust: {0}")]
    Collection(#[from] CollectionError),

    /// Canonical encoding failed.
    #[error("chain of trust: {0}")]
    Canonical(#[from] CanonicalError),

    /// Signing failed.
    #[error("chain of trust: {0}")]
    Sign(#[from] SignError),

    /// Publishing exhausted its retries under the fail-the-task policy.
    #[error("chain of trust: {0}")]
    Publish(#[from] PublishError),
}

impl ChainOfTrustError {
    /// Stable failure-reason identifier for task-result reporting.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Secret(_) => "secret-error",
            Self::Collection(_) => "collection-error",
            Self::Canonical(_) => "canonical-error",
            Self::Sign(_) => "sign-error",
            Self::Publish(_) => "publish-error",
        }
    }
}

/// The chain-of-trust signing feature for one worker.
///
/// Holds no key material and no per-run state; concurrent task
/// finalizations may share one instance, and each run independently
/// retrieves its own signing key.
pub struct ChainOfTrustFeature {
    config: ChainOfTrustConfig,
    runner: Arc<dyn CommandRunner>,
    uploader: Arc<dyn ArtifactUploader>,
    platform: Platform,
}

impl ChainOfTrustFeature {
    /// Creates the feature with the host platform detected once.
    #[must_use]
    pub fn new(
        config: ChainOfTrustConfig,
        runner: Arc<dyn CommandRunner>,
        uploader: Arc<dyn ArtifactUploader>,
    ) -> Self {
        Self {
            config,
            runner,
            uploader,
            platform: Platform::host(),
        }
    }

    /// Overrides the detected platform. Intended for tests.
    #[must_use]
    pub const fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Produces and publishes the certificate for a completed task run.
    ///
    /// # Errors
    ///
    /// Any [`ChainOfTrustError`] means no certificate was attached to the
    /// run. Publishing failures are returned only under the
    /// `publish_on_failure` policy; otherwise they are downgraded to a
    /// warning and the receipt reports `published: false`.
    pub async fn run(
        &self,
        task: &TaskRun,
        artifacts: &[ProducedArtifact],
        env: &HashMap<String, String>,
    ) -> Result<CertificateReceipt, ChainOfTrustError> {
        tracing::info!(
            task_id = %task.task_id,
            run_id = %task.run_id,
            artifact_count = artifacts.len(),
            "signing chain of trust for task run"
        );

        let collector = EvidenceCollector::new(self.config.digest_workers);
        let accessor = SecretAccessor::new(
            Arc::clone(&self.runner),
            self.platform,
            self.config.command_timeout(),
        );

        // Collecting ‖ KeyRetrieval: independent phases, joined before
        // signing. Each run reads the key afresh; nothing is cached.
        let (evidence, key) = tokio::join!(
            collector
                .collect(task, artifacts, env)
                .instrument(tracing::info_span!("collect", artifact_count = artifacts.len())),
            self.retrieve_key(&accessor)
                .instrument(tracing::info_span!("key_retrieval")),
        );
        let evidence = evidence?;
        let key = key?;

        let canonical = canonicalize(&evidence)?;
        let attestation = {
            let _span = tracing::info_span!("sign", canonical_len = canonical.len()).entered();
            EvidenceSigner::ed25519().sign(&canonical, key)?
        };
        let certificate = Certificate::build(&evidence, &canonical, &attestation, Utc::now());

        let publisher = CertificatePublisher::new(
            Arc::clone(&self.uploader),
            self.config.max_publish_attempts,
            self.config.publish_backoff(),
        );
        let published = publisher
            .publish(&certificate)
            .instrument(tracing::info_span!("publish"))
            .await;
        match published {
            Ok(outcome) => Ok(CertificateReceipt {
                certificate,
                attempts: outcome.attempts,
                published: true,
            }),
            Err(error) if !self.config.publish_on_failure => {
                // Warn-only policy: the functional task result stands, but
                // no chain-of-trust guarantee is attached.
                tracing::warn!(
                    task_id = %task.task_id,
                    run_id = %task.run_id,
                    %error,
                    "certificate publish failed; continuing per policy"
                );
                let attempts = match &error {
                    PublishError::UploadFailed { attempts, .. } => *attempts,
                    _ => 0,
                };
                Ok(CertificateReceipt {
                    certificate,
                    attempts,
                    published: false,
                })
            },
            Err(error) => Err(error.into()),
        }
    }

    /// Reads the signing key, retrying once if the read helper timed out.
    ///
    /// Timeouts are the only retryable key-retrieval failure class; every
    /// other secret error is deterministic and aborts immediately.
    async fn retrieve_key(&self, accessor: &SecretAccessor) -> Result<SigningKey, SecretError> {
        match accessor
            .read_signing_key(&self.config.signing_key_location)
            .await
        {
            Err(SecretError::Unreadable(ExecutionError::Timeout { .. })) => {
                tracing::warn!("signing key read timed out; retrying once");
                accessor
                    .read_signing_key(&self.config.signing_key_location)
                    .await
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        let err = ChainOfTrustError::from(SecretError::Empty);
        assert_eq!(err.kind(), "secret-error");

        let err = ChainOfTrustError::from(SignError::InvalidKey);
        assert_eq!(err.kind(), "sign-error");
    }

    #[test]
    fn error_display_is_prefixed_and_secret_free() {
        let err = ChainOfTrustError::from(SecretError::MalformedKey);
        let text = err.to_string();
        assert!(text.starts_with("chain of trust:"));
        // MalformedKey is payload-free, so no rendering of the bytes that
        // failed to parse can reach the text.
        assert!(!text.contains(&hex::encode([0xAB; 32])));
        assert!(!text.contains(&hex::encode([0xAB; 48])));
    }
}
