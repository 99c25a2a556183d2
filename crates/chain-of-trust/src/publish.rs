//! Certificate publishing through the artifact-upload collaborator.
//!
//! Uploads are the only retryable step in the pipeline: transport failures
//! are transient in a way collection, canonicalization, and signing failures
//! are not. Retries are bounded with multiplicative backoff; once exhausted
//! the certificate is discarded whole — there is no partial publish.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::signer::Certificate;

/// Upload name of the published certificate.
pub const CERTIFICATE_ARTIFACT_NAME: &str = "chain-of-trust.json";

/// Content type of the published certificate.
pub const CERTIFICATE_CONTENT_TYPE: &str = "application/json";

/// A single failed upload attempt, as reported by the collaborator.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct UploadError {
    /// Transport error text. Must not contain request credentials; the
    /// collaborator owns that guarantee.
    pub message: String,
}

impl UploadError {
    /// Creates an upload error from any displayable cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Seam to the external artifact-upload collaborator.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Uploads one named artifact.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError`] on any transport failure; the publisher
    /// treats every failure as transient until its retry bound.
    async fn upload_artifact(
        &self,
        name: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<(), UploadError>;
}

/// Errors from certificate publishing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublishError {
    /// The certificate could not be serialized.
    #[error("certificate not serializable: {message}")]
    Serialize {
        /// Serializer error text.
        message: String,
    },

    /// Every upload attempt failed.
    #[error("certificate upload failed after {attempts} attempts: {last_error}")]
    UploadFailed {
        /// Attempts made (equals the configured bound).
        attempts: u32,
        /// The final attempt's error.
        last_error: UploadError,
    },
}

/// Result of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Upload attempts made, including the successful one.
    pub attempts: u32,
}

/// Publishes certificates with bounded retry.
pub struct CertificatePublisher {
    uploader: Arc<dyn ArtifactUploader>,
    max_attempts: u32,
    backoff: Duration,
}

impl CertificatePublisher {
    /// Creates a publisher. `max_attempts` of zero is clamped to one;
    /// `backoff` is the delay after the first failure and grows
    /// multiplicatively with the attempt number.
    #[must_use]
    pub fn new(uploader: Arc<dyn ArtifactUploader>, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            uploader,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Serializes the certificate once and uploads it, retrying transient
    /// failures up to the configured bound.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::UploadFailed`] when the retry bound is
    /// exhausted; the caller decides, per policy, whether that fails the
    /// task run.
    pub async fn publish(&self, certificate: &Certificate) -> Result<PublishOutcome, PublishError> {
        let content = serde_json::to_vec(certificate).map_err(|e| PublishError::Serialize {
            message: e.to_string(),
        })?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .uploader
                .upload_artifact(CERTIFICATE_ARTIFACT_NAME, &content, CERTIFICATE_CONTENT_TYPE)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        task_id = %certificate.task_id,
                        run_id = %certificate.run_id,
                        attempts = attempt,
                        "chain-of-trust certificate published"
                    );
                    return Ok(PublishOutcome { attempts: attempt });
                },
                Err(error) if attempt < self.max_attempts => {
                    tracing::warn!(
                        task_id = %certificate.task_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        %error,
                        "certificate upload failed, retrying"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                },
                Err(last_error) => {
                    return Err(PublishError::UploadFailed {
                        attempts: attempt,
                        last_error,
                    });
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::canonical::canonicalize;
    use crate::evidence::TaskEvidence;
    use crate::secrets::{SignatureAlgorithm, SigningKey};
    use crate::signer::{Certificate, EvidenceSigner};

    /// Uploader that fails a scripted number of times before succeeding.
    struct FlakyUploader {
        failures_remaining: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyUploader {
        fn failing(times: u32) -> Self {
            Self {
                failures_remaining: AtomicU32::new(times),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ArtifactUploader for FlakyUploader {
        async fn upload_artifact(
            &self,
            name: &str,
            content: &[u8],
            content_type: &str,
        ) -> Result<(), UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(name, CERTIFICATE_ARTIFACT_NAME);
            assert_eq!(content_type, CERTIFICATE_CONTENT_TYPE);
            assert!(!content.is_empty());

            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(UploadError::new("503 service unavailable"));
            }
            Ok(())
        }
    }

    fn certificate() -> Certificate {
        let evidence = TaskEvidence {
            task_id: "task-abc".to_string(),
            run_id: "0".to_string(),
            worker_group: String::new(),
            worker_id: String::new(),
            task_definition: serde_json::json!({}),
            artifacts: vec![],
            environment: std::collections::BTreeMap::new(),
        };
        let canonical = canonicalize(&evidence).unwrap();
        let attestation = EvidenceSigner::ed25519()
            .sign(
                &canonical,
                SigningKey::new(SignatureAlgorithm::Ed25519, [0x42; 32]),
            )
            .unwrap();
        Certificate::build(&evidence, &canonical, &attestation, chrono::Utc::now())
    }

    #[tokio::test]
    async fn publishes_on_first_attempt() {
        let uploader = Arc::new(FlakyUploader::failing(0));
        let publisher = CertificatePublisher::new(uploader.clone(), 5, Duration::ZERO);

        let outcome = publisher.publish(&certificate()).await.unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(uploader.calls(), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_bound() {
        let uploader = Arc::new(FlakyUploader::failing(3));
        let publisher = CertificatePublisher::new(uploader.clone(), 5, Duration::ZERO);

        let outcome = publisher.publish(&certificate()).await.unwrap();
        assert_eq!(outcome.attempts, 4);
        assert_eq!(uploader.calls(), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_attempt_count() {
        let uploader = Arc::new(FlakyUploader::failing(u32::MAX));
        let publisher = CertificatePublisher::new(uploader.clone(), 3, Duration::ZERO);

        let err = publisher.publish(&certificate()).await.unwrap_err();
        match err {
            PublishError::UploadFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected UploadFailed, got {other:?}"),
        }
        assert_eq!(uploader.calls(), 3);
    }

    #[tokio::test]
    async fn zero_max_attempts_is_clamped_to_one() {
        let uploader = Arc::new(FlakyUploader::failing(u32::MAX));
        let publisher = CertificatePublisher::new(uploader.clone(), 0, Duration::ZERO);

        let err = publisher.publish(&certificate()).await.unwrap_err();
        assert!(matches!(err, PublishError::UploadFailed { attempts: 1, .. }));
    }
}
