//! Chain-of-trust certificates for task-worker runs.
//!
//! After a task finishes, this crate collects evidence of what ran — the
//! artifacts produced, the task definition, and an allow-listed environment
//! snapshot — canonicalizes it into a deterministic byte form, signs that
//! form with a host-provisioned Ed25519 key, and publishes the result as a
//! `chain-of-trust.json` artifact that downstream tooling can verify.
//!
//! # Pipeline
//!
//! ```text
//! EvidenceCollector ─┐
//!                    ├─> canonicalize -> EvidenceSigner -> CertificatePublisher
//! SecretAccessor ────┘
//! ```
//!
//! Evidence collection and key retrieval are independent and run
//! concurrently; see [`feature::ChainOfTrustFeature`] for the full state
//! machine and failure policy.
//!
//! # Key handling
//!
//! The signing key is read per signing operation through the platform's
//! native file reader (so OS ACL semantics on the key path apply), held
//! only in memory for the duration of signing, zeroed on drop, and never
//! logged, persisted, or shared between concurrent finalizations.
//!
//! # External seams
//!
//! The two collaborators the worker must provide are
//! [`process::CommandRunner`] (production: [`process::TokioCommandRunner`])
//! and [`publish::ArtifactUploader`] (the worker's artifact-upload
//! transport).

pub mod canonical;
pub mod config;
pub mod evidence;
pub mod feature;
pub mod process;
pub mod publish;
pub mod redact;
pub mod secrets;
pub mod signer;

pub use canonical::{CANONICAL_VERSION, CanonicalError, canonicalize, decode, evidence_digest};
pub use config::{ChainOfTrustConfig, ConfigError};
pub use evidence::{
    ArtifactEvidence, CollectionError, EvidenceCollector, ProducedArtifact, TaskEvidence, TaskRun,
};
pub use feature::{CertificateReceipt, ChainOfTrustError, ChainOfTrustFeature};
pub use process::{
    CommandInvocation, CommandOutput, CommandRunner, ExecutionError, Platform, TokioCommandRunner,
};
pub use publish::{
    ArtifactUploader, CERTIFICATE_ARTIFACT_NAME, CERTIFICATE_CONTENT_TYPE, CertificatePublisher,
    PublishError, PublishOutcome, UploadError,
};
pub use secrets::{SecretAccessor, SecretError, SignatureAlgorithm, SigningKey};
pub use signer::{Certificate, CertificateArtifact, EvidenceSigner, SignError, SignedAttestation};
