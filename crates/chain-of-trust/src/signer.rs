//! Ed25519 signing over canonical evidence and certificate assembly.
//!
//! Signing is a pure function over the canonical bytes and the key: no I/O
//! happens here. The key is consumed by value and dropped as soon as the
//! signature exists, which zeroes the seed (best-effort) via its
//! `Zeroizing` wrapper.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::canonical::{CANONICAL_VERSION, evidence_digest};
use crate::evidence::{DIGEST_ALGORITHM, TaskEvidence};
use crate::secrets::{SignatureAlgorithm, SigningKey};

/// Errors from the signing step. Always fatal; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignError {
    /// The key's declared algorithm is not the signer's configured one.
    #[error("signing key algorithm mismatch: expected {expected}, got {actual}")]
    AlgorithmMismatch {
        /// Algorithm the signer is configured for.
        expected: &'static str,
        /// Algorithm the key declares.
        actual: &'static str,
    },

    /// The key bytes fail algorithm-specific validation.
    #[error("signing key failed validation")]
    InvalidKey,
}

/// A signature plus the public key that verifies it.
#[derive(Debug, Clone)]
pub struct SignedAttestation {
    signature: Signature,
    verifying_key: VerifyingKey,
}

impl SignedAttestation {
    /// The Ed25519 signature.
    #[must_use]
    pub const fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The public verifying key.
    #[must_use]
    pub const fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Hex rendering of the 64-byte signature.
    #[must_use]
    pub fn signature_hex(&self) -> String {
        hex::encode(self.signature.to_bytes())
    }

    /// Fingerprint of the public key: `ed25519:` followed by the hex
    /// SHA-256 of the 32 public-key bytes.
    #[must_use]
    pub fn public_key_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.verifying_key.as_bytes());
        format!("ed25519:{}", hex::encode(hasher.finalize()))
    }
}

/// Signs canonical evidence bytes with a configured algorithm.
#[derive(Debug, Clone, Copy)]
pub struct EvidenceSigner {
    algorithm: SignatureAlgorithm,
}

impl EvidenceSigner {
    /// An Ed25519 signer, the only supported configuration.
    #[must_use]
    pub const fn ed25519() -> Self {
        Self {
            algorithm: SignatureAlgorithm::Ed25519,
        }
    }

    /// Signs the canonical bytes, consuming the key.
    ///
    /// # Errors
    ///
    /// Returns [`SignError::AlgorithmMismatch`] when the key declares a
    /// different algorithm than this signer is configured for, and
    /// [`SignError::InvalidKey`] when the key bytes fail validation (an
    /// all-zero seed, or a weak derived public key).
    pub fn sign(&self, canonical: &[u8], key: SigningKey) -> Result<SignedAttestation, SignError> {
        if key.algorithm() != self.algorithm {
            return Err(SignError::AlgorithmMismatch {
                expected: self.algorithm.as_str(),
                actual: key.algorithm().as_str(),
            });
        }

        // An all-zero seed is the classic unprovisioned-key sentinel; it
        // must never produce a certificate.
        if key.seed().iter().all(|&b| b == 0) {
            return Err(SignError::InvalidKey);
        }

        let dalek_key = ed25519_dalek::SigningKey::from_bytes(key.seed());
        let verifying_key = dalek_key.verifying_key();
        if verifying_key.is_weak() {
            return Err(SignError::InvalidKey);
        }

        let signature = dalek_key.sign(canonical);
        // `key` drops here; its Zeroizing wrapper wipes the seed. The dalek
        // key zeroizes its own copy on drop.
        drop(key);

        Ok(SignedAttestation {
            signature,
            verifying_key,
        })
    }
}

/// Verifies a signature over canonical evidence bytes.
#[must_use]
pub fn verify(message: &[u8], signature: &Signature, key: &VerifyingKey) -> bool {
    key.verify(message, signature).is_ok()
}

/// One artifact entry in the published certificate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateArtifact {
    /// Artifact upload name.
    pub name: String,
    /// Digest algorithm identifier (`sha256`).
    pub digest_algorithm: String,
    /// Hex digest of the artifact bytes.
    pub digest_hex: String,
    /// Artifact size in bytes.
    pub size: u64,
}

/// The published chain-of-trust certificate.
///
/// Created exactly once per task run that enables the feature, immutable
/// after creation, and discarded whole if publishing ultimately fails.
/// The field set and naming are parsed by downstream verification tooling;
/// layout changes require a new `version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    /// Canonical-form version the signature was computed over.
    pub version: u32,
    /// Task identifier.
    pub task_id: String,
    /// Run identifier.
    pub run_id: String,
    /// Worker group of the producing run.
    pub worker_group: String,
    /// Worker identifier of the producing run.
    pub worker_id: String,
    /// Artifact digests, in artifact-name order.
    pub artifacts: Vec<CertificateArtifact>,
    /// Allow-listed environment snapshot.
    pub environment: BTreeMap<String, String>,
    /// Hex SHA-256 over the whole canonical evidence form.
    pub task_evidence_digest: String,
    /// Fingerprint of the signing key's public half.
    pub public_key_fingerprint: String,
    /// Signing time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Hex Ed25519 signature over the canonical evidence form.
    pub signature: String,
}

impl Certificate {
    /// Assembles the certificate for signed evidence.
    #[must_use]
    pub fn build(
        evidence: &TaskEvidence,
        canonical: &[u8],
        attestation: &SignedAttestation,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let artifacts = evidence
            .artifacts
            .iter()
            .map(|a| CertificateArtifact {
                name: a.name.clone(),
                digest_algorithm: DIGEST_ALGORITHM.to_string(),
                digest_hex: a.digest_hex(),
                size: a.size,
            })
            .collect();

        Self {
            version: u32::from(CANONICAL_VERSION),
            task_id: evidence.task_id.clone(),
            run_id: evidence.run_id.clone(),
            worker_group: evidence.worker_group.clone(),
            worker_id: evidence.worker_id.clone(),
            artifacts,
            environment: evidence.environment.clone(),
            task_evidence_digest: hex::encode(evidence_digest(canonical)),
            public_key_fingerprint: attestation.public_key_fingerprint(),
            timestamp,
            signature: attestation.signature_hex(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;
    use crate::evidence::ArtifactEvidence;

    fn sample_evidence() -> TaskEvidence {
        TaskEvidence {
            task_id: "task-abc".to_string(),
            run_id: "0".to_string(),
            worker_group: "us-east-1".to_string(),
            worker_id: "worker-7".to_string(),
            task_definition: serde_json::json!({"payload": {}}),
            artifacts: vec![ArtifactEvidence {
                name: "a.txt".to_string(),
                digest: [0x11; 32],
                size: 12,
            }],
            environment: BTreeMap::new(),
        }
    }

    fn key() -> SigningKey {
        SigningKey::new(SignatureAlgorithm::Ed25519, [0x42; 32])
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let canonical = canonicalize(&sample_evidence()).unwrap();
        let attestation = EvidenceSigner::ed25519().sign(&canonical, key()).unwrap();

        assert!(verify(
            &canonical,
            attestation.signature(),
            attestation.verifying_key()
        ));
    }

    #[test]
    fn flipping_any_byte_invalidates_the_signature() {
        let canonical = canonicalize(&sample_evidence()).unwrap();
        let attestation = EvidenceSigner::ed25519().sign(&canonical, key()).unwrap();

        for index in [0, 1, canonical.len() / 2, canonical.len() - 1] {
            let mut tampered = canonical.clone();
            tampered[index] ^= 0x01;
            assert!(
                !verify(&tampered, attestation.signature(), attestation.verifying_key()),
                "flip at byte {index} should invalidate the signature"
            );
        }
    }

    #[test]
    fn signatures_are_deterministic_for_a_fixed_seed() {
        let canonical = canonicalize(&sample_evidence()).unwrap();
        let signer = EvidenceSigner::ed25519();

        let first = signer.sign(&canonical, key()).unwrap();
        let second = signer.sign(&canonical, key()).unwrap();
        assert_eq!(first.signature_hex(), second.signature_hex());
    }

    #[test]
    fn zero_seed_is_rejected() {
        let canonical = canonicalize(&sample_evidence()).unwrap();
        let zero = SigningKey::new(SignatureAlgorithm::Ed25519, [0u8; 32]);

        let err = EvidenceSigner::ed25519().sign(&canonical, zero).unwrap_err();
        assert_eq!(err, SignError::InvalidKey);
    }

    #[test]
    fn fingerprint_is_prefixed_and_stable() {
        let canonical = canonicalize(&sample_evidence()).unwrap();
        let attestation = EvidenceSigner::ed25519().sign(&canonical, key()).unwrap();

        let fingerprint = attestation.public_key_fingerprint();
        assert!(fingerprint.starts_with("ed25519:"));
        // 8-char prefix plus 64 hex chars of SHA-256.
        assert_eq!(fingerprint.len(), "ed25519:".len() + 64);
        assert_eq!(fingerprint, attestation.public_key_fingerprint());
    }

    #[test]
    fn certificate_carries_evidence_in_order() {
        let evidence = sample_evidence();
        let canonical = canonicalize(&evidence).unwrap();
        let attestation = EvidenceSigner::ed25519().sign(&canonical, key()).unwrap();

        let certificate = Certificate::build(&evidence, &canonical, &attestation, Utc::now());
        assert_eq!(certificate.version, 1);
        assert_eq!(certificate.task_id, "task-abc");
        assert_eq!(certificate.artifacts.len(), 1);
        assert_eq!(certificate.artifacts[0].digest_algorithm, "sha256");
        assert_eq!(certificate.artifacts[0].digest_hex, hex::encode([0x11; 32]));
        assert_eq!(
            certificate.task_evidence_digest,
            hex::encode(evidence_digest(&canonical))
        );
        assert!(!certificate.signature.is_empty());
    }

    #[test]
    fn certificate_serializes_with_stable_field_names() {
        let evidence = sample_evidence();
        let canonical = canonicalize(&evidence).unwrap();
        let attestation = EvidenceSigner::ed25519().sign(&canonical, key()).unwrap();
        let certificate = Certificate::build(&evidence, &canonical, &attestation, Utc::now());

        let json = serde_json::to_string(&certificate).unwrap();
        for field in [
            "\"version\"",
            "\"taskId\"",
            "\"runId\"",
            "\"workerGroup\"",
            "\"workerId\"",
            "\"artifacts\"",
            "\"digestAlgorithm\"",
            "\"digestHex\"",
            "\"environment\"",
            "\"taskEvidenceDigest\"",
            "\"publicKeyFingerprint\"",
            "\"timestamp\"",
            "\"signature\"",
        ] {
            assert!(json.contains(field), "missing {field} in {json}");
        }

        let parsed: Certificate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, certificate);
    }
}
