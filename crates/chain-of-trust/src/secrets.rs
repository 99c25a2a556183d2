//! Signing-key retrieval.
//!
//! The key file is read through the platform's native reader (see
//! [`Platform::file_read_invocation`]) rather than a direct file open, so
//! host-level ACL and ownership enforcement on the key path stays with the
//! OS command semantics the deployment was validated against. The key bytes
//! exist only on the child's stdout pipe and in the returned [`SigningKey`];
//! they are never cached, never written to disk, and never rendered into
//! error text.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::process::{CommandRunner, ExecutionError, Platform};

/// Length of an Ed25519 seed in bytes.
pub const SEED_LEN: usize = 32;

/// Signature algorithm of a provisioned key.
///
/// A single modern algorithm is supported; the enum exists so a key whose
/// declared algorithm disagrees with the signer's configuration is rejected
/// instead of silently signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignatureAlgorithm {
    /// Ed25519 (RFC 8032).
    Ed25519,
}

impl SignatureAlgorithm {
    /// Stable lowercase identifier used in the published certificate.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
        }
    }
}

/// Private signing-key material for one signing operation.
///
/// Owned exclusively by the signing operation that requested it; dropped
/// (and zeroed, best-effort) as soon as signing completes. Not `Clone` by
/// design: concurrent task finalizations each retrieve their own key.
pub struct SigningKey {
    algorithm: SignatureAlgorithm,
    seed: Zeroizing<[u8; SEED_LEN]>,
}

impl SigningKey {
    /// Wraps raw seed bytes under an algorithm identifier.
    #[must_use]
    pub fn new(algorithm: SignatureAlgorithm, seed: [u8; SEED_LEN]) -> Self {
        Self {
            algorithm,
            seed: Zeroizing::new(seed),
        }
    }

    /// The declared algorithm of this key.
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// The raw seed bytes.
    #[must_use]
    pub fn seed(&self) -> &[u8; SEED_LEN] {
        &self.seed
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .field("seed", &crate::redact::REDACTED)
            .finish()
    }
}

/// Errors from signing-key retrieval.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SecretError {
    /// The key file could not be read by the native reader.
    #[error("signing key unreadable: {0}")]
    Unreadable(#[from] ExecutionError),

    /// The key file read succeeded but produced zero bytes.
    #[error("signing key file is empty")]
    Empty,

    /// The key bytes do not parse as a key of the expected algorithm.
    ///
    /// Deliberately carries no payload: malformed key material must not
    /// leak through error text.
    #[error("signing key is malformed (expected a 32-byte ed25519 seed, raw, base64 or hex)")]
    MalformedKey,
}

/// Retrieves signing-key material through the [`CommandRunner`].
pub struct SecretAccessor {
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    timeout: Duration,
}

impl SecretAccessor {
    /// Creates an accessor for the given platform and command deadline.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, platform: Platform, timeout: Duration) -> Self {
        Self {
            runner,
            platform,
            timeout,
        }
    }

    /// Reads and parses the signing key at `location`.
    ///
    /// The key is re-read on every call; nothing is cached, keeping the
    /// in-memory lifetime of the material scoped to one signing operation.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Unreadable`] when the read helper fails,
    /// [`SecretError::Empty`] when the file holds zero bytes, and
    /// [`SecretError::MalformedKey`] when the contents do not decode to a
    /// 32-byte Ed25519 seed.
    pub async fn read_signing_key(&self, location: &Path) -> Result<SigningKey, SecretError> {
        let invocation = self.platform.file_read_invocation(location);
        let output = self.runner.run(&invocation, self.timeout).await?;

        // Take ownership under Zeroizing before any parsing so the raw
        // material is wiped regardless of the parse outcome.
        let raw = Zeroizing::new(output.stdout);
        if raw.is_empty() {
            return Err(SecretError::Empty);
        }

        let seed = parse_seed(&raw)?;
        Ok(SigningKey::new(SignatureAlgorithm::Ed25519, *seed))
    }
}

/// Parses key-file contents into a 32-byte seed.
///
/// Accepts the three layouts seen in provisioned key files: the raw seed,
/// a base64 rendering, or a hex rendering, each optionally surrounded by
/// whitespace.
fn parse_seed(raw: &[u8]) -> Result<Zeroizing<[u8; SEED_LEN]>, SecretError> {
    let trimmed = trim_ascii_whitespace(raw);
    if trimmed.is_empty() {
        return Err(SecretError::Empty);
    }

    if trimmed.len() == SEED_LEN {
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        seed.copy_from_slice(trimmed);
        return Ok(seed);
    }

    let text = std::str::from_utf8(trimmed).map_err(|_| SecretError::MalformedKey)?;

    // The hex alphabet is a subset of the base64 alphabet and a 64-char hex
    // seed is a multiple of 4 long, so it also base64-decodes (to 48 bytes).
    // Only a decode of exactly seed length identifies the encoding; anything
    // else falls through to the next candidate.
    if let Ok(bytes) = BASE64.decode(text) {
        let bytes = Zeroizing::new(bytes);
        if bytes.len() == SEED_LEN {
            let mut seed = Zeroizing::new([0u8; SEED_LEN]);
            seed.copy_from_slice(&bytes);
            return Ok(seed);
        }
    }
    if let Ok(bytes) = hex::decode(text) {
        let bytes = Zeroizing::new(bytes);
        if bytes.len() == SEED_LEN {
            let mut seed = Zeroizing::new([0u8; SEED_LEN]);
            seed.copy_from_slice(&bytes);
            return Ok(seed);
        }
    }
    Err(SecretError::MalformedKey)
}

/// Trims leading and trailing ASCII whitespace from a byte slice.
fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
