//! Canonical byte encoding of task evidence.
//!
//! The canonical form is the exact input to the signer, so it must be
//! byte-exact and order-stable: fixed field order, little-endian fixed-width
//! integers, and an explicit `u32` length prefix on every variable-length
//! field. Length prefixes (rather than delimiters) mean artifact names
//! containing any byte sequence cannot ambiguously re-frame the encoding.
//!
//! The first byte of the encoding is the canonical-form version, echoed in
//! the published certificate. Changing anything about the layout requires a
//! new version; every version ever issued must remain decodable here so
//! verification tooling can check old certificates. Version 1 is the only
//! version issued so far.
//!
//! The embedded task definition is serialized with `serde_json`, whose
//! default map representation is ordered by key, so equal definitions
//! serialize identically regardless of the key order they arrived with.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::evidence::{ArtifactEvidence, DIGEST_LEN, TaskEvidence};

/// Current canonical-form version.
pub const CANONICAL_VERSION: u8 = 1;

/// Errors from canonical encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// The task definition could not be serialized to JSON.
    #[error("task definition not serializable: {message}")]
    TaskDefinition {
        /// Serializer error text.
        message: String,
    },

    /// A variable-length field exceeds the `u32` length-prefix range.
    #[error("field too long for canonical form: {len} bytes")]
    FieldTooLong {
        /// Offending length.
        len: usize,
    },

    /// The decoder does not know this canonical-form version.
    #[error("unsupported canonical form version: {version}")]
    UnsupportedVersion {
        /// Version byte found in the encoding.
        version: u8,
    },

    /// The encoding ended before a field was complete.
    #[error("canonical form truncated")]
    Truncated,

    /// Bytes remained after the last field.
    #[error("canonical form has trailing bytes")]
    TrailingBytes,

    /// A string field was not valid UTF-8.
    #[error("canonical form string field is not valid UTF-8")]
    InvalidUtf8,

    /// The embedded task definition was not valid JSON.
    #[error("embedded task definition is not valid JSON: {message}")]
    InvalidJson {
        /// Parser error text.
        message: String,
    },
}

/// Encodes evidence into its canonical byte form.
///
/// Deterministic: equal evidence (the collector already fixes artifact and
/// environment ordering) yields byte-identical output on every call.
///
/// # Errors
///
/// Returns [`CanonicalError::TaskDefinition`] when the task definition
/// cannot be serialized, or [`CanonicalError::FieldTooLong`] when a field
/// exceeds the length-prefix range.
pub fn canonicalize(evidence: &TaskEvidence) -> Result<Vec<u8>, CanonicalError> {
    let task_definition =
        serde_json::to_vec(&evidence.task_definition).map_err(|e| CanonicalError::TaskDefinition {
            message: e.to_string(),
        })?;

    let mut out = Vec::with_capacity(256 + task_definition.len());
    out.push(CANONICAL_VERSION);

    put_bytes(&mut out, evidence.task_id.as_bytes())?;
    put_bytes(&mut out, evidence.run_id.as_bytes())?;
    put_bytes(&mut out, evidence.worker_group.as_bytes())?;
    put_bytes(&mut out, evidence.worker_id.as_bytes())?;
    put_bytes(&mut out, &task_definition)?;

    put_count(&mut out, evidence.artifacts.len())?;
    for artifact in &evidence.artifacts {
        put_bytes(&mut out, artifact.name.as_bytes())?;
        out.extend_from_slice(&artifact.digest);
        out.extend_from_slice(&artifact.size.to_le_bytes());
    }

    put_count(&mut out, evidence.environment.len())?;
    for (name, value) in &evidence.environment {
        put_bytes(&mut out, name.as_bytes())?;
        put_bytes(&mut out, value.as_bytes())?;
    }

    Ok(out)
}

/// Decodes a canonical form back into evidence.
///
/// Exists for verification tooling: every canonical-form version ever
/// issued stays decodable.
///
/// # Errors
///
/// Returns [`CanonicalError::UnsupportedVersion`] for an unknown version
/// byte, and the structural variants for malformed encodings.
pub fn decode(bytes: &[u8]) -> Result<TaskEvidence, CanonicalError> {
    let (&version, rest) = bytes.split_first().ok_or(CanonicalError::Truncated)?;
    match version {
        1 => decode_v1(rest),
        other => Err(CanonicalError::UnsupportedVersion { version: other }),
    }
}

/// SHA-256 digest over the whole canonical form.
///
/// Recorded in the certificate as the task-evidence digest.
#[must_use]
pub fn evidence_digest(canonical: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(canonical);
    hasher.finalize().into()
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CanonicalError> {
    let len =
        u32::try_from(bytes.len()).map_err(|_| CanonicalError::FieldTooLong { len: bytes.len() })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_count(out: &mut Vec<u8>, count: usize) -> Result<(), CanonicalError> {
    let count =
        u32::try_from(count).map_err(|_| CanonicalError::FieldTooLong { len: count })?;
    out.extend_from_slice(&count.to_le_bytes());
    Ok(())
}

/// Sequential reader over a canonical encoding.
struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CanonicalError> {
        if self.bytes.len() < n {
            return Err(CanonicalError::Truncated);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, CanonicalError> {
        let raw = self.take(4)?;
        let arr: [u8; 4] = raw.try_into().map_err(|_| CanonicalError::Truncated)?;
        Ok(u32::from_le_bytes(arr))
    }

    fn u64(&mut self) -> Result<u64, CanonicalError> {
        let raw = self.take(8)?;
        let arr: [u8; 8] = raw.try_into().map_err(|_| CanonicalError::Truncated)?;
        Ok(u64::from_le_bytes(arr))
    }

    fn bytes_field(&mut self) -> Result<&'a [u8], CanonicalError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string_field(&mut self) -> Result<String, CanonicalError> {
        let raw = self.bytes_field()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| CanonicalError::InvalidUtf8)
    }
}

fn decode_v1(bytes: &[u8]) -> Result<TaskEvidence, CanonicalError> {
    let mut cursor = Cursor { bytes };

    let task_id = cursor.string_field()?;
    let run_id = cursor.string_field()?;
    let worker_group = cursor.string_field()?;
    let worker_id = cursor.string_field()?;

    let definition_raw = cursor.bytes_field()?;
    let task_definition =
        serde_json::from_slice(definition_raw).map_err(|e| CanonicalError::InvalidJson {
            message: e.to_string(),
        })?;

    let artifact_count = cursor.u32()? as usize;
    let mut artifacts = Vec::with_capacity(artifact_count.min(1024));
    for _ in 0..artifact_count {
        let name = cursor.string_field()?;
        let digest_raw = cursor.take(DIGEST_LEN)?;
        let digest: [u8; DIGEST_LEN] =
            digest_raw.try_into().map_err(|_| CanonicalError::Truncated)?;
        let size = cursor.u64()?;
        artifacts.push(ArtifactEvidence { name, digest, size });
    }

    let env_count = cursor.u32()? as usize;
    let mut environment = BTreeMap::new();
    for _ in 0..env_count {
        let name = cursor.string_field()?;
        let value = cursor.string_field()?;
        environment.insert(name, value);
    }

    if !cursor.bytes.is_empty() {
        return Err(CanonicalError::TrailingBytes);
    }

    Ok(TaskEvidence {
        task_id,
        run_id,
        worker_group,
        worker_id,
        task_definition,
        artifacts,
        environment,
    })
}
