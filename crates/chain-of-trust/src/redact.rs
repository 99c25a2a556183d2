//! Environment allow-listing for certificate evidence.
//!
//! The certificate embeds a snapshot of worker-identity environment
//! variables. Everything outside a fixed allow-list is dropped before the
//! snapshot is taken, so secrets that happen to live in the task environment
//! can never reach the published document or an error message. This inverts
//! the usual deny-list approach: an unknown variable is never safe.

use std::collections::BTreeMap;

/// The replacement text used wherever a value must not be shown.
pub const REDACTED: &str = "[REDACTED]";

/// Environment variables permitted in the evidence snapshot.
///
/// These identify the worker execution that produced the artifacts and
/// contain no credential material. Kept sorted for readability; the
/// snapshot itself is ordered by the `BTreeMap` it lands in.
pub const ENV_ALLOWLIST: &[&str] = &[
    "RUN_ID",
    "TASK_GROUP_ID",
    "TASK_ID",
    "WORKER_GROUP",
    "WORKER_ID",
    "WORKER_TYPE",
];

/// Returns `true` if the variable may appear in certificate evidence.
#[must_use]
pub fn is_allowlisted_env(name: &str) -> bool {
    ENV_ALLOWLIST.contains(&name)
}

/// Filters an environment snapshot down to the allow-listed subset.
///
/// The result is ordered by variable name, which keeps the canonical
/// encoding of the evidence stable across callers that supply the
/// environment in different orders.
#[must_use]
pub fn allowlisted_snapshot<'a, I>(env: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    env.into_iter()
        .filter(|(name, _)| is_allowlisted_env(name))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_admits_worker_identity() {
        assert!(is_allowlisted_env("TASK_ID"));
        assert!(is_allowlisted_env("RUN_ID"));
        assert!(is_allowlisted_env("WORKER_GROUP"));
        assert!(is_allowlisted_env("WORKER_ID"));
    }

    #[test]
    fn allowlist_rejects_everything_else() {
        assert!(!is_allowlisted_env("PATH"));
        assert!(!is_allowlisted_env("HOME"));
        assert!(!is_allowlisted_env("AWS_SECRET_ACCESS_KEY"));
        assert!(!is_allowlisted_env("TASKCLUSTER_ACCESS_TOKEN"));
        // Case matters: allow-listing is exact-match only.
        assert!(!is_allowlisted_env("task_id"));
    }

    #[test]
    fn snapshot_drops_unlisted_variables() {
        let env = [
            ("TASK_ID", "abc123"),
            ("SECRET_TOKEN", "hunter2"),
            ("WORKER_ID", "worker-7"),
        ];
        let snapshot = allowlisted_snapshot(env);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("TASK_ID").map(String::as_str), Some("abc123"));
        assert!(!snapshot.contains_key("SECRET_TOKEN"));
    }

    #[test]
    fn snapshot_is_ordered_by_name() {
        let env = [("WORKER_ID", "w"), ("RUN_ID", "0"), ("TASK_ID", "t")];
        let snapshot = allowlisted_snapshot(env);
        let keys: Vec<_> = snapshot.keys().map(String::as_str).collect();
        assert_eq!(keys, ["RUN_ID", "TASK_ID", "WORKER_ID"]);
    }
}
