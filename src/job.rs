//! The unit of work: one source object mapped to one Markdown artefact.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Maximum length of the sanitised file stem.
const MAX_STEM_LEN: usize = 200;

/// Lifecycle status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One document conversion.
///
/// Created from a listed (or reloaded) source key; only the dispatcher's
/// worker that owns it mutates `backend`, `attempt` and `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub source_key: String,
    pub destination_key: String,
    /// Endpoint used by the most recent attempt.
    pub backend: Option<Url>,
    /// Number of attempts made so far.
    pub attempt: u32,
    pub status: JobStatus,
}

impl Job {
    pub fn new(source_key: impl Into<String>, destination_key: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            destination_key: destination_key.into(),
            backend: None,
            attempt: 0,
            status: JobStatus::Pending,
        }
    }

    /// File name component of the source key, used for the multipart upload.
    pub fn file_name(&self) -> &str {
        self.source_key
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.source_key)
    }
}

/// Build jobs for `keys`, deriving one unique destination key per source key.
///
/// Order is preserved. When a key's plain name is already taken, it gets a
/// short hash of its source key appended; if that name is taken too (a source
/// file can literally be called `a_b_<hash>.pdf`), a counter follows the hash
/// until the name is free. No destination is written twice in one run.
pub fn build_jobs(keys: &[String], source_prefix: &str, destination_prefix: &str) -> Vec<Job> {
    let mut seen: HashSet<String> = HashSet::with_capacity(keys.len());
    let mut jobs = Vec::with_capacity(keys.len());

    for key in keys {
        let stem = safe_stem(key, source_prefix);
        let mut destination = join_key(destination_prefix, &format!("{stem}.md"));
        if seen.contains(&destination) {
            destination = disambiguate(key, &stem, destination_prefix, &seen);
            tracing::warn!(
                source = %key,
                destination = %destination,
                "destination name collision, disambiguated with hash suffix"
            );
        }
        seen.insert(destination.clone());
        jobs.push(Job::new(key.clone(), destination));
    }
    jobs
}

/// First free `<stem>_<hash8>[_<n>].md` under `destination_prefix`.
fn disambiguate(key: &str, stem: &str, destination_prefix: &str, seen: &HashSet<String>) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    let hashed = format!("{stem}_{}", &digest[..8]);
    let candidate = join_key(destination_prefix, &format!("{hashed}.md"));
    if !seen.contains(&candidate) {
        return candidate;
    }
    (2usize..)
        .map(|n| join_key(destination_prefix, &format!("{hashed}_{n}.md")))
        .find(|c| !seen.contains(c))
        .unwrap_or(candidate)
}

/// Sanitised stem for a source key: relative to `source_prefix`, extension
/// dropped, anything outside `[A-Za-z0-9_-]` replaced by `_`.
pub fn safe_stem(key: &str, source_prefix: &str) -> String {
    let prefix = source_prefix.trim_matches('/');
    let trimmed = key.trim_start_matches('/');
    let relative = if prefix.is_empty() {
        trimmed
    } else {
        trimmed
            .strip_prefix(prefix)
            .filter(|r| r.starts_with('/'))
            .map(|r| r.trim_start_matches('/'))
            .filter(|r| !r.is_empty())
            .unwrap_or(trimmed)
    };

    let without_ext = match relative.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !stem.ends_with('/') && !ext.contains('/') => stem,
        _ => relative,
    };

    let mut safe: String = without_ext
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    safe.truncate(MAX_STEM_LEN);
    if safe.is_empty() {
        safe.push_str("document");
    }
    safe
}

/// Join a store prefix and a name with exactly one `/`.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
