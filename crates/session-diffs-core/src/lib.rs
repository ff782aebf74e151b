//! Data model and decoding rules for persisted execution-diff records.
//!
//! Storage backends hand this crate [`RawExecutionDiffRecord`] rows and get
//! back [`ExecutionDiffRecord`] values with `files_changed` decoded into an
//! ordered list of file names. Nothing here performs I/O.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DiffError {
    #[error("storage unavailable: {detail}; {hint}")]
    StorageUnavailable { detail: String, hint: String },
    #[error("malformed files_changed encoding in record {record_id}: {detail}")]
    MalformedEncoding { record_id: String, detail: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DiffError {
    pub fn storage_unavailable(detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            detail: detail.into(),
            hint: hint.into(),
        }
    }

    /// Remediation hint carried by [`DiffError::StorageUnavailable`].
    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::StorageUnavailable { hint, .. } => Some(hint),
            _ => None,
        }
    }
}

/// An execution-diff row exactly as persisted, `files_changed` still encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawExecutionDiffRecord {
    pub id: String,
    pub session_id: String,
    pub prompt_marker_id: Option<String>,
    pub execution_sequence: u32,
    pub git_diff: Option<String>,
    pub files_changed: Option<String>,
    pub stats_additions: u32,
    pub stats_deletions: u32,
    pub stats_files_changed: u32,
    pub before_commit_hash: Option<String>,
    pub after_commit_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl RawExecutionDiffRecord {
    /// Decodes this row. See [`normalize`].
    ///
    /// # Errors
    /// Returns [`DiffError::MalformedEncoding`] when `files_changed` is present
    /// but is not a JSON array of strings.
    pub fn normalize(self) -> Result<ExecutionDiffRecord, DiffError> {
        normalize(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionDiffRecord {
    pub id: String,
    pub session_id: String,
    pub prompt_marker_id: Option<String>,
    pub execution_sequence: u32,
    pub git_diff: Option<String>,
    pub files_changed: Vec<String>,
    /// False when the stored column held no list at all.
    pub files_changed_present: bool,
    pub stats_additions: u32,
    pub stats_deletions: u32,
    pub stats_files_changed: u32,
    pub before_commit_hash: Option<String>,
    pub after_commit_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ExecutionDiffRecord {
    /// Whether `stats_files_changed` agrees with the decoded file list.
    ///
    /// Only checked when a list was stored. Informational only; readers never
    /// reject a record on this basis.
    #[must_use]
    pub fn stats_consistent(&self) -> bool {
        !self.files_changed_present
            || usize::try_from(self.stats_files_changed)
                .is_ok_and(|count| count == self.files_changed.len())
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.git_diff
            .as_deref()
            .is_some_and(|diff| !diff.trim().is_empty())
    }
}

/// Input for the write path. The store fills in `id` and `timestamp` when absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionDiffInput {
    pub id: Option<String>,
    pub session_id: String,
    pub prompt_marker_id: Option<String>,
    pub execution_sequence: u32,
    pub git_diff: Option<String>,
    pub files_changed: Option<Vec<String>>,
    pub stats_additions: u32,
    pub stats_deletions: u32,
    pub stats_files_changed: u32,
    pub before_commit_hash: Option<String>,
    pub after_commit_hash: Option<String>,
    pub timestamp: Option<OffsetDateTime>,
}

impl ExecutionDiffInput {
    /// Validates a diff record before append.
    ///
    /// # Errors
    /// Returns [`DiffError::Validation`] when identifiers are blank or a
    /// file name is empty.
    pub fn validate(&self) -> Result<(), DiffError> {
        validate_session_id(&self.session_id)?;

        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(DiffError::Validation(
                    "id MUST NOT be blank when provided".to_string(),
                ));
            }
        }

        if let Some(files) = &self.files_changed {
            if files.iter().any(|name| name.is_empty()) {
                return Err(DiffError::Validation(
                    "files_changed entries MUST be non-empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Rejects empty or whitespace-only session identifiers.
///
/// # Errors
/// Returns [`DiffError::Validation`] for a blank identifier.
pub fn validate_session_id(session_id: &str) -> Result<(), DiffError> {
    if session_id.trim().is_empty() {
        return Err(DiffError::Validation(
            "session_id MUST be a non-empty identifier".to_string(),
        ));
    }
    Ok(())
}

/// Decodes the `files_changed` column of a raw record.
///
/// An absent column, an empty string, or a JSON `null` all decode to an empty
/// list and leave `files_changed_present` unset. Every other field is carried
/// over untouched.
///
/// # Errors
/// Returns [`DiffError::MalformedEncoding`] when the column holds anything
/// other than a JSON array of strings.
pub fn normalize(raw: RawExecutionDiffRecord) -> Result<ExecutionDiffRecord, DiffError> {
    let files_changed = decode_stored_files_changed(&raw.id, raw.files_changed.as_deref())?;

    Ok(ExecutionDiffRecord {
        id: raw.id,
        session_id: raw.session_id,
        prompt_marker_id: raw.prompt_marker_id,
        execution_sequence: raw.execution_sequence,
        git_diff: raw.git_diff,
        files_changed_present: files_changed.is_some(),
        files_changed: files_changed.unwrap_or_default(),
        stats_additions: raw.stats_additions,
        stats_deletions: raw.stats_deletions,
        stats_files_changed: raw.stats_files_changed,
        before_commit_hash: raw.before_commit_hash,
        after_commit_hash: raw.after_commit_hash,
        timestamp: raw.timestamp,
    })
}

/// # Errors
/// Returns [`DiffError::MalformedEncoding`] tagged with `record_id` when the
/// payload is not a JSON array of strings.
pub fn decode_files_changed(
    record_id: &str,
    encoded: Option<&str>,
) -> Result<Vec<String>, DiffError> {
    Ok(decode_stored_files_changed(record_id, encoded)?.unwrap_or_default())
}

/// `None` for a NULL column, an empty string, or JSON `null`. Whitespace alone
/// is not valid list syntax and is rejected.
fn decode_stored_files_changed(
    record_id: &str,
    encoded: Option<&str>,
) -> Result<Option<Vec<String>>, DiffError> {
    match encoded {
        None | Some("") => Ok(None),
        Some(encoded) => {
            serde_json::from_str(encoded).map_err(|err| DiffError::MalformedEncoding {
                record_id: record_id.to_string(),
                detail: format!("expected a JSON array of file names: {err}"),
            })
        }
    }
}

/// Encodes a file list the way [`decode_files_changed`] expects to read it.
///
/// # Errors
/// Returns [`DiffError::Validation`] if serialization fails.
pub fn encode_files_changed(files: &[String]) -> Result<String, DiffError> {
    serde_json::to_string(files)
        .map_err(|err| DiffError::Validation(format!("failed to encode files_changed: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDiffSummary {
    pub session_id: String,
    pub record_count: usize,
    pub total_additions: u64,
    pub total_deletions: u64,
    pub files_touched: Vec<String>,
    pub first_execution_sequence: Option<u32>,
    pub last_execution_sequence: Option<u32>,
    pub inconsistent_stats_records: usize,
}

/// Aggregates an ordered batch of records for one session.
///
/// `files_touched` keeps first-seen order across the batch.
#[must_use]
pub fn summarize_session(session_id: &str, records: &[ExecutionDiffRecord]) -> SessionDiffSummary {
    let mut seen = BTreeSet::new();
    let mut files_touched = Vec::new();
    let mut total_additions = 0_u64;
    let mut total_deletions = 0_u64;
    let mut inconsistent_stats_records = 0_usize;

    for record in records {
        total_additions += u64::from(record.stats_additions);
        total_deletions += u64::from(record.stats_deletions);
        if !record.stats_consistent() {
            inconsistent_stats_records += 1;
        }
        for file in &record.files_changed {
            if seen.insert(file.as_str()) {
                files_touched.push(file.clone());
            }
        }
    }

    SessionDiffSummary {
        session_id: session_id.to_string(),
        record_count: records.len(),
        total_additions,
        total_deletions,
        files_touched,
        first_execution_sequence: records.first().map(|record| record.execution_sequence),
        last_execution_sequence: records.last().map(|record| record.execution_sequence),
        inconsistent_stats_records,
    }
}

/// Parses a stored timestamp.
///
/// Accepts RFC3339 (converted to UTC) and the `YYYY-MM-DD HH:MM:SS[.ffffff]`
/// form `SQLite`'s `CURRENT_TIMESTAMP` produces, which is read as UTC.
///
/// # Errors
/// Returns [`DiffError::Validation`] when neither form matches.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, DiffError> {
    if let Ok(parsed) = OffsetDateTime::parse(value, &Rfc3339) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    let fractional =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
    let whole = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    for description in [fractional, whole] {
        if let Ok(parsed) = PrimitiveDateTime::parse(value, description) {
            return Ok(parsed.assume_utc());
        }
    }

    Err(DiffError::Validation(format!(
        "invalid timestamp: {value} (expected RFC3339 or YYYY-MM-DD HH:MM:SS)"
    )))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DiffError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DiffError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| DiffError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

pub const DEFAULT_DEV_SERVER_PORT: u16 = 5173;
pub const DEFAULT_API_PREFIX: &str = "/api";
pub const DEFAULT_API_TARGET: &str = "http://localhost:8000";

/// Local development server settings for the front-end bundler.
///
/// Declarative only: this crate loads, validates and prints it but never
/// proxies anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DevServerConfig {
    pub port: u16,
    #[serde(default)]
    pub proxy: BTreeMap<String, ProxyRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRule {
    pub target: String,
    #[serde(default)]
    pub change_origin: bool,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        let mut proxy = BTreeMap::new();
        proxy.insert(
            DEFAULT_API_PREFIX.to_string(),
            ProxyRule {
                target: DEFAULT_API_TARGET.to_string(),
                change_origin: true,
            },
        );
        Self {
            port: DEFAULT_DEV_SERVER_PORT,
            proxy,
        }
    }
}

impl DevServerConfig {
    /// # Errors
    /// Returns [`DiffError::Configuration`] when the port is zero, a prefix
    /// does not start with `/`, or a target is not an http(s) URL.
    pub fn validate(&self) -> Result<(), DiffError> {
        if self.port == 0 {
            return Err(DiffError::Configuration(
                "port MUST be in [1, 65535]".to_string(),
            ));
        }

        for (prefix, rule) in &self.proxy {
            if !prefix.starts_with('/') {
                return Err(DiffError::Configuration(format!(
                    "proxy prefix {prefix} MUST start with '/'"
                )));
            }

            let host = rule
                .target
                .strip_prefix("http://")
                .or_else(|| rule.target.strip_prefix("https://"));
            match host {
                Some(host) if !host.is_empty() => {}
                _ => {
                    return Err(DiffError::Configuration(format!(
                        "proxy target for {prefix} MUST be an http:// or https:// URL, got {}",
                        rule.target
                    )));
                }
            }
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON text.
    ///
    /// # Errors
    /// Returns [`DiffError::Configuration`] when decoding fails or the decoded
    /// values are invalid.
    pub fn from_json(raw: &str) -> Result<Self, DiffError> {
        let config: Self = serde_json::from_str(raw).map_err(|err| {
            DiffError::Configuration(format!("invalid dev server config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Longest configured prefix matching `path`, if any.
    #[must_use]
    pub fn proxy_rule_for(&self, path: &str) -> Option<(&str, &ProxyRule)> {
        self.proxy
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, rule)| (prefix.as_str(), rule))
    }
}
