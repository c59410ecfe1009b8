//! Per-backend outcomes and their aggregation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The backend rejected the input.
    Validation,
    /// The backend, the transport, or the call itself broke.
    ServerError,
}

// ---------------------------------------------------------------------------
// OperationResult
// ---------------------------------------------------------------------------

/// Outcome of one orchestration step against one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub kind: BackendKind,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl OperationResult {
    pub fn ok(kind: BackendKind) -> Self {
        Self {
            kind,
            errors: Vec::new(),
            severity: None,
        }
    }

    pub fn rejected(kind: BackendKind, messages: impl IntoIterator<Item = String>) -> Self {
        Self::with_errors(kind, messages, Severity::Validation)
    }

    pub fn server_error(kind: BackendKind, message: impl Into<String>) -> Self {
        Self::with_errors(kind, [message.into()], Severity::ServerError)
    }

    pub fn with_errors(
        kind: BackendKind,
        messages: impl IntoIterator<Item = String>,
        severity: Severity,
    ) -> Self {
        let errors: Vec<String> = messages.into_iter().collect();
        let severity = if errors.is_empty() {
            None
        } else {
            Some(severity)
        };
        Self {
            kind,
            errors,
            severity,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold another result for the same backend into this one.
    ///
    /// Severity escalates: a server error anywhere wins over validation.
    pub fn absorb(&mut self, other: OperationResult) {
        self.errors.extend(other.errors);
        self.severity = match (self.severity, other.severity) {
            (Some(Severity::ServerError), _) | (_, Some(Severity::ServerError)) => {
                Some(Severity::ServerError)
            }
            (Some(s), _) | (None, Some(s)) => Some(s),
            (None, None) => None,
        };
    }
}

// ---------------------------------------------------------------------------
// ResultSet
// ---------------------------------------------------------------------------

/// Aggregated outcome of one fan-out, in the order backends were resolved.
///
/// An empty set means no backend was applicable; that is a valid, successful
/// outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    entries: Vec<OperationResult>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a result, merging into an existing entry for the same backend.
    pub fn record(&mut self, result: OperationResult) {
        match self.entries.iter_mut().find(|e| e.kind == result.kind) {
            Some(existing) => existing.absorb(result),
            None => self.entries.push(result),
        }
    }

    pub fn entries(&self) -> &[OperationResult] {
        &self.entries
    }

    pub fn get(&self, kind: BackendKind) -> Option<&OperationResult> {
        self.entries.iter().find(|e| e.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.entries.iter().all(OperationResult::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &OperationResult> {
        self.entries.iter().filter(|e| !e.is_success())
    }

    /// The first backend, in resolution order, that reported an error.
    pub fn first_failed_kind(&self) -> Option<BackendKind> {
        self.failed().next().map(|e| e.kind)
    }

    pub fn error_count(&self) -> usize {
        self.entries.iter().map(|e| e.errors.len()).sum()
    }

    /// Append every entry of `other`, merging per backend.
    pub fn extend(&mut self, other: ResultSet) {
        for entry in other.entries {
            self.record(entry);
        }
    }
}

impl fmt::Display for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in self.failed() {
            for message in &entry.errors {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "[{}] {message}", entry.kind)?;
                first = false;
            }
        }
        if first {
            f.write_str("ok")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IdleCheckResult
// ---------------------------------------------------------------------------

/// One backend's answer to "is this project idle?".
///
/// `idle` is `None` when the check itself faulted; `error` then says why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleCheckResult {
    pub kind: BackendKind,
    pub project_key: String,
    pub idle: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_result_set_is_success() {
        let set = ResultSet::new();
        assert!(set.is_empty());
        assert!(set.is_success());
        assert_eq!(set.first_failed_kind(), None);
        assert_eq!(set.to_string(), "ok");
    }

    #[test]
    fn rejected_without_messages_is_success() {
        let r = OperationResult::rejected(BackendKind::Wiki, Vec::new());
        assert!(r.is_success());
        assert_eq!(r.severity, None);
    }

    #[test]
    fn record_merges_entries_for_same_backend() {
        let mut set = ResultSet::new();
        set.record(OperationResult::rejected(
            BackendKind::Wiki,
            vec!["space key taken".to_string()],
        ));
        set.record(OperationResult::server_error(BackendKind::Wiki, "boom"));
        set.record(OperationResult::ok(BackendKind::Tracker));

        assert_eq!(set.entries().len(), 2);
        let wiki = set.get(BackendKind::Wiki).unwrap();
        assert_eq!(wiki.errors.len(), 2);
        assert_eq!(wiki.severity, Some(Severity::ServerError));
        assert_eq!(set.error_count(), 2);
        assert!(!set.is_success());
    }

    #[test]
    fn first_failed_kind_follows_resolution_order() {
        let mut set = ResultSet::new();
        set.record(OperationResult::ok(BackendKind::Tracker));
        set.record(OperationResult::rejected(
            BackendKind::SourceControl,
            vec!["repo exists".to_string()],
        ));
        set.record(OperationResult::server_error(BackendKind::Build, "503"));
        assert_eq!(set.first_failed_kind(), Some(BackendKind::SourceControl));
        assert_eq!(
            set.to_string(),
            "[source-control] repo exists; [build] 503"
        );
    }
}
