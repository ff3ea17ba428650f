//! Error classification shared across the pipeline.
//!
//! Workers never let raw transport errors cross the job-state boundary;
//! every failure is converted to one of these kinds at the point it first
//! acquires meaning, and the kind is what the catalog records.

use serde::{Deserialize, Serialize};

/// Classified error kinds, persisted verbatim in `last_error_kind` and in
/// ingest events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed PDU, missing UIDs, length or hash mismatch
    Validation,
    /// Scratch write, fsync, rename, or final-path read failed
    StorageIo,
    /// Duplicate instance with differing content
    CatalogConflict,
    /// Database connection lost or timed out
    CatalogUnavailable,
    /// Peer refused the association
    PeerRejectAssociation,
    /// Peer refused the presentation context
    PeerRejectContext,
    /// Peer answered a failure-class C-STORE status
    PeerStatusFailure,
    /// Peer answered a warning-class C-STORE status
    PeerStatusWarning,
    /// Timeout, reset, refused-out-of-resources
    NetworkTransient,
    /// Heartbeat failed and another worker may hold the job
    LeaseLost,
    /// Operator cancellation
    Canceled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::StorageIo => "storage-io",
            ErrorKind::CatalogConflict => "catalog-conflict",
            ErrorKind::CatalogUnavailable => "catalog-unavailable",
            ErrorKind::PeerRejectAssociation => "peer-reject-association",
            ErrorKind::PeerRejectContext => "peer-reject-context",
            ErrorKind::PeerStatusFailure => "peer-status-failure",
            ErrorKind::PeerStatusWarning => "peer-status-warning",
            ErrorKind::NetworkTransient => "network-transient",
            ErrorKind::LeaseLost => "lease-lost",
            ErrorKind::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cap stored error details so one pathological peer message cannot bloat
/// the catalog.
pub const MAX_ERROR_DETAIL: usize = 1024;

/// Truncate a detail string for persistence.
pub fn truncate_detail(detail: &str) -> String {
    if detail.len() <= MAX_ERROR_DETAIL {
        detail.to_string()
    } else {
        let mut end = MAX_ERROR_DETAIL;
        while !detail.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &detail[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_taxonomy() {
        assert_eq!(ErrorKind::Validation.as_str(), "validation");
        assert_eq!(ErrorKind::StorageIo.as_str(), "storage-io");
        assert_eq!(ErrorKind::PeerRejectContext.as_str(), "peer-reject-context");
        assert_eq!(ErrorKind::NetworkTransient.as_str(), "network-transient");
    }

    #[test]
    fn detail_truncation() {
        let short = "all fine";
        assert_eq!(truncate_detail(short), short);

        let long = "x".repeat(MAX_ERROR_DETAIL + 100);
        let truncated = truncate_detail(&long);
        assert!(truncated.len() <= MAX_ERROR_DETAIL + '…'.len_utf8());
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_DETAIL);
        let truncated = truncate_detail(&long);
        assert!(truncated.ends_with('…'));
    }
}
