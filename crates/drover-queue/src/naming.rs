//! Destination names derived from a queue's base name

use serde::{Deserialize, Serialize};

/// Source, failed and error destinations of one job family.
///
/// `processing` is only used by backends that park in-flight jobs in a
/// destination of their own (the list backend).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNames {
    pub source: String,
    pub processing: Option<String>,
    pub failed: String,
    pub error: String,
}

impl QueueNames {
    /// Names for the atomic-move list backend: `{base}-source`,
    /// `{base}-processing`, `{base}-failed`, `{base}-error`
    pub fn for_list(base: &str) -> Self {
        Self {
            source: format!("{base}-source"),
            processing: Some(Self::list_processing(base)),
            failed: format!("{base}-failed"),
            error: format!("{base}-error"),
        }
    }

    /// In-flight list of the list backend: `{base}-processing`
    pub fn list_processing(base: &str) -> String {
        format!("{base}-processing")
    }

    /// Names for managed queues: `{base}-queue`, `{base}-failed`, `{base}-error`
    pub fn for_managed(base: &str) -> Self {
        Self {
            source: format!("{base}-queue"),
            processing: None,
            failed: format!("{base}-failed"),
            error: format!("{base}-error"),
        }
    }

    /// Names for reservation tubes: `{base}`, `{base}-failed`, `{base}-error`
    pub fn for_reservation(base: &str) -> Self {
        Self {
            source: base.to_string(),
            processing: None,
            failed: format!("{base}-failed"),
            error: format!("{base}-error"),
        }
    }
}
