//! Collection metadata types
//!
//! A collection's metadata is a fixed set of required fields plus an open map
//! of workflow-specific extension fields. Both are serialized side by side in
//! `collection.yml`; the required fields are validated separately from the
//! extensions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{EngineError, Result};
use crate::workflow::WorkflowDefinition;

/// Metadata file name inside every collection directory
pub const METADATA_FILE: &str = "collection.yml";

/// Field names that belong to the fixed part of the record
pub const REQUIRED_FIELDS: &[&str] = &[
    "collection_id",
    "workflow",
    "status",
    "date_created",
    "date_modified",
    "status_history",
];

/// One entry of a collection's status history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: String,
    pub date: DateTime<Utc>,
}

/// Persistent metadata of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub collection_id: String,
    pub workflow: String,
    pub status: String,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
    pub status_history: Vec<StatusEntry>,

    /// Workflow-specific fields (company, role, title, url, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl CollectionMetadata {
    /// Create metadata for a freshly created collection
    pub fn new(
        collection_id: impl Into<String>,
        workflow: impl Into<String>,
        initial_status: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let status = initial_status.into();
        Self {
            collection_id: collection_id.into(),
            workflow: workflow.into(),
            status_history: vec![StatusEntry {
                status: status.clone(),
                date: now,
            }],
            status,
            date_created: now,
            date_modified: now,
            extra: BTreeMap::new(),
        }
    }

    /// Add an extension field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Get an extension field as a string
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Record a status change
    ///
    /// The history is append-only. The entry date is clamped to the last
    /// recorded date so the sequence never decreases.
    pub fn record_status(&mut self, status: impl Into<String>, now: DateTime<Utc>) {
        let date = match self.status_history.last() {
            Some(last) if last.date > now => last.date,
            _ => now,
        };
        let status = status.into();
        self.status_history.push(StatusEntry {
            status: status.clone(),
            date,
        });
        self.status = status;
        self.touch(date);
    }

    /// Bump `date_modified`, never moving it backwards
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.date_modified {
            self.date_modified = now;
        }
    }

    /// Parse metadata from YAML text
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Serialize metadata to YAML text
    pub fn to_yaml(&self) -> std::result::Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Validate the required fields against the governing workflow
    pub fn validate(&self, workflow: &WorkflowDefinition) -> Result<()> {
        if self.collection_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "collection_id must not be empty".to_string(),
            ));
        }
        if self.workflow != workflow.name {
            return Err(EngineError::Validation(format!(
                "collection '{}' belongs to workflow '{}', not '{}'",
                self.collection_id, self.workflow, workflow.name
            )));
        }
        if workflow.stage_index(&self.status).is_none() {
            return Err(EngineError::Validation(format!(
                "status '{}' is not a stage of workflow '{}'",
                self.status, workflow.name
            )));
        }
        if self.status_history.is_empty() {
            return Err(EngineError::Validation(format!(
                "collection '{}' has an empty status history",
                self.collection_id
            )));
        }
        let ordered = self
            .status_history
            .windows(2)
            .all(|pair| pair[0].date <= pair[1].date);
        if !ordered {
            return Err(EngineError::Validation(format!(
                "status history of '{}' is not in chronological order",
                self.collection_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 30, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_new_has_single_history_entry() {
        let meta = CollectionMetadata::new("acme_dev_20250730", "job", "active", at(9));
        assert_eq!(meta.status_history.len(), 1);
        assert_eq!(meta.status_history[0].status, "active");
        assert_eq!(meta.date_created, meta.date_modified);
    }

    #[test]
    fn test_record_status_clamps_backwards_clock() {
        let mut meta = CollectionMetadata::new("x", "job", "active", at(10));
        meta.record_status("submitted", at(8));
        assert_eq!(meta.status_history[1].date, at(10));
        assert_eq!(meta.status, "submitted");
        assert_eq!(meta.date_modified, at(10));
    }

    #[test]
    fn test_extra_fields_serialize_alongside_required() {
        let meta = CollectionMetadata::new("acme_dev_20250730", "job", "active", at(9))
            .with_field("company", "Acme")
            .with_field("role", "Dev");
        let yaml = meta.to_yaml().unwrap();
        assert!(yaml.contains("company: Acme"));
        assert!(yaml.contains("collection_id: acme_dev_20250730"));

        let parsed = CollectionMetadata::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.field_str("role"), Some("Dev"));
        assert!(!parsed.extra.contains_key("status"));
    }

    #[test]
    fn test_missing_required_field_fails_to_parse() {
        let yaml = "collection_id: x\nworkflow: job\nstatus: active\n";
        assert!(CollectionMetadata::from_yaml(yaml).is_err());
    }
}
