//! File record model shared by the metadata repository and the API layer.
//!
//! One record exists per content digest. The record skeleton is created at
//! admission time; the analysis pipeline fills in status, enrichment and the
//! descriptive fields later via partial merge updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

/// Attribute names recognized by projection queries and merge updates.
/// Anything outside this list is rejected before touching the database.
pub const PROJECTION_FIELDS: &[&str] = &[
    "digest",
    "size",
    "first_seen",
    "status",
    "revision",
    "file_type",
    "packer",
    "strings",
    "enrichment",
];

/// Resolve a caller-supplied field name to its canonical static name, so
/// query text is never built from caller-controlled strings.
pub fn canonical_field(name: &str) -> Option<&'static str> {
    PROJECTION_FIELDS.iter().find(|f| **f == name).copied()
}

/// Processing status of a sample. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ScanStatus {
    Queued,
    Processing,
    Finished,
}

impl TryFrom<i64> for ScanStatus {
    type Error = String;

    fn try_from(v: i64) -> std::result::Result<Self, String> {
        match v {
            0 => Ok(ScanStatus::Queued),
            1 => Ok(ScanStatus::Processing),
            2 => Ok(ScanStatus::Finished),
            other => Err(format!("unknown status value: {}", other)),
        }
    }
}

impl From<ScanStatus> for i64 {
    fn from(s: ScanStatus) -> i64 {
        match s {
            ScanStatus::Queued => 0,
            ScanStatus::Processing => 1,
            ScanStatus::Finished => 2,
        }
    }
}

/// A string extracted from the sample by the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedString {
    pub encoding: String,
    pub value: String,
}

/// One metadata record per distinct content digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Hex SHA-256 of the stored bytes. Immutable primary key.
    pub digest: String,
    /// Byte length of the original content. Immutable.
    pub size: i64,
    /// Creation timestamp, UTC. Immutable.
    pub first_seen: DateTime<Utc>,
    pub status: ScanStatus,
    /// Optimistic concurrency token, bumped on every merge update.
    #[serde(default)]
    pub revision: i64,
    /// Analysis engine name -> result payload. Merged key-wise, never
    /// overwritten wholesale.
    #[serde(default)]
    pub enrichment: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strings: Option<Vec<ExtractedString>>,
}

impl FileRecord {
    /// Fresh record skeleton as created at the end of admission.
    pub fn new(digest: String, size: i64) -> Self {
        Self {
            digest,
            size,
            first_seen: Utc::now(),
            status: ScanStatus::Queued,
            revision: 0,
            enrichment: Map::new(),
            file_type: None,
            packer: None,
            strings: None,
        }
    }

    /// Apply a partial update in place. Immutable and unknown fields are
    /// rejected, the enrichment map merges key-wise, and status may only
    /// advance.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), AppError> {
        for (key, value) in patch {
            match key.as_str() {
                "status" => {
                    let raw = value.as_i64().ok_or_else(|| {
                        AppError::Validation("status must be an integer".to_string())
                    })?;
                    let status = ScanStatus::try_from(raw).map_err(AppError::Validation)?;
                    if status < self.status {
                        return Err(AppError::Validation(
                            "status cannot move backward".to_string(),
                        ));
                    }
                    self.status = status;
                }
                "enrichment" => {
                    let map = value.as_object().ok_or_else(|| {
                        AppError::Validation("enrichment must be an object".to_string())
                    })?;
                    for (engine, result) in map {
                        self.enrichment.insert(engine.clone(), result.clone());
                    }
                }
                "file_type" => {
                    self.file_type = parse_optional_string(key, value)?;
                }
                "packer" => {
                    self.packer = parse_optional_string(key, value)?;
                }
                "strings" => {
                    let strings: Vec<ExtractedString> = serde_json::from_value(value.clone())
                        .map_err(|e| {
                            AppError::Validation(format!("malformed strings field: {}", e))
                        })?;
                    self.strings = Some(strings);
                }
                "digest" | "size" | "first_seen" | "revision" => {
                    return Err(AppError::Validation(format!("field {} is immutable", key)));
                }
                other => {
                    return Err(AppError::Validation(format!("unknown field: {}", other)));
                }
            }
        }
        Ok(())
    }
}

fn parse_optional_string(key: &str, value: &Value) -> Result<Option<String>, AppError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        _ => Err(AppError::Validation(format!("{} must be a string", key))),
    }
}
