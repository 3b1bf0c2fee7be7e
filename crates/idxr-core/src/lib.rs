//! Core listing model shared by the feed parser, the store and the sync pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "idxr-core";

pub const LISTING_KEY_FIELD: &str = "ListingKey";
pub const STATUS_FIELD: &str = "ListingStatus";
pub const RAW_DATA_KEY: &str = "_raw_data";
pub const FILE_SOURCE_KEY: &str = "_file_source";
pub const DEFAULT_INACTIVE_STATUS: &str = "SOLD";

pub const PROMOTED_FIELDS: &[(&str, &str)] = &[
    ("ListingID", "listing_id"),
    ("ListPrice", "list_price"),
    ("StreetName", "street_name"),
    ("City", "city"),
    ("StateOrProvince", "state_or_province"),
    ("PostalCode", "postal_code"),
    ("BedroomsTotal", "bedrooms_total"),
    ("BathroomsTotalInteger", "bathrooms_total_integer"),
    ("LivingArea", "living_area"),
    ("Latitude", "latitude"),
    ("Longitude", "longitude"),
    ("ListingStatus", "listing_status"),
    ("ModificationTimestamp", "modification_timestamp"),
];

/// One listing as observed in a feed file. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub listing_key: String,
    pub fields: BTreeMap<String, String>,
    pub raw: BTreeMap<String, String>,
    pub source_file: String,
}

impl ListingRecord {
    pub fn field(&self, name: &str) -> Option<&str> {
        if name == LISTING_KEY_FIELD {
            return Some(self.listing_key.as_str());
        }
        self.fields.get(name).map(String::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.field(STATUS_FIELD)
    }

    pub fn to_document(&self) -> JsonValue {
        let mut doc = JsonMap::new();
        doc.insert(
            LISTING_KEY_FIELD.to_string(),
            JsonValue::String(self.listing_key.clone()),
        );
        for (name, value) in &self.fields {
            doc.insert(name.clone(), JsonValue::String(value.clone()));
        }
        let raw = self
            .raw
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect::<JsonMap<_, _>>();
        doc.insert(RAW_DATA_KEY.to_string(), JsonValue::Object(raw));
        doc.insert(
            FILE_SOURCE_KEY.to_string(),
            JsonValue::String(self.source_file.clone()),
        );
        JsonValue::Object(doc)
    }

    pub fn promoted_values(&self) -> Vec<Option<String>> {
        PROMOTED_FIELDS
            .iter()
            .map(|(field, _)| self.field(field).map(ToString::to_string))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub listing_key: String,
    pub columns: BTreeMap<String, Option<String>>,
    pub data: JsonValue,
    pub updated_at: DateTime<Utc>,
}

impl StoredListing {
    pub fn from_record(record: &ListingRecord, updated_at: DateTime<Utc>) -> Self {
        let columns = PROMOTED_FIELDS
            .iter()
            .zip(record.promoted_values())
            .map(|((_, column), value)| (column.to_string(), value))
            .collect();
        Self {
            listing_key: record.listing_key.clone(),
            columns,
            data: record.to_document(),
            updated_at,
        }
    }

    pub fn listing_status(&self) -> Option<&str> {
        self.columns
            .get("listing_status")
            .and_then(|v| v.as_deref())
    }

    pub fn set_listing_status(&mut self, status: &str) {
        self.columns
            .insert("listing_status".to_string(), Some(status.to_string()));
    }

    pub fn to_snapshot_entry(&self) -> SnapshotEntry {
        SnapshotEntry {
            document: self.data.clone(),
            listing_status: self.listing_status().map(ToString::to_string),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub document: JsonValue,
    pub listing_status: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotEntry {
    /// String form of a top-level document field; missing and null read as empty.
    pub fn document_field(&self, name: &str) -> String {
        match self.document.get(name) {
            None | Some(JsonValue::Null) => String::new(),
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    pub fn source_file(&self) -> Option<&str> {
        self.document
            .get(FILE_SOURCE_KEY)
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
    }
}

pub type Snapshot = BTreeMap<String, SnapshotEntry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub create: Vec<ListingRecord>,
    pub update: Vec<ListingRecord>,
    pub mark_inactive: Vec<String>,
}

impl ChangeSet {
    pub fn new(run_id: Uuid, generated_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            generated_at,
            create: Vec::new(),
            update: Vec::new(),
            mark_inactive: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.mark_inactive.is_empty()
    }

    pub fn total(&self) -> usize {
        self.create.len() + self.update.len() + self.mark_inactive.len()
    }

    pub fn create_keys(&self) -> Vec<&str> {
        self.create.iter().map(|r| r.listing_key.as_str()).collect()
    }

    pub fn update_keys(&self) -> Vec<&str> {
        self.update.iter().map(|r| r.listing_key.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactiveMark {
    pub status: String,
    pub actor: String,
    pub marked_at: DateTime<Utc>,
}

impl InactiveMark {
    pub fn for_run(status: impl Into<String>, run_id: Uuid, marked_at: DateTime<Utc>) -> Self {
        Self {
            status: status.into(),
            actor: format!("idxr-sync run {run_id}"),
            marked_at,
        }
    }

    pub fn annotation(&self) -> JsonValue {
        let mut map = JsonMap::new();
        map.insert(STATUS_FIELD.to_string(), JsonValue::String(self.status.clone()));
        map.insert("auto_marked_inactive".to_string(), JsonValue::Bool(true));
        map.insert(
            "marked_inactive_at".to_string(),
            JsonValue::String(self.marked_at.to_rfc3339()),
        );
        map.insert(
            "marked_inactive_by".to_string(),
            JsonValue::String(self.actor.clone()),
        );
        JsonValue::Object(map)
    }

    /// Top-level merge, same as jsonb `data || annotation`.
    pub fn merge_into(&self, document: &mut JsonValue) {
        let JsonValue::Object(annotation) = self.annotation() else {
            return;
        };
        match document {
            JsonValue::Object(map) => map.extend(annotation),
            other => *other = JsonValue::Object(annotation),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFileEntry {
    pub hash: String,
    pub processed_at: DateTime<Utc>,
    pub file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingQuery {
    pub city: Option<String>,
    pub status: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub min_bedrooms: Option<i64>,
    pub priority_agent_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

pub fn parse_numeric(value: &str) -> Option<f64> {
    let cleaned = value
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect::<String>();
    if cleaned.is_empty() {
        None
    } else {
        cleaned.parse().ok()
    }
}
