//! Core domain model shared by the legacy readers, the target store and the migration pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder written when a legacy letter carries no subject person name.
pub const UNKNOWN_SUBJECT_NAME: &str = "Без ФИО";

/// Lookup catalogs migrated into their own target tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookupCategory {
    Codes,
    OperationCodes,
    Organizations,
    Regions,
    HelpTypes,
    Departments,
}

impl LookupCategory {
    /// Fixed stage order; keeps logs and reports reproducible between runs.
    pub const ALL: [LookupCategory; 6] = [
        LookupCategory::Codes,
        LookupCategory::OperationCodes,
        LookupCategory::Organizations,
        LookupCategory::Regions,
        LookupCategory::HelpTypes,
        LookupCategory::Departments,
    ];

    pub fn label(self) -> &'static str {
        match self {
            LookupCategory::Codes => "codes",
            LookupCategory::OperationCodes => "operation-codes",
            LookupCategory::Organizations => "organizations",
            LookupCategory::Regions => "regions",
            LookupCategory::HelpTypes => "help-types",
            LookupCategory::Departments => "departments",
        }
    }

    /// Column holding the natural key for this category.
    pub fn natural_key_field(self) -> &'static str {
        match self {
            LookupCategory::Codes | LookupCategory::OperationCodes => "code",
            _ => "name",
        }
    }
}

impl fmt::Display for LookupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One catalog row, keyed by its natural key (`code` or `name`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRecord {
    pub category: LookupCategory,
    pub key: String,
    pub sort: Option<i64>,
    /// Organizations only.
    pub primary_email: Option<String>,
    /// Organizations only, in source order.
    pub emails: Vec<String>,
}

impl LookupRecord {
    pub fn named(category: LookupCategory, key: impl Into<String>, sort: Option<i64>) -> Self {
        Self {
            category,
            key: key.into(),
            sort,
            primary_email: None,
            emails: Vec::new(),
        }
    }

    /// Organization row whose primary email is the first listed address.
    pub fn organization(name: impl Into<String>, emails: Vec<String>, sort: Option<i64>) -> Self {
        Self {
            category: LookupCategory::Organizations,
            key: name.into(),
            sort,
            primary_email: emails.first().cloned(),
            emails,
        }
    }
}

/// Lookup rows grouped per category, in source order within each category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupCatalog {
    entries: BTreeMap<LookupCategory, Vec<LookupRecord>>,
}

impl LookupCatalog {
    pub fn push(&mut self, record: LookupRecord) {
        self.entries.entry(record.category).or_default().push(record);
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = LookupRecord>) {
        for record in records {
            self.push(record);
        }
    }

    pub fn records(&self, category: LookupCategory) -> &[LookupRecord] {
        self.entries.get(&category).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// User row as found in either legacy layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyUser {
    pub id: i64,
    pub login: Option<String>,
    pub password_hash: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub provider: Option<String>,
    pub confirmed: Option<bool>,
    pub blocked: bool,
}

/// Letter row; field names follow the legacy `journal_letters` columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyLetter {
    pub id: i64,
    pub letter_number: Option<String>,
    pub incoming_number: Option<String>,
    pub outgoing_number: Option<String>,
    pub fio: Option<String>,
    pub region: Option<String>,
    pub direction: Option<String>,
    pub arrival_date: Option<String>,
    pub send_date: Option<String>,
    pub transfer_from: Option<String>,
    pub transfer_to: Option<String>,
    pub transfer_org: Option<String>,
    pub transfer_email: Option<String>,
    pub mkb: Option<String>,
    pub mkb_other: Option<String>,
    pub operation_code: Option<String>,
    pub operation_other: Option<String>,
    pub department: Option<String>,
    pub department_other: Option<String>,
    pub help_type: Option<String>,
    pub incoming_content: Option<String>,
    pub outgoing_content: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub created_by_user_id: Option<i64>,
    pub updated_by_user_id: Option<i64>,
}

/// Audit entry row; `letter_id` and `changed_by_user_id` are legacy ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyChange {
    pub id: i64,
    pub letter_id: Option<i64>,
    pub changed_by_user_id: Option<i64>,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_at: Option<LegacyTimestamp>,
}

/// A change timestamp together with the SQLite storage class it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "value", rename_all = "snake_case")]
pub enum LegacyTimestamp {
    /// Stored as TEXT; carried byte-for-byte.
    Text(String),
    /// Stored as INTEGER milliseconds since the Unix epoch.
    EpochMillis(i64),
}

/// Everything read from the legacy side for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacySnapshot {
    pub users: Vec<LegacyUser>,
    pub letters: Vec<LegacyLetter>,
    pub changes: Vec<LegacyChange>,
    pub lookups: LookupCatalog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "incoming" => Some(Direction::Incoming),
            "outgoing" => Some(Direction::Outgoing),
            _ => None,
        }
    }
}

/// Selected value plus the free-text fallback used when it is not in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePair {
    pub code: Option<String>,
    pub other: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub organization: Option<String>,
    pub email: Option<String>,
}

impl Transfer {
    pub fn is_empty(&self) -> bool {
        self.from_date.is_none()
            && self.to_date.is_none()
            && self.organization.is_none()
            && self.email.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub provider: String,
    /// Opaque credential hash, carried over as-is.
    pub password_hash: Option<String>,
    pub confirmed: bool,
    pub blocked: bool,
    pub role_id: i64,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLetter {
    pub letter_number: String,
    pub incoming_number: Option<String>,
    pub outgoing_number: Option<String>,
    pub fio: String,
    pub region: Option<String>,
    pub direction: Direction,
    pub arrival_date: Option<String>,
    pub send_date: Option<String>,
    pub transfer: Option<Transfer>,
    pub mkb: CodePair,
    pub operation: CodePair,
    pub department: CodePair,
    pub help_type: Option<String>,
    pub incoming_content: Option<String>,
    pub outgoing_content: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub created_by: Option<i64>,
    pub updated_by: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChange {
    pub letter_id: i64,
    pub changed_by: Option<i64>,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_at: String,
}

/// Treats empty strings the same as missing values.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Accepts the boolean spellings found in legacy flag columns.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" | "" => Some(false),
        _ => None,
    }
}
