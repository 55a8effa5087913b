//! Legacy source adapters: store location, layout detection, row readers and lookup sources.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use journal_core::{
    parse_flag, LegacyChange, LegacyLetter, LegacySnapshot, LegacyTimestamp, LegacyUser,
    LookupCatalog, LookupCategory, LookupRecord,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod literal;

pub use literal::{extract_lookups, LiteralLookups};

const LETTERS_TABLE: &str = "journal_letters";
const CHANGES_TABLE: &str = "journal_letter_changes";
const FLAT_USERS_TABLE: &str = "journal_users";
const LINK_USERS_TABLE: &str = "up_users";
const FLAT_CREATOR_COLUMN: &str = "created_by_user_id";

const LETTER_CREATED_BY_LNK: &str = "journal_letters_created_by_user_lnk";
const LETTER_UPDATED_BY_LNK: &str = "journal_letters_updated_by_user_lnk";
const CHANGE_BY_USER_LNK: &str = "journal_letter_changes_changed_by_user_lnk";
const CHANGE_LETTER_LNK: &str = "journal_letter_changes_letter_lnk";

const LOOKUP_TABLES: [(LookupCategory, &str); 6] = [
    (LookupCategory::Codes, "mkb_codes"),
    (LookupCategory::OperationCodes, "operation_codes"),
    (LookupCategory::Organizations, "organizations"),
    (LookupCategory::Regions, "regions"),
    (LookupCategory::HelpTypes, "help_types"),
    (LookupCategory::Departments, "departments"),
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("legacy store not found; checked: {}", display_paths(.checked))]
    SourceNotFound { checked: Vec<PathBuf> },
    #[error("legacy store {} matches no known layout (tables: {})", .path.display(), .tables.join(", "))]
    SourceSchemaUnrecognized { path: PathBuf, tables: Vec<String> },
    #[error("lookup source {} not found", .0.display())]
    LookupSourceNotFound(PathBuf),
    #[error("declaration `{name}` is not literal data: {message}")]
    LiteralParse { name: String, message: String },
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading legacy store: {0}")]
    Read(#[from] sqlx::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Ordered candidate locations: explicit override first, then the well-known defaults.
pub fn candidate_sources(override_path: Option<&Path>, workspace_root: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = override_path {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from("/app/.tmp/data.backup.db"));
    candidates.push(PathBuf::from("/app/.tmp/data.db"));
    candidates.push(workspace_root.join(".tmp").join("data.backup.db"));
    candidates.push(workspace_root.join(".tmp").join("data.db"));
    candidates.push(workspace_root.join("backend").join("database.db"));
    candidates
}

/// First existing candidate, or `SourceNotFound` listing every path checked.
pub fn locate_source(candidates: &[PathBuf]) -> Result<PathBuf, SourceError> {
    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or_else(|| SourceError::SourceNotFound {
            checked: candidates.to_vec(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LegacyLayout {
    /// Audit user ids stored inline on `journal_letters`.
    FlatColumns,
    /// Relations stored as `*_lnk` rows.
    LinkTables,
}

impl fmt::Display for LegacyLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegacyLayout::FlatColumns => f.write_str("flat-columns"),
            LegacyLayout::LinkTables => f.write_str("link-tables"),
        }
    }
}

/// Read-only handle on the legacy SQLite file.
#[derive(Debug, Clone)]
pub struct LegacyStore {
    path: PathBuf,
    pool: SqlitePool,
}

impl LegacyStore {
    pub async fn open(path: &Path) -> Result<Self, SourceError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            pool,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn tables(&self) -> Result<Vec<String>, SourceError> {
        let tables = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    /// Probes tables once and picks the layout; never guesses.
    pub async fn detect_layout(&self) -> Result<LegacyLayout, SourceError> {
        let tables = self.tables().await?;
        let has = |name: &str| tables.iter().any(|t| t == name);

        if has(LETTERS_TABLE) && (has(LETTER_CREATED_BY_LNK) || has(CHANGE_LETTER_LNK)) {
            return Ok(LegacyLayout::LinkTables);
        }
        if has(LETTERS_TABLE)
            && table_columns(&self.pool, LETTERS_TABLE)
                .await?
                .iter()
                .any(|c| c == FLAT_CREATOR_COLUMN)
        {
            return Ok(LegacyLayout::FlatColumns);
        }

        Err(SourceError::SourceSchemaUnrecognized {
            path: self.path.clone(),
            tables,
        })
    }

    pub fn reader(&self, layout: LegacyLayout) -> Box<dyn LegacyReader> {
        match layout {
            LegacyLayout::FlatColumns => Box::new(FlatColumnReader {
                pool: self.pool.clone(),
            }),
            LegacyLayout::LinkTables => Box::new(LinkTableReader {
                pool: self.pool.clone(),
            }),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Lookup catalogs, whether stored relationally or embedded as source literals.
#[async_trait]
pub trait LookupSource: Send + Sync {
    /// Human-readable origin for logs and reports.
    fn origin(&self) -> String;

    async fn lookups(&self) -> Result<LookupCatalog, SourceError>;
}

/// Typed row sets for one legacy layout. Lookups come from the layout's catalog tables.
#[async_trait]
pub trait LegacyReader: LookupSource {
    fn layout(&self) -> LegacyLayout;

    async fn users(&self) -> Result<Vec<LegacyUser>, SourceError>;

    async fn letters(&self) -> Result<Vec<LegacyLetter>, SourceError>;

    async fn changes(&self) -> Result<Vec<LegacyChange>, SourceError>;
}

/// Reads everything up front: users, letters, changes, then lookups from `lookups`.
pub async fn read_snapshot(
    reader: &dyn LegacyReader,
    lookups: Option<&dyn LookupSource>,
) -> Result<LegacySnapshot, SourceError> {
    let users = reader.users().await?;
    let letters = reader.letters().await?;
    let changes = reader.changes().await?;
    let lookups = match lookups {
        Some(source) => source.lookups().await?,
        None => reader.lookups().await?,
    };
    info!(
        layout = %reader.layout(),
        users = users.len(),
        letters = letters.len(),
        changes = changes.len(),
        lookups = lookups.len(),
        "read legacy snapshot"
    );
    Ok(LegacySnapshot {
        users,
        letters,
        changes,
        lookups,
    })
}

#[derive(Debug, Clone)]
struct FlatColumnReader {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
struct LinkTableReader {
    pool: SqlitePool,
}

#[async_trait]
impl LookupSource for FlatColumnReader {
    fn origin(&self) -> String {
        "legacy-tables".to_string()
    }

    async fn lookups(&self) -> Result<LookupCatalog, SourceError> {
        read_lookup_tables(&self.pool).await
    }
}

#[async_trait]
impl LegacyReader for FlatColumnReader {
    fn layout(&self) -> LegacyLayout {
        LegacyLayout::FlatColumns
    }

    async fn users(&self) -> Result<Vec<LegacyUser>, SourceError> {
        let rows = rows_if_present(&self.pool, FLAT_USERS_TABLE).await?;
        rows.iter()
            .map(|row| -> Result<LegacyUser, SourceError> {
                Ok(LegacyUser {
                    id: row.try_get("id")?,
                    login: text_column(row, "login"),
                    password_hash: text_column(row, "password_hash"),
                    display_name: text_column(row, "display_name"),
                    email: text_column(row, "email"),
                    provider: None,
                    confirmed: None,
                    blocked: !flag_column(row, "is_active").unwrap_or(true),
                })
            })
            .collect()
    }

    async fn letters(&self) -> Result<Vec<LegacyLetter>, SourceError> {
        let rows = rows_if_present(&self.pool, LETTERS_TABLE).await?;
        rows.iter()
            .map(|row| -> Result<LegacyLetter, SourceError> {
                let mut letter = letter_from_row(row)?;
                letter.created_by_user_id = int_column(row, "created_by_user_id");
                letter.updated_by_user_id = int_column(row, "updated_by_user_id");
                Ok(letter)
            })
            .collect()
    }

    async fn changes(&self) -> Result<Vec<LegacyChange>, SourceError> {
        let rows = rows_if_present(&self.pool, CHANGES_TABLE).await?;
        rows.iter()
            .map(|row| -> Result<LegacyChange, SourceError> {
                let mut change = change_from_row(row)?;
                change.letter_id = int_column(row, "letter_id");
                change.changed_by_user_id = int_column(row, "changed_by_user_id");
                Ok(change)
            })
            .collect()
    }
}

#[async_trait]
impl LookupSource for LinkTableReader {
    fn origin(&self) -> String {
        "legacy-tables".to_string()
    }

    async fn lookups(&self) -> Result<LookupCatalog, SourceError> {
        read_lookup_tables(&self.pool).await
    }
}

#[async_trait]
impl LegacyReader for LinkTableReader {
    fn layout(&self) -> LegacyLayout {
        LegacyLayout::LinkTables
    }

    async fn users(&self) -> Result<Vec<LegacyUser>, SourceError> {
        let rows = rows_if_present(&self.pool, LINK_USERS_TABLE).await?;
        rows.iter()
            .map(|row| -> Result<LegacyUser, SourceError> {
                Ok(LegacyUser {
                    id: row.try_get("id")?,
                    login: text_column(row, "username"),
                    password_hash: text_column(row, "password"),
                    display_name: text_column(row, "display_name"),
                    email: text_column(row, "email"),
                    provider: text_column(row, "provider"),
                    confirmed: flag_column(row, "confirmed"),
                    blocked: flag_column(row, "blocked").unwrap_or(false),
                })
            })
            .collect()
    }

    async fn letters(&self) -> Result<Vec<LegacyLetter>, SourceError> {
        let created_by = link_map(&self.pool, LETTER_CREATED_BY_LNK, "journal_letter_id", "user_id").await?;
        let updated_by = link_map(&self.pool, LETTER_UPDATED_BY_LNK, "journal_letter_id", "user_id").await?;
        let rows = rows_if_present(&self.pool, LETTERS_TABLE).await?;
        rows.iter()
            .map(|row| -> Result<LegacyLetter, SourceError> {
                let mut letter = letter_from_row(row)?;
                letter.created_by_user_id = created_by
                    .get(&letter.id)
                    .copied()
                    .or_else(|| int_column(row, "created_by_user_id"));
                letter.updated_by_user_id = updated_by
                    .get(&letter.id)
                    .copied()
                    .or_else(|| int_column(row, "updated_by_user_id"));
                Ok(letter)
            })
            .collect()
    }

    async fn changes(&self) -> Result<Vec<LegacyChange>, SourceError> {
        let to_letter = link_map(&self.pool, CHANGE_LETTER_LNK, "journal_letter_change_id", "journal_letter_id").await?;
        let by_user = link_map(&self.pool, CHANGE_BY_USER_LNK, "journal_letter_change_id", "user_id").await?;
        let rows = rows_if_present(&self.pool, CHANGES_TABLE).await?;
        rows.iter()
            .map(|row| -> Result<LegacyChange, SourceError> {
                let mut change = change_from_row(row)?;
                change.letter_id = to_letter
                    .get(&change.id)
                    .copied()
                    .or_else(|| int_column(row, "letter_id"));
                change.changed_by_user_id = by_user
                    .get(&change.id)
                    .copied()
                    .or_else(|| int_column(row, "changed_by_user_id"));
                Ok(change)
            })
            .collect()
    }
}

fn letter_from_row(row: &SqliteRow) -> Result<LegacyLetter, SourceError> {
    Ok(LegacyLetter {
        id: row.try_get("id")?,
        letter_number: text_column(row, "letter_number"),
        incoming_number: text_column(row, "incoming_number"),
        outgoing_number: text_column(row, "outgoing_number"),
        fio: text_column(row, "fio"),
        region: text_column(row, "region"),
        direction: text_column(row, "direction"),
        arrival_date: text_column(row, "arrival_date"),
        send_date: text_column(row, "send_date"),
        transfer_from: text_column(row, "transfer_from"),
        transfer_to: text_column(row, "transfer_to"),
        transfer_org: text_column(row, "transfer_org"),
        transfer_email: text_column(row, "transfer_email"),
        mkb: text_column(row, "mkb"),
        mkb_other: text_column(row, "mkb_other"),
        operation_code: text_column(row, "operation_code"),
        operation_other: text_column(row, "operation_other"),
        department: text_column(row, "department"),
        department_other: text_column(row, "department_other"),
        help_type: text_column(row, "help_type"),
        incoming_content: text_column(row, "incoming_content"),
        outgoing_content: text_column(row, "outgoing_content"),
        subject: text_column(row, "subject"),
        content: text_column(row, "content"),
        created_by_user_id: None,
        updated_by_user_id: None,
    })
}

fn change_from_row(row: &SqliteRow) -> Result<LegacyChange, SourceError> {
    Ok(LegacyChange {
        id: row.try_get("id")?,
        letter_id: None,
        changed_by_user_id: None,
        field_name: text_column(row, "field_name"),
        old_value: text_column(row, "old_value"),
        new_value: text_column(row, "new_value"),
        changed_at: timestamp_column(row, "changed_at"),
    })
}

async fn read_lookup_tables(pool: &SqlitePool) -> Result<LookupCatalog, SourceError> {
    let mut catalog = LookupCatalog::default();
    for (category, table) in LOOKUP_TABLES {
        let rows = rows_if_present(pool, table).await?;
        for row in &rows {
            let key = text_column(row, category.natural_key_field()).unwrap_or_default();
            let sort = int_column(row, "sort");
            let record = match category {
                LookupCategory::Organizations => LookupRecord {
                    category,
                    key,
                    sort,
                    primary_email: text_column(row, "primary_email").filter(|e| !e.is_empty()),
                    emails: parse_json_array(text_column(row, "emails").as_deref()),
                },
                _ => LookupRecord::named(category, key, sort),
            };
            catalog.push(record);
        }
        debug!(%category, table, rows = rows.len(), "read lookup table");
    }
    Ok(catalog)
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool, SourceError> {
    let found = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(table)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>, SourceError> {
    let columns = sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(pool)
        .await?;
    Ok(columns)
}

/// All rows of `table` in id order, or none when the table is absent from this layout.
async fn rows_if_present(pool: &SqlitePool, table: &str) -> Result<Vec<SqliteRow>, SourceError> {
    if !table_exists(pool, table).await? {
        warn!(table, "legacy table absent; treating as empty");
        return Ok(Vec::new());
    }
    let order = if table_columns(pool, table).await?.iter().any(|c| c == "id") {
        " ORDER BY id"
    } else {
        ""
    };
    let sql = format!("SELECT * FROM \"{table}\"{order}");
    Ok(sqlx::query(&sql).fetch_all(pool).await?)
}

async fn link_map(
    pool: &SqlitePool,
    table: &str,
    from_column: &str,
    to_column: &str,
) -> Result<HashMap<i64, i64>, SourceError> {
    let mut map = HashMap::new();
    for row in rows_if_present(pool, table).await? {
        if let (Some(from), Some(to)) = (int_column(&row, from_column), int_column(&row, to_column)) {
            map.insert(from, to);
        }
    }
    Ok(map)
}

/// Text view of a column whatever its stored SQLite type; `None` when absent or NULL.
fn text_column(row: &SqliteRow, name: &str) -> Option<String> {
    if let Ok(value) = row.try_get::<Option<String>, _>(name) {
        return value;
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(name) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(name) {
        return value.map(|v| v.to_string());
    }
    None
}

/// Timestamp column keeping its storage class: TEXT stays text, INTEGER is epoch milliseconds.
/// REAL values are kept as their decimal rendering.
fn timestamp_column(row: &SqliteRow, name: &str) -> Option<LegacyTimestamp> {
    if let Ok(value) = row.try_get::<Option<String>, _>(name) {
        return value.map(LegacyTimestamp::Text);
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(name) {
        return value.map(LegacyTimestamp::EpochMillis);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(name) {
        return value.map(|v| LegacyTimestamp::Text(v.to_string()));
    }
    None
}

fn int_column(row: &SqliteRow, name: &str) -> Option<i64> {
    if let Ok(value) = row.try_get::<Option<i64>, _>(name) {
        return value;
    }
    text_column(row, name).and_then(|v| v.trim().parse().ok())
}

fn flag_column(row: &SqliteRow, name: &str) -> Option<bool> {
    if let Ok(value) = row.try_get::<Option<i64>, _>(name) {
        return value.map(|v| v != 0);
    }
    text_column(row, name).and_then(|v| parse_flag(&v))
}

/// Emails columns hold a JSON array; anything else reads as empty.
fn parse_json_array(value: Option<&str>) -> Vec<String> {
    let Some(text) = value.filter(|t| !t.trim().is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) if !s.is_empty() => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Executor;
    use tempfile::{tempdir, TempDir};

    async fn fixture_db(statements: &[&str]) -> (TempDir, PathBuf) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("legacy.db");
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.expect("create fixture");
        for statement in statements {
            pool.execute(*statement).await.expect("fixture statement");
        }
        pool.close().await;
        (dir, path)
    }

    const FLAT_SCHEMA: &[&str] = &[
        "CREATE TABLE journal_users (id INTEGER PRIMARY KEY, login TEXT NOT NULL, password_hash TEXT NOT NULL, display_name TEXT, is_active INTEGER DEFAULT 1)",
        "CREATE TABLE journal_letters (id INTEGER PRIMARY KEY, letter_number TEXT NOT NULL, incoming_number TEXT, fio TEXT NOT NULL, direction TEXT, mkb TEXT, created_by_user_id INTEGER, updated_by_user_id INTEGER)",
        "CREATE TABLE journal_letter_changes (id INTEGER PRIMARY KEY, letter_id INTEGER NOT NULL, changed_by_user_id INTEGER, field_name TEXT NOT NULL, old_value TEXT, new_value TEXT, changed_at DATETIME)",
        "INSERT INTO journal_users VALUES (1, 'journal1', '$2a$10$hash', 'Journal 1', 1), (2, 'journal2', '$2a$10$hash2', NULL, 0)",
        "INSERT INTO journal_letters VALUES (10, 'N-1', 'IN-1', 'Petrov', 'incoming', 'A00', 1, 2)",
        "INSERT INTO journal_letter_changes VALUES (100, 10, 2, 'fio', 'Petrow', 'Petrov', '2024-03-01 09:15:00')",
    ];

    const LINK_SCHEMA: &[&str] = &[
        "CREATE TABLE up_users (id INTEGER PRIMARY KEY, username TEXT, email TEXT, provider TEXT, password TEXT, confirmed INTEGER, blocked INTEGER, display_name TEXT)",
        "CREATE TABLE journal_letters (id INTEGER PRIMARY KEY, letter_number TEXT, fio TEXT, department TEXT, department_other TEXT, help_type TEXT)",
        "CREATE TABLE journal_letter_changes (id INTEGER PRIMARY KEY, field_name TEXT, old_value TEXT, new_value TEXT, changed_at INTEGER)",
        "CREATE TABLE journal_letters_created_by_user_lnk (id INTEGER PRIMARY KEY, journal_letter_id INTEGER, user_id INTEGER)",
        "CREATE TABLE journal_letter_changes_letter_lnk (id INTEGER PRIMARY KEY, journal_letter_change_id INTEGER, journal_letter_id INTEGER)",
        "CREATE TABLE organizations (id INTEGER PRIMARY KEY, name TEXT, primary_email TEXT, emails TEXT, sort INTEGER)",
        "CREATE TABLE regions (id INTEGER PRIMARY KEY, name TEXT, sort INTEGER)",
        "INSERT INTO up_users VALUES (5, 'alice', 'alice@example.org', 'local', '$2a$10$alice', 1, 0, 'Alice')",
        "INSERT INTO journal_letters VALUES (7, NULL, 'Sidorov', 'Surgery', NULL, 'consult')",
        "INSERT INTO journal_letter_changes VALUES (70, 'region', NULL, 'North', 1709284500000)",
        "INSERT INTO journal_letters_created_by_user_lnk VALUES (1, 7, 5)",
        "INSERT INTO journal_letter_changes_letter_lnk VALUES (1, 70, 7)",
        "INSERT INTO organizations VALUES (1, 'City Clinic', 'a@x.com', '[\"a@x.com\",\"b@x.com\"]', 0), (2, 'Broken', NULL, 'not json', 1)",
        "INSERT INTO regions VALUES (1, 'North', 0), (2, 12, 1)",
    ];

    #[test]
    fn missing_source_lists_every_candidate() {
        let dir = tempdir().expect("tempdir");
        let override_path = dir.path().join("explicit.db");
        let candidates = candidate_sources(Some(&override_path), dir.path());
        assert_eq!(candidates[0], override_path);

        let err = locate_source(&candidates).unwrap_err();
        let message = err.to_string();
        for candidate in &candidates {
            assert!(message.contains(&candidate.display().to_string()));
        }
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempdir().expect("tempdir");
        let fallback = dir.path().join("backend").join("database.db");
        std::fs::create_dir_all(fallback.parent().unwrap()).unwrap();
        std::fs::write(&fallback, b"").unwrap();

        let candidates = candidate_sources(Some(&dir.path().join("nope.db")), dir.path());
        assert_eq!(locate_source(&candidates).unwrap(), fallback);
    }

    #[tokio::test]
    async fn flat_layout_reads_inline_user_columns() {
        let (_dir, path) = fixture_db(FLAT_SCHEMA).await;
        let store = LegacyStore::open(&path).await.unwrap();
        let layout = store.detect_layout().await.unwrap();
        assert_eq!(layout, LegacyLayout::FlatColumns);

        let reader = store.reader(layout);
        let snapshot = read_snapshot(reader.as_ref(), None).await.unwrap();
        store.close().await;

        assert_eq!(snapshot.users.len(), 2);
        assert_eq!(snapshot.users[0].login.as_deref(), Some("journal1"));
        assert!(!snapshot.users[0].blocked);
        assert!(snapshot.users[1].blocked);

        let letter = &snapshot.letters[0];
        assert_eq!(letter.created_by_user_id, Some(1));
        assert_eq!(letter.updated_by_user_id, Some(2));
        assert_eq!(letter.mkb.as_deref(), Some("A00"));
        assert_eq!(letter.department, None);

        let change = &snapshot.changes[0];
        assert_eq!(change.letter_id, Some(10));
        assert_eq!(
            change.changed_at,
            Some(LegacyTimestamp::Text("2024-03-01 09:15:00".to_string()))
        );
        assert!(snapshot.lookups.is_empty());
    }

    #[tokio::test]
    async fn link_layout_resolves_relations_through_link_tables() {
        let (_dir, path) = fixture_db(LINK_SCHEMA).await;
        let store = LegacyStore::open(&path).await.unwrap();
        let layout = store.detect_layout().await.unwrap();
        assert_eq!(layout, LegacyLayout::LinkTables);

        let reader = store.reader(layout);
        let snapshot = read_snapshot(reader.as_ref(), None).await.unwrap();

        let user = &snapshot.users[0];
        assert_eq!(user.login.as_deref(), Some("alice"));
        assert_eq!(user.password_hash.as_deref(), Some("$2a$10$alice"));
        assert_eq!(user.confirmed, Some(true));

        let letter = &snapshot.letters[0];
        assert_eq!(letter.created_by_user_id, Some(5));
        assert_eq!(letter.updated_by_user_id, None);
        assert_eq!(letter.department.as_deref(), Some("Surgery"));

        let change = &snapshot.changes[0];
        assert_eq!(change.letter_id, Some(7));
        assert_eq!(change.changed_at, Some(LegacyTimestamp::EpochMillis(1_709_284_500_000)));

        let orgs = snapshot.lookups.records(LookupCategory::Organizations);
        assert_eq!(orgs[0].primary_email.as_deref(), Some("a@x.com"));
        assert_eq!(orgs[0].emails, vec!["a@x.com", "b@x.com"]);
        assert!(orgs[1].emails.is_empty());

        let regions: Vec<_> = snapshot
            .lookups
            .records(LookupCategory::Regions)
            .iter()
            .map(|r| r.key.clone())
            .collect();
        assert_eq!(regions, vec!["North", "12"]);
    }

    #[tokio::test]
    async fn change_timestamps_keep_their_storage_class() {
        let (_dir, path) = fixture_db(&[
            "CREATE TABLE journal_users (id INTEGER PRIMARY KEY, login TEXT, password_hash TEXT)",
            "CREATE TABLE journal_letters (id INTEGER PRIMARY KEY, letter_number TEXT, created_by_user_id INTEGER)",
            "CREATE TABLE journal_letter_changes (id INTEGER PRIMARY KEY, letter_id INTEGER, field_name TEXT, changed_at)",
            "INSERT INTO journal_letter_changes VALUES (1, 10, 'fio', '1709284500')",
            "INSERT INTO journal_letter_changes VALUES (2, 10, 'fio', '20240301091500')",
            "INSERT INTO journal_letter_changes VALUES (3, 10, 'fio', 1709284500000)",
            "INSERT INTO journal_letter_changes VALUES (4, 10, 'fio', NULL)",
        ])
        .await;
        let store = LegacyStore::open(&path).await.unwrap();
        let reader = store.reader(store.detect_layout().await.unwrap());
        let changes = reader.changes().await.unwrap();

        let stamps: Vec<_> = changes.into_iter().map(|c| c.changed_at).collect();
        assert_eq!(
            stamps,
            vec![
                Some(LegacyTimestamp::Text("1709284500".to_string())),
                Some(LegacyTimestamp::Text("20240301091500".to_string())),
                Some(LegacyTimestamp::EpochMillis(1_709_284_500_000)),
                None,
            ]
        );
    }

    #[tokio::test]
    async fn unknown_layout_is_rejected_with_table_list() {
        let (_dir, path) = fixture_db(&["CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)"]).await;
        let store = LegacyStore::open(&path).await.unwrap();
        let err = store.detect_layout().await.unwrap_err();
        match err {
            SourceError::SourceSchemaUnrecognized { tables, .. } => {
                assert_eq!(tables, vec!["notes".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn legacy_store_is_opened_read_only() {
        let (_dir, path) = fixture_db(FLAT_SCHEMA).await;
        let store = LegacyStore::open(&path).await.unwrap();
        let attempt = sqlx::query("DELETE FROM journal_letters")
            .execute(&store.pool)
            .await;
        assert!(attempt.is_err());
    }

    #[test]
    fn json_email_lists_tolerate_garbage() {
        assert_eq!(parse_json_array(Some("[\"a@x.com\", \"\", 3]")), vec!["a@x.com"]);
        assert!(parse_json_array(Some("{}")).is_empty());
        assert!(parse_json_array(None).is_empty());
    }
}
