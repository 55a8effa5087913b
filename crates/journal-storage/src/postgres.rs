//! Postgres backend for the normalized target schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use journal_core::{LookupCategory, LookupRecord, NewChange, NewLetter, NewUser};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{StoreError, TargetEntity, TargetStore, RUN_MARKER_NAME};

const MAX_CONNECTIONS: u32 = 2;

/// Versioned DDL for every table and column this store reads or writes.
pub static SCHEMA: Migrator = sqlx::migrate!("./migrations");

fn table_for(entity: TargetEntity) -> &'static str {
    match entity {
        TargetEntity::Users => "up_users",
        TargetEntity::Letters => "journal_letters",
        TargetEntity::Changes => "journal_letter_changes",
        TargetEntity::Lookup(category) => lookup_table(category),
    }
}

fn lookup_table(category: LookupCategory) -> &'static str {
    match category {
        LookupCategory::Codes => "mkb_codes",
        LookupCategory::OperationCodes => "operation_codes",
        LookupCategory::Organizations => "organizations",
        LookupCategory::Regions => "regions",
        LookupCategory::HelpTypes => "help_types",
        LookupCategory::Departments => "departments",
    }
}

/// Target store backed by a small Postgres pool held for the whole run.
#[derive(Debug, Clone)]
pub struct PgTargetStore {
    pool: PgPool,
}

impl PgTargetStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates any missing target tables. Existing tables are left as they are.
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        SCHEMA.run(&self.pool).await?;
        info!(migrations = SCHEMA.iter().count(), "target schema applied");
        Ok(())
    }

    /// Waits for in-flight queries and closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ensure_run_marker_table(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS journal_migration_runs (
                lock_name  TEXT PRIMARY KEY,
                run_id     UUID NOT NULL,
                started_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn count(&self, entity: TargetEntity) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table_for(entity));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_all(&self, entity: TargetEntity) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {}", table_for(entity));
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        debug!(%entity, rows = result.rows_affected(), "deleted target rows");
        Ok(result.rows_affected())
    }

    async fn find_role_id(&self, role_type: &str) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id::bigint FROM up_roles WHERE type = $1 ORDER BY id LIMIT 1",
        )
        .bind(role_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn existing_users(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query("SELECT username, id::bigint AS id FROM up_users WHERE username IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("username")?, row.try_get("id")?));
        }
        Ok(out)
    }

    async fn create_user(&self, user: &NewUser) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO up_users (username, email, provider, password, confirmed, blocked, role_id, display_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id::bigint
            "#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.provider)
        .bind(&user.password_hash)
        .bind(user.confirmed)
        .bind(user.blocked)
        .bind(user.role_id)
        .bind(&user.display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn lookup_keys(&self, category: LookupCategory) -> Result<Vec<String>, StoreError> {
        let sql = format!(
            "SELECT {key}::text FROM {table} WHERE {key} IS NOT NULL",
            key = category.natural_key_field(),
            table = lookup_table(category),
        );
        let keys = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    async fn create_lookup(&self, record: &LookupRecord) -> Result<i64, StoreError> {
        let id = match record.category {
            LookupCategory::Organizations => {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO organizations (name, primary_email, emails, sort)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id::bigint
                    "#,
                )
                .bind(&record.key)
                .bind(&record.primary_email)
                .bind(serde_json::json!(record.emails))
                .bind(record.sort)
                .fetch_one(&self.pool)
                .await?
            }
            category => {
                let sql = format!(
                    "INSERT INTO {table} ({key}, sort) VALUES ($1, $2) RETURNING id::bigint",
                    table = lookup_table(category),
                    key = category.natural_key_field(),
                );
                sqlx::query_scalar::<_, i64>(&sql)
                    .bind(&record.key)
                    .bind(record.sort)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(id)
    }

    async fn create_letter(&self, letter: &NewLetter) -> Result<i64, StoreError> {
        let transfer = letter.transfer.clone().unwrap_or_default();
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO journal_letters (
                letter_number, incoming_number, outgoing_number, fio, region, direction,
                arrival_date, send_date, transfer_from, transfer_to, transfer_org, transfer_email,
                mkb, mkb_other, operation_code, operation_other, department, department_other,
                help_type, incoming_content, outgoing_content, subject, content,
                created_by_user_id, updated_by_user_id
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7::date, $8::date, $9::date, $10::date, $11, $12,
                $13, $14, $15, $16, $17, $18,
                $19, $20, $21, $22, $23,
                $24, $25
            )
            RETURNING id::bigint
            "#,
        )
        .bind(&letter.letter_number)
        .bind(&letter.incoming_number)
        .bind(&letter.outgoing_number)
        .bind(&letter.fio)
        .bind(&letter.region)
        .bind(letter.direction.as_str())
        .bind(&letter.arrival_date)
        .bind(&letter.send_date)
        .bind(&transfer.from_date)
        .bind(&transfer.to_date)
        .bind(&transfer.organization)
        .bind(&transfer.email)
        .bind(&letter.mkb.code)
        .bind(&letter.mkb.other)
        .bind(&letter.operation.code)
        .bind(&letter.operation.other)
        .bind(&letter.department.code)
        .bind(&letter.department.other)
        .bind(&letter.help_type)
        .bind(&letter.incoming_content)
        .bind(&letter.outgoing_content)
        .bind(&letter.subject)
        .bind(&letter.content)
        .bind(letter.created_by)
        .bind(letter.updated_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn create_change(&self, change: &NewChange) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO journal_letter_changes (letter_id, changed_by_user_id, field_name, old_value, new_value, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id::bigint
            "#,
        )
        .bind(change.letter_id)
        .bind(change.changed_by)
        .bind(&change.field_name)
        .bind(&change.old_value)
        .bind(&change.new_value)
        .bind(&change.changed_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn acquire_run_marker(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.ensure_run_marker_table().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO journal_migration_runs (lock_name, run_id, started_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_name) DO NOTHING
            "#,
        )
        .bind(RUN_MARKER_NAME)
        .bind(run_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted == 1 {
            return Ok(());
        }

        let row = sqlx::query("SELECT run_id, started_at FROM journal_migration_runs WHERE lock_name = $1")
            .bind(RUN_MARKER_NAME)
            .fetch_one(&self.pool)
            .await?;
        let holder: Uuid = row.try_get("run_id")?;
        let started_at: DateTime<Utc> = row.try_get("started_at")?;
        Err(StoreError::RunInProgress {
            run_id: holder,
            started_at,
        })
    }

    async fn release_run_marker(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM journal_migration_runs WHERE lock_name = $1 AND run_id = $2")
            .bind(RUN_MARKER_NAME)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_run_marker(&self) -> Result<bool, StoreError> {
        self.ensure_run_marker_table().await?;
        let removed = sqlx::query("DELETE FROM journal_migration_runs WHERE lock_name = $1")
            .bind(RUN_MARKER_NAME)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }
}
