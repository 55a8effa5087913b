//! Legacy-to-normalized migration pipeline: guard check, lookups, users, letters, changes, report.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use journal_adapters::{
    candidate_sources, locate_source, read_snapshot, LegacyLayout, LegacyStore, LiteralLookups,
    LookupSource, SourceError,
};
use journal_core::{
    non_empty, CodePair, Direction, LegacyChange, LegacyLetter, LegacySnapshot, LegacyTimestamp,
    LegacyUser,
    LookupCatalog, LookupCategory, NewChange, NewLetter, NewUser, Transfer, UNKNOWN_SUBJECT_NAME,
};
use journal_storage::{fingerprint_file, PgTargetStore, StoreError, TargetEntity, TargetStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod identity;
pub mod report;
pub mod upsert;

pub use config::MigrationConfig;
pub use identity::IdentityMap;
pub use report::{MigrationReport, ResetCounts, SourceInfo, StageCounts};
pub use upsert::{UpsertOutcome, Upserter, UserOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    GuardCheck,
    Lookups,
    Users,
    Letters,
    Changes,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::GuardCheck => "guard-check",
            Stage::Lookups => "lookups",
            Stage::Users => "users",
            Stage::Letters => "letters",
            Stage::Changes => "changes",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("target already holds {letters} letter(s); rerun with force reset to replace them")]
    TargetNotEmpty { letters: u64 },
    #[error("target has no `{role}` role; create it before migrating users")]
    RoleNotFound { role: String },
    #[error("migration run {run_id} has been in progress since {started_at}")]
    RunInProgress {
        run_id: Uuid,
        started_at: DateTime<Utc>,
    },
    #[error("{stage} stage: writing {entity} failed: {source}")]
    Write {
        stage: Stage,
        entity: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("target store: {0}")]
    Store(#[source] StoreError),
}

impl From<StoreError> for MigrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunInProgress { run_id, started_at } => {
                MigrationError::RunInProgress { run_id, started_at }
            }
            other => MigrationError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    pub force_reset: bool,
    pub authenticated_role: String,
}

impl From<&MigrationConfig> for MigrationOptions {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            force_reset: config.force_reset,
            authenticated_role: config.authenticated_role.clone(),
        }
    }
}

/// Runs the stages against one target store. Stages run strictly in sequence.
pub struct Migrator<'a> {
    store: &'a dyn TargetStore,
    options: MigrationOptions,
}

impl<'a> Migrator<'a> {
    pub fn new(store: &'a dyn TargetStore, options: MigrationOptions) -> Self {
        Self { store, options }
    }

    /// Holds the run marker for the whole run and releases it on every exit path.
    pub async fn run(
        &self,
        snapshot: &LegacySnapshot,
        source: SourceInfo,
    ) -> Result<MigrationReport, MigrationError> {
        let run_id = Uuid::new_v4();
        self.store.acquire_run_marker(run_id).await?;
        info!(%run_id, force_reset = self.options.force_reset, "migration started");

        let mut report = MigrationReport::new(run_id, source, self.options.force_reset);
        let outcome = self.run_stages(snapshot, &mut report).await;

        if let Err(err) = self.store.release_run_marker(run_id).await {
            warn!(%run_id, error = %err, "failed to release run marker");
        }
        outcome?;

        report.finished_at = Utc::now();
        info!(%run_id, "migration finished");
        Ok(report)
    }

    async fn run_stages(
        &self,
        snapshot: &LegacySnapshot,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let role_id = self
            .guard_check(report)
            .instrument(info_span!("stage", stage = %Stage::GuardCheck))
            .await?;

        let mut upserter = Upserter::new(self.store);
        let mut ids = IdentityMap::new();

        self.migrate_lookups(&snapshot.lookups, &mut upserter, report)
            .instrument(info_span!("stage", stage = %Stage::Lookups))
            .await?;
        self.migrate_users(&snapshot.users, role_id, &mut upserter, &mut ids, report)
            .instrument(info_span!("stage", stage = %Stage::Users))
            .await?;
        self.migrate_letters(&snapshot.letters, &mut ids, report)
            .instrument(info_span!("stage", stage = %Stage::Letters))
            .await?;
        self.migrate_changes(&snapshot.changes, &ids, report)
            .instrument(info_span!("stage", stage = %Stage::Changes))
            .await?;
        Ok(())
    }

    /// Refuses a populated target unless force reset is set, and resolves the user role.
    /// Nothing is written or deleted when this fails.
    async fn guard_check(&self, report: &mut MigrationReport) -> Result<i64, MigrationError> {
        let letters = self.store.count(TargetEntity::Letters).await?;
        if letters > 0 && !self.options.force_reset {
            return Err(MigrationError::TargetNotEmpty { letters });
        }

        let role = &self.options.authenticated_role;
        let role_id = self
            .store
            .find_role_id(role)
            .await?
            .ok_or_else(|| MigrationError::RoleNotFound { role: role.clone() })?;

        if letters > 0 {
            let changes_deleted = self.store.delete_all(TargetEntity::Changes).await?;
            let letters_deleted = self.store.delete_all(TargetEntity::Letters).await?;
            warn!(letters_deleted, changes_deleted, "force reset removed existing letters");
            report.reset = Some(ResetCounts {
                letters_deleted,
                changes_deleted,
            });
        }
        Ok(role_id)
    }

    async fn migrate_lookups(
        &self,
        catalog: &LookupCatalog,
        upserter: &mut Upserter<'_>,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        for category in LookupCategory::ALL {
            upserter.load_category(category).await?;
            let mut counts = StageCounts::default();
            for record in catalog.records(category) {
                if record.key.trim().is_empty() {
                    counts.skipped += 1;
                    continue;
                }
                match upserter.upsert_lookup(record).await {
                    Ok(UpsertOutcome::Created(_)) => counts.created += 1,
                    Ok(UpsertOutcome::Skipped) => {
                        debug!(%category, key = %record.key, "lookup exists; skipped");
                        counts.skipped += 1;
                    }
                    Err(err) => {
                        warn!(%category, key = %record.key, error = %err, "lookup write failed");
                        counts.failed += 1;
                    }
                }
            }
            info!(%category, %counts, "lookup category migrated");
            report.lookups.insert(category, counts);
        }
        Ok(())
    }

    async fn migrate_users(
        &self,
        users: &[LegacyUser],
        role_id: i64,
        upserter: &mut Upserter<'_>,
        ids: &mut IdentityMap,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        upserter.load_users().await?;
        let mut counts = StageCounts::default();
        for legacy in users {
            let Some(user) = user_draft(legacy, role_id) else {
                debug!(legacy_id = legacy.id, "user without login; skipped");
                counts.skipped += 1;
                continue;
            };
            match upserter.upsert_user(&user).await {
                Ok(outcome) => {
                    ids.record_user(legacy.id, outcome.target_id());
                    match outcome {
                        UserOutcome::Created(_) => counts.created += 1,
                        UserOutcome::Reused(_) => counts.skipped += 1,
                    }
                }
                Err(err) => {
                    warn!(legacy_id = legacy.id, username = %user.username, error = %err, "user write failed");
                    counts.failed += 1;
                }
            }
        }
        info!(%counts, mapped = ids.user_count(), "users migrated");
        report.users = counts;
        Ok(())
    }

    async fn migrate_letters(
        &self,
        letters: &[LegacyLetter],
        ids: &mut IdentityMap,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let mut counts = StageCounts::default();
        for legacy in letters {
            let letter = letter_draft(legacy, ids);
            let target_id = self
                .store
                .create_letter(&letter)
                .await
                .map_err(|source| MigrationError::Write {
                    stage: Stage::Letters,
                    entity: format!("letter {} ({})", legacy.id, letter.letter_number),
                    source,
                })?;
            ids.record_letter(legacy.id, target_id);
            counts.created += 1;
        }
        info!(%counts, "letters migrated");
        report.letters = counts;
        Ok(())
    }

    async fn migrate_changes(
        &self,
        changes: &[LegacyChange],
        ids: &IdentityMap,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let now = Utc::now();
        let mut counts = StageCounts::default();
        for legacy in changes {
            let Some(change) = change_draft(legacy, ids, now) else {
                debug!(legacy_id = legacy.id, letter_id = ?legacy.letter_id, "change without migrated letter; dropped");
                counts.skipped += 1;
                continue;
            };
            self.store
                .create_change(&change)
                .await
                .map_err(|source| MigrationError::Write {
                    stage: Stage::Changes,
                    entity: format!("change {}", legacy.id),
                    source,
                })?;
            counts.created += 1;
        }
        info!(%counts, "changes migrated");
        report.changes = counts;
        Ok(())
    }
}

/// Target user for a legacy row; `None` when the login is blank.
pub fn user_draft(legacy: &LegacyUser, role_id: i64) -> Option<NewUser> {
    let username = legacy
        .login
        .as_deref()
        .map(str::trim)
        .filter(|login| !login.is_empty())?
        .to_string();
    Some(NewUser {
        email: non_empty(legacy.email.clone()).unwrap_or_else(|| format!("{username}@local")),
        provider: non_empty(legacy.provider.clone()).unwrap_or_else(|| "local".to_string()),
        password_hash: non_empty(legacy.password_hash.clone()),
        confirmed: legacy.confirmed.unwrap_or(true),
        blocked: legacy.blocked,
        role_id,
        display_name: non_empty(legacy.display_name.clone()),
        username,
    })
}

pub fn letter_draft(legacy: &LegacyLetter, ids: &IdentityMap) -> NewLetter {
    let letter_number = non_empty(legacy.letter_number.clone())
        .or_else(|| non_empty(legacy.incoming_number.clone()))
        .or_else(|| non_empty(legacy.outgoing_number.clone()))
        .unwrap_or_else(|| format!("legacy-{}", legacy.id));

    let direction = match non_empty(legacy.direction.clone()) {
        None => Direction::Incoming,
        Some(value) => Direction::parse(&value).unwrap_or_else(|| {
            warn!(legacy_id = legacy.id, direction = %value, "unknown direction; using incoming");
            Direction::Incoming
        }),
    };

    let transfer = Transfer {
        from_date: non_empty(legacy.transfer_from.clone()),
        to_date: non_empty(legacy.transfer_to.clone()),
        organization: non_empty(legacy.transfer_org.clone()),
        email: non_empty(legacy.transfer_email.clone()),
    };

    NewLetter {
        letter_number,
        incoming_number: non_empty(legacy.incoming_number.clone()),
        outgoing_number: non_empty(legacy.outgoing_number.clone()),
        fio: non_empty(legacy.fio.clone()).unwrap_or_else(|| UNKNOWN_SUBJECT_NAME.to_string()),
        region: non_empty(legacy.region.clone()),
        direction,
        arrival_date: non_empty(legacy.arrival_date.clone()),
        send_date: non_empty(legacy.send_date.clone()),
        transfer: (!transfer.is_empty()).then_some(transfer),
        mkb: CodePair {
            code: non_empty(legacy.mkb.clone()),
            other: non_empty(legacy.mkb_other.clone()),
        },
        operation: CodePair {
            code: non_empty(legacy.operation_code.clone()),
            other: non_empty(legacy.operation_other.clone()),
        },
        department: CodePair {
            code: non_empty(legacy.department.clone()),
            other: non_empty(legacy.department_other.clone()),
        },
        help_type: non_empty(legacy.help_type.clone()),
        incoming_content: non_empty(legacy.incoming_content.clone()),
        outgoing_content: non_empty(legacy.outgoing_content.clone()),
        subject: non_empty(legacy.subject.clone()),
        content: non_empty(legacy.content.clone()),
        created_by: resolve_user(ids, legacy.created_by_user_id),
        updated_by: resolve_user(ids, legacy.updated_by_user_id),
    }
}

/// Target change for a legacy row; `None` when its letter did not migrate.
pub fn change_draft(legacy: &LegacyChange, ids: &IdentityMap, now: DateTime<Utc>) -> Option<NewChange> {
    let letter_id = legacy.letter_id.and_then(|id| ids.target_letter_id(id))?;
    Some(NewChange {
        letter_id,
        changed_by: resolve_user(ids, legacy.changed_by_user_id),
        field_name: non_empty(legacy.field_name.clone()).unwrap_or_else(|| "unknown".to_string()),
        old_value: legacy.old_value.clone(),
        new_value: legacy.new_value.clone(),
        changed_at: change_timestamp(legacy.changed_at.as_ref(), now),
    })
}

fn resolve_user(ids: &IdentityMap, legacy_id: Option<i64>) -> Option<i64> {
    let legacy_id = legacy_id?;
    let target = ids.target_user_id(legacy_id);
    if target.is_none() {
        debug!(legacy_id, "legacy user not mapped; reference cleared");
    }
    target
}

/// TEXT timestamps pass through byte-for-byte. INTEGER epoch milliseconds become RFC 3339 UTC;
/// a missing or empty value is stamped with `now`.
pub fn change_timestamp(value: Option<&LegacyTimestamp>, now: DateTime<Utc>) -> String {
    match value {
        Some(LegacyTimestamp::Text(text)) if !text.is_empty() => text.clone(),
        Some(LegacyTimestamp::EpochMillis(ms)) => match DateTime::from_timestamp_millis(*ms) {
            Some(at) => at.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => {
                warn!(value = ms, "epoch milliseconds out of range; kept as written");
                ms.to_string()
            }
        },
        _ => now.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// Locates, fingerprints and reads the legacy store. The store is closed before returning.
pub async fn load_source(config: &MigrationConfig) -> Result<(LegacySnapshot, SourceInfo)> {
    let candidates = candidate_sources(config.source_override.as_deref(), &config.workspace_root);
    let path = locate_source(&candidates)?;
    info!(path = %path.display(), "using legacy store");

    let sha256 = fingerprint_file(&path).await?;
    let store = LegacyStore::open(&path)
        .await
        .with_context(|| format!("opening legacy store {}", path.display()))?;
    let read = read_legacy(&store, config).await;
    store.close().await;
    let (snapshot, layout, lookup_origin) = read?;

    Ok((
        snapshot,
        SourceInfo {
            path,
            sha256,
            layout,
            lookup_origin,
        },
    ))
}

async fn read_legacy(
    store: &LegacyStore,
    config: &MigrationConfig,
) -> Result<(LegacySnapshot, LegacyLayout, String), SourceError> {
    let layout = store.detect_layout().await?;
    info!(%layout, "detected legacy layout");
    let reader = store.reader(layout);
    let literal = literal_lookups(config, layout)?;

    let (lookups, origin): (Option<&dyn LookupSource>, String) = match &literal {
        Some(source) => (Some(source as &dyn LookupSource), source.origin()),
        None => (None, reader.origin()),
    };
    let snapshot = read_snapshot(reader.as_ref(), lookups).await?;
    Ok((snapshot, layout, origin))
}

/// Picks the literal artifact: an explicit path must exist; the default is only tried for the
/// flat layout, whose lookups are not stored relationally.
fn literal_lookups(
    config: &MigrationConfig,
    layout: LegacyLayout,
) -> Result<Option<LiteralLookups>, SourceError> {
    if let Some(path) = &config.lookup_source {
        if !path.is_file() {
            return Err(SourceError::LookupSourceNotFound(path.clone()));
        }
        return Ok(Some(LiteralLookups::new(path.clone())));
    }
    if layout != LegacyLayout::FlatColumns {
        return Ok(None);
    }
    let default = config.default_lookup_source();
    if default.is_file() {
        Ok(Some(LiteralLookups::new(default)))
    } else {
        warn!(path = %default.display(), "lookup literal artifact not found; lookups read from legacy tables");
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub report: MigrationReport,
    pub reports_dir: PathBuf,
}

/// Full run against Postgres: read the legacy side, migrate, write reports.
/// The target pool is closed on success and on failure.
pub async fn run_from_config(config: &MigrationConfig) -> Result<CompletedRun> {
    let (snapshot, source) = load_source(config).await?;

    let store = PgTargetStore::connect(&config.database_url)
        .await
        .context("connecting to target database")?;
    let outcome = match prepare_target(&store, config).await {
        Ok(()) => migrate_into(&store, config, &snapshot, source).await,
        Err(err) => Err(err),
    };
    store.close().await;
    outcome
}

async fn prepare_target(store: &PgTargetStore, config: &MigrationConfig) -> Result<()> {
    if config.apply_schema {
        store
            .apply_schema()
            .await
            .context("applying target schema")?;
    }
    Ok(())
}

async fn migrate_into(
    store: &dyn TargetStore,
    config: &MigrationConfig,
    snapshot: &LegacySnapshot,
    source: SourceInfo,
) -> Result<CompletedRun> {
    if config.clear_stale_marker && store.clear_run_marker().await? {
        warn!("cleared stale run marker");
    }
    let report = Migrator::new(store, MigrationOptions::from(config))
        .run(snapshot, source)
        .await?;
    let reports_dir = report.write_to(&config.reports_dir).await?;
    info!(reports_dir = %reports_dir.display(), "wrote migration reports");
    Ok(CompletedRun {
        report,
        reports_dir,
    })
}

pub async fn run_from_env() -> Result<CompletedRun> {
    run_from_config(&MigrationConfig::from_env()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn letter(id: i64) -> LegacyLetter {
        LegacyLetter {
            id,
            ..Default::default()
        }
    }

    #[test]
    fn letter_number_falls_back_through_identifiers() {
        let ids = IdentityMap::new();

        let mut row = letter(5);
        row.incoming_number = Some("IN-5".to_string());
        row.outgoing_number = Some("OUT-5".to_string());
        assert_eq!(letter_draft(&row, &ids).letter_number, "IN-5");

        row.incoming_number = Some(String::new());
        assert_eq!(letter_draft(&row, &ids).letter_number, "OUT-5");

        let bare = letter_draft(&letter(6), &ids);
        assert_eq!(bare.letter_number, "legacy-6");
        assert_eq!(bare.fio, UNKNOWN_SUBJECT_NAME);
        assert_eq!(bare.direction, Direction::Incoming);
        assert_eq!(bare.transfer, None);
    }

    #[test]
    fn letters_carry_codes_transfer_and_mapped_users() {
        let mut ids = IdentityMap::new();
        ids.record_user(1, 41);

        let mut row = letter(8);
        row.direction = Some("outgoing".to_string());
        row.transfer_org = Some("City Clinic".to_string());
        row.department = Some("Surgery".to_string());
        row.mkb_other = Some("rare".to_string());
        row.created_by_user_id = Some(1);
        row.updated_by_user_id = Some(99);

        let draft = letter_draft(&row, &ids);
        assert_eq!(draft.direction, Direction::Outgoing);
        assert_eq!(
            draft.transfer.and_then(|t| t.organization).as_deref(),
            Some("City Clinic")
        );
        assert_eq!(draft.department.code.as_deref(), Some("Surgery"));
        assert_eq!(draft.mkb.code, None);
        assert_eq!(draft.mkb.other.as_deref(), Some("rare"));
        assert_eq!(draft.created_by, Some(41));
        assert_eq!(draft.updated_by, None);
    }

    #[test]
    fn users_get_local_defaults() {
        let legacy = LegacyUser {
            id: 2,
            login: Some(" bob ".to_string()),
            password_hash: Some("$2a$10$bob".to_string()),
            blocked: true,
            ..Default::default()
        };
        let user = user_draft(&legacy, 3).unwrap();
        assert_eq!(user.username, "bob");
        assert_eq!(user.email, "bob@local");
        assert_eq!(user.provider, "local");
        assert!(user.confirmed);
        assert!(user.blocked);
        assert_eq!(user.password_hash.as_deref(), Some("$2a$10$bob"));

        let blank = LegacyUser {
            id: 3,
            login: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(user_draft(&blank, 3).is_none());
    }

    fn text(value: &str) -> LegacyTimestamp {
        LegacyTimestamp::Text(value.to_string())
    }

    #[test]
    fn change_timestamps_are_preserved_or_converted() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(
            change_timestamp(Some(&text("2024-03-01 09:15:00")), now),
            "2024-03-01 09:15:00"
        );
        assert_eq!(
            change_timestamp(Some(&LegacyTimestamp::EpochMillis(1_709_284_500_000)), now),
            "2024-03-01T09:15:00.000Z"
        );
        assert_eq!(change_timestamp(None, now), "2024-05-01T12:00:00.000Z");
        assert_eq!(change_timestamp(Some(&text("")), now), "2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn digit_only_text_timestamps_are_not_reinterpreted() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        for written in ["1709284500", "20240301091500", "1709284500000", " 2024-03-01 "] {
            assert_eq!(change_timestamp(Some(&text(written)), now), written);
        }
    }

    #[test]
    fn changes_without_migrated_letters_are_dropped() {
        let mut ids = IdentityMap::new();
        ids.record_letter(10, 110);
        let now = Utc::now();

        let orphan = LegacyChange {
            id: 1,
            letter_id: Some(11),
            ..Default::default()
        };
        assert!(change_draft(&orphan, &ids, now).is_none());

        let kept = LegacyChange {
            id: 2,
            letter_id: Some(10),
            changed_by_user_id: Some(7),
            ..Default::default()
        };
        let change = change_draft(&kept, &ids, now).unwrap();
        assert_eq!(change.letter_id, 110);
        assert_eq!(change.changed_by, None);
        assert_eq!(change.field_name, "unknown");
    }

    #[test]
    fn store_run_conflicts_surface_as_run_in_progress() {
        let run_id = Uuid::new_v4();
        let err = MigrationError::from(StoreError::RunInProgress {
            run_id,
            started_at: Utc::now(),
        });
        assert!(matches!(err, MigrationError::RunInProgress { run_id: held, .. } if held == run_id));
    }
}
