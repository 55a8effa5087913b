use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use journal_adapters::LegacyLayout;
use journal_core::LookupCategory;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub created: u64,
    pub skipped: u64,
    /// Rows whose write failed without aborting the stage.
    pub failed: u64,
}

impl fmt::Display for StageCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "created={}, skipped={}", self.created, self.skipped)?;
        if self.failed > 0 {
            write!(f, ", failed={}", self.failed)?;
        }
        Ok(())
    }
}

/// Where the run read its data from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub path: PathBuf,
    pub sha256: String,
    pub layout: LegacyLayout,
    pub lookup_origin: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetCounts {
    pub letters_deleted: u64,
    pub changes_deleted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: SourceInfo,
    pub force_reset: bool,
    pub reset: Option<ResetCounts>,
    pub lookups: BTreeMap<LookupCategory, StageCounts>,
    pub users: StageCounts,
    pub letters: StageCounts,
    pub changes: StageCounts,
}

impl MigrationReport {
    pub fn new(run_id: Uuid, source: SourceInfo, force_reset: bool) -> Self {
        let started_at = Utc::now();
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            source,
            force_reset,
            reset: None,
            lookups: LookupCategory::ALL
                .iter()
                .map(|category| (*category, StageCounts::default()))
                .collect(),
            users: StageCounts::default(),
            letters: StageCounts::default(),
            changes: StageCounts::default(),
        }
    }

    pub fn lookup_counts(&self, category: LookupCategory) -> StageCounts {
        self.lookups.get(&category).copied().unwrap_or_default()
    }

    /// One `label: created=N, skipped=N` line per stage, in stage order.
    pub fn stage_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .lookups
            .iter()
            .map(|(category, counts)| format!("{category}: {counts}"))
            .collect();
        lines.push(format!("users: {}", self.users));
        lines.push(format!("letters: {}", self.letters));
        lines.push(format!("changes: {}", self.changes));
        lines
    }

    pub fn summary_markdown(&self) -> String {
        let mut out = format!(
            "# Legacy Migration Report\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Source: `{}` ({})\n- Source SHA-256: `{}`\n- Lookups from: {}\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            self.source.path.display(),
            self.source.layout,
            self.source.sha256,
            self.source.lookup_origin,
        );
        if let Some(reset) = self.reset {
            out.push_str(&format!(
                "- Reset: deleted {} letters and {} changes\n",
                reset.letters_deleted, reset.changes_deleted
            ));
        }
        out.push_str("\n## Stages\n");
        for line in self.stage_lines() {
            out.push_str(&format!("- {line}\n"));
        }
        out
    }

    /// Writes `migration_report.json` and `summary.md` under `<reports_root>/<run_id>/`.
    pub async fn write_to(&self, reports_root: &Path) -> Result<PathBuf> {
        let dir = reports_root.join(self.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(self).context("serializing migration report")?;
        fs::write(dir.join("migration_report.json"), json)
            .await
            .context("writing migration_report.json")?;
        fs::write(dir.join("summary.md"), self.summary_markdown())
            .await
            .context("writing summary.md")?;
        Ok(dir)
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {}", self.run_id)?;
        writeln!(
            f,
            "source: {} ({}, sha256 {})",
            self.source.path.display(),
            self.source.layout,
            self.source.sha256
        )?;
        writeln!(f, "lookups from: {}", self.source.lookup_origin)?;
        if let Some(reset) = self.reset {
            writeln!(
                f,
                "reset: deleted {} letters, {} changes",
                reset.letters_deleted, reset.changes_deleted
            )?;
        }
        for line in self.stage_lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
