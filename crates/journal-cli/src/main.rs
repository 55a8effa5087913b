use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use journal_migrate::{run_from_config, MigrationConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "journal-cli")]
#[command(about = "Records journal legacy migration")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate the legacy store into the normalized target schema.
    Migrate(MigrateArgs),
}

#[derive(Debug, Default, Args)]
struct MigrateArgs {
    /// Delete existing target letters and changes before migrating.
    #[arg(long)]
    force_reset: bool,
    /// Legacy SQLite file, checked before the default locations.
    #[arg(long, value_name = "PATH")]
    source: Option<PathBuf>,
    /// Front-end script holding the literal lookup catalogs.
    #[arg(long, value_name = "PATH")]
    lookup_source: Option<PathBuf>,
    #[arg(long, value_name = "URL")]
    database_url: Option<String>,
    #[arg(long, value_name = "DIR")]
    reports_dir: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    workspace_root: Option<PathBuf>,
    /// Remove a run marker left behind by a killed run.
    #[arg(long)]
    clear_stale_marker: bool,
    /// Create missing target tables from the bundled schema first.
    #[arg(long)]
    apply_schema: bool,
}

impl MigrateArgs {
    fn apply(self, mut config: MigrationConfig) -> MigrationConfig {
        config.force_reset |= self.force_reset;
        config.clear_stale_marker |= self.clear_stale_marker;
        config.apply_schema |= self.apply_schema;
        if let Some(source) = self.source {
            config.source_override = Some(source);
        }
        if let Some(lookup_source) = self.lookup_source {
            config.lookup_source = Some(lookup_source);
        }
        if let Some(database_url) = self.database_url {
            config.database_url = database_url;
        }
        if let Some(reports_dir) = self.reports_dir {
            config.reports_dir = reports_dir;
        }
        if let Some(workspace_root) = self.workspace_root {
            config.workspace_root = workspace_root;
        }
        config
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// One-line failure report with the whole context chain.
fn failure_message(err: &anyhow::Error) -> String {
    format!("migration failed: {err:#}")
}

async fn migrate(args: MigrateArgs) -> Result<()> {
    let config = args.apply(MigrationConfig::from_env());
    let run = run_from_config(&config).await?;
    print!("{}", run.report);
    println!("reports: {}", run.reports_dir.display());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Some(Commands::Migrate(args)) => migrate(args).await,
        None => migrate(MigrateArgs::default()).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", failure_message(&err));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_environment_config() {
        let cli = Cli::try_parse_from([
            "journal-cli",
            "migrate",
            "--force-reset",
            "--source",
            "/tmp/legacy.db",
            "--reports-dir",
            "/tmp/reports",
        ])
        .unwrap();
        let Some(Commands::Migrate(args)) = cli.command else {
            panic!("expected migrate");
        };

        let config = args.apply(MigrationConfig::from_vars(|_| None));
        assert!(config.force_reset);
        assert_eq!(config.source_override, Some(PathBuf::from("/tmp/legacy.db")));
        assert_eq!(config.reports_dir, PathBuf::from("/tmp/reports"));
        assert!(!config.clear_stale_marker);
        assert!(!config.apply_schema);
    }

    #[test]
    fn apply_schema_flag_reaches_config() {
        let cli = Cli::try_parse_from(["journal-cli", "migrate", "--apply-schema"]).unwrap();
        let Some(Commands::Migrate(args)) = cli.command else {
            panic!("expected migrate");
        };
        assert!(args.apply(MigrationConfig::from_vars(|_| None)).apply_schema);
    }

    #[test]
    fn failure_is_reported_once_with_its_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("connecting to target database");
        let message = failure_message(&err);
        assert_eq!(
            message,
            "migration failed: connecting to target database: connection refused"
        );
        assert_eq!(message.matches("migration failed").count(), 1);
    }

    #[test]
    fn bare_invocation_defaults_to_migrate() {
        let cli = Cli::try_parse_from(["journal-cli"]).unwrap();
        assert!(cli.command.is_none());
    }
}
