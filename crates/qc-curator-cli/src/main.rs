use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use qc_curator_core::{IncompleteGroupPolicy, QualityConstraint, QualityPredicate};
use qc_curator_store_fs::{run_curation, run_filter_runs, CurationConfig};
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "qcc")]
#[command(about = "QC object curation CLI")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    /// Also append plain-text logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Copy primary objects correlated with accepted quality summaries.
    Curate(CurateArgs),
    /// Copy every primary object of an accepted run.
    FilterRuns(SelectionArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration after applying flag overrides.
    Show(CurateArgs),
}

#[derive(Debug, Args)]
struct SelectionArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    source_root: Option<PathBuf>,
    #[arg(long)]
    primary_catalog: Option<PathBuf>,
    #[arg(long)]
    accepted_runs: Option<PathBuf>,
    #[arg(long)]
    destination: Option<PathBuf>,
    #[arg(long)]
    primary_run_field: Option<String>,
    #[arg(long)]
    run_catalog_field: Option<String>,
    #[arg(long)]
    manifest: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct CurateArgs {
    #[command(flatten)]
    selection: SelectionArgs,
    #[arg(long)]
    summary_catalog: Option<PathBuf>,
    #[arg(long, conflicts_with = "quality_annotations")]
    quality_mapping: Option<PathBuf>,
    #[arg(long)]
    quality_annotations: Option<PathBuf>,
    #[arg(long)]
    summary_run_field: Option<String>,
    #[arg(long)]
    primary_path: Option<String>,
    #[arg(long)]
    summary_path: Option<String>,
    #[arg(long)]
    tolerance_minutes: Option<u32>,
    /// Quality constraint `key=value`; repeat for a conjunction. Replaces the configured predicate.
    #[arg(long = "predicate", value_name = "KEY=VALUE")]
    predicates: Vec<String>,
    #[arg(long, default_value_t = false)]
    skip_incomplete_groups: bool,
    /// How to handle a run group lacking one category: `fatal` or `skip`.
    #[arg(
        long,
        value_name = "POLICY",
        value_parser = parse_incomplete_groups,
        conflicts_with = "skip_incomplete_groups"
    )]
    incomplete_groups: Option<IncompleteGroupPolicy>,
}

fn parse_incomplete_groups(raw: &str) -> Result<IncompleteGroupPolicy, String> {
    IncompleteGroupPolicy::parse(raw)
        .ok_or_else(|| format!("incomplete group policy MUST be `fatal` or `skip`, got {raw:?}"))
}

fn override_with<T: Clone>(slot: &mut T, value: Option<&T>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

fn override_optional<T: Clone>(slot: &mut Option<T>, value: Option<&T>) {
    if let Some(value) = value {
        *slot = Some(value.clone());
    }
}

impl SelectionArgs {
    fn effective_config(&self) -> Result<CurationConfig> {
        let mut config = match &self.config {
            Some(path) => CurationConfig::load(path)?,
            None => CurationConfig::default(),
        };

        override_with(&mut config.source_root, self.source_root.as_ref());
        override_optional(&mut config.primary_catalog, self.primary_catalog.as_ref());
        override_optional(&mut config.accepted_runs, self.accepted_runs.as_ref());
        override_optional(&mut config.destination, self.destination.as_ref());
        override_with(&mut config.primary_run_field, self.primary_run_field.as_ref());
        override_with(&mut config.run_catalog_field, self.run_catalog_field.as_ref());
        override_optional(&mut config.manifest, self.manifest.as_ref());
        config.dry_run |= self.dry_run;

        Ok(config)
    }
}

impl CurateArgs {
    fn effective_config(&self) -> Result<CurationConfig> {
        let mut config = self.selection.effective_config()?;

        override_optional(&mut config.summary_catalog, self.summary_catalog.as_ref());
        if self.quality_mapping.is_some() {
            config.quality_mapping.clone_from(&self.quality_mapping);
            config.quality_annotations = None;
        }
        if self.quality_annotations.is_some() {
            config.quality_annotations.clone_from(&self.quality_annotations);
            config.quality_mapping = None;
        }
        override_with(&mut config.summary_run_field, self.summary_run_field.as_ref());
        override_optional(&mut config.primary_path, self.primary_path.as_ref());
        override_optional(&mut config.summary_path, self.summary_path.as_ref());
        override_with(&mut config.tolerance_minutes, self.tolerance_minutes.as_ref());
        if !self.predicates.is_empty() {
            let constraints = self
                .predicates
                .iter()
                .map(|raw| QualityConstraint::parse(raw))
                .collect::<Result<Vec<_>, _>>()?;
            config.predicate = QualityPredicate::new(constraints);
        }
        if self.skip_incomplete_groups {
            config.incomplete_groups = IncompleteGroupPolicy::Skip;
        }
        override_with(&mut config.incomplete_groups, self.incomplete_groups.as_ref());

        Ok(config)
    }
}

fn init_logging(level: LogLevel, log_file: Option<&PathBuf>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(tracing_subscriber::fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.log_file.as_ref())?;
    tracing::debug!("log level: {}", cli.log_level.as_str());

    match cli.command {
        Command::Curate(args) => run_curate(&args),
        Command::FilterRuns(args) => run_select(&args),
        Command::Config { command } => match command {
            ConfigCommand::Show(args) => run_config_show(&args),
        },
    }
}

fn run_curate(args: &CurateArgs) -> Result<()> {
    let config = args.effective_config()?;
    let report = run_curation(&config, None)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize curation report")?)
}

fn run_select(args: &SelectionArgs) -> Result<()> {
    let config = args.effective_config()?;
    let report = run_filter_runs(&config, None)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize run selection report")?)
}

fn run_config_show(args: &CurateArgs) -> Result<()> {
    let config = args.effective_config()?;
    emit_json(serde_json::json!({
        "config": serde_json::to_value(&config).context("failed to serialize configuration")?
    }))
}
