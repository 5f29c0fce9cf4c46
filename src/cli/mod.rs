//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `fuzz` -- run the fuzzer against a live target
//! - `routes` -- list the operations a run would cover (dry run)
//! - `version` -- print build/version info

use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::auth;
use crate::config::{ConfigError, FileConfig, Secrets, DEFAULT_OUTPUT_DIR};
use crate::contract::{join_paths, Contract, ContractError};
use crate::fuzz::{
    select_targets, ArtifactError, FileArtifactSink, FuzzError, FuzzSummary, Fuzzer,
    DEFAULT_EXCLUDE,
};
use crate::logging::{init_logging, LogFormat, LoggingError};

/// Contract-driven black-box fuzzer for OpenAPI-described HTTP services.
#[derive(Parser, Debug)]
#[command(
    name = "oasfuzz",
    version = env!("CARGO_PKG_VERSION"),
    about = "oasfuzz: replay contract-conforming random requests and flag contract violations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fuzz a running service for a bounded duration.
    Fuzz(FuzzArgs),

    /// Print the operations a fuzz run would cover, without sending anything.
    Routes {
        /// Contract file (OpenAPI 3.x, JSON or YAML).
        #[arg(long)]
        spec: PathBuf,

        /// Regex over path templates to leave out.
        #[arg(long)]
        exclude: Option<String>,
    },

    /// Print version, build date, and git commit information.
    Version,
}

#[derive(clap::Args, Debug, Default)]
pub struct FuzzArgs {
    /// Contract file (OpenAPI 3.x, JSON or YAML).
    #[arg(long)]
    pub spec: Option<PathBuf>,

    /// Target base URL; `http://` is assumed when no scheme is given.
    #[arg(long)]
    pub url: Option<String>,

    /// Username for basic auth and the session login.
    #[arg(long)]
    pub user: Option<String>,

    /// Password for basic auth and the session login.
    #[arg(long)]
    pub password: Option<String>,

    /// API key for `apiKey` security schemes.
    #[arg(long)]
    pub apikey: Option<String>,

    /// Bearer token for `http bearer` and `oauth2` security schemes.
    #[arg(long)]
    pub token: Option<String>,

    /// Artifact directory (default: fuzzer_output).
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Also persist exchanges that conform to the contract.
    #[arg(long)]
    pub detailed: bool,

    /// Wall-clock budget, e.g. 90s, 30m, 1h30m (default: 1h).
    #[arg(long)]
    pub duration: Option<String>,

    /// Verbose diagnostics (log level `debug`).
    #[arg(long)]
    pub debug: bool,

    /// JSON5 file with default settings; flags take precedence.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seed for reproducible value generation.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Regex over path templates never fuzzed (default: logout$).
    #[arg(long)]
    pub exclude: Option<String>,

    /// Login endpoint for the session cookie, used as given.
    #[arg(long)]
    pub login_path: Option<String>,

    /// Per-request timeout (default: 30s).
    #[arg(long)]
    pub timeout: Option<String>,

    /// Log line format.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Do not print the progress line.
    #[arg(long)]
    pub no_progress: bool,
}

impl FuzzArgs {
    /// The non-secret flags as a settings layer. Unset flags stay `None`
    /// so the config file can fill them.
    pub fn layer(&self) -> FileConfig {
        FileConfig {
            spec: self.spec.clone(),
            url: self.url.clone(),
            username: self.user.clone(),
            output: self.output.clone(),
            detailed: self.detailed.then_some(true),
            duration: self.duration.clone(),
            timeout: self.timeout.clone(),
            exclude: self.exclude.clone(),
            login_path: self.login_path.clone(),
            seed: self.seed,
            log_level: self.debug.then(|| "debug".to_string()),
            log_format: self.log_format,
            progress: self.no_progress.then_some(false),
        }
    }

    pub fn secrets(&self) -> Secrets {
        Secrets {
            password: self.password.clone(),
            api_key: self.apikey.clone(),
            token: self.token.clone(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Usage(#[from] clap::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Fuzz(#[from] FuzzError),

    #[error("Invalid exclusion pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

/// Run the `fuzz` subcommand.
pub async fn handle_fuzz(args: FuzzArgs) -> Result<FuzzSummary, CliError> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let run = match file.merge(args.layer()).resolve(args.secrets()) {
        Ok(run) => run,
        Err(ConfigError::Missing(name)) => {
            return Err(usage_error(format!(
                "the following required argument was not provided: --{}",
                name
            )))
        }
        Err(e) => return Err(e.into()),
    };

    init_logging(&run.log_level, run.log_format)?;

    let contract = Arc::new(Contract::load(&run.spec)?);
    info!(
        spec = %run.spec.display(),
        operations = contract.operation_count(),
        "contract loaded"
    );

    let sink = Arc::new(FileArtifactSink::new(&run.output)?);
    let login_path = auth::resolve_login_path(&contract, run.login_path.as_deref());
    let mut fuzzer = Fuzzer::new(
        contract,
        &run.url,
        run.credentials.clone(),
        sink,
        run.settings.clone(),
    )?;

    if fuzzer.establish_session(&login_path).await.is_established() {
        println!("Session established via {}", login_path);
    }

    let summary = fuzzer.run().await?;
    print_summary(&summary, &run.output);
    Ok(summary)
}

/// Run the `routes` subcommand -- list targets in fuzzing order.
pub fn handle_routes(spec: &Path, exclude: Option<&str>) -> Result<(), CliError> {
    let contract = Contract::load(spec)?;
    let pattern = exclude.unwrap_or(DEFAULT_EXCLUDE);
    let exclude = regex::Regex::new(pattern).map_err(|e| CliError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let base_path = contract.base_path();
    let targets = select_targets(&contract, &exclude);
    for (path, method, operation) in &targets {
        let full = join_paths(&base_path, path);
        match operation.operation_id.as_deref() {
            Some(id) => println!("{:<7} {}  ({})", method, full, id),
            None => println!("{:<7} {}", method, full),
        }
    }
    println!();
    println!(
        "{} of {} operations selected (excluding '{}')",
        targets.len(),
        contract.operation_count(),
        pattern
    );
    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("oasfuzz {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("OASFUZZ_BUILD_DATE"));
    println!("  Git commit: {}", env!("OASFUZZ_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn usage_error(message: String) -> CliError {
    let mut cmd = Cli::command();
    let err = match cmd.find_subcommand_mut("fuzz") {
        Some(fuzz) => fuzz.error(clap::error::ErrorKind::MissingRequiredArgument, message),
        None => cmd.error(clap::error::ErrorKind::MissingRequiredArgument, message),
    };
    CliError::Usage(err)
}

fn print_summary(summary: &FuzzSummary, output: &Path) {
    println!("Fuzzing finished after {:.1?}", summary.elapsed);
    println!("  Cycles:   {}", summary.cycles);
    println!("  Sent:     {}", summary.sent);
    println!("  Crashes:  {}", summary.crashes);
    println!("  Passed:   {}", summary.passes);
    println!("  Failed:   {}", summary.failed);
    println!("  Skipped:  {}", summary.skipped);
    if summary.crashes > 0 {
        println!("Crash artifacts written to {}", output.display());
    } else if output != Path::new(DEFAULT_OUTPUT_DIR) {
        println!("Artifacts directory: {}", output.display());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
