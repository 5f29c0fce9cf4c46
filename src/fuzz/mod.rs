//! Fuzz Loop
//!
//! Drives the whole run: each cycle synthesizes one request per target
//! operation, then sends them one at a time and classifies every response
//! against the contract. Cycles repeat until the configured duration has
//! elapsed; a cycle in flight always runs to completion.
//!
//! ```text
//!   Idle ──run()──▶ Running ──elapsed ≥ duration──▶ Completed
//! ```

pub mod artifacts;

pub use artifacts::{
    artifact_file_name, ArtifactError, ArtifactKind, ArtifactSink, ExchangeRecord,
    FileArtifactSink,
};

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::HeaderMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::auth::{self, SessionState};
use crate::contract::{
    Contract, ExchangeValidator, HttpMethod, Operation, RouteError, RouteResolver, Router,
    SchemaValidator, ValidationContext, ValidationError,
};
use crate::generate::ValueGenerator;
use crate::logging::Redactor;
use crate::request::{Credentials, RequestSynthesizer, SynthesisError, SynthesizedRequest};

/// Default wall-clock budget for a run
pub const DEFAULT_DURATION: Duration = Duration::from_secs(60 * 60);

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Paths matching this are never fuzzed, so the shared session survives
pub const DEFAULT_EXCLUDE: &str = "logout$";

/// Pause after a cycle that sent nothing, so an all-skipped contract does
/// not spin
const IDLE_CYCLE_PAUSE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("No operations left to fuzz after excluding '{0}'")]
    NoTargets(String),

    #[error("Route table construction failed: {0}")]
    Route(#[from] RouteError),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Fuzzer cannot start from state {0:?}")]
    InvalidState(FuzzState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzState {
    Idle,
    Running,
    Completed,
}

/// Run parameters
#[derive(Debug, Clone)]
pub struct FuzzSettings {
    pub duration: Duration,
    /// Persist conforming exchanges as well
    pub detailed: bool,
    pub exclude: Regex,
    pub timeout: Duration,
    /// Print the `\r`-refreshed progress line on stdout
    pub progress: bool,
    pub seed: Option<u64>,
}

impl Default for FuzzSettings {
    fn default() -> Self {
        Self {
            duration: DEFAULT_DURATION,
            detailed: false,
            exclude: default_exclude(),
            timeout: DEFAULT_TIMEOUT,
            progress: true,
            seed: None,
        }
    }
}

lazy_static! {
    static ref DEFAULT_EXCLUDE_RE: Regex = Regex::new(DEFAULT_EXCLUDE).unwrap();
}

fn default_exclude() -> Regex {
    DEFAULT_EXCLUDE_RE.clone()
}

/// Result of judging one response
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Conforming,
    Violation(ValidationError),
}

/// What happened to one synthesized request
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    Passed,
    Crashed,
    /// The exchange never completed (send, timeout or body read failure)
    Failed(String),
}

/// Counters for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub synthesized: usize,
    pub skipped: usize,
    pub passed: usize,
    pub crashed: usize,
    pub failed: usize,
}

impl CycleReport {
    /// Exchanges that completed, whatever their verdict
    pub fn sent(&self) -> usize {
        self.passed + self.crashed
    }
}

/// Totals for a whole run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuzzSummary {
    pub cycles: usize,
    pub sent: usize,
    pub crashes: usize,
    pub passes: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

impl FuzzSummary {
    fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.sent += report.sent();
        self.crashes += report.crashed;
        self.passes += report.passed;
        self.failed += report.failed;
        self.skipped += report.skipped;
    }
}

/// Judge a response. Pure: identical inputs give identical verdicts.
pub fn classify(
    validator: &dyn ExchangeValidator,
    context: &ValidationContext,
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
) -> Verdict {
    match validator.validate_response(context, status, headers, body) {
        Ok(()) => Verdict::Conforming,
        Err(e) => Verdict::Violation(e),
    }
}

/// Operations a run covers, in contract order, minus excluded paths
pub fn select_targets<'a>(
    contract: &'a Contract,
    exclude: &Regex,
) -> Vec<(&'a str, HttpMethod, &'a Operation)> {
    contract
        .operations()
        .filter(|(path, method, _)| {
            let excluded = exclude.is_match(path);
            if excluded {
                debug!(method = %method, path, "excluded from fuzzing");
            }
            !excluded
        })
        .collect()
}

pub struct Fuzzer {
    contract: Arc<Contract>,
    synthesizer: RequestSynthesizer,
    validator: Arc<dyn ExchangeValidator>,
    sink: Arc<dyn ArtifactSink>,
    client: reqwest::Client,
    settings: FuzzSettings,
    credentials: Credentials,
    redactor: Redactor,
    session: SessionState,
    generator: ValueGenerator,
    state: FuzzState,
}

impl Fuzzer {
    /// Fuzzer over `contract` using the built-in router and schema validator
    pub fn new(
        contract: Arc<Contract>,
        target: &str,
        credentials: Credentials,
        sink: Arc<dyn ArtifactSink>,
        settings: FuzzSettings,
    ) -> Result<Self, FuzzError> {
        let resolver: Arc<dyn RouteResolver> = Arc::new(Router::new(&contract)?);
        let validator: Arc<dyn ExchangeValidator> =
            Arc::new(SchemaValidator::new(Arc::clone(&contract)));
        Self::with_parts(contract, resolver, validator, sink, target, credentials, settings)
    }

    /// Fuzzer with caller-supplied route resolution and validation
    pub fn with_parts(
        contract: Arc<Contract>,
        resolver: Arc<dyn RouteResolver>,
        validator: Arc<dyn ExchangeValidator>,
        sink: Arc<dyn ArtifactSink>,
        target: &str,
        credentials: Credentials,
        settings: FuzzSettings,
    ) -> Result<Self, FuzzError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("oasfuzz/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let generator = ValueGenerator::new(settings.seed).with_schemas(contract.schemas());
        let synthesizer = RequestSynthesizer::new(
            Arc::clone(&contract),
            resolver,
            Arc::clone(&validator),
            target,
            credentials.clone(),
        );

        Ok(Self {
            contract,
            synthesizer,
            validator,
            sink,
            client,
            generator,
            settings,
            redactor: Redactor::for_credentials(&credentials),
            credentials,
            session: SessionState::NotConfigured,
            state: FuzzState::Idle,
        })
    }

    pub fn state(&self) -> FuzzState {
        self.state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn settings(&self) -> &FuzzSettings {
        &self.settings
    }

    /// Log in once; the resulting cookies ride along with every request
    pub async fn establish_session(&mut self, login_path: &str) -> &SessionState {
        self.session = auth::login(
            &self.client,
            &self.credentials,
            self.synthesizer.target(),
            login_path,
        )
        .await;
        &self.session
    }

    pub fn targets(&self) -> Vec<(&str, HttpMethod, &Operation)> {
        select_targets(&self.contract, &self.settings.exclude)
    }

    /// Run cycles until the duration elapses
    pub async fn run(&mut self) -> Result<FuzzSummary, FuzzError> {
        if self.state != FuzzState::Idle {
            return Err(FuzzError::InvalidState(self.state));
        }
        if self.targets().is_empty() {
            return Err(FuzzError::NoTargets(self.settings.exclude.to_string()));
        }

        self.state = FuzzState::Running;
        let start = Instant::now();
        let mut summary = FuzzSummary::default();
        info!(
            targets = self.targets().len(),
            duration = ?self.settings.duration,
            "fuzzing started"
        );

        while start.elapsed() < self.settings.duration {
            let report = self.run_cycle().await;
            summary.absorb(&report);

            if self.settings.progress {
                print_progress(summary.sent, start.elapsed());
            }
            if report.sent() == 0 && report.failed == 0 {
                tokio::time::sleep(IDLE_CYCLE_PAUSE).await;
            }
        }

        if self.settings.progress {
            println!();
        }
        summary.elapsed = start.elapsed();
        self.state = FuzzState::Completed;
        info!(
            cycles = summary.cycles,
            sent = summary.sent,
            crashes = summary.crashes,
            failed = summary.failed,
            "fuzzing completed"
        );
        Ok(summary)
    }

    /// One cycle: synthesize every target, then send and classify in order
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let contract = Arc::clone(&self.contract);

        let mut queue = Vec::new();
        for (path, method, operation) in select_targets(&contract, &self.settings.exclude) {
            match self.synthesizer.synthesize(
                path,
                method,
                operation,
                &mut self.generator,
                self.session.cookies(),
            ) {
                Ok(request) => queue.push(request),
                Err(SynthesisError::Route(e)) => {
                    debug!(method = %method, path, error = %e, "route not resolvable, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(method = %method, path, error = %e, "request construction failed, skipping");
                    report.skipped += 1;
                }
            }
        }
        report.synthesized = queue.len();

        for synthesized in queue {
            match self.exchange(synthesized).await {
                ExchangeOutcome::Passed => report.passed += 1,
                ExchangeOutcome::Crashed => report.crashed += 1,
                ExchangeOutcome::Failed(reason) => {
                    debug!(reason = %reason, "exchange failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Send one request, read the full response and route it by verdict
    async fn exchange(&self, synthesized: SynthesizedRequest) -> ExchangeOutcome {
        let SynthesizedRequest {
            request,
            record,
            context,
            request_error,
        } = synthesized;

        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    method = %record.method,
                    url = %self.redactor.redact_string(&record.url),
                    error = %self.redactor.redact_string(&e.to_string()),
                    "request failed"
                );
                return ExchangeOutcome::Failed(e.to_string());
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    method = %record.method,
                    url = %self.redactor.redact_string(&record.url),
                    error = %e,
                    "failed to read response body"
                );
                return ExchangeOutcome::Failed(e.to_string());
            }
        };

        let verdict = classify(self.validator.as_ref(), &context, status, &headers, &body);
        let mut exchange = ExchangeRecord {
            request: record,
            status,
            response_headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect(),
            response_body: body.to_vec(),
            request_validation: request_error.map(|e| e.to_string()),
            response_validation: None,
        };

        match verdict {
            Verdict::Violation(e) => {
                debug!(
                    method = %exchange.request.method,
                    path = %exchange.request.path,
                    status,
                    error = %e,
                    "contract violation"
                );
                exchange.response_validation = Some(e.to_string());
                if let Err(e) = self.sink.write_crash(&exchange) {
                    error!(error = %e, "failed to write crash artifact");
                }
                ExchangeOutcome::Crashed
            }
            Verdict::Conforming => {
                if self.settings.detailed {
                    if let Err(e) = self.sink.write_test(&exchange) {
                        error!(error = %e, "failed to write test artifact");
                    }
                }
                ExchangeOutcome::Passed
            }
        }
    }
}

fn print_progress(sent: usize, elapsed: Duration) {
    let mut stdout = std::io::stdout();
    let _ = write!(
        stdout,
        "\rProgress: {} requests sent in {:.1?} | Current time: {}",
        sent,
        elapsed,
        chrono::Local::now().format("%H:%M:%S")
    );
    let _ = stdout.flush();
}
