//! Telemetry
//!
//! Stage spans and request metrics for the pipeline.
//!
//! # Spans
//! Each request runs under a root `query` span. Each stage opens a child span
//! (`sql_generation`, `sql_validation`, `sql_execution`, `result_validation`) through
//! [`Telemetry::start_span`] and closes it with [`StageSpan::end`]. A span dropped without
//! an explicit end (the request future was cancelled) is recorded as `cancelled`, so no
//! exit path goes unobserved.
//!
//! # Metrics
//! - `query_requests_total{status}`
//! - `generator_calls_total{stage}`
//! - `query_duration_seconds`
//! - `stage_duration_seconds{stage,status}`
//!
//! Metrics live in a private [`prometheus::Registry`]; [`Telemetry::render`] produces the
//! text exposition format for whatever exporter the host wires up.

use std::fmt;
use std::time::Instant;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::{debug, field, info_span, Span};

use crate::error::{QueryError, Result};

/// Pipeline stage with its own span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generation,
    Validation,
    Execution,
    ResultValidation,
}

impl Stage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "sql_generation",
            Self::Validation => "sql_validation",
            Self::Execution => "sql_execution",
            Self::ResultValidation => "result_validation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Ok,
    /// The stage refused to proceed (policy violation, open circuit, exhausted permits)
    Rejected,
    Error,
    Cancelled,
}

impl StageStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Rejected => "rejected",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Request-level metric registry
#[derive(Clone)]
pub struct Telemetry {
    registry: Registry,
    requests: IntCounterVec,
    generator_calls: IntCounterVec,
    query_duration: Histogram,
    stage_duration: HistogramVec,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

fn metrics_error(e: prometheus::Error) -> QueryError {
    QueryError::config_error(format!("Could not register metrics: {e}"))
}

impl Telemetry {
    /// Create a registry with every pipeline metric registered
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("query_requests_total", "Requests by terminal status"),
            &["status"],
        )
        .map_err(metrics_error)?;
        let generator_calls = IntCounterVec::new(
            Opts::new("generator_calls_total", "SQL generator invocations by purpose"),
            &["stage"],
        )
        .map_err(metrics_error)?;
        let query_duration = Histogram::with_opts(HistogramOpts::new(
            "query_duration_seconds",
            "End-to-end request duration",
        ))
        .map_err(metrics_error)?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new("stage_duration_seconds", "Pipeline stage duration"),
            &["stage", "status"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(requests.clone())).map_err(metrics_error)?;
        registry.register(Box::new(generator_calls.clone())).map_err(metrics_error)?;
        registry.register(Box::new(query_duration.clone())).map_err(metrics_error)?;
        registry.register(Box::new(stage_duration.clone())).map_err(metrics_error)?;

        Ok(Self { registry, requests, generator_calls, query_duration, stage_duration })
    }

    /// Open a stage span under the current span
    pub fn start_span(&self, stage: Stage, attempt: u32) -> StageSpan<'_> {
        let span = match stage {
            Stage::Generation => info_span!("sql_generation", attempt, status = field::Empty),
            Stage::Validation => info_span!("sql_validation", attempt, status = field::Empty),
            Stage::Execution => info_span!("sql_execution", attempt, status = field::Empty),
            Stage::ResultValidation => info_span!("result_validation", attempt, status = field::Empty),
        };
        StageSpan { telemetry: self, stage, span, started: Instant::now(), ended: false }
    }

    /// Start timing a request; the timer records `cancelled` unless finished
    pub fn start_request(&self) -> RequestTimer<'_> {
        RequestTimer { telemetry: self, started: Instant::now(), finished: false }
    }

    /// Count one generator call, labelled by why it was made
    pub fn record_generator_call(&self, purpose: &str) {
        self.generator_calls.with_label_values(&[purpose]).inc();
    }

    /// Requests recorded with `status`
    #[must_use]
    pub fn requests_total(&self, status: &str) -> u64 {
        self.requests.with_label_values(&[status]).get()
    }

    /// Generator calls recorded for `purpose`
    #[must_use]
    pub fn generator_calls_total(&self, purpose: &str) -> u64 {
        self.generator_calls.with_label_values(&[purpose]).get()
    }

    /// Stage observations with the given status
    #[must_use]
    pub fn stage_count(&self, stage: Stage, status: StageStatus) -> u64 {
        self.stage_duration.with_label_values(&[stage.as_str(), status.as_str()]).get_sample_count()
    }

    /// Text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| QueryError::config_error(format!("Invalid metrics output: {e}")))
    }
}

/// Handle on an open stage span
#[must_use = "a stage span records `cancelled` when dropped without `end`"]
pub struct StageSpan<'a> {
    telemetry: &'a Telemetry,
    stage: Stage,
    span: Span,
    started: Instant,
    ended: bool,
}

impl StageSpan<'_> {
    /// The tracing span, for instrumenting the stage's futures
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    pub fn end(mut self, status: StageStatus) {
        self.finish(status);
    }

    fn finish(&mut self, status: StageStatus) {
        self.ended = true;
        let elapsed = self.started.elapsed();
        self.span.record("status", status.as_str());
        self.telemetry
            .stage_duration
            .with_label_values(&[self.stage.as_str(), status.as_str()])
            .observe(elapsed.as_secs_f64());
        debug!(
            parent: &self.span,
            stage = %self.stage,
            status = status.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "stage finished"
        );
    }
}

impl Drop for StageSpan<'_> {
    fn drop(&mut self) {
        if !self.ended {
            self.finish(StageStatus::Cancelled);
        }
    }
}

/// Times one request end to end
#[must_use = "a request timer records `cancelled` when dropped without `finish`"]
pub struct RequestTimer<'a> {
    telemetry: &'a Telemetry,
    started: Instant,
    finished: bool,
}

impl RequestTimer<'_> {
    /// Record the terminal status
    pub fn finish(mut self, status: &str) {
        self.record(status);
    }

    fn record(&mut self, status: &str) {
        self.finished = true;
        self.telemetry.requests.with_label_values(&[status]).inc();
        self.telemetry.query_duration.observe(self.started.elapsed().as_secs_f64());
    }
}

impl Drop for RequestTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.record("cancelled");
        }
    }
}
