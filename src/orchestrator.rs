//! Query Orchestrator
//!
//! Sequences one request through the pipeline:
//!
//! ```text
//! RECEIVED -> GENERATING -> VALIDATING -> EXECUTING -> RESULT_VALIDATING -> COMPLETE
//!      \___________\______________\____________\_______________\____-> FAILED
//! ```
//!
//! 1. Generation: fails fast while the circuit is open; otherwise takes a generator
//!    permit and calls the generator, retrying failures with the error fed back
//! 2. Validation: a rejected candidate may be regenerated once with the violation reasons
//!    fed back
//! 3. Execution: takes a query permit and runs the verdict through the target's executor
//! 4. Result validation: a failing result loops back to generation a bounded number of times
//!
//! Each request owns its pipeline state. Shared state is the router (immutable), the rate
//! limiter and the circuit breaker. Every stage is wrapped in a [`StageSpan`] so failures
//! and cancellations are observed like successes.
//!
//! [`StageSpan`]: crate::telemetry::StageSpan

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{QueryError, Result};
use crate::executor::ExecutionResult;
use crate::generator::{GeneratedSql, GenerationRequest, SqlGenerator};
use crate::output::QueryResponse;
use crate::resilience::{CircuitBreaker, PermitCategory, RateLimiter};
use crate::result_validator::{ResultValidator, ShapeValidator};
use crate::router::{DatabaseRouter, DatabaseTarget};
use crate::telemetry::{Stage, StageStatus, Telemetry};
use crate::validator::Verdict;

/// Regeneration budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Extra generator calls after a failed one
    pub generation_retries: u32,
    /// Regenerate once when the validator rejects the candidate
    pub regenerate_on_violation: bool,
    /// Loops back to generation when the result fails validation
    pub result_regenerations: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { generation_retries: 2, regenerate_on_violation: true, result_regenerations: 1 }
    }
}

/// Inbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub natural_language: String,
    /// Target database; the default database when absent
    #[serde(default)]
    pub database: Option<String>,
    /// Row cap requested by the caller, bounded by the policy
    #[serde(default)]
    pub max_rows: Option<usize>,
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
}

impl QueryRequest {
    pub fn new(natural_language: impl Into<String>) -> Self {
        Self {
            natural_language: natural_language.into(),
            database: None,
            max_rows: None,
            request_id: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    #[must_use]
    pub const fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

/// Pipeline state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Generating,
    Validating,
    Executing,
    ResultValidating,
    Complete,
    Failed,
}

impl PipelineState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Executing => "executing",
            Self::ResultValidating => "result_validating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a generator call was made (`generator_calls_total{stage}`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Initial,
    ViolationFeedback,
    ResultFeedback,
}

impl Purpose {
    const fn label(self, attempt: u32) -> &'static str {
        if attempt > 1 {
            return "retry";
        }
        match self {
            Self::Initial => "initial",
            Self::ViolationFeedback => "violation_feedback",
            Self::ResultFeedback => "result_feedback",
        }
    }
}

/// Mutable state of one pipeline run
#[derive(Debug)]
struct Run {
    state: PipelineState,
    sql_used: Option<String>,
    tokens_used: u64,
    warnings: Vec<String>,
    /// Reasons fed back to the generator, oldest first
    feedback: Vec<String>,
}

impl Run {
    fn new() -> Self {
        Self {
            state: PipelineState::Received,
            sql_used: None,
            tokens_used: 0,
            warnings: Vec::new(),
            feedback: Vec::new(),
        }
    }

    fn enter(&mut self, state: PipelineState) {
        debug!(from = %self.state, to = %state, "pipeline transition");
        self.state = state;
    }
}

/// Top-level pipeline
pub struct QueryOrchestrator {
    router: DatabaseRouter,
    generator: Arc<dyn SqlGenerator>,
    result_validator: Arc<dyn ResultValidator>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    telemetry: Telemetry,
    config: OrchestratorConfig,
}

impl fmt::Debug for QueryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOrchestrator")
            .field("router", &self.router)
            .field("limiter", &self.limiter)
            .field("breaker", &self.breaker)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueryOrchestrator {
    pub fn new(
        router: DatabaseRouter,
        generator: Arc<dyn SqlGenerator>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        telemetry: Telemetry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            router,
            generator,
            result_validator: Arc::new(ShapeValidator),
            limiter,
            breaker,
            telemetry,
            config,
        }
    }

    /// Build the pipeline described by `settings`, connecting to every database
    pub async fn from_settings(settings: &Settings, generator: Arc<dyn SqlGenerator>) -> Result<Self> {
        let router = DatabaseRouter::from_settings(settings).await?;
        Ok(Self::new(
            router,
            generator,
            Arc::new(RateLimiter::new(settings.rate_limiter_config()?)),
            Arc::new(CircuitBreaker::new(settings.circuit_breaker_config()?)),
            Telemetry::new()?,
            settings.orchestrator,
        ))
    }

    #[must_use]
    pub fn with_result_validator(mut self, validator: Arc<dyn ResultValidator>) -> Self {
        self.result_validator = validator;
        self
    }

    #[must_use]
    pub const fn router(&self) -> &DatabaseRouter {
        &self.router
    }

    #[must_use]
    pub const fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run one request to its terminal response
    pub async fn query(&self, request: QueryRequest) -> QueryResponse {
        let root = info_span!(
            "query",
            request_id = %request.request_id,
            database = request.database.as_deref().unwrap_or("<default>"),
        );
        let timer = self.telemetry.start_request();

        let mut run = Run::new();
        let outcome = self.run(&request, &mut run).instrument(root.clone()).await;
        let _entered = root.enter();

        match outcome {
            Ok((verdict, result)) => {
                run.enter(PipelineState::Complete);
                if result.truncated {
                    run.warnings.push(format!("result truncated at {} rows", verdict.row_cap));
                }
                if result.row_count == 0 {
                    run.warnings.push("query returned no rows".to_string());
                }
                info!(
                    rows = result.row_count,
                    truncated = result.truncated,
                    attempts = result.attempts,
                    tokens = run.tokens_used,
                    "request complete"
                );
                timer.finish("complete");
                QueryResponse::complete(
                    verdict.sql,
                    result.records(),
                    result.truncated,
                    run.tokens_used,
                    run.warnings,
                )
            }
            Err(err) => {
                let stage = run.state;
                run.enter(PipelineState::Failed);
                if err.is_retriable() || matches!(err, QueryError::ValidationRejected { .. }) {
                    warn!(stage = %stage, kind = err.kind(), "request failed");
                } else {
                    error!(stage = %stage, kind = err.kind(), error = %err, "request failed");
                }
                timer.finish("failed");
                QueryResponse::failed(&err, stage.as_str(), run.sql_used, run.tokens_used, run.warnings)
            }
        }
    }

    async fn run(&self, request: &QueryRequest, run: &mut Run) -> Result<(Verdict, ExecutionResult)> {
        if request.natural_language.trim().is_empty() {
            return Err(QueryError::invalid_request("natural_language must not be empty"));
        }
        if request.max_rows == Some(0) {
            return Err(QueryError::invalid_request("max_rows must be at least 1"));
        }
        let target = self.router.resolve(request.database.as_deref())?;

        let mut violation_regenerations = u32::from(self.config.regenerate_on_violation);
        let mut result_regenerations = self.config.result_regenerations;
        let mut purpose = Purpose::Initial;

        loop {
            run.enter(PipelineState::Generating);
            let generated = self.generate(request, &target, run, purpose).await?;
            run.sql_used = Some(generated.sql.clone());

            run.enter(PipelineState::Validating);
            let span = self.telemetry.start_span(Stage::Validation, generated.attempt);
            let verdict = span.span().in_scope(|| target.validator.validate(&generated.sql, request.max_rows));
            if !verdict.allowed {
                span.end(StageStatus::Rejected);
                let reasons: Vec<String> =
                    verdict.violations.iter().map(|v| v.loggable(&target.policy)).collect();
                warn!(violations = ?reasons, "candidate SQL rejected");

                if violation_regenerations > 0 {
                    violation_regenerations -= 1;
                    run.feedback.extend(verdict.feedback());
                    run.warnings.push(format!("regenerated SQL after policy violation: {}", reasons.join(", ")));
                    purpose = Purpose::ViolationFeedback;
                    continue;
                }
                return Err(verdict
                    .to_error()
                    .unwrap_or_else(|| QueryError::invalid_request("candidate SQL rejected")));
            }
            span.end(StageStatus::Ok);
            run.sql_used = Some(verdict.sql.clone());

            run.enter(PipelineState::Executing);
            let result = self.execute(&target, &verdict).await?;

            run.enter(PipelineState::ResultValidating);
            let span = self.telemetry.start_span(Stage::ResultValidation, 1);
            match span.span().in_scope(|| self.result_validator.check(&verdict, &result)) {
                Ok(()) => {
                    span.end(StageStatus::Ok);
                    return Ok((verdict, result));
                }
                Err(reason) if result_regenerations > 0 => {
                    span.end(StageStatus::Rejected);
                    warn!(reason = %reason, "result rejected, regenerating");
                    result_regenerations -= 1;
                    run.feedback.push(format!("result rejected: {reason}"));
                    run.warnings.push(format!("regenerated SQL after result check: {reason}"));
                    purpose = Purpose::ResultFeedback;
                }
                Err(reason) => {
                    span.end(StageStatus::Rejected);
                    return Err(QueryError::result_validation_failed(reason));
                }
            }
        }
    }

    /// Call the generator with bounded retries behind the circuit breaker
    async fn generate(
        &self,
        request: &QueryRequest,
        target: &DatabaseTarget,
        run: &mut Run,
        purpose: Purpose,
    ) -> Result<GeneratedSql> {
        let mut generation = GenerationRequest {
            natural_language: request.natural_language.clone(),
            schema_context: target.schema.render(),
            engine: target.engine,
            prior_violations: run.feedback.clone(),
        };
        let attempts = self.config.generation_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let span = self.telemetry.start_span(Stage::Generation, attempt);

            let call = match self.breaker.try_acquire() {
                Ok(call) => call,
                Err(e) => {
                    span.end(StageStatus::Rejected);
                    return Err(e);
                }
            };
            let permit = match self.limiter.acquire(PermitCategory::Generator).instrument(span.span().clone()).await {
                Ok(permit) => permit,
                Err(e) => {
                    span.end(StageStatus::Rejected);
                    return Err(e);
                }
            };

            self.telemetry.record_generator_call(purpose.label(attempt));
            let outcome = self.generator.generate(&generation).instrument(span.span().clone()).await;
            drop(permit);

            match outcome {
                Ok(mut generated) if !generated.sql.trim().is_empty() => {
                    call.success();
                    span.end(StageStatus::Ok);
                    generated.attempt = attempt;
                    run.tokens_used = run.tokens_used.saturating_add(generated.tokens_used);
                    return Ok(generated);
                }
                Ok(generated) => {
                    call.failure();
                    span.end(StageStatus::Error);
                    run.tokens_used = run.tokens_used.saturating_add(generated.tokens_used);
                    last_error = "generator returned no SQL".to_string();
                }
                Err(e) => {
                    call.failure();
                    span.end(StageStatus::Error);
                    last_error = e.to_string();
                }
            }

            warn!(attempt, max_attempts = attempts, error = %last_error, "SQL generation failed");
            generation
                .prior_violations
                .push(format!("previous generation attempt failed: {last_error}"));
        }

        Err(QueryError::generation_failed(format!(
            "{attempts} attempt(s) failed, last error: {last_error}"
        )))
    }

    async fn execute(&self, target: &DatabaseTarget, verdict: &Verdict) -> Result<ExecutionResult> {
        let span = self.telemetry.start_span(Stage::Execution, 1);
        let permit = match self.limiter.acquire(PermitCategory::Query).instrument(span.span().clone()).await {
            Ok(permit) => permit,
            Err(e) => {
                span.end(StageStatus::Rejected);
                return Err(e);
            }
        };

        let outcome = target.executor.execute(verdict).instrument(span.span().clone()).await;
        drop(permit);

        match outcome {
            Ok(result) => {
                span.end(StageStatus::Ok);
                Ok(result)
            }
            Err(e) => {
                span.end(StageStatus::Error);
                Err(e)
            }
        }
    }
}
