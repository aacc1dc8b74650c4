//! Shared fakes for pipeline tests: a scripted generator and a scripted connection pool.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use querygate::engine::{ColumnDescriptor, DbResult, RowSet, SchemaContext, StatementPlan};
use querygate::generator::ModelMetadata;
use querygate::resilience::{CircuitBreakerConfig, RateLimiterConfig};
use querygate::{
    CircuitBreaker, ConnectionPool, DatabaseRouter, DatabaseType, DbError, DbErrorKind, GeneratedSql,
    GenerationRequest, GeneratorError, OrchestratorConfig, PolicySettings, QueryOrchestrator, RateLimiter,
    RetryPolicy, SecurityPolicy, Session, SqlGenerator, Telemetry,
};
use querygate::router::DatabaseTarget;

/// Generator replying from a script; an exhausted script fails every call
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, GeneratorError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    hang: bool,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Result<&str, GeneratorError>>) -> Arc<Self> {
        let replies = replies.into_iter().map(|r| r.map(str::to_string)).collect();
        Arc::new(Self { replies: Mutex::new(replies), requests: Mutex::default(), hang: false })
    }

    /// Generator whose calls never complete
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self { hang: true, ..Self::default() })
    }

    pub fn always(sql: &str, times: usize) -> Arc<Self> {
        Self::new(vec![Ok(sql); times])
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedSql, GeneratorError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GeneratorError::Transport("script exhausted".to_string())));
        reply.map(|sql| GeneratedSql {
            sql,
            model_metadata: ModelMetadata { model: Some("scripted".to_string()) },
            tokens_used: 25,
            attempt: 0,
        })
    }
}

/// One scripted database outcome
#[derive(Debug, Clone)]
pub enum Step {
    Rows(RowSet),
    Fail(DbErrorKind, &'static str),
}

/// Pool whose sessions replay a script, recording every plan they run
#[derive(Debug, Default)]
pub struct ScriptedPool {
    steps: Mutex<VecDeque<Step>>,
    plans: Mutex<Vec<StatementPlan>>,
}

impl ScriptedPool {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self { steps: Mutex::new(steps.into()), plans: Mutex::default() })
    }

    pub fn runs(&self) -> usize {
        self.plans.lock().unwrap().len()
    }

    pub fn plans(&self) -> Vec<StatementPlan> {
        self.plans.lock().unwrap().clone()
    }
}

pub struct ScriptedSession(Arc<ScriptedPool>);

/// Local handle so the foreign `ConnectionPool` trait can be implemented over a shared pool
#[derive(Debug, Clone)]
pub struct SharedPool(pub Arc<ScriptedPool>);

#[async_trait]
impl ConnectionPool for SharedPool {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn acquire(&self, _timeout: Duration) -> DbResult<Box<dyn Session>> {
        Ok(Box::new(ScriptedSession(self.0.clone())))
    }

    async fn describe_schema(&self) -> DbResult<SchemaContext> {
        Ok(SchemaContext::default())
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn run(&mut self, plan: &StatementPlan) -> DbResult<RowSet> {
        self.0.plans.lock().unwrap().push(plan.clone());
        let step = self.0.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Rows(set)) => Ok(set),
            Some(Step::Fail(kind, message)) => Err(DbError::new(kind, message)),
            None => Err(DbError::new(DbErrorKind::Other, "script exhausted")),
        }
    }
}

/// `n` single-column rows
pub fn rows(n: usize) -> RowSet {
    RowSet {
        columns: vec![ColumnDescriptor { name: "id".to_string(), data_type: "int4".to_string() }],
        rows: (0..n).map(|i| vec![json!(i)]).collect(),
        truncated: false,
    }
}

/// Policy blocking the `secrets` table
pub fn policy() -> SecurityPolicy {
    SecurityPolicy::build(&PolicySettings {
        blocked_tables: Some(vec!["secrets".to_string()]),
        ..PolicySettings::default()
    })
    .unwrap()
}

/// Pipeline over one scripted database named `main`
pub struct Harness {
    pub orchestrator: QueryOrchestrator,
    pub generator: Arc<ScriptedGenerator>,
    pub pool: Arc<ScriptedPool>,
}

impl Harness {
    pub fn new(generator: Arc<ScriptedGenerator>, pool: Arc<ScriptedPool>) -> Self {
        Self::with_breaker(generator, pool, Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())))
    }

    pub fn with_breaker(
        generator: Arc<ScriptedGenerator>,
        pool: Arc<ScriptedPool>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self::build(generator, pool, breaker, OrchestratorConfig::default())
    }

    pub fn build(
        generator: Arc<ScriptedGenerator>,
        pool: Arc<ScriptedPool>,
        breaker: Arc<CircuitBreaker>,
        config: OrchestratorConfig,
    ) -> Self {
        let target = DatabaseTarget::new(
            "main",
            Arc::new(SharedPool(pool.clone())),
            policy(),
            RetryPolicy::default(),
            Duration::from_secs(5),
        );
        let orchestrator = QueryOrchestrator::new(
            DatabaseRouter::new(vec![target], "main").unwrap(),
            generator.clone(),
            Arc::new(RateLimiter::new(RateLimiterConfig::default())),
            breaker,
            Telemetry::new().unwrap(),
            config,
        );
        Self { orchestrator, generator, pool }
    }
}
