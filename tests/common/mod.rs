#![allow(dead_code)]

//! Scripted in-memory shard for integration tests.
//!
//! Rules map a SQL substring to a queue of canned responses; the
//! longest matching pattern wins and each match pops one response.
//! With no matching rule the shard answers with harmless defaults
//! (no rows, one changed row), and usage probes report `size_bytes`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use volshard::router::{RouterConfig, ShardBinding};
use volshard::{Result, Row, RunMeta, ShardConnection, ShardError, ShardRouter, Statement};

static TRACING: Once = Once::new();

/// Route crate warnings (excluded shards, failed repairs) into the
/// test harness output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Clone)]
pub enum Response {
    Rows(Vec<Row>),
    Changes(u64),
    Error(String),
}

struct Rule {
    pattern: String,
    responses: VecDeque<Response>,
}

pub struct MockShard {
    size_bytes: u64,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
}

impl MockShard {
    pub fn new() -> Arc<Self> {
        Self::with_size(1024)
    }

    /// A shard whose usage probe reports `size_bytes`.
    pub fn with_size(size_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            size_bytes,
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn queue_rows(&self, pattern: &str, rows: Vec<Row>) {
        self.queue(pattern, Response::Rows(rows));
    }

    pub fn queue_changes(&self, pattern: &str, changes: u64) {
        self.queue(pattern, Response::Changes(changes));
    }

    pub fn queue_error(&self, pattern: &str, message: &str) {
        self.queue(pattern, Response::Error(message.to_string()));
    }

    fn queue(&self, pattern: &str, response: Response) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.pattern == pattern) {
            rule.responses.push_back(response);
        } else {
            rules.push(Rule {
                pattern: pattern.to_string(),
                responses: VecDeque::from([response]),
            });
        }
    }

    /// Number of executed statements whose SQL contains `pattern`.
    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(sql, _)| sql.contains(pattern))
            .count()
    }

    pub fn last_params(&self, pattern: &str) -> Option<Vec<Value>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(sql, _)| sql.contains(pattern))
            .map(|(_, params)| params.clone())
    }

    fn respond(&self, sql: &str, params: &[Value]) -> Option<Response> {
        self.calls
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));

        let mut rules = self.rules.lock().unwrap();
        let best = rules
            .iter_mut()
            .filter(|r| sql.contains(&r.pattern) && !r.responses.is_empty())
            .max_by_key(|r| r.pattern.len())?;
        best.responses.pop_front()
    }

    fn run_response(&self, sql: &str, params: &[Value]) -> Result<RunMeta> {
        match self.respond(sql, params) {
            Some(Response::Changes(changes)) => Ok(RunMeta { changes }),
            Some(Response::Rows(_)) | None => Ok(RunMeta { changes: 1 }),
            Some(Response::Error(message)) => Err(ShardError::Execution(message)),
        }
    }
}

#[async_trait]
impl ShardConnection for MockShard {
    async fn first(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        match self.respond(sql, params) {
            Some(Response::Rows(rows)) => Ok(rows.into_iter().next()),
            Some(Response::Changes(_)) => Ok(None),
            Some(Response::Error(message)) => Err(ShardError::Execution(message)),
            None if sql.contains("pragma_page_count") => {
                Ok(Some(row(&[("size", Value::from(self.size_bytes))])))
            }
            None => Ok(None),
        }
    }

    async fn all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        match self.respond(sql, params) {
            Some(Response::Rows(rows)) => Ok(rows),
            Some(Response::Changes(_)) => Ok(Vec::new()),
            Some(Response::Error(message)) => Err(ShardError::Execution(message)),
            None => Ok(Vec::new()),
        }
    }

    async fn run(&self, sql: &str, params: &[Value]) -> Result<RunMeta> {
        self.run_response(sql, params)
    }

    async fn batch(&self, statements: &[Statement]) -> Result<Vec<RunMeta>> {
        let mut metas = Vec::with_capacity(statements.len());
        for statement in statements {
            metas.push(self.run_response(&statement.sql, &statement.params)?);
        }
        Ok(metas)
    }
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(column, value)| (column.to_string(), value.clone()))
        .collect()
}

pub fn bindings(shards: Vec<(&str, Arc<MockShard>)>) -> Vec<ShardBinding> {
    shards
        .into_iter()
        .map(|(name, shard)| ShardBinding::new(name, shard as Arc<dyn ShardConnection>))
        .collect()
}

/// Router over the given `(binding name, shard)` pairs, with defaults.
pub fn router_with(shards: Vec<(&str, Arc<MockShard>)>) -> Arc<ShardRouter> {
    router_from_config(RouterConfig::new(bindings(shards)))
}

pub fn router_from_config(config: RouterConfig) -> Arc<ShardRouter> {
    init_tracing();
    let codec = Arc::new(volshard::IdCodec::new());
    Arc::new(ShardRouter::new(config, codec).unwrap())
}
