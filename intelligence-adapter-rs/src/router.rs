//! # Router
//!
//! Static dispatch table keyed by `(topic, OperationType)`, built once at
//! startup. Every backend route owns exactly one [`ResilienceClient`]; routes
//! registered for several topics share that client, and therefore its
//! circuit.

use std::collections::{BTreeMap, HashMap};

use resilience::{CircuitBreakerConfig, ResilienceClient, RetryPolicy};
use thiserror::Error;
use tracing::debug;

use crate::envelope::EventEnvelope;
use crate::operation::OperationType;

/// Terminal routing failures; sent to the dead letter queue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnroutableError {
    #[error("payload has no string 'operation_type'")]
    MissingOperationType,

    #[error("unknown operation type '{0}'")]
    UnknownOperationType(String),

    #[error("no route for operation '{operation}' on topic '{topic}'")]
    NoRoute {
        topic: String,
        operation: OperationType,
    },
}

/// The pipeline selected for one message
#[derive(Debug, Clone)]
pub struct Handler {
    pub operation: OperationType,
    pub client: ResilienceClient,
}

/// Immutable routing table
#[derive(Debug)]
pub struct Router {
    table: HashMap<(String, OperationType), Handler>,
    clients: BTreeMap<OperationType, ResilienceClient>,
}

impl Router {
    /// Router serving every operation on every topic in `topics`
    pub fn for_topics(topics: &[String], breaker: CircuitBreakerConfig, policy: RetryPolicy) -> Self {
        topics
            .iter()
            .fold(RouterBuilder::new(breaker, policy), |builder, topic| builder.all_operations(topic))
            .build()
    }

    pub fn builder(breaker: CircuitBreakerConfig, policy: RetryPolicy) -> RouterBuilder {
        RouterBuilder::new(breaker, policy)
    }

    /// Selects the handler for an envelope received on `topic`
    pub fn route(&self, topic: &str, envelope: &EventEnvelope) -> Result<&Handler, UnroutableError> {
        let raw = envelope
            .operation_type()
            .ok_or(UnroutableError::MissingOperationType)?;
        let operation = raw
            .parse::<OperationType>()
            .map_err(|_| UnroutableError::UnknownOperationType(raw.to_string()))?;

        self.table
            .get(&(topic.to_string(), operation))
            .ok_or_else(|| UnroutableError::NoRoute {
                topic: topic.to_string(),
                operation,
            })
    }

    /// The resilience client of every registered backend route
    pub fn clients(&self) -> impl Iterator<Item = &ResilienceClient> {
        self.clients.values()
    }

    pub fn client(&self, operation: OperationType) -> Option<&ResilienceClient> {
        self.clients.get(&operation)
    }

    /// Topics with at least one route
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.table.keys().map(|(topic, _)| topic.clone()).collect();
        topics.sort();
        topics.dedup();
        topics
    }
}

/// Registers routes before the table is frozen
#[derive(Debug)]
pub struct RouterBuilder {
    breaker: CircuitBreakerConfig,
    policy: RetryPolicy,
    routes: Vec<(String, OperationType)>,
}

impl RouterBuilder {
    pub fn new(breaker: CircuitBreakerConfig, policy: RetryPolicy) -> Self {
        Self {
            breaker,
            policy,
            routes: Vec::new(),
        }
    }

    pub fn route(mut self, topic: impl Into<String>, operation: OperationType) -> Self {
        self.routes.push((topic.into(), operation));
        self
    }

    pub fn all_operations(self, topic: &str) -> Self {
        OperationType::ALL
            .into_iter()
            .fold(self, |builder, op| builder.route(topic, op))
    }

    pub fn build(self) -> Router {
        let mut clients: BTreeMap<OperationType, ResilienceClient> = BTreeMap::new();
        let mut table = HashMap::new();

        for (topic, operation) in self.routes {
            let client = clients
                .entry(operation)
                .or_insert_with(|| {
                    ResilienceClient::new(operation.as_str(), self.breaker.clone(), self.policy.clone())
                })
                .clone();
            debug!(topic = %topic, operation = %operation, "Registered route");
            table.insert((topic, operation), Handler { operation, client });
        }

        Router { table, clients }
    }
}
