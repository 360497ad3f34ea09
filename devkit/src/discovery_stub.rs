/*!
Scripted discovery provider

Replays a fixed sequence of attempt outcomes, then keeps repeating the
fallback step. Counts every attempt so retry budgets can be asserted.
*/

use async_trait::async_trait;
use ggd_heartbeat::discovery::{ConnectivityInfo, CoreInfo, DiscoveryDocument, DiscoveryProvider, GroupInfo};
use ggd_heartbeat::error::AttemptError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const TEST_GROUP_CA: &str = "-----BEGIN CERTIFICATE-----\nTESTGROUPCA\n-----END CERTIFICATE-----\n";

/// Outcome of one scripted attempt
#[derive(Debug, Clone)]
pub enum Step {
    Found(DiscoveryDocument),
    Fail(String),
    Reject(u16),
}

#[derive(Clone)]
pub struct ScriptedProvider {
    script: Arc<Mutex<VecDeque<Step>>>,
    fallback: Step,
    attempts: Arc<AtomicU32>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Step>, fallback: Step) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Every attempt finds `document`
    pub fn always(document: DiscoveryDocument) -> Self {
        Self::new(Vec::new(), Step::Found(document))
    }

    /// Every attempt fails with a retryable error
    pub fn never() -> Self {
        Self::new(Vec::new(), Step::Fail("no route to discovery service".to_string()))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryProvider for ScriptedProvider {
    async fn fetch(&self, thing_name: &str) -> Result<DiscoveryDocument, AttemptError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        tracing::info!("[MOCK] Discovery attempt {} for {}: {:?}", attempt, thing_name, step);

        match step {
            Step::Found(document) => Ok(document),
            Step::Fail(reason) => Err(AttemptError::Retryable(reason)),
            Step::Reject(status) => Err(AttemptError::Rejected {
                status,
                message: "rejected by mock".to_string(),
            }),
        }
    }
}

/// Core with one address per `(host, port)` pair
pub fn core(thing_arn: &str, addresses: &[(&str, u16)]) -> CoreInfo {
    CoreInfo {
        thing_arn: thing_arn.to_string(),
        group_id: String::new(),
        connectivity: addresses
            .iter()
            .enumerate()
            .map(|(i, (host, port))| ConnectivityInfo {
                id: format!("{thing_arn}-{i}"),
                host_address: host.to_string(),
                port: *port,
                metadata: String::new(),
            })
            .collect(),
    }
}

/// Single-group document carrying `cores` and the test group CA
pub fn document(group_id: &str, cores: Vec<CoreInfo>) -> DiscoveryDocument {
    DiscoveryDocument {
        groups: vec![group(group_id, cores)],
    }
}

pub fn group(group_id: &str, cores: Vec<CoreInfo>) -> GroupInfo {
    GroupInfo {
        group_id: group_id.to_string(),
        cores,
        cas: vec![TEST_GROUP_CA.to_string()],
    }
}
