//! Consensus mode: ask several providers at once, keep the best answer
//!
//! ```text
//!                      ┌─▶ adapter(p1) ─┐
//! route_limited(K) ────┼─▶ adapter(p2) ─┼─▶ select_best (trust × confidence)
//!                      └─▶ adapter(p3) ─┘
//!         global deadline ─▶ cancel stragglers (recorded as failures)
//! ```
//!
//! Calls run on a [`JoinSet`]; dropping the aggregator future aborts every
//! call still in flight, and the adapter records each aborted call as a
//! failure.

pub mod voting;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{Admission, BackendRequest, ProviderAdapter};
use crate::config::ConsensusConfig;
use crate::errors::{BackendError, ProviderUnavailable};
use crate::router::{Router, TaskCategory};
pub use voting::{select_best, Candidate, ScoreEntry, VoteOutcome};

/// Outcome of one consensus round.
#[derive(Debug)]
pub struct ConsensusOutcome {
    pub participants: Vec<String>,
    pub vote: Option<VoteOutcome>,
    /// One entry per participant that failed or missed the deadline.
    pub failures: Vec<String>,
    pub last_resort: bool,
}

/// Parallel fan-out over up to K providers.
#[derive(Debug, Clone)]
pub struct ConsensusAggregator {
    router: Router,
    adapters: Arc<HashMap<String, Arc<ProviderAdapter>>>,
    config: ConsensusConfig,
}

impl ConsensusAggregator {
    pub fn new(
        router: Router,
        adapters: Arc<HashMap<String, Arc<ProviderAdapter>>>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            router,
            adapters,
            config,
        }
    }

    pub fn k(&self) -> usize {
        self.config.k
    }

    pub async fn run(
        &self,
        category: TaskCategory,
        session_override: Option<&str>,
        request: Arc<BackendRequest>,
    ) -> ConsensusOutcome {
        let chain = self
            .router
            .route_limited(category, session_override, self.config.k);
        let participants: Vec<Arc<ProviderAdapter>> = chain
            .iter()
            .filter_map(|id| self.adapters.get(id).cloned())
            .collect();

        let slowest = participants
            .iter()
            .map(|a| a.descriptor().timeout)
            .max()
            .unwrap_or(Duration::ZERO);
        let budget = self.config.deadline_for(slowest);
        let deadline = Instant::now() + budget;
        let cancel = CancellationToken::new();

        info!(
            %category,
            k = self.config.k,
            participants = ?chain.ids(),
            budget_ms = budget.as_millis() as u64,
            "consensus fan-out"
        );

        let admission = Admission::for_chain(chain.last_resort);
        let mut calls = JoinSet::new();
        for adapter in &participants {
            let adapter = adapter.clone();
            let request = request.clone();
            let token = cancel.child_token();
            calls.spawn(async move {
                let result = adapter.invoke(&request, admission, Some(&token)).await;
                (adapter, result)
            });
        }

        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        let mut timed_out = false;
        loop {
            let joined = tokio::select! {
                joined = calls.join_next() => joined,
                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    warn!(
                        %category,
                        pending = calls.len(),
                        "consensus deadline reached, cancelling stragglers"
                    );
                    timed_out = true;
                    cancel.cancel();
                    continue;
                }
            };
            let Some(joined) = joined else { break };
            match joined {
                Ok((adapter, Ok(response))) => {
                    let registry = self.router.registry();
                    debug!(provider = %response.provider, "consensus participant answered");
                    candidates.push(Candidate {
                        trust_weight: adapter.descriptor().trust_weight,
                        config_order: registry
                            .position(adapter.provider_id())
                            .unwrap_or(usize::MAX),
                        response,
                    });
                }
                Ok((_, Err(ProviderUnavailable {
                    provider,
                    cause: BackendError::CircuitOpen,
                    ..
                }))) => {
                    debug!(%provider, "trial permit already taken, participant skipped");
                }
                Ok((_, Err(ProviderUnavailable { provider, cause, .. }))) => {
                    failures.push(format!("{provider}: {cause}"));
                }
                Err(join_err) => {
                    warn!(error = %join_err, "consensus task did not complete");
                    failures.push(format!("task: {join_err}"));
                }
            }
        }

        let vote = select_best(candidates);
        if let Some(vote) = &vote {
            info!(
                winner = %vote.winner.response.provider,
                score = vote.score,
                failed = failures.len(),
                "consensus winner selected"
            );
        }

        ConsensusOutcome {
            participants: chain.ids().to_vec(),
            vote,
            failures,
            last_resort: chain.last_resort,
        }
    }
}
