//! Scenario builder API.

use cairn_core::ProcessorConfig;
use cairn_proto::StreamId;

use super::{OracleFn, Report, World};

/// Scenario builder.
///
/// Add clients and streams, then call `.oracle()` to get a
/// [`RunnableScenario`].
pub struct Scenario {
    name: String,
    seed: u64,
    clients: Vec<(String, ProcessorConfig)>,
    streams: Vec<StreamId>,
    rounds: Option<usize>,
}

impl Scenario {
    /// Create a new scenario with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), seed: 0, clients: Vec::new(), streams: Vec::new(), rounds: None }
    }

    /// Seed for every random choice in the run.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Add a client with default configuration.
    pub fn client(mut self, name: impl Into<String>) -> Self {
        self.clients.push((name.into(), ProcessorConfig::default()));
        self
    }

    /// Add a client with custom configuration.
    pub fn client_with_config(mut self, name: impl Into<String>, config: ProcessorConfig) -> Self {
        self.clients.push((name.into(), config));
        self
    }

    /// Add `count` default clients named `client-0`, `client-1`, ...
    pub fn clients(mut self, count: usize) -> Self {
        let start = self.clients.len();
        for i in start..start + count {
            self.clients.push((format!("client-{i}"), ProcessorConfig::default()));
        }
        self
    }

    /// Add a stream. Without any, the scenario uses a single `stream-0`.
    pub fn stream(mut self, stream_id: impl Into<StreamId>) -> Self {
        self.streams.push(stream_id.into());
        self
    }

    /// Rounds to run. Defaults to one per client.
    pub fn rounds(mut self, rounds: usize) -> Self {
        self.rounds = Some(rounds);
        self
    }

    /// Set the oracle function and return a runnable scenario.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// Every client calls `initialize_or_join_group` on every stream, then the
    /// world runs the configured rounds and the oracle checks the report.
    pub async fn run(self) -> Result<Report, String> {
        let Self { scenario, oracle } = self;
        let name = scenario.name;

        let mut world = World::new(scenario.seed);
        let rounds = scenario.rounds.unwrap_or(scenario.clients.len());
        for (client, config) in scenario.clients {
            world.add_client(client, config);
        }

        let mut streams = scenario.streams;
        if streams.is_empty() {
            streams.push(StreamId::new("stream-0"));
        }
        for stream_id in &streams {
            world.create_stream(stream_id);
            world
                .join_all(stream_id)
                .await
                .map_err(|e| format!("Scenario '{name}': join on {stream_id} failed: {e}"))?;
        }

        world.run_rounds(rounds).await;
        tracing::info!(scenario = %name, rounds = world.rounds(), "scenario finished");

        let report =
            world.report().await.map_err(|e| format!("Scenario '{name}': report failed: {e}"))?;
        oracle(&report).map_err(|e| format!("Scenario '{name}': {e}"))?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::oracle;

    #[tokio::test]
    async fn single_client_creates_group() {
        let report = Scenario::new("single")
            .client("alice")
            .oracle(oracle::all_of(vec![oracle::all_active(), oracle::all_at_epoch(0)]))
            .run()
            .await
            .unwrap();

        let view = report.stream("alice", &StreamId::new("stream-0")).unwrap();
        assert_eq!(view.digest.accepted.len(), 1);
    }

    #[tokio::test]
    async fn failing_oracle_fails_the_scenario() {
        let result = Scenario::new("no rounds")
            .client("alice")
            .rounds(0)
            .oracle(oracle::all_active())
            .run()
            .await;

        let err = result.unwrap_err();
        assert!(err.contains("no rounds"), "{err}");
    }
}
