//! Rollout strategies: how the agent explores an environment.
//!
//! Three variants are available behind the closed [`RolloutStrategy`] enum:
//! - [`react::ReactStrategy`] -- one linear path, one action per round.
//! - [`tot::TotStrategy`] -- a branching tree of candidate actions, every
//!   root-to-leaf path becomes an experience.
//! - [`mcts::MctsStrategy`] -- per round, candidates are scored by simulated
//!   lookahead on forked environments and the best one is committed.
//!
//! A strategy is resolved once from its name with [`StrategyKind`]; unknown
//! names fail with [`Error::UnknownStrategy`].

pub mod mcts;
pub mod react;
pub mod tot;

use std::str::FromStr;

use crate::agent::Agent;
use crate::config::StrategyConfig;
use crate::env::{EnvClient, StepOutput};
use crate::error::{Error, Result};
use crate::trajectory::{ExperienceOutput, Transcript};

pub use mcts::{CandidateStats, MctsStrategy, SearchOutcome};
pub use react::ReactStrategy;
pub use tot::TotStrategy;

/// The names a strategy can be selected by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Sequential,
    TreeExploring,
    SearchGuided,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "StandardReAct",
            Self::TreeExploring => "ToT",
            Self::SearchGuided => "MCTS",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    /// Case-insensitive; `-` and `_` are ignored.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "standardreact" | "react" | "sequential" => Ok(Self::Sequential),
            "tot" | "treeofthoughts" | "tree" => Ok(Self::TreeExploring),
            "mcts" | "montecarlotreesearch" | "search" => Ok(Self::SearchGuided),
            _ => Err(Error::UnknownStrategy(s.to_string())),
        }
    }
}

/// The strategy a controller runs for every rollout.
#[derive(Debug, Clone)]
pub enum RolloutStrategy {
    Sequential(ReactStrategy),
    TreeExploring(TotStrategy),
    SearchGuided(MctsStrategy),
}

impl RolloutStrategy {
    /// Resolve the configured strategy name and validate its parameters.
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let strategy = match config.name.parse::<StrategyKind>()? {
            StrategyKind::Sequential => Self::Sequential(ReactStrategy),
            StrategyKind::TreeExploring => {
                Self::TreeExploring(TotStrategy::new(config.branch_factor, config.max_depth)?)
            }
            StrategyKind::SearchGuided => Self::SearchGuided(
                MctsStrategy::new(config.num_simulations, config.exploration_weight)?
                    .with_num_candidates(config.num_candidates)?
                    .with_simulation_depth(config.simulation_depth),
            ),
        };
        Ok(strategy)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Sequential(_) => StrategyKind::Sequential,
            Self::TreeExploring(_) => StrategyKind::TreeExploring,
            Self::SearchGuided(_) => StrategyKind::SearchGuided,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Run one rollout from `initial_observation`.
    ///
    /// `client` must already be reset to the task. `max_rounds = None` means
    /// the rollout only stops when the environment reports `done`.
    pub async fn execute(
        &self,
        agent: &Agent,
        client: &mut dyn EnvClient,
        initial_observation: &str,
        max_rounds: Option<usize>,
    ) -> Result<Vec<ExperienceOutput>> {
        match self {
            Self::Sequential(s) => s.execute(agent, client, initial_observation, max_rounds).await,
            Self::TreeExploring(s) => s.execute(agent, client, initial_observation, max_rounds).await,
            Self::SearchGuided(s) => s.execute(agent, client, initial_observation, max_rounds).await,
        }
    }
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self::Sequential(ReactStrategy)
    }
}

/// Record `action` as an agent turn, apply it and record the resulting state.
pub(crate) async fn take_turn(
    client: &mut dyn EnvClient,
    transcript: &mut Transcript,
    action: String,
) -> StepOutput {
    let out = client.step(&action).await;
    transcript.push_agent(action);
    transcript.push_human(out.state.clone());
    out
}

pub(crate) fn round_limit_reached(rounds: usize, max_rounds: Option<usize>) -> bool {
    max_rounds.is_some_and(|max| rounds >= max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_case_insensitively() {
        assert_eq!("StandardReAct".parse::<StrategyKind>().unwrap(), StrategyKind::Sequential);
        assert_eq!("react".parse::<StrategyKind>().unwrap(), StrategyKind::Sequential);
        assert_eq!("ToT".parse::<StrategyKind>().unwrap(), StrategyKind::TreeExploring);
        assert_eq!("tree_of_thoughts".parse::<StrategyKind>().unwrap(), StrategyKind::TreeExploring);
        assert_eq!("MCTS".parse::<StrategyKind>().unwrap(), StrategyKind::SearchGuided);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = "beam".parse::<StrategyKind>().unwrap_err();
        assert!(matches!(err, Error::UnknownStrategy(name) if name == "beam"));

        let config = StrategyConfig {
            name: "beam".into(),
            ..StrategyConfig::default()
        };
        assert!(matches!(
            RolloutStrategy::from_config(&config),
            Err(Error::UnknownStrategy(_))
        ));
    }

    #[test]
    fn from_config_builds_each_variant() {
        let mut config = StrategyConfig::default();
        assert_eq!(RolloutStrategy::from_config(&config).unwrap().name(), "StandardReAct");

        config.name = "tot".into();
        assert_eq!(
            RolloutStrategy::from_config(&config).unwrap().kind(),
            StrategyKind::TreeExploring
        );

        config.name = "mcts".into();
        assert_eq!(
            RolloutStrategy::from_config(&config).unwrap().kind(),
            StrategyKind::SearchGuided
        );
    }

    #[test]
    fn invalid_parameters_are_config_errors() {
        let config = StrategyConfig {
            name: "tot".into(),
            branch_factor: 0,
            ..StrategyConfig::default()
        };
        assert!(matches!(
            RolloutStrategy::from_config(&config),
            Err(Error::Config(_))
        ));

        let config = StrategyConfig {
            name: "mcts".into(),
            num_simulations: 0,
            ..StrategyConfig::default()
        };
        assert!(matches!(
            RolloutStrategy::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn round_limit() {
        assert!(!round_limit_reached(5, None));
        assert!(!round_limit_reached(1, Some(2)));
        assert!(round_limit_reached(2, Some(2)));
        assert!(round_limit_reached(0, Some(0)));
    }
}
