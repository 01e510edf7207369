//! Search-guided ("MCTS") rollouts.
//!
//! Each round the agent proposes several candidate actions. Every candidate
//! is scored by playing short lookahead simulations on forks of the real
//! environment; the candidate with the best mean simulated reward is then
//! committed to the real environment exactly as a sequential round would.

use tracing::{debug, info};

use super::{round_limit_reached, take_turn};
use crate::agent::Agent;
use crate::env::EnvClient;
use crate::error::{Error, Result};
use crate::trajectory::{ExperienceOutput, Transcript};

pub const DEFAULT_NUM_CANDIDATES: usize = 5;
pub const DEFAULT_SIMULATION_DEPTH: usize = 5;

#[derive(Debug, Clone)]
pub struct MctsStrategy {
    num_simulations: usize,
    exploration_weight: f64,
    num_candidates: usize,
    simulation_depth: usize,
}

/// Simulation statistics for one candidate action.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateStats {
    pub action: String,
    pub visits: usize,
    pub total_reward: f64,
}

impl CandidateStats {
    fn new(action: String) -> Self {
        Self {
            action,
            visits: 0,
            total_reward: 0.0,
        }
    }

    pub fn mean_reward(&self) -> f64 {
        if self.visits == 0 {
            0.0
        } else {
            self.total_reward / self.visits as f64
        }
    }

    fn record(&mut self, reward: f64) {
        self.visits += 1;
        self.total_reward += reward;
    }
}

/// Result of scoring one round's candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub candidates: Vec<CandidateStats>,
    /// Index into `candidates` of the action to commit.
    pub chosen: usize,
}

impl SearchOutcome {
    pub fn chosen_action(&self) -> &str {
        &self.candidates[self.chosen].action
    }

    pub fn total_visits(&self) -> usize {
        self.candidates.iter().map(|c| c.visits).sum()
    }
}

impl MctsStrategy {
    pub fn new(num_simulations: usize, exploration_weight: f64) -> Result<Self> {
        if num_simulations == 0 {
            return Err(Error::Config("num_simulations must be at least 1".into()));
        }
        if !exploration_weight.is_finite() || exploration_weight < 0.0 {
            return Err(Error::Config(format!(
                "exploration_weight must be a non-negative number, got {exploration_weight}"
            )));
        }
        Ok(Self {
            num_simulations,
            exploration_weight,
            num_candidates: DEFAULT_NUM_CANDIDATES,
            simulation_depth: DEFAULT_SIMULATION_DEPTH,
        })
    }

    pub fn with_num_candidates(mut self, num_candidates: usize) -> Result<Self> {
        if num_candidates == 0 {
            return Err(Error::Config("num_candidates must be at least 1".into()));
        }
        self.num_candidates = num_candidates;
        Ok(self)
    }

    /// Cap on the agent turns played after the candidate inside one simulation.
    pub fn with_simulation_depth(mut self, simulation_depth: usize) -> Self {
        self.simulation_depth = simulation_depth;
        self
    }

    pub fn num_simulations(&self) -> usize {
        self.num_simulations
    }

    pub fn exploration_weight(&self) -> f64 {
        self.exploration_weight
    }

    pub fn num_candidates(&self) -> usize {
        self.num_candidates
    }

    pub fn simulation_depth(&self) -> usize {
        self.simulation_depth
    }

    pub async fn execute(
        &self,
        agent: &Agent,
        client: &mut dyn EnvClient,
        initial_observation: &str,
        max_rounds: Option<usize>,
    ) -> Result<Vec<ExperienceOutput>> {
        let mut transcript = Transcript::seeded(client.conversation_start(), initial_observation);
        let mut rounds = 0usize;
        let mut reward = 0.0;

        while !round_limit_reached(rounds, max_rounds) {
            let outcome = self.search(agent, &*client, &transcript).await?;
            let chosen = &outcome.candidates[outcome.chosen];
            debug!(
                round = rounds + 1,
                candidate = outcome.chosen,
                mean_reward = chosen.mean_reward(),
                visits = chosen.visits,
                "committing searched action"
            );

            let action = chosen.action.clone();
            let out = take_turn(client, &mut transcript, action).await;
            rounds += 1;
            reward = out.reward;
            if out.done {
                break;
            }
        }

        info!(rounds, reward, "search-guided rollout finished");
        Ok(vec![agent.package(transcript, reward)])
    }

    /// Propose candidates for the next turn of `transcript` and score them by
    /// simulation. `client` is only forked.
    pub async fn search(
        &self,
        agent: &Agent,
        client: &dyn EnvClient,
        transcript: &Transcript,
    ) -> Result<SearchOutcome> {
        let mut candidates = Vec::with_capacity(self.num_candidates);
        for _ in 0..self.num_candidates {
            let action = agent.explore(transcript.text()).await?;
            candidates.push(CandidateStats::new(action));
        }

        let per_candidate = (self.num_simulations / self.num_candidates).max(1);
        for idx in 0..candidates.len() {
            for _ in 0..per_candidate {
                let reward = self
                    .simulate(agent, client, transcript, &candidates[idx].action)
                    .await?;
                candidates[idx].record(reward);
            }
        }

        let leftover = self
            .num_simulations
            .saturating_sub(per_candidate * self.num_candidates);
        for _ in 0..leftover {
            let idx = self.most_promising(&candidates);
            let reward = self
                .simulate(agent, client, transcript, &candidates[idx].action)
                .await?;
            candidates[idx].record(reward);
        }

        let chosen = best_mean(&candidates);
        Ok(SearchOutcome { candidates, chosen })
    }

    /// Play `candidate` and then the plain policy on a fork of `client` and
    /// return the reward reached when the simulation stops.
    async fn simulate(
        &self,
        agent: &Agent,
        client: &dyn EnvClient,
        transcript: &Transcript,
        candidate: &str,
    ) -> Result<f64> {
        let mut sim_client = client.fork();
        let mut sim_transcript = transcript.clone();

        let mut out = take_turn(sim_client.as_mut(), &mut sim_transcript, candidate.to_string()).await;
        let mut depth = 0;
        while !out.done && depth < self.simulation_depth {
            let utterance = agent.act(sim_transcript.text()).await?;
            out = take_turn(sim_client.as_mut(), &mut sim_transcript, utterance).await;
            depth += 1;
        }
        Ok(out.reward)
    }

    /// UCB1 selection over candidates that have all been visited at least once.
    fn most_promising(&self, candidates: &[CandidateStats]) -> usize {
        let total: usize = candidates.iter().map(|c| c.visits).sum();
        let ln_total = (total.max(1) as f64).ln();
        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, c) in candidates.iter().enumerate() {
            let score = if c.visits == 0 {
                f64::INFINITY
            } else {
                c.mean_reward() + self.exploration_weight * (ln_total / c.visits as f64).sqrt()
            };
            if score > best_score {
                best = idx;
                best_score = score;
            }
        }
        best
    }
}

/// Index of the strictly highest mean reward; ties go to the earliest.
fn best_mean(candidates: &[CandidateStats]) -> usize {
    let mut best = 0;
    for (idx, c) in candidates.iter().enumerate().skip(1) {
        if c.mean_reward() > candidates[best].mean_reward() {
            best = idx;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::env::{ScriptedEnvClient, ScriptedTask};
    use crate::model::{ByteTokenizer, Generator, SamplingConfig};

    /// Rotates through `candidates` when exploring and always answers
    /// `"wait"` under plain sampling.
    struct ExploringStub {
        candidates: Vec<&'static str>,
        explore_calls: AtomicUsize,
    }

    impl ExploringStub {
        fn new(candidates: &[&'static str]) -> Self {
            Self {
                candidates: candidates.to_vec(),
                explore_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for ExploringStub {
        async fn generate(&self, _transcript: &str, sampling: &SamplingConfig) -> Result<String> {
            if sampling.temperature > 0.0 {
                let call = self.explore_calls.fetch_add(1, Ordering::SeqCst);
                Ok(self.candidates[call % self.candidates.len()].to_string())
            } else {
                Ok("wait".to_string())
            }
        }
    }

    fn agent(candidates: &[&'static str]) -> Agent {
        Agent::new(Arc::new(ExploringStub::new(candidates)), Arc::new(ByteTokenizer))
    }

    async fn confirm_env() -> ScriptedEnvClient {
        let mut env = ScriptedEnvClient::new(vec![ScriptedTask::new("start", "confirm", 100)]);
        env.reset(0).await.unwrap();
        env
    }

    #[tokio::test]
    async fn search_spends_exact_budget_and_picks_rewarding_candidate() {
        let env = confirm_env().await;
        let strategy = MctsStrategy::new(7, 1.0)
            .unwrap()
            .with_num_candidates(3)
            .unwrap();
        let transcript = Transcript::seeded(&[], "start");

        let outcome = strategy
            .search(&agent(&["wait", "confirm", "look"]), &env, &transcript)
            .await
            .unwrap();

        assert_eq!(outcome.total_visits(), 7);
        assert_eq!(outcome.chosen_action(), "confirm");
        assert_eq!(outcome.candidates[1].mean_reward(), 1.0);
        // The leftover simulation goes to the candidate with the best bound.
        let visits: Vec<usize> = outcome.candidates.iter().map(|c| c.visits).collect();
        assert_eq!(visits, vec![2, 3, 2]);
        assert_eq!(env.steps_taken(), 0);
    }

    #[tokio::test]
    async fn small_budget_still_visits_every_candidate() {
        let env = confirm_env().await;
        let strategy = MctsStrategy::new(2, 1.0).unwrap().with_num_candidates(4).unwrap();
        let outcome = strategy
            .search(&agent(&["a", "b", "c", "d"]), &env, &Transcript::seeded(&[], "start"))
            .await
            .unwrap();
        assert!(outcome.candidates.iter().all(|c| c.visits == 1));
    }

    #[tokio::test]
    async fn ties_go_to_first_candidate() {
        let env = confirm_env().await;
        let strategy = MctsStrategy::new(4, 0.5).unwrap().with_num_candidates(2).unwrap();
        let outcome = strategy
            .search(&agent(&["left", "right"]), &env, &Transcript::seeded(&[], "start"))
            .await
            .unwrap();
        assert_eq!(outcome.chosen, 0);
        assert_eq!(outcome.chosen_action(), "left");
    }

    #[tokio::test]
    async fn committed_action_is_a_candidate() {
        let mut env = confirm_env().await;
        let strategy = MctsStrategy::new(6, 1.0).unwrap().with_num_candidates(3).unwrap();
        let candidates = ["look", "wait", "confirm"];

        let experiences = strategy
            .execute(&agent(&candidates), &mut env, "start", Some(4))
            .await
            .unwrap();

        assert_eq!(experiences.len(), 1);
        let exp = &experiences[0];
        assert_eq!(exp.reward, 1.0);
        assert_eq!(exp.agent_turns(), 1);
        assert!(candidates.contains(&exp.conversation[1].content.as_str()));
        // Only the committed action reached the real environment.
        assert_eq!(env.steps_taken(), 1);
        assert!(env.is_done());
    }

    #[tokio::test]
    async fn round_limit_bounds_committed_turns() {
        let mut env = confirm_env().await;
        let strategy = MctsStrategy::new(2, 1.0)
            .unwrap()
            .with_num_candidates(2)
            .unwrap()
            .with_simulation_depth(1);

        let experiences = strategy
            .execute(&agent(&["left", "right"]), &mut env, "start", Some(3))
            .await
            .unwrap();
        assert_eq!(experiences[0].agent_turns(), 3);
        assert_eq!(experiences[0].reward, 0.0);
        assert_eq!(env.steps_taken(), 3);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(MctsStrategy::new(0, 1.0).is_err());
        assert!(MctsStrategy::new(1, -0.1).is_err());
        assert!(MctsStrategy::new(1, f64::NAN).is_err());
        assert!(MctsStrategy::new(1, 0.0).unwrap().with_num_candidates(0).is_err());
    }

    #[test]
    fn best_mean_prefers_strictly_higher() {
        let mut a = CandidateStats::new("a".into());
        a.record(0.5);
        let mut b = CandidateStats::new("b".into());
        b.record(0.5);
        let mut c = CandidateStats::new("c".into());
        c.record(1.0);
        c.record(0.0);
        assert_eq!(best_mean(&[a.clone(), b.clone(), c]), 0);

        b.record(1.0);
        assert_eq!(best_mean(&[a, b]), 1);
    }
}
