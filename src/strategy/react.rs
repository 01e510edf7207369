//! Sequential ("ReAct") rollouts: generate, step, repeat.

use tracing::{debug, info};

use super::{round_limit_reached, take_turn};
use crate::agent::Agent;
use crate::env::EnvClient;
use crate::error::Result;
use crate::trajectory::{ExperienceOutput, Transcript};

/// One linear path per rollout.
///
/// Each round the agent produces one utterance under plain sampling, the
/// environment is stepped with it and the resulting state becomes the next
/// human turn. The rollout ends when the environment reports `done` or the
/// round limit is hit; either way exactly one experience is produced, carrying
/// the reward of the last step (0.0 if no step was taken).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReactStrategy;

impl ReactStrategy {
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
            let utterance = agent.act(transcript.text()).await?;
            let out = take_turn(client, &mut transcript, utterance).await;
            rounds += 1;
            reward = out.reward;
            debug!(round = rounds, reward, done = out.done, "sequential round");
            if out.done {
                break;
            }
        }

        info!(rounds, reward, "sequential rollout finished");
        Ok(vec![agent.package(transcript, reward)])
    }
}
