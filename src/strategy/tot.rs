//! Tree-exploring ("Tree of Thoughts") rollouts.
//!
//! At every node the agent proposes `branch_factor` candidates under the
//! diversified sampling configuration. Each candidate is applied to its own
//! fork of the node's environment, so sibling branches never observe each
//! other's effects. Non-terminal children are expanded until the depth limit;
//! afterwards every root-to-leaf path is packaged as its own experience.

use futures::future::BoxFuture;
use tracing::{debug, info};

use super::round_limit_reached;
use crate::agent::{Agent, split_thought};
use crate::env::EnvClient;
use crate::error::{Error, Result};
use crate::trajectory::{ExperienceOutput, TrajectoryNode, Transcript};

#[derive(Debug, Clone)]
pub struct TotStrategy {
    branch_factor: usize,
    max_depth: usize,
}

impl TotStrategy {
    pub fn new(branch_factor: usize, max_depth: usize) -> Result<Self> {
        if branch_factor == 0 {
            return Err(Error::Config("branch_factor must be at least 1".into()));
        }
        if max_depth == 0 {
            return Err(Error::Config("max_depth must be at least 1".into()));
        }
        Ok(Self {
            branch_factor,
            max_depth,
        })
    }

    pub fn branch_factor(&self) -> usize {
        self.branch_factor
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Build the tree and return one experience per leaf, depth-first in
    /// branch order.
    ///
    /// `client` is only ever forked, never stepped, so it keeps the state it
    /// had at the root.
    pub async fn execute(
        &self,
        agent: &Agent,
        client: &mut dyn EnvClient,
        initial_observation: &str,
        max_rounds: Option<usize>,
    ) -> Result<Vec<ExperienceOutput>> {
        let root = self
            .build_tree(agent, &*client, initial_observation, max_rounds)
            .await?;

        let transcript = Transcript::seeded(client.conversation_start(), initial_observation);
        let mut experiences = Vec::with_capacity(root.leaf_count());
        collect_paths(&root, transcript, agent, &mut experiences);

        info!(
            leaves = experiences.len(),
            depth = root.depth(),
            "tree rollout finished"
        );
        Ok(experiences)
    }

    /// Grow the exploration tree rooted at `initial_observation`.
    pub async fn build_tree(
        &self,
        agent: &Agent,
        client: &dyn EnvClient,
        initial_observation: &str,
        max_rounds: Option<usize>,
    ) -> Result<TrajectoryNode> {
        let depth = match max_rounds {
            Some(rounds) => rounds.min(self.max_depth),
            None => self.max_depth,
        };

        let mut root = TrajectoryNode::root(initial_observation);
        if !round_limit_reached(0, Some(depth)) {
            let transcript = Transcript::seeded(client.conversation_start(), initial_observation);
            self.expand(agent, client, &mut root, transcript, depth).await?;
        }
        Ok(root)
    }

    /// Add `branch_factor` children to `node`, recursing while `remaining`
    /// levels are left and the child is not done.
    fn expand<'a>(
        &'a self,
        agent: &'a Agent,
        client: &'a dyn EnvClient,
        node: &'a mut TrajectoryNode,
        transcript: Transcript,
        remaining: usize,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for branch in 0..self.branch_factor {
                let utterance = agent.explore(transcript.text()).await?;
                let mut branch_client = client.fork();
                let out = branch_client.step(&utterance).await;
                debug!(
                    branch,
                    remaining,
                    reward = out.reward,
                    done = out.done,
                    "explored branch"
                );

                let (thought, _) = split_thought(&utterance);
                let mut child = TrajectoryNode {
                    observation: out.state.clone(),
                    thought,
                    action: utterance.clone(),
                    reward: out.reward,
                    done: out.done,
                    children: Vec::new(),
                };

                if remaining > 1 && !out.done {
                    let mut branch_transcript = transcript.clone();
                    branch_transcript.push_agent(utterance);
                    branch_transcript.push_human(out.state);
                    self.expand(
                        agent,
                        branch_client.as_ref(),
                        &mut child,
                        branch_transcript,
                        remaining - 1,
                    )
                    .await?;
                }

                node.children.push(child);
            }
            Ok(())
        })
    }
}

/// Package every root-to-leaf path below `node`.
fn collect_paths(
    node: &TrajectoryNode,
    transcript: Transcript,
    agent: &Agent,
    out: &mut Vec<ExperienceOutput>,
) {
    if node.children.is_empty() {
        out.push(agent.package(transcript, node.reward));
        return;
    }
    for child in &node.children {
        let mut path = transcript.clone();
        path.push_agent(child.action.clone());
        path.push_human(child.observation.clone());
        collect_paths(child, path, agent, out);
    }
}
