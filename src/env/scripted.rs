//! A deterministic in-process environment.
//!
//! Each scripted task has an opening observation and a goal keyword. An
//! action containing the keyword (case-insensitive) completes the task with
//! reward 1.0; anything else is a neutral step until the step budget runs out.
//! The client is plain data, so forking is an exact copy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::traits::{EnvClient, StepOutput};
use crate::error::{Error, Result};
use crate::trajectory::ConversationMessage;

/// One scripted task.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedTask {
    pub observation: String,
    pub goal: String,
    pub max_steps: usize,
}

impl ScriptedTask {
    pub fn new(observation: impl Into<String>, goal: impl Into<String>, max_steps: usize) -> Self {
        Self {
            observation: observation.into(),
            goal: goal.into(),
            max_steps,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedEnvClient {
    tasks: Arc<[ScriptedTask]>,
    conversation_start: Arc<[ConversationMessage]>,
    current: Option<usize>,
    state: String,
    steps_taken: usize,
    done: bool,
}

impl ScriptedEnvClient {
    pub fn new(tasks: Vec<ScriptedTask>) -> Self {
        Self {
            tasks: Arc::from(tasks),
            conversation_start: Arc::from(Vec::new()),
            current: None,
            state: String::new(),
            steps_taken: 0,
            done: false,
        }
    }

    /// A small shopping-flavoured task set for offline runs.
    pub fn shopping() -> Self {
        Self::new(vec![
            ScriptedTask::new(
                "WebShop [Search bar] Find noise-cancelling wireless headphones under $80.",
                "buy",
                8,
            ),
            ScriptedTask::new(
                "WebShop [Search bar] Find a 32oz stainless steel water bottle with a straw lid.",
                "buy",
                8,
            ),
            ScriptedTask::new(
                "WebShop [Search bar] Find a waterproof running jacket, size medium, under $40.",
                "buy",
                8,
            ),
        ])
        .with_conversation_start(vec![ConversationMessage::human(
            "You are a shopping assistant. Reply with one action per turn: search[query], click[item] or buy.",
        )])
    }

    pub fn with_conversation_start(mut self, prefix: Vec<ConversationMessage>) -> Self {
        self.conversation_start = Arc::from(prefix);
        self
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[async_trait]
impl EnvClient for ScriptedEnvClient {
    fn size(&self) -> usize {
        self.tasks.len()
    }

    async fn reset(&mut self, idx: usize) -> Result<()> {
        self.steps_taken = 0;
        self.done = false;
        match self.tasks.get(idx) {
            Some(task) => {
                self.current = Some(idx);
                self.state = task.observation.clone();
                Ok(())
            }
            None => {
                let reason = format!("no scripted task at index {idx}");
                self.current = None;
                self.state = format!("Error: {reason}");
                Err(Error::EnvironmentUnavailable(reason))
            }
        }
    }

    fn observe(&self) -> &str {
        &self.state
    }

    async fn step(&mut self, action: &str) -> StepOutput {
        let Some(task) = self.current.and_then(|idx| self.tasks.get(idx)).cloned() else {
            return StepOutput::failure("environment has not been reset");
        };
        if self.done {
            return StepOutput {
                state: "The episode is already over.".into(),
                reward: 0.0,
                done: true,
            };
        }

        self.steps_taken += 1;
        let out = if action.to_lowercase().contains(&task.goal.to_lowercase()) {
            StepOutput {
                state: format!("Task complete after {} steps.", self.steps_taken),
                reward: 1.0,
                done: true,
            }
        } else if self.steps_taken >= task.max_steps {
            StepOutput {
                state: "Out of steps.".into(),
                reward: 0.0,
                done: true,
            }
        } else {
            StepOutput {
                state: format!(
                    "Nothing happens after {:?}. Step {}/{}.",
                    action.trim(),
                    self.steps_taken,
                    task.max_steps
                ),
                reward: 0.0,
                done: false,
            }
        };

        debug!(steps = self.steps_taken, done = out.done, "scripted step");
        self.done = out.done;
        self.state = out.state.clone();
        out
    }

    fn conversation_start(&self) -> &[ConversationMessage] {
        &self.conversation_start
    }

    fn fork(&self) -> Box<dyn EnvClient> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirm_env() -> ScriptedEnvClient {
        ScriptedEnvClient::new(vec![ScriptedTask::new("Please confirm the order.", "confirm", 10)])
    }

    #[tokio::test]
    async fn goal_keyword_completes_task() {
        let mut env = confirm_env();
        env.reset(0).await.unwrap();
        assert_eq!(env.observe(), "Please confirm the order.");

        let first = env.step("look around").await;
        assert_eq!(first.reward, 0.0);
        assert!(!first.done);

        let second = env.step("I CONFIRM").await;
        assert_eq!(second.reward, 1.0);
        assert!(second.done);
        assert!(env.is_done());
    }

    #[tokio::test]
    async fn step_budget_ends_episode() {
        let mut env = ScriptedEnvClient::new(vec![ScriptedTask::new("obs", "win", 2)]);
        env.reset(0).await.unwrap();
        assert!(!env.step("a").await.done);
        let last = env.step("b").await;
        assert!(last.done);
        assert_eq!(last.reward, 0.0);
    }

    #[tokio::test]
    async fn unknown_index_fails_but_stays_observable() {
        let mut env = confirm_env();
        let err = env.reset(5).await.unwrap_err();
        assert!(matches!(err, Error::EnvironmentUnavailable(_)));
        assert!(env.observe().starts_with("Error:"));
        assert!(env.step("confirm").await.done);
    }

    #[tokio::test]
    async fn fork_is_isolated() {
        let mut env = confirm_env();
        env.reset(0).await.unwrap();
        env.step("wait").await;

        let mut fork = env.fork();
        let out = fork.step("confirm").await;
        assert!(out.done);

        assert_eq!(env.steps_taken(), 1);
        assert!(!env.is_done());
        assert_eq!(env.observe(), "Nothing happens after \"wait\". Step 1/10.");
    }

    #[tokio::test]
    async fn shopping_tasks_carry_a_prefix() {
        let env = ScriptedEnvClient::shopping();
        assert_eq!(env.size(), 3);
        assert_eq!(env.conversation_start().len(), 1);
    }
}
