//! Core trajectory data types shared by the strategies, the controller and
//! the storage backends.
//!
//! A rollout accumulates [`ConversationMessage`]s in a [`Transcript`], which
//! keeps the rendered transcript text in sync with the message list and
//! remembers where each trainable agent turn sits in that text. When the path
//! finishes the transcript is packaged into an [`ExperienceOutput`].

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::model::Tokenizer;

// ---------------------------------------------------------------------------
// Conversation turns
// ---------------------------------------------------------------------------

/// Who authored a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The environment (initial observation and every state it returns).
    #[serde(rename = "human")]
    Human,
    /// The agent being rolled out.
    #[serde(rename = "gpt", alias = "assistant")]
    Agent,
}

impl Role {
    /// The label that introduces a turn of this role in the transcript text.
    pub fn label(self) -> &'static str {
        match self {
            Self::Human => "Human",
            Self::Agent => "Assistant",
        }
    }
}

/// One turn of a conversation.
///
/// Serialized in the `{"from", "value", "loss"}` shape used by the stored
/// trajectories so they can be fed to fine-tuning tools unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    #[serde(rename = "from")]
    pub role: Role,
    #[serde(rename = "value")]
    pub content: String,
    /// Whether this turn contributes to the training loss. Only agent turns
    /// produced during a rollout are marked `Some(true)`.
    #[serde(rename = "loss", default)]
    pub trainable: Option<bool>,
}

impl ConversationMessage {
    /// An environment turn. Never trainable.
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
            trainable: None,
        }
    }

    /// An agent turn generated during the rollout.
    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            content: content.into(),
            trainable: Some(true),
        }
    }

    pub fn is_trainable(&self) -> bool {
        self.role == Role::Agent && self.trainable == Some(true)
    }
}

// ---------------------------------------------------------------------------
// Transcript builder
// ---------------------------------------------------------------------------

/// An ordered conversation together with its rendered text.
///
/// Every turn is rendered as `"\n{Label}: {content}"`. Cloning a transcript
/// gives an independent copy, which is how branches diverge.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<ConversationMessage>,
    text: String,
    /// Byte ranges of trainable agent content inside `text`.
    action_spans: Vec<Range<usize>>,
}

impl Transcript {
    /// Start a transcript from a copy of `prefix`.
    pub fn new(prefix: &[ConversationMessage]) -> Self {
        let mut transcript = Self::default();
        for message in prefix {
            transcript.push(message.clone());
        }
        transcript
    }

    /// Start a transcript from `prefix` followed by the initial observation.
    pub fn seeded(prefix: &[ConversationMessage], initial_observation: &str) -> Self {
        let mut transcript = Self::new(prefix);
        transcript.push_human(initial_observation);
        transcript
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.text.push('\n');
        self.text.push_str(message.role.label());
        self.text.push_str(": ");
        let start = self.text.len();
        self.text.push_str(&message.content);
        if message.is_trainable() {
            self.action_spans.push(start..self.text.len());
        }
        self.messages.push(message);
    }

    pub fn push_human(&mut self, content: impl Into<String>) {
        self.push(ConversationMessage::human(content));
    }

    pub fn push_agent(&mut self, content: impl Into<String>) {
        self.push(ConversationMessage::agent(content));
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Package the finished path.
    ///
    /// The action mask marks the tokens of every trainable agent turn. Span
    /// boundaries are found by tokenizing the text prefix that ends at each
    /// boundary, which is exact for prefix-stable tokenizers.
    pub fn into_experience(self, reward: f64, tokenizer: &dyn Tokenizer) -> ExperienceOutput {
        let token_ids = tokenizer.encode(&self.text);
        let total = token_ids.len();
        let mut action_mask = vec![0u8; total];
        for span in &self.action_spans {
            let start = tokenizer.encode(&self.text[..span.start]).len().min(total);
            let end = tokenizer.encode(&self.text[..span.end]).len().min(total);
            for slot in &mut action_mask[start..end.max(start)] {
                *slot = 1;
            }
        }

        ExperienceOutput {
            conversation: self.messages,
            reward,
            text: self.text,
            attention_mask: vec![1; total],
            action_mask,
            token_ids,
        }
    }
}

// ---------------------------------------------------------------------------
// Experience
// ---------------------------------------------------------------------------

/// One completed rollout path, ready for training or persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceOutput {
    pub conversation: Vec<ConversationMessage>,
    /// Reward of the final transition reached on this path.
    pub reward: f64,
    /// Full rendered transcript.
    pub text: String,
    pub token_ids: Vec<u32>,
    /// All ones, same length as `token_ids`.
    pub attention_mask: Vec<u8>,
    /// One for tokens generated by the agent, zero elsewhere.
    pub action_mask: Vec<u8>,
}

impl ExperienceOutput {
    /// Number of agent turns in the conversation.
    pub fn agent_turns(&self) -> usize {
        self.conversation
            .iter()
            .filter(|m| m.role == Role::Agent)
            .count()
    }

    /// The part of an experience that gets persisted.
    pub fn to_record(&self) -> TrajectoryRecord {
        TrajectoryRecord {
            reward: self.reward,
            conversation: self.conversation.clone(),
            text: self.text.clone(),
        }
    }
}

/// The persisted body of a trajectory: `{reward, conversation, text}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub reward: f64,
    pub conversation: Vec<ConversationMessage>,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Exploration tree
// ---------------------------------------------------------------------------

/// A node of the tree built by the tree-exploring strategy.
///
/// The root carries the initial observation and an empty action. Every other
/// node carries the action taken from its parent and the state it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryNode {
    pub observation: String,
    pub thought: String,
    pub action: String,
    pub reward: f64,
    pub done: bool,
    pub children: Vec<TrajectoryNode>,
}

impl TrajectoryNode {
    pub fn root(observation: impl Into<String>) -> Self {
        Self {
            observation: observation.into(),
            thought: String::new(),
            action: String::new(),
            reward: 0.0,
            done: false,
            children: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.children.is_empty() || self.done
    }

    /// Number of leaves below (and including) this node.
    pub fn leaf_count(&self) -> usize {
        if self.children.is_empty() {
            1
        } else {
            self.children.iter().map(Self::leaf_count).sum()
        }
    }

    /// Number of edges on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        self.children
            .iter()
            .map(|c| c.depth() + 1)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ByteTokenizer;

    #[test]
    fn transcript_renders_role_labels_in_order() {
        let prefix = vec![ConversationMessage::human("You are a shopper.")];
        let mut t = Transcript::seeded(&prefix, "Welcome");
        t.push_agent("search[bag]");
        t.push_human("3 results");

        assert_eq!(
            t.text(),
            "\nHuman: You are a shopper.\nHuman: Welcome\nAssistant: search[bag]\nHuman: 3 results"
        );
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn action_mask_covers_only_agent_content() {
        let mut t = Transcript::seeded(&[], "obs");
        t.push_agent("act");
        t.push_human("next");
        let exp = t.into_experience(0.5, &ByteTokenizer);

        assert_eq!(exp.token_ids.len(), exp.text.len());
        assert!(exp.attention_mask.iter().all(|&m| m == 1));

        let start = exp.text.find("act").unwrap();
        let masked: Vec<usize> = exp
            .action_mask
            .iter()
            .enumerate()
            .filter(|(_, m)| **m == 1)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(masked, vec![start, start + 1, start + 2]);
        assert_eq!(exp.reward, 0.5);
    }

    #[test]
    fn prefix_agent_turns_without_loss_are_not_masked() {
        let prefix = vec![ConversationMessage {
            role: Role::Agent,
            content: "ok".into(),
            trainable: Some(false),
        }];
        let exp = Transcript::seeded(&prefix, "obs").into_experience(0.0, &ByteTokenizer);
        assert!(exp.action_mask.iter().all(|&m| m == 0));
    }

    #[test]
    fn message_serializes_in_sharegpt_shape() {
        let json = serde_json::to_value(ConversationMessage::agent("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"from": "gpt", "value": "hi", "loss": true}));

        let back: ConversationMessage =
            serde_json::from_value(serde_json::json!({"from": "human", "value": "x"})).unwrap();
        assert_eq!(back, ConversationMessage::human("x"));
    }

    #[test]
    fn node_leaf_count_and_depth() {
        let mut root = TrajectoryNode::root("start");
        let mut child = TrajectoryNode::root("a");
        child.children.push(TrajectoryNode::root("b"));
        child.children.push(TrajectoryNode::root("c"));
        root.children.push(child);
        root.children.push(TrajectoryNode::root("d"));

        assert_eq!(root.leaf_count(), 3);
        assert_eq!(root.depth(), 2);
        assert!(!root.is_terminal());
    }
}
