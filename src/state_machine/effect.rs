//! Effects produced by session transitions

use crate::protocol::FollowUpQuestion;

/// Effects to be executed after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Publish the seq-ordered partial buffer
    PublishPartial { content: String },

    /// Publish the authoritative final reply
    PublishCompleted {
        content: String,
        follow_up_questions: Vec<FollowUpQuestion>,
        title: Option<String>,
    },

    /// Publish that the generation was stopped, with whatever text arrived
    PublishStopped { partial: String },

    /// Publish a generation failure
    PublishErrored { message: String },

    /// Publish that a newer stream replaced this one
    PublishSuperseded,

    /// Send `chat:stop` for the conversation
    SendStop,

    /// Refetch the conversation from the message store
    Reconcile,
}

impl Effect {
    pub fn completed(content: String, follow_up_questions: Vec<FollowUpQuestion>, title: Option<String>) -> Self {
        Effect::PublishCompleted {
            content,
            follow_up_questions,
            title,
        }
    }

    pub fn errored(message: impl Into<String>) -> Self {
        Effect::PublishErrored {
            message: message.into(),
        }
    }
}
