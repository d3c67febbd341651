//! Stage interceptors.
//!
//! Each stage carries a fixed list of [`Interceptor`]s. The list is evaluated in
//! declaration order at the four [`HookPoint`]s of the stage loop.

use tracing::debug;

use triage_core::hooks::{HookDecision, HookPoint};
use triage_core::messages::{Message, ToolCallBlock};
use triage_core::state::{Slot, SlotValue, StateDelta};
use triage_core::tools::ToolResult;

use crate::truncate::excerpt;

pub const DEFAULT_SUMMARY_TOKEN_THRESHOLD: usize = 8000;
pub const DEFAULT_MESSAGES_TO_KEEP: usize = 10;
const CHARS_PER_TOKEN: usize = 4;
const DIGEST_LINE_CHARS: usize = 200;

/// Compacts older conversation history once it grows past a token estimate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummarizationPolicy {
    pub max_tokens: usize,
    pub messages_to_keep: usize,
}

impl Default for SummarizationPolicy {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_SUMMARY_TOKEN_THRESHOLD,
            messages_to_keep: DEFAULT_MESSAGES_TO_KEEP,
        }
    }
}

impl SummarizationPolicy {
    pub fn estimate_tokens(conversation: &[Message]) -> usize {
        conversation.iter().map(Message::char_len).sum::<usize>() / CHARS_PER_TOKEN
    }

    /// Replace everything between the opening message and the kept tail with a digest.
    /// Returns the number of messages folded into the digest.
    pub fn compact(&self, conversation: &mut Vec<Message>) -> usize {
        if Self::estimate_tokens(conversation) <= self.max_tokens {
            return 0;
        }
        // The latest message always survives compaction.
        let keep = self.messages_to_keep.max(1);
        let len = conversation.len();
        if len <= keep + 1 {
            return 0;
        }

        // The kept tail must not open with a tool result whose call was folded away.
        let mut split = len - keep;
        while split > 1 && conversation[split].is_tool_result() {
            split -= 1;
        }
        if split <= 1 {
            return 0;
        }

        let folded: Vec<Message> = conversation.drain(1..split).collect();
        let mut digest = format!("[summary of {} earlier messages]", folded.len());
        for message in &folded {
            digest.push('\n');
            digest.push_str(&digest_line(message));
        }
        conversation.insert(1, Message::user_text(digest));
        folded.len()
    }
}

fn digest_line(message: &Message) -> String {
    match message {
        Message::User(m) => format!("user: {}", excerpt(&m.text, DIGEST_LINE_CHARS)),
        Message::Assistant(m) => {
            let calls: Vec<&str> = m.tool_calls.iter().map(|c| c.name.as_str()).collect();
            if calls.is_empty() {
                format!("assistant: {}", excerpt(&m.text, DIGEST_LINE_CHARS))
            } else {
                format!(
                    "assistant: {} (called {})",
                    excerpt(&m.text, DIGEST_LINE_CHARS),
                    calls.join(", ")
                )
            }
        }
        Message::ToolResult(m) => {
            format!("tool result: {}", excerpt(&m.content, DIGEST_LINE_CHARS))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Interceptor {
    Summarization(SummarizationPolicy),
    /// Suspend the stage whenever `tool` is requested.
    ApprovalGate { tool: String, description: String },
    /// Copy the structured details of `tool` results into `slot`.
    CaptureDetails { tool: String, slot: Slot },
}

impl Interceptor {
    pub fn points(&self) -> &'static [HookPoint] {
        match self {
            Interceptor::Summarization(_) => &[HookPoint::PreCall],
            Interceptor::ApprovalGate { .. } => &[HookPoint::PreDispatch],
            Interceptor::CaptureDetails { .. } => {
                &[HookPoint::PostToolResult, HookPoint::PreTermination]
            }
        }
    }

    pub fn tool(&self) -> Option<&str> {
        match self {
            Interceptor::Summarization(_) => None,
            Interceptor::ApprovalGate { tool, .. } | Interceptor::CaptureDetails { tool, .. } => {
                Some(tool)
            }
        }
    }
}

/// The ordered interceptor list of one stage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HookSet {
    interceptors: Vec<Interceptor>,
}

impl HookSet {
    pub fn new(interceptors: Vec<Interceptor>) -> Self {
        Self { interceptors }
    }

    pub fn push(&mut self, interceptor: Interceptor) {
        self.interceptors.push(interceptor);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interceptor> {
        self.interceptors.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn pre_call(&self, stage: &str, conversation: &mut Vec<Message>) {
        for interceptor in &self.interceptors {
            if let Interceptor::Summarization(policy) = interceptor {
                let folded = policy.compact(conversation);
                if folded > 0 {
                    debug!(stage, folded, "conversation compacted");
                }
            }
        }
    }

    /// The first gate matching the call wins.
    pub fn pre_dispatch(&self, call: &ToolCallBlock) -> HookDecision {
        for interceptor in &self.interceptors {
            if let Interceptor::ApprovalGate { tool, description } = interceptor {
                if *tool == call.name {
                    return HookDecision::Suspend {
                        description: description.clone(),
                    };
                }
            }
        }
        HookDecision::Continue
    }

    /// Stash result details for every capture watching this tool. Error results are ignored.
    pub fn post_tool_result(&self, call: &ToolCallBlock, result: &ToolResult, captured: &mut StateDelta) {
        if result.is_error {
            return;
        }
        let Some(details) = &result.details else {
            return;
        };
        for interceptor in &self.interceptors {
            if let Interceptor::CaptureDetails { tool, slot } = interceptor {
                if *tool == call.name {
                    captured.set(*slot, SlotValue::Json(details.clone()));
                }
            }
        }
    }

    /// Move captured details into the outgoing delta. The stage's own output slot is never overwritten.
    pub fn pre_termination(&self, captured: StateDelta, output: Slot, delta: &mut StateDelta) {
        for (slot, value) in captured {
            if slot != output && !delta.contains(slot) {
                delta.set(slot, value);
            }
        }
    }
}
