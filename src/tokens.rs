//! Rough token and cost estimates for tokens-only mode.
//!
//! Counts are approximate: text is taken to be four characters per token, which is close enough
//! for English prose to decide whether a conversation is worth sending.

use crate::message::{Message, Role};

/// Tokens of framing around every message.
const TOKENS_PER_MESSAGE: usize = 4;
/// Tokens that prime the reply when the conversation ends on a user turn.
const REPLY_PRIMING_TOKENS: usize = 2;
const CHARS_PER_TOKEN: usize = 4;

/// Per-model pricing, in dollars per thousand tokens.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pricing {
    /// Model name.
    pub model: &'static str,
    /// Price of prompt tokens.
    pub prompt: f64,
    /// Price of completion tokens.
    pub completion: f64,
}

/// Models the estimate is reported for.
pub const PRICING: &[Pricing] = &[
    Pricing {
        model: "gpt-3.5-turbo",
        prompt: 0.001,
        completion: 0.002,
    },
    Pricing {
        model: "gpt-4",
        prompt: 0.03,
        completion: 0.06,
    },
    Pricing {
        model: "gpt-4-1106-preview",
        prompt: 0.01,
        completion: 0.03,
    },
];

/// Estimated size and price of a conversation for one model.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenEstimate {
    /// Model name.
    pub model: String,
    /// Estimated token count.
    pub tokens: usize,
    /// Estimated cost in dollars.
    pub cost: f64,
}

/// Approximate token count of a piece of text.
pub fn count_text(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Estimates `messages` against one pricing entry.
pub fn estimate(messages: &[Message], pricing: &Pricing) -> TokenEstimate {
    let mut tokens = 0;
    let mut cost = 0.0;
    for (idx, message) in messages.iter().enumerate() {
        let message_tokens =
            TOKENS_PER_MESSAGE + count_text(message.role.as_str()) + count_text(&message.content);
        let is_reply = idx + 1 == messages.len() && message.role == Role::Assistant;
        let rate = if is_reply {
            pricing.completion
        } else {
            pricing.prompt
        };
        cost += rate * message_tokens as f64;
        tokens += message_tokens;
    }
    if messages.last().is_some_and(|m| m.role == Role::User) {
        tokens += REPLY_PRIMING_TOKENS;
        cost += pricing.prompt * REPLY_PRIMING_TOKENS as f64;
    }
    TokenEstimate {
        model: pricing.model.to_string(),
        tokens,
        cost: cost / 1000.0,
    }
}

/// Estimates `messages` against every known model.
pub fn estimate_all(messages: &[Message]) -> Vec<TokenEstimate> {
    PRICING.iter().map(|p| estimate(messages, p)).collect()
}
