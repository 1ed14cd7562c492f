//! Approximate token counting without a tokenizer dependency.
//!
//! Non-ASCII runs (CJK and other dense scripts) tokenize at roughly one
//! token per 1.5 characters, ASCII at one per 4; the split keeps estimates
//! usable for mixed-script notes.

use crate::session::Message;

const ASCII_CHARS_PER_TOKEN: f64 = 4.0;
const DENSE_CHARS_PER_TOKEN: f64 = 1.5;

/// Fixed allowance for role/framing tokens around each message.
pub const PER_MESSAGE_OVERHEAD: u64 = 3;

pub fn estimate_text_tokens(text: &str) -> u64 {
    let (ascii, dense) = text.chars().fold((0u64, 0u64), |(ascii, dense), c| {
        if c.is_ascii() {
            (ascii + 1, dense)
        } else {
            (ascii, dense + 1)
        }
    });
    (ascii as f64 / ASCII_CHARS_PER_TOKEN + dense as f64 / DENSE_CHARS_PER_TOKEN).ceil() as u64
}

pub fn estimate_message_tokens(message: &Message) -> u64 {
    estimate_text_tokens(&message.content) + PER_MESSAGE_OVERHEAD
}

pub fn estimate_conversation_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}
