//! Conversation state storage
//!
//! Canonical, append-only message history for one conversation plus a log of
//! every tool exchange. Removal only ever happens in the filtered view built by
//! the context manager, never here.

use crate::models::{Message, Role, ToolCall, ToolResult, WRITE_AND_VALIDATE_TOOL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tool call paired with its normalized result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExchange {
    pub turn: u32,
    pub call: ToolCall,
    pub result: ToolResult,
}

impl ToolExchange {
    pub fn is_failed_validation(&self) -> bool {
        self.call.function_name == WRITE_AND_VALIDATE_TOOL && !self.result.success
    }
}

/// State of a single conversation, owned by the driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    messages: Vec<Message>,
    exchanges: Vec<ToolExchange>,
    /// Index into `exchanges` where the current turn begins
    turn_start: usize,
    turns: u32,
    failed_validations: u32,
}

impl ConversationState {
    pub fn new(initial_messages: Vec<Message>) -> Self {
        Self {
            created_at: Utc::now(),
            updated_at: Utc::now(),
            messages: initial_messages,
            exchanges: Vec::new(),
            turn_start: 0,
            turns: 0,
            failed_validations: 0,
        }
    }

    /// Mark the start of a new model turn and return its number (1-based)
    pub fn begin_turn(&mut self) -> u32 {
        self.turns += 1;
        self.turn_start = self.exchanges.len();
        self.turns
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Append an assistant tool-calling message and its result message.
    ///
    /// `results` must be order-aligned with `assistant.tool_calls`.
    pub fn record_tool_turn(&mut self, assistant: Message, results: Vec<ToolResult>) {
        for (call, result) in assistant.tool_calls.iter().zip(results.iter()) {
            let exchange = ToolExchange {
                turn: self.turns,
                call: call.clone(),
                result: result.clone(),
            };

            if exchange.is_failed_validation() {
                self.failed_validations += 1;
            }

            self.exchanges.push(exchange);
        }

        self.messages.push(assistant);
        self.messages.push(Message::tool_results(results));
        self.updated_at = Utc::now();
    }

    // =============================
    // Accessors
    // =============================

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn exchanges(&self) -> &[ToolExchange] {
        &self.exchanges
    }

    /// Exchanges appended since the last `begin_turn`
    pub fn current_turn(&self) -> &[ToolExchange] {
        &self.exchanges[self.turn_start..]
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.exchanges.iter().map(|e| e.call.clone()).collect()
    }

    pub fn tool_results(&self) -> Vec<ToolResult> {
        self.exchanges.iter().map(|e| e.result.clone()).collect()
    }

    /// First user message; the question the conversation is answering
    pub fn original_question(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(Message::text)
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn failed_validations(&self) -> u32 {
        self.failed_validations
    }

    pub fn validation_attempts(&self) -> u32 {
        self.exchanges
            .iter()
            .filter(|e| e.call.function_name == WRITE_AND_VALIDATE_TOOL)
            .count() as u32
    }
}
