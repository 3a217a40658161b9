//! Context Window Management
//!
//! Reduces the canonical conversation history to the bounded subsequence sent
//! to the model on each turn. Every message is tagged with a category, then a
//! retention rule per category decides whether it survives:
//!
//! | Tag                    | Retained when                                         |
//! |------------------------|-------------------------------------------------------|
//! | `Framing`              | always                                                |
//! | `DocstringCall`        | always, with its result                               |
//! | `WriteAndValidateCall` | it is the most recent one or also fetches docs        |
//! | `OtherToolCall`        | it is the final tool-calling message, with its result |
//! | `VerificationFailure`  | it is the final message                               |
//! | `Verification`         | most recent, and after the retained validation call   |
//! | `ToolResult`, `Other`  | only through the rules above                          |
//!
//! An assistant message calling both tools is tagged `WriteAndValidateCall`
//! but survives supersession, since its documentation lookup must stay.

use crate::error::OrchestrationError;
use crate::models::{Message, Role, DOCSTRING_TOOL, WRITE_AND_VALIDATE_TOOL};
use crate::Result;
use tracing::{debug, warn};

/// Unsuccessful write-and-validate attempts that end the conversation
pub const MAX_FAILED_VALIDATIONS: u32 = 4;

/// Configuration for context window filtering
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_failed_validations: u32,
    /// Phrase identifying a rejected-verification notice (case-insensitive)
    pub failure_marker: String,
    /// Phrases identifying a verification hand-off (case-insensitive)
    pub verification_markers: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_failed_validations: MAX_FAILED_VALIDATIONS,
            failure_marker: "verification failed".to_string(),
            verification_markers: vec![
                "verification".to_string(),
                "before we proceed".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    Framing,
    WriteAndValidateCall,
    DocstringCall,
    OtherToolCall,
    ToolResult,
    Verification,
    VerificationFailure,
    Other,
}

impl MessageTag {
    fn is_tool_call(self) -> bool {
        matches!(
            self,
            MessageTag::WriteAndValidateCall | MessageTag::DocstringCall | MessageTag::OtherToolCall
        )
    }
}

/// Filters message history into the bounded context window
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
        }
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Assign one tag per message, positionally aligned with `messages`
    pub fn tag_messages(&self, messages: &[Message]) -> Vec<MessageTag> {
        let first_tool_call = messages
            .iter()
            .position(Message::has_tool_calls)
            .unwrap_or(messages.len());

        let mut tags = Vec::with_capacity(messages.len());

        for (index, message) in messages.iter().enumerate() {
            let previous_is_call = tags
                .last()
                .map(|tag: &MessageTag| tag.is_tool_call())
                .unwrap_or(false);

            let tag = match message.role {
                Role::User | Role::Assistant
                    if index < first_tool_call && !message.has_tool_calls() =>
                {
                    MessageTag::Framing
                }
                Role::Assistant if message.has_tool_calls() => {
                    if message.calls_function(WRITE_AND_VALIDATE_TOOL) {
                        MessageTag::WriteAndValidateCall
                    } else if message.calls_function(DOCSTRING_TOOL) {
                        MessageTag::DocstringCall
                    } else {
                        MessageTag::OtherToolCall
                    }
                }
                Role::ToolResult if previous_is_call => MessageTag::ToolResult,
                Role::User => self.tag_user_text(&message.text()),
                _ => MessageTag::Other,
            };

            tags.push(tag);
        }

        tags
    }

    fn tag_user_text(&self, text: &str) -> MessageTag {
        let lowered = text.to_lowercase();

        if lowered.contains(&self.config.failure_marker) {
            MessageTag::VerificationFailure
        } else if self
            .config
            .verification_markers
            .iter()
            .any(|marker| lowered.contains(marker.as_str()))
        {
            MessageTag::Verification
        } else {
            MessageTag::Other
        }
    }

    /// Count write-and-validate results that report failure
    pub fn count_failed_validations(&self, messages: &[Message]) -> u32 {
        messages
            .iter()
            .filter(|m| m.role == Role::ToolResult)
            .flat_map(Message::tool_result_blocks)
            .filter(|r| r.function_name == WRITE_AND_VALIDATE_TOOL && !r.success)
            .count() as u32
    }

    /// Produce the filtered, chronologically ordered view of `messages`.
    ///
    /// Fails with `MaxRetriesExceeded` once the history holds the configured
    /// number of failed write-and-validate results.
    pub fn filter<'a>(&self, messages: &'a [Message]) -> Result<Vec<&'a Message>> {
        let failed = self.count_failed_validations(messages);
        if failed >= self.config.max_failed_validations {
            warn!(
                failed_validations = failed,
                "Write-and-validate attempts exhausted"
            );
            return Err(OrchestrationError::MaxRetriesExceeded { attempts: failed });
        }

        let tags = self.tag_messages(messages);

        let latest_validation = tags
            .iter()
            .rposition(|t| *t == MessageTag::WriteAndValidateCall);
        let latest_tool_call = tags.iter().rposition(|t| t.is_tool_call());
        let latest_verification = tags.iter().rposition(|t| {
            matches!(t, MessageTag::Verification | MessageTag::VerificationFailure)
        });
        let final_index = messages.len().checked_sub(1);

        let mut keep = vec![false; messages.len()];

        for (index, tag) in tags.iter().enumerate() {
            let retain = match tag {
                MessageTag::Framing | MessageTag::DocstringCall => true,
                MessageTag::WriteAndValidateCall => {
                    Some(index) == latest_validation || messages[index].calls_function(DOCSTRING_TOOL)
                }
                MessageTag::OtherToolCall => Some(index) == latest_tool_call,
                MessageTag::VerificationFailure if Some(index) == final_index => true,
                MessageTag::Verification | MessageTag::VerificationFailure => {
                    Some(index) == latest_verification
                        && latest_validation.map_or(true, |v| index > v)
                }
                MessageTag::ToolResult | MessageTag::Other => false,
            };

            if !retain {
                continue;
            }

            keep[index] = true;
            if tag.is_tool_call() && tags.get(index + 1) == Some(&MessageTag::ToolResult) {
                keep[index + 1] = true;
            }
        }

        let filtered: Vec<&Message> = messages
            .iter()
            .zip(keep)
            .filter_map(|(message, kept)| kept.then_some(message))
            .collect();

        debug!(
            total = messages.len(),
            retained = filtered.len(),
            failed_validations = failed,
            "Context window filtered"
        );

        Ok(filtered)
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ToolCall, ToolResult};
    use serde_json::json;

    fn call_msg(id: &str, name: &str) -> Message {
        Message::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: id.to_string(),
                function_name: name.to_string(),
                arguments: json!({}),
            }],
        )
    }

    fn result_msg(id: &str, name: &str, success: bool) -> Message {
        Message::tool_results(vec![ToolResult {
            tool_call_id: id.to_string(),
            function_name: name.to_string(),
            success,
            payload: json!({ "valid": success }),
            script_content: None,
        }])
    }

    fn pair(id: &str, name: &str, success: bool) -> Vec<Message> {
        vec![call_msg(id, name), result_msg(id, name, success)]
    }

    fn ids(filtered: &[&Message]) -> Vec<String> {
        filtered
            .iter()
            .map(|m| match m.role {
                Role::Assistant if m.has_tool_calls() => format!("call:{}", m.tool_calls[0].id),
                Role::ToolResult => format!(
                    "result:{}",
                    m.tool_result_blocks().next().map(|r| r.tool_call_id.as_str()).unwrap_or("")
                ),
                _ => m.text(),
            })
            .collect()
    }

    fn is_subsequence(filtered: &[&Message], all: &[Message]) -> bool {
        let mut cursor = all.iter();
        filtered
            .iter()
            .all(|f| cursor.any(|m| std::ptr::eq(m, *f)))
    }

    #[test]
    fn test_keeps_only_latest_validation_pair() {
        let mut history = vec![Message::user("plot a MACD crossover")];
        history.extend(pair("w1", WRITE_AND_VALIDATE_TOOL, false));
        history.extend(pair("w2", WRITE_AND_VALIDATE_TOOL, false));
        history.extend(pair("w3", WRITE_AND_VALIDATE_TOOL, true));

        let manager = ContextManager::new();
        let filtered = manager.filter(&history).unwrap();

        assert_eq!(
            ids(&filtered),
            vec!["plot a MACD crossover", "call:w3", "result:w3"]
        );
    }

    #[test]
    fn test_keeps_every_docstring_pair() {
        let mut history = vec![Message::user("q")];
        history.extend(pair("d1", DOCSTRING_TOOL, true));
        history.extend(pair("w1", WRITE_AND_VALIDATE_TOOL, false));
        history.extend(pair("d2", DOCSTRING_TOOL, true));
        history.extend(pair("w2", WRITE_AND_VALIDATE_TOOL, true));
        history.extend(pair("d3", DOCSTRING_TOOL, true));

        let filtered = ContextManager::new().filter(&history).unwrap();

        assert_eq!(
            ids(&filtered),
            vec![
                "q", "call:d1", "result:d1", "call:d2", "result:d2", "call:w2", "result:w2",
                "call:d3", "result:d3",
            ]
        );
    }

    #[test]
    fn test_docstring_in_superseded_validation_batch_is_kept() {
        let mixed = Message::assistant_with_tool_calls(
            "",
            vec![
                ToolCall {
                    id: "d1".into(),
                    function_name: DOCSTRING_TOOL.into(),
                    arguments: json!({ "function_name": "calculate_rsi" }),
                },
                ToolCall {
                    id: "w1".into(),
                    function_name: WRITE_AND_VALIDATE_TOOL.into(),
                    arguments: json!({}),
                },
            ],
        );
        let mixed_results = Message::tool_results(vec![
            ToolResult {
                tool_call_id: "d1".into(),
                function_name: DOCSTRING_TOOL.into(),
                success: true,
                payload: json!({ "docstring": "calculate_rsi(close, period)" }),
                script_content: None,
            },
            ToolResult {
                tool_call_id: "w1".into(),
                function_name: WRITE_AND_VALIDATE_TOOL.into(),
                success: false,
                payload: json!({ "valid": false }),
                script_content: None,
            },
        ]);

        let mut history = vec![Message::user("q"), mixed, mixed_results];
        history.extend(pair("w2", WRITE_AND_VALIDATE_TOOL, true));
        history.push(Message::user("VERIFICATION PASSED. Before we proceed, reply with the schema."));

        let filtered = ContextManager::new().filter(&history).unwrap();

        assert_eq!(
            ids(&filtered),
            vec![
                "q",
                "call:d1",
                "result:d1",
                "call:w2",
                "result:w2",
                "VERIFICATION PASSED. Before we proceed, reply with the schema.",
            ]
        );
        let docstring_calls = filtered
            .iter()
            .filter(|m| m.calls_function(DOCSTRING_TOOL))
            .count();
        assert_eq!(docstring_calls, 1);
    }

    #[test]
    fn test_fourth_failure_is_hard_error() {
        let mut history = vec![Message::user("q")];
        for i in 0..3 {
            history.extend(pair(&format!("w{}", i), WRITE_AND_VALIDATE_TOOL, false));
        }
        let manager = ContextManager::new();
        assert!(manager.filter(&history).is_ok());

        history.extend(pair("d1", DOCSTRING_TOOL, true));
        history.push(Message::user("Before we proceed, please double check the window length"));
        history.extend(pair("w3", WRITE_AND_VALIDATE_TOOL, false));

        match manager.filter(&history) {
            Err(OrchestrationError::MaxRetriesExceeded { attempts }) => assert_eq!(attempts, 4),
            other => panic!("expected MaxRetriesExceeded, got {:?}", other.map(|f| f.len())),
        }
    }

    #[test]
    fn test_verification_before_validation_is_dropped() {
        let mut history = vec![Message::user("q")];
        history.extend(pair("w1", WRITE_AND_VALIDATE_TOOL, true));
        history.push(Message::user("Verification passed. Before we proceed, respond with JSON."));
        history.extend(pair("w2", WRITE_AND_VALIDATE_TOOL, true));

        let filtered = ContextManager::new().filter(&history).unwrap();
        assert_eq!(ids(&filtered), vec!["q", "call:w2", "result:w2"]);
    }

    #[test]
    fn test_verification_after_validation_is_kept() {
        let mut history = vec![Message::user("q")];
        history.extend(pair("w1", WRITE_AND_VALIDATE_TOOL, true));
        history.push(Message::user("Verification passed. Before we proceed, respond with JSON."));

        let filtered = ContextManager::new().filter(&history).unwrap();
        assert_eq!(filtered.len(), 4);
        assert_eq!(filtered[3].text(), history[3].text());
    }

    #[test]
    fn test_verification_without_validation_is_kept() {
        let history = vec![
            Message::user("q"),
            call_msg("d1", DOCSTRING_TOOL),
            result_msg("d1", DOCSTRING_TOOL, true),
            Message::user("Before we proceed, confirm the data range."),
        ];

        let filtered = ContextManager::new().filter(&history).unwrap();
        assert_eq!(filtered.len(), 4);
    }

    #[test]
    fn test_final_failure_notice_kept() {
        let mut history = vec![Message::user("q")];
        history.extend(pair("w1", WRITE_AND_VALIDATE_TOOL, true));
        history.push(Message::user("VERIFICATION FAILED: reviewers rejected the script"));

        let tags = ContextManager::new().tag_messages(&history);
        assert_eq!(tags[3], MessageTag::VerificationFailure);

        let filtered = ContextManager::new().filter(&history).unwrap();
        assert_eq!(filtered.last().map(|m| m.text()), Some(history[3].text()));
    }

    #[test]
    fn test_framing_stops_at_first_tool_call() {
        let mut history = vec![
            Message::user("existing scripts: rsi_v1.py"),
            Message::assistant("Let me look at the docs."),
            Message::user("Use daily bars."),
        ];
        history.extend(pair("x1", "list_scripts", true));
        history.push(Message::assistant("thinking out loud"));
        history.extend(pair("d1", DOCSTRING_TOOL, true));

        let tags = ContextManager::new().tag_messages(&history);
        assert_eq!(&tags[..3], &[MessageTag::Framing; 3]);
        assert_eq!(tags[3], MessageTag::OtherToolCall);
        assert_eq!(tags[5], MessageTag::Other);

        let filtered = ContextManager::new().filter(&history).unwrap();
        assert_eq!(
            ids(&filtered),
            vec![
                "existing scripts: rsi_v1.py",
                "Let me look at the docs.",
                "Use daily bars.",
                "call:d1",
                "result:d1",
            ]
        );
    }

    #[test]
    fn test_latest_other_tool_pair_is_visible() {
        let mut history = vec![Message::user("q")];
        history.extend(pair("x1", "list_scripts", true));

        let filtered = ContextManager::new().filter(&history).unwrap();
        assert_eq!(ids(&filtered), vec!["q", "call:x1", "result:x1"]);
    }

    #[test]
    fn test_filter_is_ordered_subsequence() {
        let manager = ContextManager::new();
        let shapes: Vec<Vec<Message>> = vec![
            vec![],
            vec![Message::user("only")],
            {
                let mut h = vec![Message::user("q")];
                h.extend(pair("d1", DOCSTRING_TOOL, true));
                h.extend(pair("w1", WRITE_AND_VALIDATE_TOOL, false));
                h.push(Message::user("verification notes"));
                h.extend(pair("w2", WRITE_AND_VALIDATE_TOOL, true));
                h.push(Message::assistant("stray text"));
                h
            },
            {
                let mut h = vec![Message::user("q"), Message::assistant("a")];
                for i in 0..3 {
                    h.extend(pair(&format!("d{}", i), DOCSTRING_TOOL, true));
                    h.extend(pair(&format!("w{}", i), WRITE_AND_VALIDATE_TOOL, i == 2));
                }
                h
            },
        ];

        for history in &shapes {
            let filtered = manager.filter(history).unwrap();
            assert!(filtered.len() <= history.len());
            assert!(is_subsequence(&filtered, history));

            let validation_calls = filtered
                .iter()
                .filter(|m| m.calls_function(WRITE_AND_VALIDATE_TOOL))
                .count();
            assert!(validation_calls <= 1);
        }
    }
}
