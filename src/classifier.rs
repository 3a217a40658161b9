//! Structured Response Classifier
//!
//! Recognizes terminal decisions embedded in free-form model output:
//! - Reuse decision: an existing script already answers the question
//! - Script generation: success or failure of generating a new script
//!
//! Checks run in a fixed order and the first match wins. Malformed blocks are
//! skipped; only a complete absence of recognizable structure yields
//! `NoStructuredResponse`.

use crate::models::{GenerationStatus, ReuseDecision, ScriptGeneration, StructuredResponse};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

/// Script blocks at or below this many characters are not treated as scripts
pub const MIN_SCRIPT_BLOCK_LEN: usize = 100;

/// Source marker for responses synthesized from a bare script block
pub const MARKDOWN_EXTRACTION_SOURCE: &str = "markdown_extraction";

/// Fence tags carrying structured data
const STRUCTURED_TAGS: &[&str] = &["json"];

/// Fence tags carrying a script body
const SCRIPT_TAGS: &[&str] = &["python", "py"];

/// A fenced code block found in model output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FencedBlock<'a> {
    pub tag: &'a str,
    pub body: &'a str,
}

impl FencedBlock<'_> {
    fn tagged_with(&self, tags: &[&str]) -> bool {
        tags.iter().any(|t| self.tag.eq_ignore_ascii_case(t))
    }
}

/// Split text into its fenced code blocks, in order.
/// An unterminated fence ends the scan.
pub fn fenced_blocks(text: &str) -> Vec<FencedBlock<'_>> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let Some(line_end) = after_fence.find('\n') else {
            break;
        };
        let tag = after_fence[..line_end].trim();
        let body_start = &after_fence[line_end + 1..];

        let Some(close) = body_start.find("```") else {
            break;
        };

        blocks.push(FencedBlock {
            tag,
            body: &body_start[..close],
        });
        rest = &body_start[close + 3..];
    }

    blocks
}

/// Structured response classifier
pub struct ResponseClassifier;

impl ResponseClassifier {
    /// Classify model output text into a structured response
    pub fn classify(text: &str) -> StructuredResponse {
        let blocks = fenced_blocks(text);

        let structured: Vec<Value> = blocks
            .iter()
            .filter(|b| b.tagged_with(STRUCTURED_TAGS))
            .filter_map(|b| match serde_json::from_str::<Value>(b.body.trim()) {
                Ok(value) if value.is_object() => Some(value),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed structured block");
                    None
                }
            })
            .collect();

        // 1️⃣ Reuse decision inside a fenced block
        if let Some(decision) = structured.iter().find_map(positive_reuse_decision) {
            return StructuredResponse::ReuseDecision(decision);
        }

        // 2️⃣ Reuse decision as the whole text
        if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
            if let Some(decision) = positive_reuse_decision(&value) {
                return StructuredResponse::ReuseDecision(decision);
            }
        }

        // 3️⃣ Script generation outcome
        for value in &structured {
            let Some(raw) = value.get("script_generation") else {
                continue;
            };

            match serde_json::from_value::<ScriptGeneration>(raw.clone()) {
                Ok(generation) => {
                    return match generation.status {
                        GenerationStatus::Success => {
                            StructuredResponse::ScriptGenerationSuccess(generation)
                        }
                        GenerationStatus::Failed => {
                            StructuredResponse::ScriptGenerationFailed(generation)
                        }
                    };
                }
                Err(e) => warn!(error = %e, "Skipping unreadable script_generation block"),
            }
        }

        // 4️⃣ Bare script block
        if let Some(script) = blocks
            .iter()
            .filter(|b| b.tagged_with(SCRIPT_TAGS))
            .map(|b| b.body.trim())
            .find(|body| body.chars().count() > MIN_SCRIPT_BLOCK_LEN)
        {
            debug!(length = script.len(), "Synthesizing script generation from script block");
            return StructuredResponse::ScriptGenerationSuccess(markdown_extraction(script));
        }

        StructuredResponse::NoStructuredResponse
    }
}

/// `should_reuse == false` is not a match; scanning continues.
fn positive_reuse_decision(value: &Value) -> Option<ReuseDecision> {
    let raw = value.get("reuse_decision")?;

    match serde_json::from_value::<ReuseDecision>(raw.clone()) {
        Ok(decision) if decision.should_reuse => Some(decision),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Skipping unreadable reuse_decision block");
            None
        }
    }
}

fn markdown_extraction(script: &str) -> ScriptGeneration {
    let mut extra = serde_json::Map::new();
    extra.insert("script_content".to_string(), Value::String(script.to_string()));

    ScriptGeneration {
        status: GenerationStatus::Success,
        script_name: Some(default_script_name()),
        analysis_description: None,
        final_error: None,
        validation_attempts: None,
        verification: None,
        execution: None,
        source: Some(MARKDOWN_EXTRACTION_SOURCE.to_string()),
        extra,
    }
}

fn default_script_name() -> String {
    format!("generated_analysis_{}.py", Utc::now().format("%Y%m%d_%H%M%S"))
}
