//! Prompt templates
//!
//! Templates are plain text with `{placeholder}` slots. They are loaded once
//! when the orchestrator is constructed and passed to the components that
//! render them.

use crate::error::OrchestrationError;
use crate::Result;
use std::path::Path;

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a quantitative analysis assistant. You answer market-analysis questions by reusing an existing analysis script or by writing a new Python script built on the available technical-indicator functions.

Rules:
- Use `get_function_docstring` to read the documentation of any indicator function before you call it.
- Submit every script with `write_and_validate`, passing `script_name`, `description`, `parameters` and the full source as `content`.
- When an existing script already answers the question, reply with:
```json
{"reuse_decision": {"should_reuse": true, "existing_function_name": "<name>", "reasoning": "<why>"}}
```
- When you cannot produce a valid script, reply with:
```json
{"script_generation": {"status": "failed", "final_error": "<reason>"}}
```
- Only report success after the verification step asks you to."#;

pub const DEFAULT_VERIFICATION_PROMPT: &str = r#"You are reviewing a Python analysis script written to answer a user's market-analysis question.

Question:
{question}

Script:
```python
{script}
```

Check that the script answers the question, uses the indicator functions correctly, has no look-ahead bias, and handles missing data. Reply with a single JSON object:
```json
{"verdict": "APPROVE" | "REJECT", "confidence": 0.0-1.0, "issues": ["..."], "critical_issues": ["..."]}
```
Only list blocking problems under critical_issues."#;

/// A text template with `{question}` / `{script}` style placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    /// Create a template, requiring every placeholder in `required` to appear
    pub fn new(text: impl Into<String>, required: &[&str]) -> Result<Self> {
        let text = text.into();

        if text.trim().is_empty() {
            return Err(OrchestrationError::Prompt("template is empty".to_string()));
        }

        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !text.contains(&format!("{{{}}}", name)))
            .collect();
        if !missing.is_empty() {
            return Err(OrchestrationError::Prompt(format!(
                "template is missing placeholders: {}",
                missing.join(", ")
            )));
        }

        Ok(Self { text })
    }

    pub fn from_file(path: &Path, required: &[&str]) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::new(text, required)
    }

    /// Template for reviewer prompts; needs `{question}` and `{script}`
    pub fn verification(text: impl Into<String>) -> Result<Self> {
        Self::new(text, &["question", "script"])
    }

    pub fn default_verification() -> Self {
        Self {
            text: DEFAULT_VERIFICATION_PROMPT.to_string(),
        }
    }

    /// Substitute placeholders in one pass; inserted values are never rescanned
    pub fn render(&self, values: &[(&str, &str)]) -> String {
        let mut out = String::with_capacity(self.text.len());
        let mut rest = self.text.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let candidate = &rest[open + 1..];

            let value = candidate.find('}').and_then(|close| {
                let name = &candidate[..close];
                values
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| (*value, close))
            });

            match value {
                Some((value, close)) => {
                    out.push_str(value);
                    rest = &candidate[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = candidate;
                }
            }
        }

        out.push_str(rest);
        out
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}
