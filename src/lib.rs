//! Analysis Script Orchestrator
//!
//! Drives a tool-calling conversation with a language model until it either
//! reuses an existing analysis script or produces a new, validated and
//! consensus-verified one.
//!
//! CONVERSATION LOOP:
//! FILTER → MODEL → (TOOLS → VERIFY?)* → CLASSIFY → COMPLETE

pub mod agent;
pub mod api;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;
pub mod llm;
pub mod memory;
pub mod models;
pub mod prompts;
pub mod tools;
pub mod verification;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use agent::Orchestrator;
pub use classifier::ResponseClassifier;
