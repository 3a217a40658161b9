//! Conversation audit trail
//!
//! Every completed conversation is recorded with a hash of its full
//! transcript so a stored record can later be checked for tampering.

use crate::models::{AnalysisResponse, Message, ResponseType};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Stored summary of one finished conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub audit_id: Uuid,
    pub question: String,
    pub response_type: ResponseType,
    pub success: bool,
    pub turns: u32,
    pub tool_call_count: usize,
    pub failed_validations: u32,
    pub transcript: Arc<Vec<Message>>,
    pub transcript_hash: String,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

impl ConversationRecord {
    pub fn new(
        question: String,
        transcript: Vec<Message>,
        response: &AnalysisResponse,
        execution_time_ms: u64,
    ) -> Self {
        let transcript_hash = compute_transcript_hash(&transcript);
        Self {
            audit_id: Uuid::new_v4(),
            question,
            response_type: response.response_type,
            success: response.success,
            turns: response.turns,
            tool_call_count: response.tool_calls.len(),
            failed_validations: response.failed_validations,
            transcript: Arc::new(transcript),
            transcript_hash,
            created_at: Utc::now(),
            execution_time_ms,
        }
    }
}

/// Audit trail storage
pub struct AuditLog {
    records: Arc<RwLock<HashMap<Uuid, ConversationRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store a conversation record
    pub async fn record(&self, record: ConversationRecord) -> Result<Uuid> {
        let audit_id = record.audit_id;
        let mut records = self.records.write().await;
        records.insert(audit_id, record);
        Ok(audit_id)
    }

    pub async fn get(&self, audit_id: Uuid) -> Result<Option<ConversationRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&audit_id).cloned())
    }

    /// All audit IDs, oldest first
    pub async fn list(&self) -> Result<Vec<Uuid>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .iter()
            .map(|(id, record)| (*id, record.created_at))
            .collect();
        items.sort_by_key(|(_, created_at)| *created_at);

        Ok(items.into_iter().map(|(id, _)| id).collect())
    }

    /// Recompute the transcript hash and compare with the stored one
    pub async fn verify_integrity(&self, audit_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;

        Ok(records
            .get(&audit_id)
            .map(|record| compute_transcript_hash(&record.transcript) == record.transcript_hash)
            .unwrap_or(false))
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA256 of the serialized transcript, streamed straight into the hasher
pub fn compute_transcript_hash(messages: &[Message]) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), messages).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
