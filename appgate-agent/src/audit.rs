//! Structured audit events emitted at session and request boundaries.
//!
//! Event names are stable; downstream pipelines key on them.

use std::sync::Mutex;

use serde::Serialize;

/// The envelope every application audit event carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionMetadata {
    /// Cluster emitting the event.
    pub cluster_name: String,
    /// Host id of the agent.
    pub server_id: String,
    /// Namespace of the agent's records.
    pub server_namespace: String,
    /// Application session id.
    pub session_id: String,
    /// Whether the session was MFA-verified.
    pub mfa_verified: bool,
    /// The authenticated user.
    pub user: String,
    /// Remote address of the client.
    pub remote_addr: String,
    /// Application URI.
    pub app_uri: String,
    /// Application public address.
    pub app_public_addr: String,
    /// Application name.
    pub app_name: String,
}

/// An application audit event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum AuditEvent {
    /// A session began.
    #[serde(rename = "app.session.start")]
    SessionStart {
        /// Common envelope.
        #[serde(flatten)]
        session: SessionMetadata,
    },
    /// A session ended.
    #[serde(rename = "app.session.end")]
    SessionEnd {
        /// Common envelope.
        #[serde(flatten)]
        session: SessionMetadata,
    },
    /// A recording chunk was produced.
    #[serde(rename = "app.session.chunk")]
    SessionChunk {
        /// Common envelope.
        #[serde(flatten)]
        session: SessionMetadata,
        /// Id of the uploaded chunk.
        session_chunk_id: String,
    },
    /// One forwarded HTTP request completed.
    #[serde(rename = "app.session.request")]
    SessionRequest {
        /// Common envelope.
        #[serde(flatten)]
        session: SessionMetadata,
        /// Request method.
        method: String,
        /// Request path.
        path: String,
        /// Raw query string.
        raw_query: String,
        /// Upstream status code.
        status_code: u16,
    },
}

impl AuditEvent {
    /// The stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::SessionStart { .. } => "app.session.start",
            AuditEvent::SessionEnd { .. } => "app.session.end",
            AuditEvent::SessionChunk { .. } => "app.session.chunk",
            AuditEvent::SessionRequest { .. } => "app.session.request",
        }
    }
}

/// Where audit events go. The audit log writers are collaborators; the agent
/// only submits.
pub trait AuditEmitter: Send + Sync {
    /// Submit one event. Emission must never fail the serving path.
    fn emit(&self, event: AuditEvent);
}

/// Emits events onto the structured log.
#[derive(Debug, Default)]
pub struct LogEmitter;

impl AuditEmitter for LogEmitter {
    fn emit(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(target: "audit", event = event.name(), %payload),
            Err(error) => tracing::warn!(?error, "failed to encode audit event"),
        }
    }
}

/// Captures events in memory; test instrumentation.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingEmitter {
    /// A fresh recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    /// The stable names of everything emitted so far.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }
}

impl AuditEmitter for RecordingEmitter {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}
