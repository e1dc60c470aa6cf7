//! A record of every answered request.

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use tokio::sync::mpsc;

use dns_types::protocol::types::DomainName;

/// Capacity of the channel between the server and the audit sink.
/// Events are dropped, not waited for, when it is full.
pub const AUDIT_CHANNEL_CAPACITY: usize = 1024;

/// Emitted after a response has been sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub query_name: DomainName,
    pub client: SocketAddr,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn now(query_name: DomainName, client: SocketAddr) -> Self {
        Self {
            query_name,
            client,
            timestamp: Utc::now(),
        }
    }
}

/// Log each audit event until every sender is gone.
pub async fn log_audit_events_task(mut rx: mpsc::Receiver<AuditEvent>) {
    while let Some(event) = rx.recv().await {
        tracing::info!(
            target: "audit",
            query_name = %event.query_name,
            client = %event.client,
            timestamp = %event.timestamp.to_rfc3339(),
            "response sent"
        );
    }
}
