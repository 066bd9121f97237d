use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Additional context for errors, carried alongside the kind so callers and
/// telemetry sinks can reconstruct what was happening without parsing the
/// message string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    pub peer_id: Option<String>,
    pub chunk_hash: Option<String>,
    pub operation_id: Option<String>,
    pub operation: String,
    pub duration_ms: Option<u64>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            ..Default::default()
        }
    }

    pub fn with_peer_id(mut self, peer_id: &str) -> Self {
        self.peer_id = Some(peer_id.to_string());
        self
    }

    pub fn with_chunk_hash(mut self, chunk_hash: &str) -> Self {
        self.chunk_hash = Some(chunk_hash.to_string());
        self
    }

    pub fn with_operation_id(mut self, operation_id: &str) -> Self {
        self.operation_id = Some(operation_id.to_string());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Unified error type for the mesh coordination layer. Variants map onto the
/// kind taxonomy of the spec (Discovery, Connectivity, Gating, Validation,
/// Capacity, Integrity, Trust) rather than onto implementation accidents.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("chunk not found: {chunk_hash}")]
    ChunkNotFound {
        chunk_hash: String,
        context: ErrorContext,
    },

    #[error("peer not found: {peer_id}")]
    PeerNotFound {
        peer_id: String,
        context: ErrorContext,
    },

    #[error("DHT lookup failed for {target}")]
    DhtLookupFailed {
        target: String,
        context: ErrorContext,
    },

    #[error("peer unreachable: {peer_id}")]
    PeerUnreachable {
        peer_id: String,
        context: ErrorContext,
    },

    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        context: ErrorContext,
    },

    #[error("operation timed out after {duration:?}")]
    Timeout {
        duration: Duration,
        context: ErrorContext,
    },

    #[error("circuit open for peer {peer_id}")]
    CircuitOpen {
        peer_id: String,
        context: ErrorContext,
    },

    #[error("invalid chunk hash: {chunk_hash}")]
    InvalidChunkHash {
        chunk_hash: String,
        context: ErrorContext,
    },

    #[error("invalid peer id: {peer_id}")]
    InvalidPeerId {
        peer_id: String,
        context: ErrorContext,
    },

    #[error("invalid merkle proof for key {key}")]
    InvalidProof {
        key: String,
        context: ErrorContext,
    },

    #[error("insufficient peers: required {required}, available {available}")]
    InsufficientPeers {
        required: usize,
        available: usize,
        context: ErrorContext,
    },

    #[error("capacity exceeded: {resource}")]
    CapacityExceeded {
        resource: String,
        context: ErrorContext,
    },

    #[error("quota exceeded for {resource}")]
    QuotaExceeded {
        resource: String,
        context: ErrorContext,
    },

    #[error("gossip queue full")]
    GossipQueueFull { context: ErrorContext },

    #[error("signature invalid for message {message_id}")]
    SignatureInvalid {
        message_id: String,
        context: ErrorContext,
    },

    #[error("message expired: {message_id}")]
    MessageExpired {
        message_id: String,
        context: ErrorContext,
    },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        expected: String,
        actual: String,
        context: ErrorContext,
    },

    #[error("peer reputation too low: {peer_id} (score {score}, threshold {threshold})")]
    LowReputation {
        peer_id: String,
        score: f32,
        threshold: f32,
        context: ErrorContext,
    },

    #[error("peer banned: {peer_id}")]
    PeerBanned {
        peer_id: String,
        context: ErrorContext,
    },

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: i64,
        available: i64,
        context: ErrorContext,
    },

    #[error("escrow state violation: escrow {escrow_id} expected {expected}, found {actual}")]
    EscrowStateViolation {
        escrow_id: String,
        expected: String,
        actual: String,
        context: ErrorContext,
    },

    #[error("duplicate id: {id}")]
    DuplicateId { id: String, context: ErrorContext },

    #[error("serialization error: {message}")]
    Serialization {
        message: String,
        context: ErrorContext,
    },

    #[error("configuration error: {field} = {value} is invalid ({expected})")]
    Configuration {
        field: String,
        value: String,
        expected: String,
    },

    #[error("operation cancelled: {operation}")]
    Cancelled {
        operation: String,
        context: ErrorContext,
    },
}

impl MeshError {
    /// Stable kind code, used by callers and metrics rather than matching on
    /// the rendered message.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::ChunkNotFound { .. } => "chunk_not_found",
            MeshError::PeerNotFound { .. } => "peer_not_found",
            MeshError::DhtLookupFailed { .. } => "dht_lookup_failed",
            MeshError::PeerUnreachable { .. } => "peer_unreachable",
            MeshError::ConnectionFailed { .. } => "connection_failed",
            MeshError::Timeout { .. } => "timeout",
            MeshError::CircuitOpen { .. } => "circuit_open",
            MeshError::InvalidChunkHash { .. } => "invalid_chunk_hash",
            MeshError::InvalidPeerId { .. } => "invalid_peer_id",
            MeshError::InvalidProof { .. } => "invalid_proof",
            MeshError::InsufficientPeers { .. } => "insufficient_peers",
            MeshError::CapacityExceeded { .. } => "capacity_exceeded",
            MeshError::QuotaExceeded { .. } => "quota_exceeded",
            MeshError::GossipQueueFull { .. } => "gossip_queue_full",
            MeshError::SignatureInvalid { .. } => "signature_invalid",
            MeshError::MessageExpired { .. } => "message_expired",
            MeshError::DigestMismatch { .. } => "digest_mismatch",
            MeshError::LowReputation { .. } => "low_reputation",
            MeshError::PeerBanned { .. } => "peer_banned",
            MeshError::InsufficientBalance { .. } => "insufficient_balance",
            MeshError::EscrowStateViolation { .. } => "escrow_state_violation",
            MeshError::DuplicateId { .. } => "duplicate_id",
            MeshError::Serialization { .. } => "serialization",
            MeshError::Configuration { .. } => "configuration",
            MeshError::Cancelled { .. } => "cancelled",
        }
    }

    /// Errors that are safe to retry or that resolve themselves without
    /// surfacing to the caller (duplicate gossip, rate limits, single-peer
    /// RPC failures).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MeshError::PeerUnreachable { .. }
                | MeshError::ConnectionFailed { .. }
                | MeshError::Timeout { .. }
                | MeshError::CircuitOpen { .. }
                | MeshError::QuotaExceeded { .. }
                | MeshError::Cancelled { .. }
        )
    }

    pub fn severity(&self) -> &'static str {
        match self {
            MeshError::DigestMismatch { .. }
            | MeshError::SignatureInvalid { .. }
            | MeshError::EscrowStateViolation { .. }
            | MeshError::InsufficientBalance { .. } => "error",
            MeshError::CircuitOpen { .. }
            | MeshError::LowReputation { .. }
            | MeshError::PeerBanned { .. }
            | MeshError::QuotaExceeded { .. } => "warn",
            MeshError::Cancelled { .. } | MeshError::Timeout { .. } => "info",
            _ => "debug",
        }
    }

    pub fn to_metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![("error_kind", self.kind().to_string())];
        if let Some(ctx) = self.context() {
            if let Some(peer) = &ctx.peer_id {
                tags.push(("peer_id", peer.clone()));
            }
            if !ctx.operation.is_empty() {
                tags.push(("operation", ctx.operation.clone()));
            }
        }
        tags
    }

    fn context(&self) -> Option<&ErrorContext> {
        match self {
            MeshError::ChunkNotFound { context, .. }
            | MeshError::PeerNotFound { context, .. }
            | MeshError::DhtLookupFailed { context, .. }
            | MeshError::PeerUnreachable { context, .. }
            | MeshError::ConnectionFailed { context, .. }
            | MeshError::Timeout { context, .. }
            | MeshError::CircuitOpen { context, .. }
            | MeshError::InvalidChunkHash { context, .. }
            | MeshError::InvalidPeerId { context, .. }
            | MeshError::InvalidProof { context, .. }
            | MeshError::InsufficientPeers { context, .. }
            | MeshError::CapacityExceeded { context, .. }
            | MeshError::QuotaExceeded { context, .. }
            | MeshError::GossipQueueFull { context }
            | MeshError::SignatureInvalid { context, .. }
            | MeshError::MessageExpired { context, .. }
            | MeshError::DigestMismatch { context, .. }
            | MeshError::LowReputation { context, .. }
            | MeshError::PeerBanned { context, .. }
            | MeshError::InsufficientBalance { context, .. }
            | MeshError::EscrowStateViolation { context, .. }
            | MeshError::DuplicateId { context, .. }
            | MeshError::Serialization { context, .. }
            | MeshError::Cancelled { context, .. } => Some(context),
            MeshError::Configuration { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

/// Extension trait for attaching operation context to a `Result` at the call
/// site, without threading context through every intermediate signature.
pub trait ResultExt<T> {
    fn with_context(self, operation: &str) -> Result<T>;
    fn with_peer_context(self, operation: &str, peer_id: &str) -> Result<T>;
    fn with_chunk_context(self, operation: &str, chunk_hash: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, operation: &str) -> Result<T> {
        self
    }

    fn with_peer_context(self, operation: &str, peer_id: &str) -> Result<T> {
        self.map_err(|e| {
            tracing::debug!(operation, peer_id, "operation failed: {e}");
            e
        })
    }

    fn with_chunk_context(self, operation: &str, chunk_hash: &str) -> Result<T> {
        self.map_err(|e| {
            tracing::debug!(operation, chunk_hash, "operation failed: {e}");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_are_flagged() {
        let err = MeshError::Timeout {
            duration: Duration::from_secs(1),
            context: ErrorContext::new("fetch_chunk"),
        };
        assert!(err.is_recoverable());

        let fatal = MeshError::DigestMismatch {
            expected: "a".into(),
            actual: "b".into(),
            context: ErrorContext::default(),
        };
        assert!(!fatal.is_recoverable());
    }

    #[test]
    fn kind_codes_are_stable() {
        let err = MeshError::CircuitOpen {
            peer_id: "peer-1".into(),
            context: ErrorContext::default(),
        };
        assert_eq!(err.kind(), "circuit_open");
        assert_eq!(err.severity(), "warn");
    }

    #[test]
    fn metrics_tags_include_peer_and_operation() {
        let ctx = ErrorContext::new("fetch_chunk").with_peer_id("peer-9");
        let err = MeshError::PeerUnreachable {
            peer_id: "peer-9".into(),
            context: ctx,
        };
        let tags = err.to_metrics_tags();
        assert!(tags.contains(&("peer_id", "peer-9".to_string())));
        assert!(tags.contains(&("operation", "fetch_chunk".to_string())));
    }
}
