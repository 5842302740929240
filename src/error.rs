use crate::store::StoreError;

/// Errors surfaced by the measure ingestion pipeline.
///
/// A failed ingestion may be partially applied: persistence runs as parallel
/// writes with no compensating rollback, so callers should retry — the
/// snapshot merge and measure-record creation are idempotent or additive.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid measure: {0}")]
    Validation(String),

    #[error("device \"{device_id}\" is not linked to asset \"{asset_id}\"")]
    LinkInconsistency {
        device_id: String,
        asset_id: String,
    },

    #[error("cannot persist {entity}: {reason}")]
    Persistence { entity: String, reason: String },

    /// Retryable: another ingestion for the same device held the lock for
    /// longer than the configured lease.
    #[error("timed out acquiring lock \"{key}\"")]
    LockTimeout { key: String },

    #[error("enrichment subscriber failed: {0}")]
    Enrichment(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn persistence(entity: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Persistence {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }
}
