use thiserror::Error;

/// Failures surfaced by the watermarking pipeline.
///
/// Every variant is fatal for the request that triggered it and recoverable
/// for the service: the next request starts from a clean pipeline instance.
/// A ledger failure after a successful composite is the one exception to
/// "fatal" — the orchestrator logs it and still delivers the document.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The external decrypt step could not produce loadable bytes.
    #[error("Failed to decrypt document: {0}")]
    DecryptFailure(String),

    /// The external decrypt step exceeded the configured timeout.
    #[error("Decrypt step timed out after {secs}s")]
    DecryptTimeout { secs: u64 },

    /// No brand image could be resolved for the tenant.
    #[error("No brand asset found for tenant: {tenant}")]
    AssetNotFound { tenant: String },

    /// The input document could not be loaded or stamped.
    #[error("Watermark composition failed: {0}")]
    Composition(String),

    /// The tracking payload could not be rendered to a barcode.
    #[error("Tracking code generation failed: {0}")]
    Tracking(String),

    /// Usage accounting could not be persisted.
    #[error("Usage ledger write failed: {0}")]
    Ledger(#[from] sqlx::Error),

    /// Object store transport error other than "not found".
    #[error("Asset store error: {0}")]
    AssetStore(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn composition(err: impl std::fmt::Display) -> Self {
        PipelineError::Composition(err.to_string())
    }
}
