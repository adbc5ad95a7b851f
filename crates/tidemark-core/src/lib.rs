//! Tenant-branded PDF watermarking and usage metering.
//!
//! The pipeline takes an uploaded PDF, normalizes away owner-password
//! encryption, resolves the tenant's brand asset from object storage,
//! encodes a provenance tracking code, composites both onto every page,
//! and meters the page count against the tenant's plan.

pub mod assets;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod tracking;
pub mod watermark;

pub use assets::{AssetResolver, BrandAsset};
pub use config::{
    DecryptConfig, PipelineConfig, StorageConfig, StorageProvider, TrackingConfig, WatermarkConfig,
};
pub use decrypt::{normalize, Decryptor, QpdfDecryptor};
pub use error::PipelineError;
pub use ledger::{PeriodKey, PlanTier, TenantAccount, TenantStore, UsageLedger, UsageTotals};
pub use pipeline::{Pipeline, WatermarkedDocument};
pub use tracking::{Counterparties, TrackingCode, TrackingPayload};
pub use watermark::{stamp_document, StampSummary};

/// Parse PDF bytes and return the page count.
pub fn page_count(bytes: &[u8]) -> Result<usize, PipelineError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(PipelineError::composition)?;
    Ok(doc.get_pages().len())
}
