//! End-to-end watermarking pipeline.
//!
//! Stage order matters: the input is normalized and the brand asset
//! resolved before any page is touched, so every failure up to composition
//! leaves no trace in the ledger. Usage recording runs last and is
//! best-effort, because once a document has been composited the tenant
//! gets it back even if accounting is briefly unavailable.

use std::sync::Arc;

use chrono::Utc;
use lopdf::Document;
use tracing::{info, warn};

use crate::assets::AssetResolver;
use crate::config::PipelineConfig;
use crate::decrypt::{normalize, Decryptor};
use crate::error::PipelineError;
use crate::ledger::{PeriodKey, TenantAccount, UsageLedger, UsageTotals};
use crate::tracking::{encode, Counterparties, TrackingPayload};
use crate::watermark::stamp_document;

/// A watermarked document ready for delivery.
#[derive(Debug)]
pub struct WatermarkedDocument {
    pub bytes: Vec<u8>,
    pub pages: usize,
    /// URL embedded in the corner tracking code.
    pub tracking_url: String,
    /// Totals after metering, `None` when recording failed after delivery
    /// was already committed.
    pub usage: Option<UsageTotals>,
}

pub struct Pipeline {
    decryptor: Arc<dyn Decryptor>,
    assets: AssetResolver,
    ledger: UsageLedger,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        decryptor: Arc<dyn Decryptor>,
        assets: AssetResolver,
        ledger: UsageLedger,
        config: PipelineConfig,
    ) -> Self {
        Self {
            decryptor,
            assets,
            ledger,
            config,
        }
    }

    /// Watermark `raw` for `tenant` and meter the page count.
    pub async fn run(
        &self,
        tenant: &TenantAccount,
        parties: &Counterparties,
        raw: Vec<u8>,
    ) -> Result<WatermarkedDocument, PipelineError> {
        let normalized = normalize(raw, self.decryptor.as_ref()).await?;

        let mut doc = Document::load_mem(&normalized).map_err(PipelineError::composition)?;

        // Asset resolution hits the store; code rendering is pure CPU.
        // Neither depends on the other, so they overlap.
        let payload = TrackingPayload::new(&tenant.email, parties, Utc::now().date_naive());
        let (asset, code) = tokio::join!(
            self.assets.resolve(&tenant.email),
            async { encode(&payload, &self.config.tracking) },
        );
        let (asset, code) = (asset?, code?);
        let tracking_url = code.url.clone();

        let summary = stamp_document(&mut doc, &asset, &code, &self.config.watermark)?;

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).map_err(PipelineError::composition)?;

        let usage = match self
            .ledger
            .record(tenant, summary.pages as u32, &PeriodKey::current())
            .await
        {
            Ok(totals) => Some(totals),
            Err(err) => {
                // The document is already composited; deliver it anyway.
                warn!(
                    tenant = %tenant.email,
                    pages = summary.pages,
                    error = %err,
                    "usage recording failed after composition"
                );
                None
            }
        };

        info!(
            tenant = %tenant.email,
            pages = summary.pages,
            overlays = summary.overlays,
            "document watermarked"
        );

        Ok(WatermarkedDocument {
            bytes,
            pages: summary.pages,
            tracking_url,
            usage,
        })
    }
}
