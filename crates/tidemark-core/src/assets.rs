//! Brand-asset resolution.
//!
//! Tenants upload their logo through a separate onboarding flow, and naming
//! has drifted over time: some buckets hold a flat `{tenant}.png`, newer
//! uploads land under a `{tenant}/` folder with one object per upload.
//! Resolution tries the conventions in order and, when a listing returns
//! several candidates, picks the most recent upload. The tie-break is an
//! explicit comparator over `(last_modified, key)` from the store metadata
//! rather than parsing version numbers out of filenames.

use std::sync::Arc;

use futures::TryStreamExt;
use image::ImageFormat;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use tracing::debug;

use crate::error::PipelineError;

/// Extensions probed for a direct key hit, in priority order.
const KNOWN_EXTENSIONS: [&str; 3] = [".png", ".jpg", ".jpeg"];

/// A tenant's logo image as resolved from the object store.
#[derive(Debug, Clone)]
pub struct BrandAsset {
    /// Raw image bytes as stored.
    pub bytes: Vec<u8>,
    /// Intrinsic pixel width.
    pub width: u32,
    /// Intrinsic pixel height.
    pub height: u32,
    pub format: ImageFormat,
}

impl BrandAsset {
    /// Validate raw bytes as a raster image and capture its dimensions.
    fn from_bytes(tenant: &str, bytes: Vec<u8>) -> Result<Self, PipelineError> {
        let format = image::guess_format(&bytes).map_err(|_| PipelineError::AssetNotFound {
            tenant: tenant.to_string(),
        })?;
        let image = image::load_from_memory(&bytes).map_err(|e| {
            PipelineError::Composition(format!("brand asset for {tenant} is not decodable: {e}"))
        })?;
        Ok(Self {
            width: image.width(),
            height: image.height(),
            bytes,
            format,
        })
    }
}

/// Resolves tenant keys to brand assets against one bucket.
pub struct AssetResolver {
    store: Arc<dyn ObjectStore>,
}

impl AssetResolver {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Locate the tenant's brand image.
    ///
    /// Strategies, first hit wins:
    /// 1. exact key `{tenant}{ext}` for each known extension;
    /// 2. listing of the `{tenant}/` folder, newest entry;
    /// 3. flat bucket listing filtered by `{tenant}` filename prefix, newest.
    ///
    /// Deterministic for a fixed bucket state. A missing asset yields
    /// [`PipelineError::AssetNotFound`], never a raw transport error.
    pub async fn resolve(&self, tenant: &str) -> Result<BrandAsset, PipelineError> {
        for ext in KNOWN_EXTENSIONS {
            let key = ObjectPath::from(format!("{tenant}{ext}"));
            match self.fetch(&key).await? {
                Some(bytes) => {
                    debug!(tenant, key = %key, "brand asset resolved by exact key");
                    return BrandAsset::from_bytes(tenant, bytes);
                }
                None => continue,
            }
        }

        let folder = ObjectPath::from(tenant);
        if let Some(meta) = self.newest(self.list(Some(&folder)).await?) {
            debug!(tenant, key = %meta.location, "brand asset resolved from tenant folder");
            let bytes = self.fetch(&meta.location).await?.ok_or_else(|| {
                PipelineError::AssetNotFound {
                    tenant: tenant.to_string(),
                }
            })?;
            return BrandAsset::from_bytes(tenant, bytes);
        }

        let everything = self.list(None).await?;
        let candidates = everything
            .into_iter()
            .filter(|meta| {
                meta.location
                    .filename()
                    .is_some_and(|name| name.starts_with(tenant))
            })
            .collect();
        if let Some(meta) = self.newest(candidates) {
            debug!(tenant, key = %meta.location, "brand asset resolved by prefix scan");
            let bytes = self.fetch(&meta.location).await?.ok_or_else(|| {
                PipelineError::AssetNotFound {
                    tenant: tenant.to_string(),
                }
            })?;
            return BrandAsset::from_bytes(tenant, bytes);
        }

        Err(PipelineError::AssetNotFound {
            tenant: tenant.to_string(),
        })
    }

    /// Download a key, mapping 404 to `None` and keeping other transport
    /// failures as errors.
    async fn fetch(&self, key: &ObjectPath) -> Result<Option<Vec<u8>>, PipelineError> {
        match self.store.get(key).await {
            Ok(result) => Ok(Some(result.bytes().await?.to_vec())),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: Option<&ObjectPath>) -> Result<Vec<ObjectMeta>, PipelineError> {
        let metas = self.store.list(prefix).try_collect::<Vec<_>>().await?;
        Ok(metas)
    }

    /// Most recent upload wins; identical timestamps fall back to the key so
    /// the choice stays stable across repeated resolutions.
    fn newest(&self, mut metas: Vec<ObjectMeta>) -> Option<ObjectMeta> {
        metas.retain(|meta| {
            meta.location
                .filename()
                .is_some_and(|name| KNOWN_EXTENSIONS.iter().any(|ext| name.ends_with(ext)))
        });
        metas
            .into_iter()
            .max_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.location.as_ref().cmp(b.location.as_ref()))
            })
    }
}
