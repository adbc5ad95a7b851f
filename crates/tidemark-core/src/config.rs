//! Pipeline and storage configuration.
//!
//! Everything the pipeline depends on is passed in explicitly through these
//! structs so one process can serve several environments in tests. The only
//! environment access happens in the `from_env` constructors called from main.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;

/// Geometry and opacity knobs for the page overlay.
#[derive(Debug, Clone)]
pub struct WatermarkConfig {
    /// Displayed logo width as a fraction of page width.
    pub logo_scale: f32,
    /// Gap between tiles, in page units.
    pub tile_gap: f32,
    /// Tile rotation in degrees.
    pub tile_angle: f32,
    /// Fill opacity of the tiled logo.
    pub logo_opacity: f32,
    /// Fill opacity of the corner tracking code.
    pub code_opacity: f32,
    /// Side length of the square tracking code stamp, in page units.
    pub code_size: f32,
    /// Offset of the code from the right page edge.
    pub code_right_margin: f32,
    /// Offset of the code from the bottom page edge.
    pub code_bottom_margin: f32,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            logo_scale: 0.2,
            tile_gap: 150.0,
            tile_angle: 45.0,
            logo_opacity: 0.15,
            code_opacity: 0.4,
            code_size: 20.0,
            code_right_margin: 35.0,
            code_bottom_margin: 15.0,
        }
    }
}

/// Template for the traceability payload embedded in the corner code.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Base URL the payload is attached to as a `data` query parameter.
    pub base_url: String,
    /// First field of the delimited payload, identifying the service.
    pub label: String,
    /// Pixels per QR module.
    pub module_scale: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://tidemark.dev/verify".to_string(),
            label: "ProtectedByTidemark".to_string(),
            module_scale: 5,
        }
    }
}

/// Settings for the external decrypt step.
#[derive(Debug, Clone)]
pub struct DecryptConfig {
    /// Path or name of the qpdf binary.
    pub qpdf_path: String,
    /// Hard deadline for a single decrypt invocation.
    pub timeout: Duration,
}

impl Default for DecryptConfig {
    fn default() -> Self {
        Self {
            qpdf_path: "qpdf".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub watermark: WatermarkConfig,
    pub tracking: TrackingConfig,
    pub decrypt: DecryptConfig,
}

impl PipelineConfig {
    /// Load overrides from the environment, falling back to defaults.
    ///
    /// Recognized variables: `TIDEMARK_VERIFY_URL`, `TIDEMARK_QPDF_PATH`,
    /// `TIDEMARK_DECRYPT_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TIDEMARK_VERIFY_URL") {
            config.tracking.base_url = url;
        }
        if let Ok(path) = std::env::var("TIDEMARK_QPDF_PATH") {
            config.decrypt.qpdf_path = path;
        }
        if let Some(secs) = std::env::var("TIDEMARK_DECRYPT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.decrypt.timeout = Duration::from_secs(secs);
        }
        config
    }
}

/// Storage provider options for the brand-asset bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// Cloudflare R2 (zero egress fees)
    CloudflareR2,
    /// AWS S3
    AwsS3,
    /// Local filesystem (for development and tests)
    Local,
}

/// Brand-asset bucket configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    /// Bucket name (or local path for the Local provider)
    pub bucket: String,
    /// AWS region (use "auto" for R2)
    pub region: String,
    /// Custom endpoint URL (required for R2)
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl StorageConfig {
    /// Local filesystem bucket rooted at `path`.
    pub fn local(path: &str) -> Self {
        Self {
            provider: StorageProvider::Local,
            bucket: path.to_string(),
            region: String::new(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Expected variables:
    /// - TIDEMARK_STORAGE_PROVIDER: "cloudflare_r2", "aws_s3", or "local"
    /// - TIDEMARK_LOGO_BUCKET: bucket name or local path
    /// - TIDEMARK_STORAGE_REGION: AWS region (default "auto")
    /// - R2_ENDPOINT: custom endpoint URL
    /// - AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY: credentials
    pub fn from_env() -> Result<Self> {
        let provider_str =
            std::env::var("TIDEMARK_STORAGE_PROVIDER").unwrap_or_else(|_| "local".to_string());

        let provider = match provider_str.to_lowercase().as_str() {
            "cloudflare_r2" | "r2" => StorageProvider::CloudflareR2,
            "aws_s3" | "s3" => StorageProvider::AwsS3,
            "local" => StorageProvider::Local,
            _ => return Err(anyhow!("Unknown storage provider: {}", provider_str)),
        };

        Ok(Self {
            provider,
            bucket: std::env::var("TIDEMARK_LOGO_BUCKET")
                .unwrap_or_else(|_| "./logo-data".to_string()),
            region: std::env::var("TIDEMARK_STORAGE_REGION").unwrap_or_else(|_| "auto".to_string()),
            endpoint: std::env::var("R2_ENDPOINT").ok(),
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
        })
    }

    /// Build an ObjectStore instance from this configuration.
    pub fn build_object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        match &self.provider {
            StorageProvider::CloudflareR2 => {
                let endpoint = self
                    .endpoint
                    .as_ref()
                    .ok_or_else(|| anyhow!("Endpoint required for {:?}", self.provider))?;

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&self.bucket)
                    .with_region(&self.region)
                    .with_endpoint(endpoint)
                    .with_virtual_hosted_style_request(false);

                if let (Some(key), Some(secret)) = (&self.access_key_id, &self.secret_access_key) {
                    builder = builder
                        .with_access_key_id(key)
                        .with_secret_access_key(secret);
                }

                Ok(Arc::new(builder.build()?))
            }

            StorageProvider::AwsS3 => {
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&self.bucket)
                    .with_region(&self.region);

                if let (Some(key), Some(secret)) = (&self.access_key_id, &self.secret_access_key) {
                    builder = builder
                        .with_access_key_id(key)
                        .with_secret_access_key(secret);
                }

                Ok(Arc::new(builder.build()?))
            }

            StorageProvider::Local => {
                std::fs::create_dir_all(&self.bucket)?;
                Ok(Arc::new(LocalFileSystem::new_with_prefix(&self.bucket)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_config() {
        let config = StorageConfig::local("/tmp/test-logos");
        assert_eq!(config.provider, StorageProvider::Local);
        assert_eq!(config.bucket, "/tmp/test-logos");
    }

    #[test]
    fn test_watermark_defaults() {
        let wm = WatermarkConfig::default();
        assert!(wm.logo_scale > 0.0 && wm.logo_scale < 1.0);
        assert!(wm.logo_opacity < wm.code_opacity);
    }
}
