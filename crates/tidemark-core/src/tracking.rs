//! Traceability payload and corner-code rendering.
//!
//! Every stamped document carries a scannable record of who processed it and
//! when. The payload is pure data: a fixed-arity, `|`-delimited string,
//! percent-encoded into the `data` query parameter of the verification URL.
//! Absent counterparty fields are written as the literal `"unknown"` so the
//! field positions never shift.

use std::io::Cursor;

use chrono::NaiveDate;
use image::{GrayImage, ImageFormat, Luma};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use qrcode::{Color, QrCode};

use crate::config::TrackingConfig;
use crate::error::PipelineError;

/// Placeholder for counterparty fields the caller did not supply.
pub const UNKNOWN: &str = "unknown";

const DELIMITER: char = '|';

/// Characters escaped the way `encodeURIComponent` does: everything except
/// ASCII alphanumerics and `- _ . ! ~ * ' ( )`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Counterparties named on the processed document.
///
/// All fields are optional at the API boundary; the payload substitutes
/// [`UNKNOWN`] for anything missing.
#[derive(Debug, Clone, Default)]
pub struct Counterparties {
    pub lender: Option<String>,
    pub salesperson: Option<String>,
    pub processor: Option<String>,
}

/// The ordered tuple embedded in the corner code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingPayload {
    pub tenant: String,
    pub lender: String,
    pub salesperson: String,
    pub processor: String,
    /// Issuance date, UTC calendar day.
    pub date: NaiveDate,
}

impl TrackingPayload {
    pub fn new(tenant: &str, parties: &Counterparties, date: NaiveDate) -> Self {
        let or_unknown =
            |field: &Option<String>| field.clone().unwrap_or_else(|| UNKNOWN.to_string());
        Self {
            tenant: tenant.to_string(),
            lender: or_unknown(&parties.lender),
            salesperson: or_unknown(&parties.salesperson),
            processor: or_unknown(&parties.processor),
            date,
        }
    }

    /// The delimited form, before percent-encoding. Arity is fixed at six.
    pub fn delimited(&self, label: &str) -> String {
        format!(
            "{label}{d}{}{d}{}{d}{}{d}{}{d}{}",
            self.tenant,
            self.lender,
            self.salesperson,
            self.processor,
            self.date.format("%Y-%m-%d"),
            d = DELIMITER,
        )
    }

    /// The full verification URL carried by the barcode.
    pub fn to_url(&self, config: &TrackingConfig) -> String {
        let delimited = self.delimited(&config.label);
        let encoded = utf8_percent_encode(&delimited, COMPONENT);
        format!("{}?data={}", config.base_url, encoded)
    }

    /// Recover a payload from the `data` query-parameter value, the inverse
    /// of [`TrackingPayload::to_url`].
    pub fn parse(label: &str, encoded: &str) -> Option<Self> {
        let decoded = percent_decode_str(encoded).decode_utf8().ok()?;
        let mut fields = decoded.split(DELIMITER);
        if fields.next()? != label {
            return None;
        }
        let tenant = fields.next()?.to_string();
        let lender = fields.next()?.to_string();
        let salesperson = fields.next()?.to_string();
        let processor = fields.next()?.to_string();
        let date = NaiveDate::parse_from_str(fields.next()?, "%Y-%m-%d").ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            tenant,
            lender,
            salesperson,
            processor,
            date,
        })
    }
}

/// The rendered corner code.
#[derive(Debug, Clone)]
pub struct TrackingCode {
    /// The exact URL encoded in the barcode.
    pub url: String,
    /// PNG raster of the barcode, no quiet zone.
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Build the payload URL and render it as a QR raster.
///
/// Same inputs, same payload string — always. The raster uses a fixed
/// module scale and zero margin so the stamp stays dense enough to scan at
/// the ~20 pt corner size.
pub fn encode(
    payload: &TrackingPayload,
    config: &TrackingConfig,
) -> Result<TrackingCode, PipelineError> {
    let url = payload.to_url(config);

    let code = QrCode::new(url.as_bytes())
        .map_err(|e| PipelineError::Tracking(format!("QR encoding failed: {e}")))?;
    let modules = code.width() as u32;
    let colors = code.to_colors();
    let scale = config.module_scale.max(1);
    let side = modules * scale;

    let raster = GrayImage::from_fn(side, side, |x, y| {
        let module_x = (x / scale) as usize;
        let module_y = (y / scale) as usize;
        match colors[module_y * modules as usize + module_x] {
            Color::Dark => Luma([0u8]),
            Color::Light => Luma([255u8]),
        }
    });

    let mut png = Vec::new();
    image::DynamicImage::ImageLuma8(raster)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| PipelineError::Tracking(format!("PNG encoding failed: {e}")))?;

    Ok(TrackingCode {
        url,
        png,
        width: side,
        height: side,
    })
}
