//! Request model for the watermark endpoint

use axum::extract::Multipart;
use tidemark_core::Counterparties;

use crate::error::ApiError;

/// A parsed watermark request. Field names follow the multipart form
/// convention partner integrations already use: `file`, `user_email`,
/// `lender`, `salesperson`, `processor`, `state`.
#[derive(Debug)]
pub struct WatermarkRequest {
    pub file_name: String,
    pub document: Vec<u8>,
    pub email: String,
    pub parties: Counterparties,
    /// Two-letter code or full state name, for the disclaimer header.
    pub state: Option<String>,
}

impl WatermarkRequest {
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut file_name = None;
        let mut document = None;
        let mut email = None;
        let mut parties = Counterparties::default();
        let mut state = None;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::InvalidRequest(format!("Malformed multipart body: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    file_name = Some(
                        field
                            .file_name()
                            .unwrap_or("document.pdf")
                            .to_string(),
                    );
                    let bytes = field.bytes().await.map_err(|e| {
                        ApiError::InvalidRequest(format!("Failed to read file: {}", e))
                    })?;
                    document = Some(bytes.to_vec());
                }
                "user_email" => email = text_field(field, &name).await?,
                "lender" => parties.lender = text_field(field, &name).await?,
                "salesperson" => parties.salesperson = text_field(field, &name).await?,
                "processor" => parties.processor = text_field(field, &name).await?,
                "state" => state = text_field(field, &name).await?,
                // Unknown fields are ignored so partners can send extras.
                _ => {}
            }
        }

        let document = document
            .ok_or_else(|| ApiError::InvalidRequest("Missing file or user_email".to_string()))?;
        let email = email
            .ok_or_else(|| ApiError::InvalidRequest("Missing file or user_email".to_string()))?;

        Ok(Self {
            file_name: file_name.unwrap_or_else(|| "document.pdf".to_string()),
            document,
            email,
            parties,
            state,
        })
    }

    /// Download filename: the upload's stem plus a " - protected" suffix.
    /// Quotes and non-ASCII are dropped so the value stays a valid
    /// Content-Disposition header.
    pub fn delivery_filename(&self) -> String {
        let stem = self
            .file_name
            .strip_suffix(".pdf")
            .or_else(|| self.file_name.strip_suffix(".PDF"))
            .unwrap_or(&self.file_name);
        let clean: String = stem
            .chars()
            .filter(|c| c.is_ascii() && !c.is_ascii_control() && *c != '"' && *c != '\\')
            .collect();
        let clean = clean.trim();
        if clean.is_empty() {
            "document - protected.pdf".to_string()
        } else {
            format!("{} - protected.pdf", clean)
        }
    }
}

/// A trimmed text field, treating empty values as absent.
async fn text_field(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<Option<String>, ApiError> {
    let value = field
        .text()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("Failed to read {}: {}", name, e)))?;
    let trimmed = value.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}
