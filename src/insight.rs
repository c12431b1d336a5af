//! Best-effort document insight from an image captioning model.
//!
//! The model only produces a free-text caption; everything "extracted" here is
//! a keyword window over that caption and should be read as a hint.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

use crate::config::InsightConfig;
use crate::utils::hash_bytes;

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("document analysis is not configured")]
    Unavailable,

    #[error("uploaded document is not a readable image: {0}")]
    InvalidImage(String),

    #[error("caption model failed: {0}")]
    Upstream(String),
}

impl InsightError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable => "insight_unavailable",
            Self::InvalidImage(_) => "invalid_image",
            Self::Upstream(_) => "insight_upstream",
        }
    }
}

/// Anything that can caption an image.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptionModel: Send + Sync {
    async fn caption(&self, image: Vec<u8>) -> Result<String, InsightError>;
}

#[derive(Debug, Deserialize)]
struct CaptionOutput {
    generated_text: String,
}

/// Caption model behind an HTTP inference endpoint.
pub struct HttpCaptioner {
    client: reqwest::Client,
    endpoint: Url,
    api_token: Option<Secret<String>>,
}

impl HttpCaptioner {
    pub fn new(config: &InsightConfig) -> Result<Self, InsightError> {
        let endpoint = config.caption_endpoint.as_deref().ok_or(InsightError::Unavailable)?;
        let endpoint = Url::parse(endpoint)
            .map_err(|e| InsightError::Upstream(format!("invalid caption endpoint {endpoint:?}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(upstream)?;

        Ok(Self { client, endpoint, api_token: config.api_token.clone() })
    }
}

#[async_trait]
impl CaptionModel for HttpCaptioner {
    async fn caption(&self, image: Vec<u8>) -> Result<String, InsightError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(image);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let outputs: Vec<CaptionOutput> = request
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?
            .json()
            .await
            .map_err(upstream)?;

        outputs
            .into_iter()
            .next()
            .map(|output| output.generated_text.trim().to_string())
            .ok_or_else(|| InsightError::Upstream("caption response was empty".into()))
    }
}

fn upstream(err: reqwest::Error) -> InsightError {
    InsightError::Upstream(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Lease,
    Id,
    Unknown,
}

impl DocumentKind {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "lease" => Self::Lease,
            "id" => Self::Id,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lease => "lease",
            Self::Id => "id",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentAnalysis {
    pub caption: String,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    pub extracted_info: BTreeMap<String, String>,
    /// SHA-256 of the uploaded bytes.
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityVerification {
    pub verified: bool,
    pub confidence: f64,
    pub extracted_info: BTreeMap<String, String>,
    pub id_type: String,
    pub verification_method: &'static str,
}

const IDENTITY_FIELDS: [&str; 3] = ["name", "id_number", "date_of_birth"];

/// Up to `len` characters of `caption` starting at the first of `keywords`
/// found (case-insensitive), tried in order.
fn window(caption: &str, keywords: &[&str], len: usize) -> Option<String> {
    let lowered = caption.to_ascii_lowercase();
    keywords
        .iter()
        .find_map(|keyword| lowered.find(keyword))
        .map(|start| caption[start..].chars().take(len).collect())
}

fn extract(caption: &str, kind: DocumentKind) -> BTreeMap<String, String> {
    let rules: &[(&str, &[&str], usize)] = match kind {
        DocumentKind::Lease => &[
            ("property_address", &["address"], 100),
            ("rent_amount", &["rent"], 50),
            ("lease_term", &["term", "duration"], 50),
        ],
        DocumentKind::Id => &[
            ("name", &["name"], 50),
            ("id_number", &["number", "id"], 30),
            ("date_of_birth", &["birth", "dob"], 30),
        ],
        DocumentKind::Unknown => &[],
    };
    rules
        .iter()
        .filter_map(|(field, keywords, len)| window(caption, keywords, *len).map(|text| (field.to_string(), text)))
        .collect()
}

/// Document analysis with a lazily built, shared caption model.
pub struct DocumentInsight {
    config: InsightConfig,
    model: OnceCell<Arc<dyn CaptionModel>>,
}

impl DocumentInsight {
    pub fn new(config: InsightConfig) -> Self {
        Self { config, model: OnceCell::new() }
    }

    pub fn with_model(config: InsightConfig, model: Arc<dyn CaptionModel>) -> Self {
        Self { config, model: OnceCell::new_with(Some(model)) }
    }

    async fn model(&self) -> Result<Arc<dyn CaptionModel>, InsightError> {
        self.model
            .get_or_try_init(|| async {
                let model: Arc<dyn CaptionModel> = Arc::new(HttpCaptioner::new(&self.config)?);
                info!("caption model client initialized");
                Ok(model)
            })
            .await
            .cloned()
    }

    pub async fn analyze_document(&self, image: Vec<u8>, kind: DocumentKind) -> Result<DocumentAnalysis, InsightError> {
        let fingerprint = hash_bytes(&image);
        let image = validate_image(image).await?;
        let caption = self.model().await?.caption(image).await?;
        debug!(%kind, %fingerprint, caption = %caption, "document captioned");

        Ok(DocumentAnalysis { extracted_info: extract(&caption, kind), caption, kind, fingerprint })
    }

    pub async fn verify_identity(&self, image: Vec<u8>, id_type: &str) -> Result<IdentityVerification, InsightError> {
        let analysis = self.analyze_document(image, DocumentKind::Id).await?;
        let found = IDENTITY_FIELDS
            .iter()
            .filter(|field| analysis.extracted_info.contains_key(**field))
            .count();

        info!(id_type, found, "identity document analyzed");
        Ok(IdentityVerification {
            verified: found > 0,
            confidence: found as f64 / IDENTITY_FIELDS.len() as f64,
            extracted_info: analysis.extracted_info,
            id_type: id_type.to_string(),
            verification_method: "AI document analysis",
        })
    }
}

/// Rejects uploads that do not decode as an image.
async fn validate_image(image: Vec<u8>) -> Result<Vec<u8>, InsightError> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&image)
            .map(|_| image)
            .map_err(|e| InsightError::InvalidImage(e.to_string()))
    })
    .await
    .map_err(|e| InsightError::Upstream(format!("image check failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::io::Cursor;

    fn png() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        GrayImage::from_pixel(4, 4, Luma([200]))
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn insight_with_caption(caption: &'static str) -> DocumentInsight {
        let mut model = MockCaptionModel::new();
        model.expect_caption().times(1).returning(move |_| Ok(caption.to_string()));
        DocumentInsight::with_model(InsightConfig::default(), Arc::new(model))
    }

    #[test]
    fn lease_fields_are_keyword_windows() {
        let info = extract(
            "a lease listing the Address 12 Harbour Road, monthly rent of 1500 and a term of one year",
            DocumentKind::Lease,
        );
        assert!(info["property_address"].starts_with("Address 12 Harbour Road"));
        assert_eq!(info["rent_amount"], "rent of 1500 and a term of one year");
        assert_eq!(info["lease_term"], "term of one year");
    }

    #[test]
    fn id_fields_fall_back_to_secondary_keywords() {
        let info = extract("a card with id AB123 and dob 1990", DocumentKind::Id);
        assert_eq!(info["id_number"], "id AB123 and dob 1990");
        assert_eq!(info["date_of_birth"], "dob 1990");
        assert!(!info.contains_key("name"));
    }

    #[test]
    fn windows_are_bounded_and_char_safe() {
        let caption = format!("name {}", "é".repeat(80));
        let text = window(&caption, &["name"], 50).unwrap();
        assert_eq!(text.chars().count(), 50);
    }

    #[test]
    fn unknown_kinds_extract_nothing() {
        assert_eq!(DocumentKind::parse("Invoice"), DocumentKind::Unknown);
        assert!(extract("rent address term", DocumentKind::Unknown).is_empty());
    }

    #[tokio::test]
    async fn analysis_carries_caption_and_fingerprint() {
        let bytes = png();
        let analysis = insight_with_caption("a rental agreement with rent 900")
            .analyze_document(bytes.clone(), DocumentKind::Lease)
            .await
            .unwrap();
        assert_eq!(analysis.kind, DocumentKind::Lease);
        assert_eq!(analysis.fingerprint, hash_bytes(&bytes));
        assert_eq!(analysis.extracted_info["rent_amount"], "rent 900");

        let json = serde_json::to_value(&analysis).unwrap();
        assert_eq!(json["type"], "lease");
    }

    #[tokio::test]
    async fn non_images_never_reach_the_model() {
        let mut model = MockCaptionModel::new();
        model.expect_caption().never();
        let insight = DocumentInsight::with_model(InsightConfig::default(), Arc::new(model));

        let err = insight.analyze_document(b"%PDF-1.7".to_vec(), DocumentKind::Lease).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_image");
    }

    #[tokio::test]
    async fn missing_endpoint_is_unavailable() {
        let insight = DocumentInsight::new(InsightConfig::default());
        let err = insight.analyze_document(png(), DocumentKind::Id).await.unwrap_err();
        assert!(matches!(err, InsightError::Unavailable));
    }

    #[tokio::test]
    async fn identity_confidence_counts_fields() {
        let verification = insight_with_caption("a passport showing name JANE DOE and number X1234567")
            .verify_identity(png(), "passport")
            .await
            .unwrap();
        assert!(verification.verified);
        assert!((verification.confidence - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(verification.id_type, "passport");

        let verification = insight_with_caption("a blurry photo of a desk")
            .verify_identity(png(), "passport")
            .await
            .unwrap();
        assert!(!verification.verified);
        assert_eq!(verification.confidence, 0.0);
    }
}
