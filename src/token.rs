//! Credential tokens: a QR image pointing back at an on-chain agreement.
//!
//! The token is a convenience pointer, never a source of truth. Whoever scans
//! it still has to read the agreement from the ledger.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use alloy::primitives::Address;
use image::{GrayImage, Luma};
use qrcode::{Color, EcLevel, QrCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agreement::AgreementId;
use crate::config::TokenConfig;

/// Pixels per QR module.
const MODULE_PX: u32 = 10;
/// Quiet zone around the symbol, in modules.
const QUIET_ZONE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialToken {
    pub contract_address: Address,
    pub agreement_id: AgreementId,
    pub landlord: Address,
    pub tenant: Address,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("could not encode credential token: {0}")]
    Encode(String),

    #[error("uploaded file is not a readable image: {0}")]
    InvalidImage(String),

    #[error("no QR code found in image")]
    NoCode,

    #[error("invalid credential token: {0}")]
    Payload(String),

    #[error("token storage failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("token worker failed: {0}")]
    Worker(String),
}

impl TokenError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Encode(_) => "token_encode",
            Self::InvalidImage(_) => "invalid_image",
            Self::NoCode => "token_not_found",
            Self::Payload(_) => "invalid_token",
            Self::Storage(_) => "token_storage",
            Self::Worker(_) => "token_worker",
        }
    }

    /// Failures caused by what the caller uploaded.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidImage(_) | Self::NoCode | Self::Payload(_))
    }
}

/// Renders `payload` as a black-on-white QR symbol.
pub fn render(payload: &str) -> Result<GrayImage, TokenError> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::L)
        .map_err(|e| TokenError::Encode(e.to_string()))?;
    let width = code.width() as u32;
    let colors = code.to_colors();
    let side = (width + 2 * QUIET_ZONE) * MODULE_PX;

    Ok(GrayImage::from_fn(side, side, |x, y| {
        let (mx, my) = (x / MODULE_PX, y / MODULE_PX);
        let inside = (QUIET_ZONE..QUIET_ZONE + width).contains(&mx)
            && (QUIET_ZONE..QUIET_ZONE + width).contains(&my);
        let dark = inside
            && colors[((my - QUIET_ZONE) * width + (mx - QUIET_ZONE)) as usize] == Color::Dark;
        Luma([if dark { 0 } else { 255 }])
    }))
}

/// Finds the first QR symbol in a PNG/JPEG upload and parses its payload.
pub fn decode(image_bytes: &[u8]) -> Result<CredentialToken, TokenError> {
    let grey = image::load_from_memory(image_bytes)
        .map_err(|e| TokenError::InvalidImage(e.to_string()))?
        .to_luma8();
    let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
        grey.width() as usize,
        grey.height() as usize,
        |x, y| grey.get_pixel(x as u32, y as u32)[0],
    );
    let grids = prepared.detect_grids();
    let grid = grids.first().ok_or(TokenError::NoCode)?;
    let (_, content) = grid.decode().map_err(|e| TokenError::Payload(format!("{e:?}")))?;

    serde_json::from_str(&content).map_err(|e| TokenError::Payload(e.to_string()))
}

/// Token images on local disk, one uniquely named PNG per issued token.
pub struct TokenStore {
    dir: PathBuf,
    retention: Option<Duration>,
}

impl TokenStore {
    pub fn new(config: &TokenConfig) -> Self {
        Self { dir: config.dir.clone(), retention: config.retention() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the token image and returns its path.
    pub async fn issue(&self, token: &CredentialToken) -> Result<PathBuf, TokenError> {
        let payload = serde_json::to_string(token).map_err(|e| TokenError::Encode(e.to_string()))?;
        let path = self.dir.join(format!("{}.png", Uuid::new_v4()));

        let dir = self.dir.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TokenError> {
            std::fs::create_dir_all(&dir)?;
            render(&payload)?
                .save(&target)
                .map_err(|e| TokenError::Encode(format!("could not write png: {e}")))
        })
        .await
        .map_err(|e| TokenError::Worker(e.to_string()))??;

        info!(path = %path.display(), agreement_id = %token.agreement_id, "credential token issued");

        if self.retention.is_some() {
            if let Err(e) = self.prune_expired(Some(&path)).await {
                warn!(error = %e, "opportunistic token pruning failed");
            }
        }
        Ok(path)
    }

    pub async fn read(&self, image_bytes: Vec<u8>) -> Result<CredentialToken, TokenError> {
        tokio::task::spawn_blocking(move || decode(&image_bytes))
            .await
            .map_err(|e| TokenError::Worker(e.to_string()))?
    }

    /// Deletes token images older than the retention window. Returns how many
    /// were removed; without a retention window nothing is ever removed.
    pub async fn prune(&self) -> Result<usize, TokenError> {
        self.prune_expired(None).await
    }

    async fn prune_expired(&self, keep: Option<&Path>) -> Result<usize, TokenError> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if Some(path.as_path()) == keep || path.extension().map_or(true, |ext| ext != "png") {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= retention {
                tokio::fs::remove_file(&path).await?;
                debug!(path = %path.display(), age_secs = age.as_secs(), "pruned credential token");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "pruned expired credential tokens");
        }
        Ok(removed)
    }

    /// Prunes on a fixed interval until the task is aborted.
    pub fn spawn_pruning(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                if let Err(e) = self.prune().await {
                    warn!(error = %e, "token pruning failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;
    use std::io::Cursor;

    fn token() -> CredentialToken {
        CredentialToken {
            contract_address: Address::repeat_byte(0xc0),
            agreement_id: AgreementId::new(B256::repeat_byte(0x42)),
            landlord: Address::repeat_byte(0xaa),
            tenant: Address::repeat_byte(0xbb),
        }
    }

    fn png(image: &GrayImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("lease-ledger-tokens-{}", Uuid::new_v4()))
    }

    fn store(dir: &Path, retention_secs: Option<u64>) -> TokenStore {
        TokenStore::new(&TokenConfig {
            dir: dir.to_path_buf(),
            retention_secs,
            prune_interval_secs: 3600,
        })
    }

    #[test]
    fn rendered_token_scans_back() {
        let payload = serde_json::to_string(&token()).unwrap();
        let image = render(&payload).unwrap();
        assert_eq!(image.width() % MODULE_PX, 0);
        assert_eq!(decode(&png(&image)).unwrap(), token());
    }

    #[test]
    fn payload_uses_hex_strings() {
        let json = serde_json::to_value(token()).unwrap();
        assert_eq!(json["agreement_id"], format!("0x{}", "42".repeat(32)));
        let contract = json["contract_address"].as_str().unwrap().to_ascii_lowercase();
        assert_eq!(contract, format!("0x{}", "c0".repeat(20)));
    }

    #[test]
    fn blank_image_has_no_code() {
        let blank = GrayImage::from_pixel(200, 200, Luma([255]));
        let err = decode(&png(&blank)).unwrap_err();
        assert!(matches!(err, TokenError::NoCode));
        assert!(err.is_client_error());
    }

    #[test]
    fn non_token_qr_is_rejected() {
        let image = render("https://example.com").unwrap();
        assert!(matches!(decode(&png(&image)).unwrap_err(), TokenError::Payload(_)));
    }

    #[test]
    fn garbage_bytes_are_not_an_image() {
        let err = decode(b"definitely not a png").unwrap_err();
        assert_eq!(err.kind(), "invalid_image");
    }

    #[tokio::test]
    async fn issued_tokens_are_unique_files() {
        let dir = scratch_dir();
        let store = store(&dir, None);

        let first = store.issue(&token()).await.unwrap();
        let second = store.issue(&token()).await.unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(&dir));

        let bytes = tokio::fs::read(&first).await.unwrap();
        assert_eq!(store.read(bytes).await.unwrap(), token());
        assert_eq!(store.prune().await.unwrap(), 0);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn expired_tokens_are_pruned() {
        let dir = scratch_dir();
        let store = store(&dir, Some(0));

        let first = store.issue(&token()).await.unwrap();
        let second = store.issue(&token()).await.unwrap();
        assert!(!first.exists(), "older token should be pruned on issue");
        assert!(second.exists());

        assert_eq!(store.prune().await.unwrap(), 1);
        assert!(!second.exists());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn pruning_a_missing_dir_is_a_no_op() {
        let store = store(&scratch_dir(), Some(60));
        assert_eq!(store.prune().await.unwrap(), 0);
    }
}
