//! Signed Upload URLs
//!
//! Generates pre-signed upload endpoints for volumes awaiting content. The
//! signature is a hex-encoded HMAC-SHA256 over the metadata and expiry.

use crate::domain::model::{StoragePool, Volume};
use crate::domain::ports::{UploadParams, UploadUrlGenerator};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Upload URL generator signing with a shared key
#[derive(Debug, Clone)]
pub struct SignedUploadUrls {
    host: String,
    key: String,
    validity: Duration,
}

impl SignedUploadUrls {
    pub fn new(host: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            key: key.into(),
            validity: Duration::hours(1),
        }
    }

    fn mac(&self, metadata: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|e| Error::Internal(format!("Invalid upload signing key: {}", e)))?;
        mac.update(metadata.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    fn sign(&self, metadata: &str, expires: i64) -> Result<String> {
        let tag = self.mac(metadata, expires)?.finalize().into_bytes();
        Ok(hex::encode(tag))
    }

    /// Whether `signature` matches `metadata` and the expiry
    pub fn verify(&self, params: &UploadParams) -> bool {
        if params.expires_at <= Utc::now() {
            return false;
        }
        let Ok(tag) = hex::decode(&params.signature) else {
            return false;
        };
        self.mac(&params.metadata, params.expires_at.timestamp())
            .map(|mac| mac.verify_slice(&tag).is_ok())
            .unwrap_or(false)
    }
}

impl Default for SignedUploadUrls {
    fn default() -> Self {
        Self::new("upload.local", "standalone")
    }
}

#[async_trait]
impl UploadUrlGenerator for SignedUploadUrls {
    async fn upload_params(
        &self,
        volume: &Volume,
        pool: &StoragePool,
        format: &str,
        use_https: bool,
    ) -> Result<UploadParams> {
        let scheme = if use_https { "https" } else { "http" };
        let expires_at = Utc::now() + self.validity;

        let metadata = format!(
            "volume={}&pool={}&format={}&size={}",
            urlencoding::encode(&volume.id),
            urlencoding::encode(&pool.id),
            urlencoding::encode(format),
            volume.size_bytes
        );
        let signature = self.sign(&metadata, expires_at.timestamp())?;
        let post_url = format!(
            "{}://{}/upload/{}",
            scheme,
            self.host,
            urlencoding::encode(&volume.id)
        );

        Ok(UploadParams {
            volume_id: volume.id.clone(),
            post_url,
            metadata,
            signature,
            expires_at,
        })
    }
}
