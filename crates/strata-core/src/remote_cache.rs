//! Remote cache backend - S3/R2
//!
//! Optional second tier behind the local store: entries are uploaded in
//! the background after a local write and downloaded on a local miss.
//! Configured from ~/.strata/config.json; absent config disables it.

use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StrataError};

const SIGN_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemoteCacheSettings {
    pub s3: Option<S3Settings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Settings file path (~/.strata/config.json)
pub fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strata")
        .join("config.json")
}

pub fn load_settings() -> Result<RemoteCacheSettings> {
    let path = settings_path();
    if !path.exists() {
        return Ok(RemoteCacheSettings::default());
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

#[derive(Clone)]
pub struct RemoteCache {
    bucket: Bucket,
    credentials: Credentials,
    client: reqwest::Client,
}

impl RemoteCache {
    pub fn from_settings(settings: &S3Settings) -> Result<Self> {
        let endpoint = settings
            .endpoint
            .parse()
            .map_err(|_| StrataError::Config(format!("invalid endpoint URL: {}", settings.endpoint)))?;
        let bucket = Bucket::new(
            endpoint,
            UrlStyle::Path,
            settings.bucket.clone(),
            settings.region.clone(),
        )
        .map_err(|e| StrataError::Config(format!("invalid bucket config: {e}")))?;
        let credentials =
            Credentials::new(settings.access_key.clone(), settings.secret_key.clone());

        Ok(Self {
            bucket,
            credentials,
            client: reqwest::Client::new(),
        })
    }

    /// None when no remote cache is configured and enabled
    pub fn try_new() -> Result<Option<Self>> {
        let settings = load_settings()?;
        match settings.s3 {
            Some(s3) if s3.enabled && !s3.endpoint.is_empty() => {
                tracing::debug!(bucket = %s3.bucket, "remote cache enabled");
                Ok(Some(Self::from_settings(&s3)?))
            }
            _ => Ok(None),
        }
    }

    fn key(hash: &str) -> String {
        format!("artifacts/{hash}")
    }

    pub async fn upload(&self, hash: &str, data: Vec<u8>) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &Self::key(hash))
            .sign(SIGN_TTL);

        self.client
            .put(url)
            .body(data)
            .send()
            .await
            .map_err(|e| StrataError::Config(format!("remote cache upload failed: {e}")))?;
        tracing::debug!(hash, "uploaded cache entry");
        Ok(())
    }

    pub async fn download(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &Self::key(hash))
            .sign(SIGN_TTL);

        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(hash, "remote cache unreachable: {e}");
                return Ok(None);
            }
        };
        if !resp.status().is_success() {
            return Ok(None);
        }
        let data = resp
            .bytes()
            .await
            .map_err(|e| StrataError::Config(format!("remote cache read failed: {e}")))?;
        tracing::debug!(hash, "downloaded cache entry");
        Ok(Some(data.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_path_is_under_home_dot_strata() {
        let path = settings_path();
        assert!(path.to_string_lossy().contains(".strata"));
        assert!(path.to_string_lossy().ends_with("config.json"));
    }

    #[test]
    fn settings_roundtrip() {
        let settings = RemoteCacheSettings {
            s3: Some(S3Settings {
                endpoint: "https://s3.example.com".into(),
                bucket: "strata-cache".into(),
                region: "auto".into(),
                access_key: "key".into(),
                secret_key: "secret".into(),
                enabled: true,
            }),
        };
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: RemoteCacheSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.s3.unwrap().bucket, "strata-cache");
    }

    #[test]
    fn disabled_settings_yield_no_backend() {
        let settings = S3Settings {
            endpoint: String::new(),
            bucket: String::new(),
            region: "auto".into(),
            access_key: String::new(),
            secret_key: String::new(),
            enabled: false,
        };
        // from_settings rejects an empty endpoint
        assert!(RemoteCache::from_settings(&settings).is_err());
    }
}
