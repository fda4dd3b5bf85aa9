//! Build-id minting
//!
//! The tot service hands out build ids over plain HTTP: a GET against
//! `<base>/vend/<job>` answers with the id as an ASCII integer in the body.
//! The controller makes no uniqueness assumption; duplicate ids simply show
//! up as distinct runs with equal build ids.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildIdError {
    #[error("Request to the build-id service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Build-id service answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Build-id service returned a non-numeric body: {body:?}")]
    Malformed { body: String },
}

#[async_trait]
pub trait BuildIdMinter: Send + Sync {
    async fn mint(&self, job: &str) -> Result<String, BuildIdError>;
}

/// Minter backed by the HTTP tot service
pub struct HttpBuildIdMinter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBuildIdMinter {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BuildIdMinter for HttpBuildIdMinter {
    async fn mint(&self, job: &str) -> Result<String, BuildIdError> {
        let url = format!("{}/vend/{}", self.base_url.trim_end_matches('/'), job);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BuildIdError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let id = body.trim().to_string();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BuildIdError::Malformed { body });
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedBuildIdMinter;

    #[tokio::test]
    async fn test_fixed_minter_vends_configured_id() {
        let minter = FixedBuildIdMinter::new("0987654321");
        assert_eq!(minter.mint("boop").await.unwrap(), "0987654321");
        assert_eq!(minter.calls(), 1);
    }
}
