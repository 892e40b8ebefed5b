//! # EIDO Retrieval Client
//!
//! Fetches one EIDO by reference id from a notifier's retrieval route. Built
//! on `reqwest` with `reqwest-middleware`, retrying transient failures with
//! exponential backoff.

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Url;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use thiserror::Error;

use crate::eido::EidoDocument;
use crate::retrieve::eido_retrieval::EIDO_CONTENT_TYPE;

/// Errors raised by [`EidoRetrievalClient`].
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// The base URL could not be parsed or joined.
    #[error("Invalid retrieval URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The reference id was empty.
    #[error("Reference id must not be empty")]
    EmptyReference,
    /// The request failed after retries.
    #[error("Request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),
    /// The notifier answered with a non-success status.
    #[error("Notifier answered {status}")]
    Status {
        /// HTTP status.
        status: u16,
    },
    /// The body was not an EIDO.
    #[error("Invalid EIDO body: {0}")]
    Body(String),
}

/// HTTP client for a notifier's retrieval route.
#[derive(Debug, Clone)]
pub struct EidoRetrievalClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl EidoRetrievalClient {
    /// A client for `base_url`, e.g. `https://notifier:8443/incidents/eidos`,
    /// retrying up to `max_retries` times.
    pub fn new(base_url: &str, auth_token: Option<String>, max_retries: u32) -> Result<Self, RetrievalError> {
        let mut url = Url::parse(base_url)?;
        // Url::join replaces the last segment unless the base ends in '/'.
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { inner: client, base_url: url, auth_token })
    }

    /// The URL an id resolves to.
    pub fn url_for(&self, reference_id: &str) -> Result<Url, RetrievalError> {
        if reference_id.is_empty() {
            return Err(RetrievalError::EmptyReference);
        }
        Ok(self.base_url.join(reference_id)?)
    }

    /// Fetches the EIDO with `reference_id`.
    pub async fn fetch(&self, reference_id: &str) -> Result<EidoDocument, RetrievalError> {
        let url = self.url_for(reference_id)?;
        let mut req = self.inner.get(url.clone()).header(ACCEPT, EIDO_CONTENT_TYPE);
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            log::warn!("Retrieval of {} answered {}", url, status);
            return Err(RetrievalError::Status { status: status.as_u16() });
        }
        let text = response
            .text()
            .await
            .map_err(|e| RetrievalError::Body(e.to_string()))?;
        EidoDocument::from_json(&text).map_err(|e| RetrievalError::Body(e.to_string()))
    }
}
