//! # Remote Collaborators
//!
//! HTTP adapters for collaborators that run as separate services.
//!
//! ## Endpoints:
//! - **Transcriber**: `POST <url>` with the raw audio body, answers `{"text": "..."}`
//! - **Generator**: `POST <url>` with `{"input", "history"}`, answers with a streamed
//!   UTF-8 body that is split into words as it arrives
//! - **Synthesizer**: `POST <url>` with `{"text"}`, answers with audio bytes
//! - **Warm-up**: `GET <warm_url>`; an empty warm URL means there is nothing to warm

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::text_stream::words_from_bytes;
use super::{CollaboratorError, Generator, Synthesizer, TokenStream, Transcriber};
use crate::config::{CollaboratorsConfig, EndpointConfig};
use crate::pipeline::history::HistoryEntry;

/// Shared HTTP client for every remote collaborator.
pub fn build_client(config: &CollaboratorsConfig) -> Result<reqwest::Client, CollaboratorError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()?;
    Ok(client)
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CollaboratorError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Clone)]
struct Endpoint {
    client: reqwest::Client,
    config: EndpointConfig,
}

impl Endpoint {
    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    async fn warm(&self) -> Result<(), CollaboratorError> {
        if self.config.warm_url.is_empty() {
            return Ok(());
        }
        debug!(url = %self.config.warm_url, "Warming remote collaborator");
        let response = self.client.get(&self.config.warm_url).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    input: &'a str,
    history: &'a [HistoryEntry],
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
}

pub struct RemoteTranscriber {
    endpoint: Endpoint,
}

impl RemoteTranscriber {
    pub fn new(client: reqwest::Client, config: EndpointConfig) -> Self {
        Self {
            endpoint: Endpoint { client, config },
        }
    }
}

#[async_trait]
impl Transcriber for RemoteTranscriber {
    async fn warm(&self) -> Result<(), CollaboratorError> {
        self.endpoint.warm().await
    }

    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, CollaboratorError> {
        let response = self
            .endpoint
            .client
            .post(&self.endpoint.config.url)
            .timeout(self.endpoint.request_timeout())
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(audio)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
        Ok(body.text.trim().to_string())
    }
}

pub struct RemoteGenerator {
    endpoint: Endpoint,
}

impl RemoteGenerator {
    pub fn new(client: reqwest::Client, config: EndpointConfig) -> Self {
        Self {
            endpoint: Endpoint { client, config },
        }
    }
}

#[async_trait]
impl Generator for RemoteGenerator {
    async fn warm(&self) -> Result<(), CollaboratorError> {
        self.endpoint.warm().await
    }

    /// The request timeout only bounds the response headers; the body streams for as
    /// long as the backend keeps generating.
    async fn generate(
        &self,
        prompt: &str,
        history: &[HistoryEntry],
    ) -> Result<TokenStream, CollaboratorError> {
        let request = GenerationRequest {
            input: prompt,
            history,
        };
        let send = self
            .endpoint
            .client
            .post(&self.endpoint.config.url)
            .json(&request)
            .send();
        let response = tokio::time::timeout(self.endpoint.request_timeout(), send)
            .await
            .map_err(|_| CollaboratorError::Unavailable("generator did not respond".into()))??;
        let response = ensure_success(response).await?;

        Ok(words_from_bytes(Box::pin(response.bytes_stream())).boxed())
    }
}

pub struct RemoteSynthesizer {
    endpoint: Endpoint,
}

impl RemoteSynthesizer {
    pub fn new(client: reqwest::Client, config: EndpointConfig) -> Self {
        Self {
            endpoint: Endpoint { client, config },
        }
    }
}

#[async_trait]
impl Synthesizer for RemoteSynthesizer {
    async fn warm(&self) -> Result<(), CollaboratorError> {
        self.endpoint.warm().await
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError> {
        let response = self
            .endpoint
            .client
            .post(&self.endpoint.config.url)
            .timeout(self.endpoint.request_timeout())
            .json(&SynthesisRequest { text })
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(CollaboratorError::InvalidResponse(
                "synthesizer returned no audio".into(),
            ));
        }
        Ok(audio.to_vec())
    }
}
