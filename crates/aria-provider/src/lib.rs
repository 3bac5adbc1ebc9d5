//! Speech-provider collaborator.
//!
//! The provider is a black box reached two ways: an HTTP voice-management
//! API (clone a voice from sample audio, delete a voice) and a per-session
//! bidirectional WebSocket that carries the actual audio stream.
//!
//! [`SpeechProvider`] is the seam the slot manager programs against; the
//! production implementation is [`HttpSpeechProvider`]. Tests substitute
//! their own implementations to simulate provider failures without any
//! network.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::http::HeaderValue,
    MaybeTlsStream, WebSocketStream,
};

/// Errors from provider calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected request: {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("provider returned an unusable response: {0}")]
    BadResponse(String),

    #[error("provider websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid provider configuration: {0}")]
    Config(String),
}

/// Connection settings for the speech provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API key sent in the `xi-api-key` header.
    pub api_key: String,
    /// HTTP base URL, e.g. `https://api.example-speech.io/v1`.
    pub base_url: String,
    /// WebSocket base URL, e.g. `wss://api.example-speech.io/v1`.
    pub ws_base_url: String,
}

/// The outbound streaming leg to the provider.
pub type VoiceStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Voice-management operations used by slot creation and eviction.
///
/// Implementations must treat `delete_voice` as best-effort from the
/// caller's point of view: the slot manager logs failures and proceeds on
/// local state.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Clones a voice from sample audio, returning the provider's voice
    /// handle.
    async fn clone_voice(&self, name: &str, sample: Vec<u8>) -> Result<String, ProviderError>;

    /// Deletes a cloned voice upstream.
    async fn delete_voice(&self, voice_id: &str) -> Result<(), ProviderError>;
}

#[derive(Debug, Deserialize)]
struct CloneVoiceResponse {
    voice_id: String,
}

/// Production provider client over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpSpeechProvider {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl HttpSpeechProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Opens the per-session audio stream for a cloned voice.
    ///
    /// Negotiated once per relay session, after slot acquisition. The API
    /// key travels in a header, never in the URL.
    pub async fn connect_stream(&self, voice_id: &str) -> Result<VoiceStream, ProviderError> {
        let url = format!("{}/voice-stream/{}", self.config.ws_base_url, voice_id);
        let mut request = url
            .into_client_request()
            .map_err(|e| ProviderError::Config(format!("bad websocket url: {e}")))?;
        request.headers_mut().insert(
            "xi-api-key",
            HeaderValue::from_str(&self.config.api_key)
                .map_err(|_| ProviderError::Config("api key contains invalid bytes".into()))?,
        );

        let (stream, _response) = connect_async(request).await?;
        tracing::info!(voice_id = %voice_id, "connected provider voice stream");
        Ok(stream)
    }
}

#[async_trait]
impl SpeechProvider for HttpSpeechProvider {
    async fn clone_voice(&self, name: &str, sample: Vec<u8>) -> Result<String, ProviderError> {
        let form = reqwest::multipart::Form::new()
            .text("name", name.to_string())
            .part(
                "files",
                reqwest::multipart::Part::bytes(sample).file_name("voice.mp3"),
            );

        let response = self
            .http
            .post(format!("{}/voices/add", self.config.base_url))
            .header("xi-api-key", &self.config.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CloneVoiceResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        if parsed.voice_id.is_empty() {
            return Err(ProviderError::BadResponse("empty voice_id".into()));
        }

        tracing::info!(voice_id = %parsed.voice_id, name = %name, "cloned provider voice");
        Ok(parsed.voice_id)
    }

    async fn delete_voice(&self, voice_id: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(format!("{}/voices/{}", self.config.base_url, voice_id))
            .header("xi-api-key", &self.config.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(voice_id = %voice_id, "deleted provider voice");
        Ok(())
    }
}
