//! Service client.
//!
//! [`Client`] bundles the credentials, the HTTP client used for one-shot
//! conversion and the connection pool shared by realtime sessions. It is
//! cheap to clone; clones share the pool.

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use futures::stream::BoxStream;
use http::{HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::core::realtime::{
    ConnectionPool, DirectConnection, PoolKey, RealtimeError, RealtimeSession, Transport,
    WsTransport,
};
use crate::core::tts::convert::{self, MODEL_HEADER};
use crate::core::tts::{TtsRequest, build_convert_request};
use crate::errors::{ClientError, ClientResult};

/// Path of the realtime endpoint, relative to the base URL.
pub const LIVE_PATH: &str = "/v1/tts/live";

/// Backend used when the caller does not pick one.
pub const DEFAULT_BACKEND: &str = "s1";

/// Realtime endpoint for `base_url`: `http` becomes `ws`, `https` becomes
/// `wss`.
pub fn live_url(base_url: &str) -> ClientResult<String> {
    let base = base_url.trim_end_matches('/');
    let (scheme, rest) = if let Some(rest) = base.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        ("ws", rest)
    } else if let Some(rest) = base.strip_prefix("wss://") {
        ("wss", rest)
    } else if let Some(rest) = base.strip_prefix("ws://") {
        ("ws", rest)
    } else {
        return Err(ClientError::InvalidUrl(format!(
            "unsupported scheme in base URL '{base_url}'"
        )));
    };
    if rest.is_empty() {
        return Err(ClientError::InvalidUrl(format!(
            "missing host in base URL '{base_url}'"
        )));
    }
    Ok(format!("{scheme}://{rest}{LIVE_PATH}"))
}

/// Handshake headers: bearer authorization and backend selection.
pub fn realtime_headers(api_key: &str, backend: &str) -> ClientResult<HeaderMap> {
    let invalid = |e: http::header::InvalidHeaderValue| {
        ClientError::Request(format!("Invalid header value: {e}"))
    };

    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(invalid)?;
    auth.set_sensitive(true);
    headers.insert(http::header::AUTHORIZATION, auth);
    headers.insert(MODEL_HEADER, HeaderValue::from_str(backend).map_err(invalid)?);
    Ok(headers)
}

#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    http: reqwest::Client,
    pool: Arc<ConnectionPool<WsTransport>>,
}

impl Client {
    /// Validates `config` and builds a client around it.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::Request(format!("Failed to build HTTP client: {e}")))?;
        let pool = Arc::new(ConnectionPool::new(config.pool_config()));

        info!(
            base_url = %config.base_url(),
            pooling = config.pooling,
            max_conns_per_key = config.max_conns_per_key,
            "Fish Audio client created"
        );
        Ok(Self { config, http, pool })
    }

    /// Builds a client from `FISH_*` environment variables.
    pub fn from_env() -> ClientResult<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool<WsTransport> {
        &self.pool
    }

    /// Pool key a realtime request with `backend` would use.
    pub fn pool_key(&self, request: &TtsRequest, backend: &str) -> PoolKey {
        PoolKey::new(
            self.config.base_url(),
            backend,
            request.format.as_ref().map(|f| f.as_str()),
            request.reference_id.as_deref(),
        )
    }

    // =========================================================================
    // One-shot conversion
    // =========================================================================

    /// Synthesizes `request` in one HTTP call and returns the whole body.
    pub async fn convert(&self, request: &TtsRequest, backend: &str) -> ClientResult<Bytes> {
        let builder = build_convert_request(
            &self.http,
            self.config.base_url(),
            &self.config.api_key,
            backend,
            request,
        )?;
        convert::convert(builder).await
    }

    /// Synthesizes `request` in one HTTP call and streams the body.
    pub async fn convert_stream(
        &self,
        request: &TtsRequest,
        backend: &str,
    ) -> ClientResult<BoxStream<'static, ClientResult<Bytes>>> {
        let builder = build_convert_request(
            &self.http,
            self.config.base_url(),
            &self.config.api_key,
            backend,
            request,
        )?;
        convert::convert_stream(builder).await
    }

    // =========================================================================
    // Realtime
    // =========================================================================

    /// Opens a realtime session that synthesizes each fragment of `texts`.
    pub async fn convert_realtime<S>(
        &self,
        request: TtsRequest,
        texts: S,
        backend: &str,
    ) -> ClientResult<RealtimeSession>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        self.convert_realtime_with_cancel(request, texts, backend, &CancellationToken::new())
            .await
    }

    /// Like [`convert_realtime`](Self::convert_realtime). `cancel` aborts
    /// only the dial or pool wait, never the opened session.
    pub async fn convert_realtime_with_cancel<S>(
        &self,
        request: TtsRequest,
        texts: S,
        backend: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<RealtimeSession>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let url = live_url(self.config.base_url())?;
        let headers = realtime_headers(&self.config.api_key, backend)?;
        let transport_options = self.config.transport_options();
        let session_options = self.config.session_options();

        if self.config.pooling {
            let key = self.pool_key(&request, backend);
            debug!(key = %key, "Acquiring pooled realtime connection");
            let lease = self
                .pool
                .acquire(&key, cancel, || {
                    let url = url.clone();
                    let headers = headers.clone();
                    async move { WsTransport::connect(&url, headers, transport_options).await }
                })
                .await
                .map_err(RealtimeError::from)?;

            let transport: Arc<dyn Transport> = lease.connection().clone();
            let session =
                RealtimeSession::open(transport, Box::new(lease), request, texts, session_options)
                    .await?;
            return Ok(session);
        }

        debug!(url = %url, "Dialing direct realtime connection");
        let transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RealtimeError::Cancelled.into()),
            dialed = WsTransport::connect(&url, headers, transport_options) => {
                dialed.map_err(RealtimeError::from)?
            }
        };
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let control = Box::new(DirectConnection::new(transport.clone()));
        let session =
            RealtimeSession::open(transport, control, request, texts, session_options).await?;
        Ok(session)
    }

    /// Closes every pooled connection and stops the reaper.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("connections", &self.pool.total_connections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tts::AudioFormat;
    use futures::stream;

    #[test]
    fn test_live_url() {
        assert_eq!(
            live_url("https://api.fish.audio").unwrap(),
            "wss://api.fish.audio/v1/tts/live"
        );
        assert_eq!(
            live_url("http://127.0.0.1:8080/").unwrap(),
            "ws://127.0.0.1:8080/v1/tts/live"
        );
        assert_eq!(
            live_url("ws://localhost:9000").unwrap(),
            "ws://localhost:9000/v1/tts/live"
        );
        assert!(matches!(
            live_url("ftp://example.com"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(live_url("https://").is_err());
    }

    #[test]
    fn test_realtime_headers() {
        let headers = realtime_headers("test-api-key", "speech-1.6").unwrap();
        let auth = headers.get("authorization").unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer test-api-key");
        assert!(auth.is_sensitive());
        assert_eq!(headers.get("model").unwrap().to_str().unwrap(), "speech-1.6");

        assert!(realtime_headers("bad\nkey", "s1").is_err());
    }

    #[test]
    fn test_new_validates_config() {
        assert!(matches!(
            Client::new(ClientConfig::default()),
            Err(ClientError::Config(_))
        ));
        assert!(Client::new(ClientConfig::new("key")).is_ok());
    }

    #[test]
    fn test_pool_key_normalizes_backend_and_format() {
        let client = Client::new(ClientConfig::new("key")).unwrap();
        let request = TtsRequest::new("hi")
            .with_format(AudioFormat::Opus)
            .with_reference_id("voice-1");

        let a = client.pool_key(&request, "S1");
        let b = client.pool_key(&request, "s1");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "https://api.fish.audio|s1|opus|voice-1");

        let other = client.pool_key(&TtsRequest::new("hi"), "s1");
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn test_direct_dial_cancelled() {
        let mut config = ClientConfig::new("key");
        config.pooling = false;
        config.base_url = "http://127.0.0.1:9".to_string();
        let client = Client::new(config).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client
            .convert_realtime_with_cancel(
                TtsRequest::new("hi"),
                stream::empty::<String>(),
                DEFAULT_BACKEND,
                &cancel,
            )
            .await;
        assert!(matches!(
            result,
            Err(ClientError::Realtime(RealtimeError::Cancelled))
        ));
    }
}
