//! HTTP clients shared by the back-end sessions

use bytes::Bytes;
use chatrelay_config::GatewayConfig;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, CACHE_CONTROL, PRAGMA, USER_AGENT};
use reqwest::{Client, Proxy};
use std::pin::Pin;
use std::time::Duration;

use crate::error::{RelayError, RelayResult};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// Raw upstream response body
pub type ByteStream = Pin<Box<dyn Stream<Item = RelayResult<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub proxy: Option<String>,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            proxy: None,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl TransportSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            proxy: config.resolve_proxy(),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Two clients over the same proxy: one with a total timeout for handshake
/// steps, one with only a connect timeout for the long-lived stream.
#[derive(Debug, Clone)]
pub struct Transport {
    handshake: Client,
    streaming: Client,
    user_agent: String,
}

impl Transport {
    pub fn new(settings: &TransportSettings) -> RelayResult<Self> {
        let headers = browser_headers(&settings.user_agent)?;

        // Handshake steps read cookies off the first response
        let mut handshake = Client::builder()
            .default_headers(headers.clone())
            .redirect(reqwest::redirect::Policy::none())
            .timeout(settings.handshake_timeout)
            .connect_timeout(settings.connect_timeout);
        let mut streaming = Client::builder()
            .default_headers(headers)
            .connect_timeout(settings.connect_timeout);

        if let Some(proxy) = settings.proxy.as_deref() {
            tracing::info!(proxy, "using outbound proxy");
            let proxy = Proxy::all(proxy)
                .map_err(|e| RelayError::Configuration(format!("invalid proxy {}: {}", proxy, e)))?
                .no_proxy(reqwest::NoProxy::from_env());
            handshake = handshake.proxy(proxy.clone());
            streaming = streaming.proxy(proxy);
        }

        Ok(Self {
            handshake: handshake.build()?,
            streaming: streaming.build()?,
            user_agent: settings.user_agent.clone(),
        })
    }

    pub fn from_config(config: &GatewayConfig) -> RelayResult<Self> {
        Self::new(&TransportSettings::from_config(config))
    }

    /// Client for handshake steps (bounded total timeout)
    pub fn handshake(&self) -> &Client {
        &self.handshake
    }

    /// Client for the streaming request (no total timeout)
    pub fn streaming(&self) -> &Client {
        &self.streaming
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

fn browser_headers(user_agent: &str) -> RelayResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent)
            .map_err(|_| RelayError::Configuration("Invalid user agent".into()))?,
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    Ok(headers)
}

/// Body of a successful streaming response as a [`ByteStream`]
pub fn body_stream(response: reqwest::Response) -> ByteStream {
    Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(RelayError::from)))
}
