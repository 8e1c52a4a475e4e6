//! Stateless text-generation endpoint: one POST, token-delta stream back

use async_trait::async_trait;
use chatrelay_protocol::{BackendKind, ModelProfile};
use secrecy::ExposeSecret;
use serde::Serialize;

use super::{BackendSession, HandshakeStep, SessionState, StepTracker};
use crate::credential::Credential;
use crate::error::RelayResult;
use crate::normalizer::WireFormat;
use crate::response_handling::parse_error_body;
use crate::transport::{body_stream, ByteStream, Transport};

const SAMPLING_FLOOR: f64 = 0.01;
const SAMPLING_CEIL: f64 = 0.99;
pub const DEFAULT_TEMPERATURE: f64 = 0.5;
pub const DEFAULT_TOP_P: f64 = 0.95;

/// Generation parameters after budgeting and clamping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_new_tokens: u64,
    pub use_cache: bool,
}

impl InferenceParams {
    /// Clamp client sampling values into the open interval the endpoint accepts.
    ///
    /// Missing or negative temperature counts as zero before clamping; a
    /// missing `top_p` uses [`DEFAULT_TOP_P`].
    pub fn new(
        temperature: Option<f64>,
        top_p: Option<f64>,
        max_new_tokens: u64,
        use_cache: bool,
    ) -> Self {
        let temperature = match temperature {
            Some(t) if t >= 0.0 => t,
            _ => 0.0,
        };
        let top_p = match top_p {
            Some(p) if p >= 0.0 => p,
            Some(_) => 0.0,
            None => DEFAULT_TOP_P,
        };

        Self {
            temperature: clamp_sampling(temperature),
            top_p: clamp_sampling(top_p),
            max_new_tokens,
            use_cache,
        }
    }
}

fn clamp_sampling(value: f64) -> f64 {
    if value.is_nan() {
        return SAMPLING_FLOOR;
    }
    value.clamp(SAMPLING_FLOOR, SAMPLING_CEIL)
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    inputs: &'a str,
    parameters: GenerationParameters,
    options: GenerationOptions,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerationParameters {
    temperature: f64,
    top_p: f64,
    max_new_tokens: u64,
    return_full_text: bool,
}

#[derive(Debug, Serialize)]
struct GenerationOptions {
    use_cache: bool,
}

pub struct InferenceSession {
    transport: Transport,
    url: String,
    prompt: String,
    params: InferenceParams,
    credential: Option<Credential>,
    stop_marker: Option<String>,
    tracker: StepTracker,
    body: Option<ByteStream>,
}

impl InferenceSession {
    pub fn new(
        transport: Transport,
        endpoint: &str,
        profile: &ModelProfile,
        prompt: String,
        params: InferenceParams,
        credential: Option<Credential>,
    ) -> Self {
        Self {
            transport,
            url: format!(
                "{}/models/{}",
                endpoint.trim_end_matches('/'),
                profile.upstream_name
            ),
            prompt,
            params,
            credential,
            stop_marker: profile.stop_marker.clone(),
            tracker: StepTracker::new(BackendKind::Inference),
            body: None,
        }
    }

    pub fn params(&self) -> &InferenceParams {
        &self.params
    }

    async fn open_stream(&mut self) -> RelayResult<SessionState> {
        let step = HandshakeStep::Stream;
        let payload = GenerationRequest {
            inputs: &self.prompt,
            parameters: GenerationParameters {
                temperature: self.params.temperature,
                top_p: self.params.top_p,
                max_new_tokens: self.params.max_new_tokens,
                return_full_text: false,
            },
            options: GenerationOptions {
                use_cache: self.params.use_cache,
            },
            stream: true,
        };

        let mut request = self.transport.streaming().post(&self.url).json(&payload);
        if let Some(credential) = &self.credential {
            tracing::info!(api_key = %credential.masked(), "using api key");
            request = request.bearer_auth(credential.secret().expose_secret());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.tracker.fail_network(step, e)),
        };

        let status = response.status();
        if !status.is_success() {
            let detail = parse_error_body(response).await;
            return Err(self.tracker.fail(step, Some(status.as_u16()), detail));
        }

        self.tracker.record_status(status.as_u16());
        self.body = Some(body_stream(response));
        Ok(self
            .tracker
            .complete(step, SessionState::Streaming, None))
    }
}

#[async_trait]
impl BackendSession for InferenceSession {
    fn backend(&self) -> BackendKind {
        BackendKind::Inference
    }

    fn state(&self) -> SessionState {
        self.tracker.state()
    }

    fn last_status(&self) -> Option<u16> {
        self.tracker.last_status()
    }

    fn last_id(&self) -> Option<&str> {
        self.tracker.last_id()
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::TokenDelta {
            stop_marker: self.stop_marker.clone(),
        }
    }

    async fn advance(&mut self) -> RelayResult<SessionState> {
        self.tracker.ensure_can_advance()?;
        self.open_stream().await
    }

    fn take_body(&mut self) -> Option<ByteStream> {
        let body = self.body.take()?;
        self.tracker.finish();
        Some(body)
    }
}
