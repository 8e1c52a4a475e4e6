//! Per-request orchestration: resolve, compose, budget, handshake, normalize

use anyhow::Context;
use chatrelay_config::GatewayConfig;
use chatrelay_protocol::{
    BackendKind, CanonicalEvent, ChatCompletion, ChatCompletionChunk, ChatTurn, ModelCard,
    ModelProfile,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::composer::{merge, render_generic, split, ComposedPrompt};
use crate::credential::Credential;
use crate::error::{RelayError, RelayResult};
use crate::normalizer::{normalize, EventStream};
use crate::proof_of_work::ProofOfWorkSolver;
use crate::registry::ModelRegistry;
use crate::session::{
    drive_to_streaming, AnonChatSession, BackendSession, HuggingChatSession, InferenceParams,
    InferenceSession, DEFAULT_TEMPERATURE,
};
use crate::tokens::{TokenBudgeter, TokenizerRegistry};
use crate::transport::Transport;

fn default_temperature() -> Option<f64> {
    Some(DEFAULT_TEMPERATURE)
}

/// Chat request in the OpenAI-compatible shape
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatTurn>,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default, alias = "max_new_tokens")]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default)]
    pub stream: bool,
    /// Raw `Authorization` value supplied by the client
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatTurn>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// Request-independent state, shared read-only across requests
pub struct Gateway {
    config: GatewayConfig,
    registry: ModelRegistry,
    budgeter: TokenBudgeter,
    transport: Transport,
    solver: ProofOfWorkSolver,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        registry: ModelRegistry,
        tokenizers: TokenizerRegistry,
    ) -> RelayResult<Self> {
        let transport = Transport::from_config(&config)?;
        let solver = ProofOfWorkSolver::new(
            crate::proof_of_work::DEFAULT_MAX_ITERATIONS,
            transport.user_agent(),
        );

        Ok(Self {
            config,
            registry,
            budgeter: TokenBudgeter::new(Arc::new(tokenizers)),
            transport,
            solver,
        })
    }

    /// Build the registry and load tokenizers as `config` describes
    pub fn from_config(config: GatewayConfig) -> RelayResult<Self> {
        let registry = ModelRegistry::from_config(&config)?;
        let tokenizers =
            TokenizerRegistry::load(registry.profiles(), config.tokenizer_dir.as_deref())?;
        Self::new(config, registry, tokenizers)
    }

    /// Load configuration, install the tracing subscriber, build the gateway
    pub fn bootstrap(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = chatrelay_config::load_config(config_path)?;
        if let Err(e) = chatrelay_telemetry::try_init_subscriber(&config.telemetry) {
            tracing::debug!(error = %e, "tracing subscriber already installed");
        }

        let gateway = Self::from_config(config).context("Failed to build gateway")?;
        tracing::info!(
            models = gateway.registry.profiles().len(),
            default = %gateway.registry.default_profile().public_id,
            "gateway ready"
        );
        Ok(gateway)
    }

    pub fn with_solver(mut self, solver: ProofOfWorkSolver) -> Self {
        self.solver = solver;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn model_cards(&self) -> Vec<ModelCard> {
        self.registry.model_cards()
    }

    /// Canonical event stream for `request`.
    ///
    /// Budget and handshake failures are returned before any event.
    /// Cancelling during the handshake returns [`RelayError::Cancelled`].
    pub async fn chat(&self, request: &ChatRequest) -> RelayResult<EventStream> {
        self.chat_with_cancel(request, CancellationToken::new())
            .await
    }

    pub async fn chat_with_cancel(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> RelayResult<EventStream> {
        let (_, events) = self.open(request, cancel).await?;
        Ok(events)
    }

    /// Outward chat-completion chunks for `request`
    pub async fn chat_chunks(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> RelayResult<impl Stream<Item = ChatCompletionChunk> + Send> {
        let (profile, events) = self.open(request, cancel).await?;
        let model = profile.public_id;
        Ok(events.map(move |event| ChatCompletionChunk::from_event(&event, &model)))
    }

    /// Drain the stream into one non-streamed completion
    pub async fn complete(&self, request: &ChatRequest) -> RelayResult<ChatCompletion> {
        let (profile, mut events) = self.open(request, CancellationToken::new()).await?;

        let mut content = String::new();
        while let Some(event) = events.next().await {
            match event {
                CanonicalEvent::ContentDelta { text } => content.push_str(&text),
                CanonicalEvent::Error { kind, detail } => {
                    return Err(RelayError::InvalidResponse(format!(
                        "{}: {}",
                        kind.as_str(),
                        detail
                    )));
                }
                CanonicalEvent::RoleAnnounce | CanonicalEvent::Finished => {}
            }
        }

        if let Some(stop) = profile.stop_marker.as_deref() {
            content = content.replace(stop, "");
        }
        Ok(ChatCompletion::assistant(
            &profile.public_id,
            content.trim(),
        ))
    }

    async fn open(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> RelayResult<(ModelProfile, EventStream)> {
        let profile = self.registry.resolve(&request.model).clone();
        let composed = merge(&request.messages, &profile);
        let max_new_tokens = self
            .budgeter
            .clamp(request.max_tokens, &composed, &profile)?;

        tracing::info!(
            model = %profile.public_id,
            backend = %profile.backend,
            max_new_tokens,
            "opening session"
        );

        let mut session = self.open_session(&profile, composed, max_new_tokens, request);
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            body = drive_to_streaming(session.as_mut()) => Some(body?),
        };
        let Some(body) = body else {
            // Dropping the session aborts any in-flight handshake request
            tracing::info!(
                backend = %profile.backend,
                state = ?session.state(),
                "request cancelled before streaming"
            );
            return Err(RelayError::Cancelled {
                backend: profile.backend,
            });
        };

        let events = normalize(body, session.wire_format(), cancel);
        Ok((profile, events))
    }

    fn open_session(
        &self,
        profile: &ModelProfile,
        composed: ComposedPrompt,
        max_new_tokens: u64,
        request: &ChatRequest,
    ) -> Box<dyn BackendSession> {
        let endpoints = &self.config.endpoints;
        match profile.backend {
            BackendKind::Inference => {
                let prompt = match composed {
                    ComposedPrompt::Text { text, .. } => text,
                    ComposedPrompt::Turns { turns, .. } => render_generic(&turns),
                };
                let params = InferenceParams::new(
                    request.temperature,
                    request.top_p,
                    max_new_tokens,
                    request.use_cache,
                );
                let credential = Credential::resolve(request.api_key.as_deref(), &self.config);
                Box::new(InferenceSession::new(
                    self.transport.clone(),
                    &endpoints.inference,
                    profile,
                    prompt,
                    params,
                    credential,
                ))
            }
            BackendKind::HuggingChat => Box::new(HuggingChatSession::new(
                self.transport.clone(),
                &endpoints.huggingchat,
                profile,
                &split(&composed),
            )),
            BackendKind::AnonChat => Box::new(AnonChatSession::new(
                self.transport.clone(),
                &endpoints.anon_chat,
                profile,
                &split(&composed),
                self.solver.clone(),
            )),
        }
    }
}
