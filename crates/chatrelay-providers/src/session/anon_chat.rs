//! Anonymous web chat: requirements probe with proof-of-work, then one
//! streaming POST carrying the whole conversation.

use async_trait::async_trait;
use chatrelay_protocol::{BackendKind, ChatTurn, ModelProfile, Role};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{BackendSession, HandshakeStep, SessionState, StepTracker};
use crate::error::{RelayError, RelayResult};
use crate::normalizer::WireFormat;
use crate::proof_of_work::{ProofChallenge, ProofOfWorkSolver, ProofToken};
use crate::response_handling::parse_error_body;
use crate::transport::{body_stream, ByteStream, Transport};

const DEVICE_ID_HEADER: &str = "oai-device-id";
const LANGUAGE_HEADER: &str = "oai-language";
const REQUIREMENTS_TOKEN_HEADER: &str = "openai-sentinel-chat-requirements-token";
const PROOF_TOKEN_HEADER: &str = "openai-sentinel-proof-token";

/// Response of the requirements probe
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequirements {
    pub token: String,
    #[serde(default, rename = "proofofwork")]
    pub proof_of_work: Option<ProofOfWorkRequirement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProofOfWorkRequirement {
    #[serde(default)]
    pub required: bool,
    pub seed: Option<String>,
    pub difficulty: Option<String>,
}

impl ChatRequirements {
    /// Challenge to solve, if the probe demands one.
    ///
    /// A required proof of work without both seed and difficulty is an error.
    pub fn challenge(&self) -> RelayResult<Option<ProofChallenge>> {
        let Some(pow) = self.proof_of_work.as_ref().filter(|pow| pow.required) else {
            return Ok(None);
        };
        match (&pow.seed, &pow.difficulty) {
            (Some(seed), Some(difficulty)) => Ok(Some(ProofChallenge {
                seed: seed.clone(),
                difficulty: difficulty.clone(),
            })),
            _ => Err(RelayError::InvalidResponse(
                "proof of work required but challenge incomplete".to_string(),
            )),
        }
    }
}

#[derive(Debug, Serialize)]
struct Author<'a> {
    role: &'a str,
}

#[derive(Debug, Serialize)]
struct MessageContent<'a> {
    content_type: &'static str,
    parts: [&'a str; 1],
}

#[derive(Debug, Serialize)]
struct UpstreamMessage<'a> {
    author: Author<'a>,
    content: MessageContent<'a>,
    metadata: Value,
}

fn author_role(role: &Role) -> &str {
    match role {
        Role::System | Role::User | Role::Assistant => role.as_str(),
        Role::Other(_) => "system",
    }
}

fn upstream_messages(turns: &[ChatTurn]) -> Vec<UpstreamMessage<'_>> {
    turns
        .iter()
        .map(|turn| UpstreamMessage {
            author: Author {
                role: author_role(&turn.role),
            },
            content: MessageContent {
                content_type: "text",
                parts: [turn.content.as_str()],
            },
            metadata: json!({}),
        })
        .collect()
}

pub struct AnonChatSession {
    transport: Transport,
    base: String,
    upstream_name: String,
    turns: Vec<ChatTurn>,
    solver: ProofOfWorkSolver,
    device_id: String,
    tracker: StepTracker,
    requirements_token: Option<String>,
    proof_token: Option<ProofToken>,
    payload: Option<Value>,
    body: Option<ByteStream>,
}

impl AnonChatSession {
    pub fn new(
        transport: Transport,
        endpoint: &str,
        profile: &ModelProfile,
        turns: &[ChatTurn],
        solver: ProofOfWorkSolver,
    ) -> Self {
        Self {
            transport,
            base: endpoint.trim_end_matches('/').to_string(),
            upstream_name: profile.upstream_name.clone(),
            turns: turns.to_vec(),
            solver,
            device_id: Uuid::new_v4().to_string(),
            tracker: StepTracker::new(BackendKind::AnonChat),
            requirements_token: None,
            proof_token: None,
            payload: None,
            body: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn proof_token(&self) -> Option<&ProofToken> {
        self.proof_token.as_ref()
    }

    fn device_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.device_id) {
            headers.insert(DEVICE_ID_HEADER, value);
        }
        headers.insert(LANGUAGE_HEADER, HeaderValue::from_static("en-US"));
        headers
    }

    async fn fetch_requirements(&mut self) -> RelayResult<SessionState> {
        let step = HandshakeStep::Requirements;
        let response = match self
            .transport
            .handshake()
            .post(format!("{}/sentinel/chat-requirements", self.base))
            .headers(self.device_headers())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Err(self.tracker.fail_network(step, e)),
        };

        let status = response.status();
        if !status.is_success() {
            let detail = parse_error_body(response).await;
            return Err(self.tracker.fail(step, Some(status.as_u16()), detail));
        }
        self.tracker.record_status(status.as_u16());

        let requirements: ChatRequirements = match response.json().await {
            Ok(requirements) => requirements,
            Err(e) => {
                return Err(self.tracker.fail(
                    step,
                    Some(status.as_u16()),
                    format!("malformed requirements body: {}", e),
                ))
            }
        };

        let challenge = match requirements.challenge() {
            Ok(challenge) => challenge,
            Err(e) => {
                return Err(self.tracker.fail(step, Some(status.as_u16()), e.to_string()));
            }
        };
        if let Some(challenge) = challenge {
            let token = match self.solver.solve_blocking(&challenge).await {
                Ok(token) => token,
                Err(e) => {
                    return Err(self.tracker.fail(step, None, e.to_string()));
                }
            };
            tracing::debug!(solved = token.is_solved(), "proof token ready");
            self.proof_token = Some(token);
        }

        self.requirements_token = Some(requirements.token);
        let device_id = self.device_id.clone();
        Ok(self
            .tracker
            .complete(step, SessionState::Authenticated, Some(device_id)))
    }

    /// Local step: conversation and message slot are both implied by the
    /// payload, so no request is made.
    fn prepare_payload(&mut self) -> SessionState {
        let request_id = Uuid::new_v4().to_string();
        let payload = json!({
            "action": "next",
            "messages": upstream_messages(&self.turns),
            "conversation_mode": { "kind": "primary_assistant" },
            "force_nulligen": false,
            "force_paragen": false,
            "force_paragen_model_slug": "",
            "force_rate_limit": false,
            "history_and_training_disabled": false,
            "model": self.upstream_name,
            "parent_message_id": "",
            "suggestions": [],
            "timezone_offset_min": -480,
            "websocket_request_id": request_id,
        });
        self.payload = Some(payload);
        self.tracker.complete(
            HandshakeStep::Prepare,
            SessionState::MessageSlotReady,
            Some(request_id),
        )
    }

    async fn open_stream(&mut self) -> RelayResult<SessionState> {
        let step = HandshakeStep::Stream;
        let mut headers = self.device_headers();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(token) = &self.requirements_token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert(REQUIREMENTS_TOKEN_HEADER, value);
            }
        }
        if let Some(proof) = &self.proof_token {
            if let Ok(value) = HeaderValue::from_str(proof.as_str()) {
                headers.insert(PROOF_TOKEN_HEADER, value);
            }
        }

        let payload = self.payload.take().unwrap_or_default();
        let response = match self
            .transport
            .streaming()
            .post(format!("{}/conversation", self.base))
            .headers(headers)
            .json(&payload)
            .send()
            .await
        {
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
        Ok(self.tracker.complete(step, SessionState::Streaming, None))
    }
}

#[async_trait]
impl BackendSession for AnonChatSession {
    fn backend(&self) -> BackendKind {
        BackendKind::AnonChat
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
        WireFormat::FullTextSnapshot
    }

    async fn advance(&mut self) -> RelayResult<SessionState> {
        self.tracker.ensure_can_advance()?;
        match self.tracker.state() {
            SessionState::Init => self.fetch_requirements().await,
            SessionState::Authenticated | SessionState::ConversationReady => {
                Ok(self.prepare_payload())
            }
            _ => self.open_stream().await,
        }
    }

    fn take_body(&mut self) -> Option<ByteStream> {
        let body = self.body.take()?;
        self.tracker.finish();
        Some(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_roles_become_system() {
        let turns = vec![
            ChatTurn::new("tool", "result"),
            ChatTurn::user("hello"),
            ChatTurn::assistant("hi"),
        ];
        let json = serde_json::to_value(upstream_messages(&turns)).unwrap();
        assert_eq!(json[0]["author"]["role"], "system");
        assert_eq!(json[1]["author"]["role"], "user");
        assert_eq!(json[2]["author"]["role"], "assistant");
        assert_eq!(json[1]["content"]["content_type"], "text");
        assert_eq!(json[1]["content"]["parts"][0], "hello");
        assert_eq!(json[1]["metadata"], json!({}));
    }

    #[test]
    fn test_requirements_challenge() {
        let requirements: ChatRequirements = serde_json::from_value(json!({
            "persona": "chatgpt-freeaccount",
            "token": "req-token",
            "proofofwork": { "required": true, "seed": "0.5", "difficulty": "0fffff" }
        }))
        .unwrap();
        let challenge = requirements.challenge().unwrap().unwrap();
        assert_eq!(challenge.seed, "0.5");
        assert_eq!(challenge.difficulty, "0fffff");

        let relaxed: ChatRequirements = serde_json::from_value(json!({
            "token": "req-token",
            "proofofwork": { "required": false }
        }))
        .unwrap();
        assert!(relaxed.challenge().unwrap().is_none());

        let bare: ChatRequirements =
            serde_json::from_value(json!({ "token": "req-token" })).unwrap();
        assert!(bare.challenge().unwrap().is_none());

        let incomplete: ChatRequirements = serde_json::from_value(json!({
            "token": "req-token",
            "proofofwork": { "required": true, "seed": "0.5" }
        }))
        .unwrap();
        assert!(incomplete.challenge().is_err());
    }

    #[test]
    fn test_prepare_is_local() {
        let transport = Transport::new(&Default::default()).unwrap();
        let profile = ModelProfile::new(
            "gpt-3.5-turbo",
            "text-davinci-002-render-sha",
            chatrelay_protocol::TemplateFamily::RoleTagged,
            BackendKind::AnonChat,
            8192,
        );
        let mut session = AnonChatSession::new(
            transport,
            "http://127.0.0.1:9",
            &profile,
            &[ChatTurn::user("hello")],
            ProofOfWorkSolver::default(),
        );
        assert_eq!(session.prepare_payload(), SessionState::MessageSlotReady);
        let payload = session.payload.as_ref().unwrap();
        assert_eq!(payload["action"], "next");
        assert_eq!(payload["model"], "text-davinci-002-render-sha");
        assert_eq!(payload["messages"][0]["content"]["parts"][0], "hello");
        assert!(session.last_id().is_some());
    }
}
