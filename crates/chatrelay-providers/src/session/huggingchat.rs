//! Cookie-authenticated web chat: settings, conversation, message slot, stream

use async_trait::async_trait;
use chatrelay_protocol::{BackendKind, ChatTurn, ModelProfile, Role};
use chatrelay_telemetry::mask_secret;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, ORIGIN, REFERER};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::json;

use super::{BackendSession, HandshakeStep, SessionState, StepTracker};
use crate::composer::render_generic;
use crate::error::RelayResult;
use crate::normalizer::WireFormat;
use crate::response_handling::{extract_cookie, parse_error_body};
use crate::transport::{body_stream, ByteStream, Transport};

pub const SESSION_COOKIE: &str = "hf-chat";

lazy_static! {
    static ref UUID_RE: Regex =
        Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap();
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationCreated {
    conversation_id: String,
}

pub struct HuggingChatSession {
    transport: Transport,
    base: String,
    upstream_name: String,
    preprompt: String,
    inputs: String,
    tracker: StepTracker,
    cookie: Option<String>,
    conversation_id: Option<String>,
    message_id: Option<String>,
    body: Option<ByteStream>,
}

impl HuggingChatSession {
    pub fn new(
        transport: Transport,
        endpoint: &str,
        profile: &ModelProfile,
        turns: &[ChatTurn],
    ) -> Self {
        let (system, dialogue): (Vec<&ChatTurn>, Vec<&ChatTurn>) =
            turns.iter().partition(|turn| turn.role == Role::System);

        let preprompt = system
            .iter()
            .map(|turn| turn.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let inputs = match dialogue.as_slice() {
            [single] => single.content.clone(),
            _ => {
                let dialogue: Vec<ChatTurn> = dialogue.into_iter().cloned().collect();
                render_generic(&dialogue)
            }
        };

        Self {
            transport,
            base: format!("{}/chat", endpoint.trim_end_matches('/')),
            upstream_name: profile.upstream_name.clone(),
            preprompt,
            inputs,
            tracker: StepTracker::new(BackendKind::HuggingChat),
            cookie: None,
            conversation_id: None,
            message_id: None,
            body: None,
        }
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    fn page_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let origin = self.base.trim_end_matches("/chat");
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(ORIGIN, value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("{}/", self.base)) {
            headers.insert(REFERER, value);
        }
        if let Some(cookie) = &self.cookie {
            if let Ok(value) = HeaderValue::from_str(&format!("{}={}", SESSION_COOKIE, cookie)) {
                headers.insert(COOKIE, value);
            }
        }
        headers
    }

    async fn send(
        &mut self,
        step: HandshakeStep,
        request: RequestBuilder,
    ) -> RelayResult<reqwest::Response> {
        let response = match request.headers(self.page_headers()).send().await {
            Ok(response) => response,
            Err(e) => return Err(self.tracker.fail_network(step, e)),
        };
        self.tracker.record_status(response.status().as_u16());
        Ok(response)
    }

    async fn request_cookie(&mut self) -> RelayResult<SessionState> {
        let step = HandshakeStep::Settings;
        let payload = json!({
            "assistants": [],
            "customPrompts": {},
            "ethicsModalAccepted": true,
            "ethicsModalAcceptedAt": null,
            "hideEmojiOnSidebar": false,
            "recentlySaved": false,
            "searchEnabled": true,
            "shareConversationsWithModelAuthors": true,
            "activeModel": self.upstream_name,
        });
        let request = self
            .transport
            .handshake()
            .post(format!("{}/settings", self.base))
            .json(&payload);
        let response = self.send(step, request).await?;

        let status = response.status();
        // Redirects are not followed, so a 3xx still carries the cookie
        if !(status.is_success() || status.is_redirection()) {
            let detail = parse_error_body(response).await;
            return Err(self.tracker.fail(step, Some(status.as_u16()), detail));
        }

        let status = status.as_u16();
        let cookie = extract_cookie(response.headers(), SESSION_COOKIE);
        match cookie {
            Some(cookie) => {
                let masked = mask_secret(&cookie);
                self.cookie = Some(cookie);
                Ok(self
                    .tracker
                    .complete(step, SessionState::Authenticated, Some(masked)))
            }
            None => {
                let detail = parse_error_body(response).await;
                Err(self.tracker.fail(
                    step,
                    Some(status),
                    format!("no {} cookie: {}", SESSION_COOKIE, detail),
                ))
            }
        }
    }

    async fn create_conversation(&mut self) -> RelayResult<SessionState> {
        let step = HandshakeStep::Conversation;
        let payload = json!({
            "model": self.upstream_name,
            "preprompt": self.preprompt,
        });
        let request = self
            .transport
            .handshake()
            .post(format!("{}/conversation", self.base))
            .json(&payload);
        let response = self.send(step, request).await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let detail = parse_error_body(response).await;
            return Err(self.tracker.fail(step, Some(status.as_u16()), detail));
        }

        match response.json::<ConversationCreated>().await {
            Ok(created) => {
                self.conversation_id = Some(created.conversation_id.clone());
                Ok(self.tracker.complete(
                    step,
                    SessionState::ConversationReady,
                    Some(created.conversation_id),
                ))
            }
            Err(e) => Err(self.tracker.fail(
                step,
                Some(status.as_u16()),
                format!("malformed conversation body: {}", e),
            )),
        }
    }

    async fn find_message_slot(&mut self) -> RelayResult<SessionState> {
        let step = HandshakeStep::MessageSlot;
        let conversation_id = self.conversation_id.clone().unwrap_or_default();
        let request = self
            .transport
            .handshake()
            .get(format!(
                "{}/conversation/{}/__data.json",
                self.base, conversation_id
            ))
            .query(&[("x-sveltekit-invalidated", "11")]);
        let response = self.send(step, request).await?;

        let status = response.status();
        if !status.is_success() {
            let detail = parse_error_body(response).await;
            return Err(self.tracker.fail(step, Some(status.as_u16()), detail));
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return Err(self.tracker.fail_network(step, e)),
        };

        // The newest message is the last id in the page data
        match latest_message_id(&text) {
            Some(message_id) => {
                self.message_id = Some(message_id.clone());
                Ok(self.tracker.complete(
                    step,
                    SessionState::MessageSlotReady,
                    Some(message_id),
                ))
            }
            None => Err(self.tracker.fail(
                step,
                Some(status.as_u16()),
                "no message id in conversation data",
            )),
        }
    }

    async fn open_stream(&mut self) -> RelayResult<SessionState> {
        let step = HandshakeStep::Stream;
        let conversation_id = self.conversation_id.clone().unwrap_or_default();
        let payload = json!({
            "inputs": self.inputs,
            "id": self.message_id,
            "is_retry": false,
            "is_continue": false,
            "web_search": false,
            "files": [],
        });
        let request = self
            .transport
            .streaming()
            .post(format!("{}/conversation/{}", self.base, conversation_id))
            .json(&payload);
        let response = self.send(step, request).await?;

        let status = response.status();
        if !status.is_success() {
            let detail = parse_error_body(response).await;
            return Err(self.tracker.fail(step, Some(status.as_u16()), detail));
        }

        self.body = Some(body_stream(response));
        Ok(self.tracker.complete(step, SessionState::Streaming, None))
    }
}

fn latest_message_id(page_data: &str) -> Option<String> {
    UUID_RE
        .find_iter(page_data)
        .last()
        .map(|m| m.as_str().to_string())
}

#[async_trait]
impl BackendSession for HuggingChatSession {
    fn backend(&self) -> BackendKind {
        BackendKind::HuggingChat
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
        WireFormat::DiscriminatedEvent
    }

    async fn advance(&mut self) -> RelayResult<SessionState> {
        self.tracker.ensure_can_advance()?;
        match self.tracker.state() {
            SessionState::Init => self.request_cookie().await,
            SessionState::Authenticated => self.create_conversation().await,
            SessionState::ConversationReady => self.find_message_slot().await,
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
    use chatrelay_protocol::TemplateFamily;

    fn profile() -> ModelProfile {
        ModelProfile::new(
            "command-r-plus",
            "CohereForAI/c4ai-command-r-plus",
            TemplateFamily::Generic,
            BackendKind::HuggingChat,
            32768,
        )
    }

    #[test]
    fn test_latest_message_id_takes_last_match() {
        let page = r#"{"nodes":[{"id":"0f1e2d3c-4b5a-6978-8a9b-0c1d2e3f4a5b"},{"id":"aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee"}]}"#;
        assert_eq!(
            latest_message_id(page).as_deref(),
            Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee")
        );
        assert_eq!(latest_message_id("{}"), None);
    }

    #[test]
    fn test_system_turns_become_preprompt() {
        let transport = Transport::new(&Default::default()).unwrap();
        let session = HuggingChatSession::new(
            transport,
            "https://huggingface.co/",
            &profile(),
            &[ChatTurn::system("be brief"), ChatTurn::user("hello")],
        );
        assert_eq!(session.preprompt, "be brief");
        assert_eq!(session.inputs, "hello");
        assert_eq!(session.base, "https://huggingface.co/chat");
        assert_eq!(session.state(), SessionState::Init);
    }

    #[test]
    fn test_multi_turn_inputs_are_rendered() {
        let transport = Transport::new(&Default::default()).unwrap();
        let session = HuggingChatSession::new(
            transport,
            "https://huggingface.co",
            &profile(),
            &[
                ChatTurn::user("hi"),
                ChatTurn::assistant("hello"),
                ChatTurn::user("how are you"),
            ],
        );
        assert!(session.inputs.contains("hi"));
        assert!(session.inputs.contains("how are you"));
        assert!(session.preprompt.is_empty());
    }
}
