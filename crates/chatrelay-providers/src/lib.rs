//! Chatrelay Providers - Upstream chat back-ends behind one event stream
//!
//! This crate turns an OpenAI-style chat request into a canonical event
//! stream from one of three upstreams:
//! - A stateless text-generation inference endpoint
//! - HuggingChat (cookie session, conversation and message ids)
//! - An anonymous web chat guarded by a proof-of-work challenge
//!
//! [`Gateway`] is the entry point. It resolves the model, composes the
//! prompt, checks the token budget, drives the back-end handshake and hands
//! the response body to the stream normalizer.

mod composer;
mod credential;
mod error;
mod gateway;
mod normalizer;
mod proof_of_work;
mod registry;
mod response_handling;
mod session;
mod tokens;
mod transport;

pub use composer::{merge, split, split_text, ComposedPrompt};
pub use credential::Credential;
pub use error::{RelayError, RelayResult};
pub use gateway::{ChatRequest, Gateway};
pub use normalizer::{normalize, EventStream, LineDecoder, WireFormat};
pub use proof_of_work::{
    verify as verify_proof, ProofChallenge, ProofOfWorkSolver, ProofToken,
    DEFAULT_MAX_ITERATIONS, FALLBACK_PREFIX, SOLVED_PREFIX,
};
pub use registry::{builtin_profiles, ModelRegistry, DEFAULT_MODEL};
pub use secrecy::SecretString;
pub use session::{
    drive_to_streaming, AnonChatSession, BackendSession, ChatRequirements, HandshakeStep,
    HuggingChatSession, InferenceParams, InferenceSession, ProofOfWorkRequirement, SessionState,
};
pub use tokens::{
    tokenizer_key, Cl100kCounter, HfTokenCounter, TokenBudgeter, TokenCounter,
    TokenizerRegistry, WhitespaceCounter, CL100K_BASE, GATED_TOKENIZER_STAND_INS,
};
pub use transport::{ByteStream, Transport, TransportSettings, DEFAULT_USER_AGENT};
