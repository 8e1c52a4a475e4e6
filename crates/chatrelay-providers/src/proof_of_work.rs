//! Proof-of-work solver for the anonymous chat requirements challenge

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::seq::SliceRandom;
use serde::Deserialize;
use sha3::{Digest, Sha3_512};

use crate::error::RelayResult;
use crate::transport::DEFAULT_USER_AGENT;

pub const DEFAULT_MAX_ITERATIONS: u64 = 100_000;

/// Prefix of a token whose digest met the difficulty
pub const SOLVED_PREFIX: &str = "gAAAAAB";

/// Prefix of the token sent when the search is exhausted
pub const FALLBACK_PREFIX: &str = "gAAAAABwQ8Lk5FbGpA2NcR9dShT6gYjU7VxZ4D";

const FINGERPRINT_CONSTANT: u64 = 4_294_705_152;
const CORE_COUNTS: &[u32] = &[8, 12, 16, 24];
const SCREEN_WIDTHS: &[u32] = &[3000, 4000, 6000];
const TIME_FORMAT: &str = "%a %b %d %Y %H:%M:%S GMT%z";

/// Challenge issued by the requirements probe
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProofChallenge {
    pub seed: String,
    /// Hex threshold; the digest prefix of half this length must not exceed it
    pub difficulty: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofToken {
    Solved(String),
    /// Search bound reached; carries the seed only
    Fallback(String),
}

impl ProofToken {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Solved(token) | Self::Fallback(token) => token,
        }
    }

    pub fn is_solved(&self) -> bool {
        matches!(self, Self::Solved(_))
    }

    /// Tell the two token shapes apart by prefix.
    ///
    /// Solved payloads are base64 of a JSON array, so they always continue
    /// with `W` after [`SOLVED_PREFIX`] and never collide with
    /// [`FALLBACK_PREFIX`].
    pub fn classify(token: &str) -> Option<Self> {
        if token.starts_with(FALLBACK_PREFIX) {
            Some(Self::Fallback(token.to_string()))
        } else if token.starts_with(SOLVED_PREFIX) {
            Some(Self::Solved(token.to_string()))
        } else {
            None
        }
    }
}

impl std::fmt::Display for ProofToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded brute-force search over the fingerprint counter
#[derive(Debug, Clone)]
pub struct ProofOfWorkSolver {
    max_iterations: u64,
    user_agent: String,
}

impl Default for ProofOfWorkSolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS, DEFAULT_USER_AGENT)
    }
}

impl ProofOfWorkSolver {
    pub fn new(max_iterations: u64, user_agent: impl Into<String>) -> Self {
        Self {
            max_iterations,
            user_agent: user_agent.into(),
        }
    }

    pub fn max_iterations(&self) -> u64 {
        self.max_iterations
    }

    /// Search counters `0..max_iterations` for a payload meeting `difficulty`
    pub fn solve(&self, seed: &str, difficulty: &str) -> ProofToken {
        let (head, tail) = self.fingerprint_parts();
        let prefix_len = difficulty.len() / 2;

        for counter in 0..self.max_iterations {
            let payload = BASE64.encode(format!("{}{}{}", head, counter, tail));
            let digest = digest_hex(seed, &payload);
            if meets_difficulty(&digest, prefix_len, difficulty) {
                tracing::debug!(counter, "proof-of-work solved");
                return ProofToken::Solved(format!("{}{}", SOLVED_PREFIX, payload));
            }
        }

        tracing::warn!(
            iterations = self.max_iterations,
            difficulty,
            "proof-of-work exhausted, sending fallback token"
        );
        ProofToken::Fallback(format!("{}{}", FALLBACK_PREFIX, BASE64.encode(seed)))
    }

    /// [`solve`](Self::solve) on the blocking pool
    pub async fn solve_blocking(&self, challenge: &ProofChallenge) -> RelayResult<ProofToken> {
        let solver = self.clone();
        let seed = challenge.seed.clone();
        let difficulty = challenge.difficulty.clone();
        let token =
            tokio::task::spawn_blocking(move || solver.solve(&seed, &difficulty)).await?;
        Ok(token)
    }

    /// JSON fingerprint `[cores+screen, time, constant, <counter>, ua]` split
    /// around the counter, serialized with `", "` separators.
    fn fingerprint_parts(&self) -> (String, String) {
        let mut rng = rand::thread_rng();
        let core = CORE_COUNTS.choose(&mut rng).copied().unwrap_or(8);
        let screen = SCREEN_WIDTHS.choose(&mut rng).copied().unwrap_or(3000);
        let time = chrono::Local::now().format(TIME_FORMAT).to_string();

        let head = format!(
            "[{}, {}, {}, ",
            json_string(&format!("{}{}", core, screen)),
            json_string(&time),
            FINGERPRINT_CONSTANT
        );
        let tail = format!(", {}]", json_string(&self.user_agent));
        (head, tail)
    }
}

/// Check a token against its challenge
pub fn verify(seed: &str, difficulty: &str, token: &str) -> bool {
    match ProofToken::classify(token) {
        Some(ProofToken::Solved(token)) => {
            let payload = &token[SOLVED_PREFIX.len()..];
            meets_difficulty(&digest_hex(seed, payload), difficulty.len() / 2, difficulty)
        }
        _ => false,
    }
}

fn digest_hex(seed: &str, payload: &str) -> String {
    let mut hasher = Sha3_512::new();
    hasher.update(seed.as_bytes());
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Thresholds longer than the digest compare the whole digest
fn meets_difficulty(digest: &str, prefix_len: usize, difficulty: &str) -> bool {
    &digest[..prefix_len.min(digest.len())] <= difficulty
}

fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
