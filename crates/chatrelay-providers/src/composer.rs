//! Prompt composition: role-tagged turns to and from model template strings.
//!
//! Turns are first grouped by [`RoleCategory`]: consecutive instruction-like
//! turns (system, user, anything unrecognized) are joined with a newline, as
//! are consecutive assistant turns. Each group is then rendered with the
//! marker set of the profile's [`TemplateFamily`].
//!
//! `split` inverts `merge` for the bracket, turn-marker and named-turn
//! families. The generic family is lossy: its split returns the whole text as
//! a single user turn.

use chatrelay_protocol::{ChatTurn, ModelProfile, Role, RoleCategory, TemplateFamily};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref BRACKET_PAIR_RE: Regex =
        Regex::new(r"<s>\s*\[INST\](?P<inst>[\s\S]*?)\[/INST\](?P<answer>[\s\S]*?)</s>").unwrap();
    static ref BRACKET_INST_RE: Regex =
        Regex::new(r"\[INST\](?P<inst>[\s\S]*?)\[/INST\]").unwrap();
    static ref CHAT_ML_TURN_RE: Regex =
        Regex::new(r"<\|im_start\|>(?P<role>[^\n]*)\n(?P<content>[\s\S]*?)<\|im_end\|>").unwrap();
    static ref GEMMA_TURN_RE: Regex =
        Regex::new(r"<start_of_turn>(?P<role>user|model)\n(?P<content>[\s\S]*?)<end_of_turn>")
            .unwrap();
    static ref NAMED_TURN_RE: Regex = Regex::new(
        r"(?i)GPT4 Correct (?P<role>user|assistant):\n(?P<content>[\s\S]*?)<\|end_of_turn\|>"
    )
    .unwrap();
}

const CHAT_ML_CURSOR: &str = "<|im_start|>assistant";
const GEMMA_CURSOR: &str = "<start_of_turn>model\n";
const NAMED_TURN_CURSOR: &str = "GPT4 Correct Assistant:\n";

/// Prompt ready to send upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposedPrompt {
    /// Raw-text completion input
    Text {
        family: TemplateFamily,
        text: String,
    },
    /// Role-tagged payload for upstreams that accept turns directly
    Turns {
        family: TemplateFamily,
        turns: Vec<ChatTurn>,
    },
}

impl ComposedPrompt {
    pub fn family(&self) -> TemplateFamily {
        match self {
            Self::Text { family, .. } | Self::Turns { family, .. } => *family,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            Self::Turns { .. } => None,
        }
    }

    pub fn as_turns(&self) -> Option<&[ChatTurn]> {
        match self {
            Self::Turns { turns, .. } => Some(turns),
            Self::Text { .. } => None,
        }
    }
}

/// Compile `turns` into the prompt format `profile` expects
pub fn merge(turns: &[ChatTurn], profile: &ModelProfile) -> ComposedPrompt {
    let family = profile.template;
    if family.is_structured() {
        return ComposedPrompt::Turns {
            family,
            turns: turns.to_vec(),
        };
    }

    let groups = concat_by_category(turns);
    let text = match family {
        TemplateFamily::BracketInstruction => render_bracket(&groups),
        TemplateFamily::ChatMl => render_chat_ml(&groups),
        TemplateFamily::Gemma => render_gemma(&groups),
        TemplateFamily::NamedTurn => render_named_turn(&groups),
        TemplateFamily::Generic | TemplateFamily::RoleTagged => render_generic(&groups),
    };

    ComposedPrompt::Text { family, text }
}

/// Best-effort inverse of [`merge`]
pub fn split(composed: &ComposedPrompt) -> Vec<ChatTurn> {
    match composed {
        ComposedPrompt::Turns { turns, .. } => turns.clone(),
        ComposedPrompt::Text { family, text } => split_text(text, *family),
    }
}

/// Recover turns from a rendered prompt of the given family
pub fn split_text(text: &str, family: TemplateFamily) -> Vec<ChatTurn> {
    match family {
        TemplateFamily::BracketInstruction => split_bracket(text),
        TemplateFamily::ChatMl => CHAT_ML_TURN_RE
            .captures_iter(text)
            .map(|caps| ChatTurn::new(&caps["role"], &caps["content"]))
            .collect(),
        TemplateFamily::Gemma => GEMMA_TURN_RE
            .captures_iter(text)
            .map(|caps| {
                let role = if &caps["role"] == "model" {
                    Role::Assistant
                } else {
                    Role::User
                };
                ChatTurn::new(role, &caps["content"])
            })
            .collect(),
        TemplateFamily::NamedTurn => NAMED_TURN_RE
            .captures_iter(text)
            .map(|caps| {
                let role = if caps["role"].eq_ignore_ascii_case("assistant") {
                    Role::Assistant
                } else {
                    Role::User
                };
                ChatTurn::new(role, &caps["content"])
            })
            .collect(),
        TemplateFamily::Generic | TemplateFamily::RoleTagged => vec![ChatTurn::user(text)],
    }
}

/// Join consecutive same-category turns with a newline.
///
/// A group keeps its role when every member shares it. Mixed instruction
/// groups (e.g. system followed by user) are labelled `user`.
fn concat_by_category(turns: &[ChatTurn]) -> Vec<ChatTurn> {
    let mut groups: Vec<ChatTurn> = Vec::new();

    for turn in turns {
        match groups.last_mut() {
            Some(last) if last.category() == turn.category() => {
                last.content.push('\n');
                last.content.push_str(&turn.content);
                if last.role != turn.role {
                    last.role = match turn.category() {
                        RoleCategory::Instruction => Role::User,
                        RoleCategory::Answer => Role::Assistant,
                    };
                }
            }
            _ => groups.push(turn.clone()),
        }
    }

    groups
}

fn render_bracket(groups: &[ChatTurn]) -> String {
    let mut merged = String::new();
    let mut pending: Option<String> = None;

    for group in groups {
        match group.category() {
            RoleCategory::Instruction => {
                pending = Some(format!("[INST] {} [/INST]", group.content));
            }
            RoleCategory::Answer => {
                let inst = pending.take().unwrap_or_default();
                merged.push_str(&format!("<s> {} {} </s>\n", inst, group.content));
            }
        }
    }

    if let Some(inst) = pending {
        merged.push_str(&inst);
    }

    merged
}

fn split_bracket(text: &str) -> Vec<ChatTurn> {
    let pairs: Vec<_> = BRACKET_PAIR_RE.captures_iter(text).collect();
    let insts: Vec<_> = BRACKET_INST_RE.captures_iter(text).collect();

    if pairs.is_empty() && insts.is_empty() {
        return vec![ChatTurn::user(text)];
    }

    let mut turns = Vec::with_capacity(pairs.len() * 2 + 1);
    for caps in &pairs {
        turns.push(ChatTurn::user(caps["inst"].trim()));
        turns.push(ChatTurn::assistant(caps["answer"].trim()));
    }

    if insts.len() > pairs.len() {
        if let Some(last) = insts.last() {
            turns.push(ChatTurn::user(last["inst"].trim()));
        }
    }

    turns
}

fn chat_ml_role(role: &Role) -> &str {
    if role.is_known() {
        role.as_str()
    } else {
        "user"
    }
}

fn render_chat_ml(groups: &[ChatTurn]) -> String {
    let mut lines: Vec<String> = groups
        .iter()
        .map(|g| format!("<|im_start|>{}\n{}<|im_end|>", chat_ml_role(&g.role), g.content))
        .collect();
    lines.push(CHAT_ML_CURSOR.to_string());
    lines.join("\n")
}

fn render_gemma(groups: &[ChatTurn]) -> String {
    let mut lines: Vec<String> = groups
        .iter()
        .map(|g| {
            let role = match g.category() {
                RoleCategory::Instruction => "user",
                RoleCategory::Answer => "model",
            };
            format!("<start_of_turn>{}\n{}<end_of_turn>", role, g.content)
        })
        .collect();
    lines.push(GEMMA_CURSOR.to_string());
    lines.join("\n")
}

fn render_named_turn(groups: &[ChatTurn]) -> String {
    let mut lines: Vec<String> = groups
        .iter()
        .map(|g| {
            let name = match g.category() {
                RoleCategory::Instruction => "User",
                RoleCategory::Answer => "Assistant",
            };
            format!("GPT4 Correct {}:\n{}<|end_of_turn|>", name, g.content)
        })
        .collect();
    lines.push(NAMED_TURN_CURSOR.to_string());
    lines.join("\n")
}

/// `` `role`:\ncontent\n `` blocks separated by blank lines
pub(crate) fn render_generic(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("`{}`:\n{}\n", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}
