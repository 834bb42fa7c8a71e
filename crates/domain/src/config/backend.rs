use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response-generation backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Echoes the user message back, streamed word by word.
    #[default]
    Echo,
    /// Any endpoint speaking the OpenAI chat completions contract.
    OpenaiCompat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Base URL, e.g. `https://api.openai.com/v1`.  Required for
    /// `openai_compat`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "d_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    /// Wall-clock budget for one whole generation.  Unset means no limit.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Case-insensitive terms that short-circuit generation.
    #[serde(default)]
    pub blocked_terms: Vec<String>,
    /// Answer returned instead of calling the backend when a blocked term
    /// matches.
    #[serde(default = "d_blocked_reply")]
    pub blocked_reply: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            base_url: None,
            model: d_model(),
            api_key_env: d_api_key_env(),
            timeout_ms: None,
            system_prompt: None,
            blocked_terms: Vec::new(),
            blocked_reply: d_blocked_reply(),
        }
    }
}

fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn d_blocked_reply() -> String {
    "I can't help with that request.".into()
}
