//! Model endpoint table
//!
//! Each capability (tool-capable chat, plain chat, speech) has an ordered list
//! of OpenAI-compatible endpoints. An endpoint whose API key comes from an
//! environment variable is only usable when that variable is set.

use serde::{Deserialize, Serialize};

pub const OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const DEEPSEEK_BASE: &str = "https://api.deepseek.com";
pub const GAIA_LLAMA_8B_BASE: &str = "https://llama8b.gaia.domains/v1";
pub const GAIA_LLAMA_70B_BASE: &str = "https://llama70b.gaia.domains/v1";
pub const GAIA_QWEN_72B_BASE: &str = "https://qwen72b.gaia.domains/v1";

/// Overrides the base URL of every endpoint pointing at [`OPENAI_BASE`]
pub const ENV_OPENAI_API_BASE: &str = "OPENAI_API_BASE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    ChatWithTools,
    #[serde(alias = "chat")]
    ChatOnly,
    #[serde(alias = "speech")]
    TextToSpeech,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub name: String,
    pub kind: EndpointKind,
    pub model: String,
    #[serde(alias = "base_url")]
    pub base: String,
    /// Used when `api_key_env` is empty
    #[serde(default)]
    pub api_key: String,
    /// Name of the environment variable holding the key
    #[serde(default)]
    pub api_key_env: String,
    /// Path appended to `base`
    #[serde(default = "default_chat_path")]
    pub url: String,
}

fn default_chat_path() -> String {
    "/chat/completions".to_string()
}

impl ApiEndpoint {
    fn new(
        name: &str,
        kind: EndpointKind,
        model: &str,
        base: &str,
        key: EndpointKey,
        url: &str,
    ) -> Self {
        let (api_key, api_key_env) = match key {
            EndpointKey::Literal(k) => (k.to_string(), String::new()),
            EndpointKey::Env(var) => (String::new(), var.to_string()),
        };
        Self {
            name: name.to_string(),
            kind,
            model: model.to_string(),
            base: base.to_string(),
            api_key,
            api_key_env,
            url: url.to_string(),
        }
    }

    /// Full request URL
    pub fn endpoint_url(&self) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), self.url)
    }

    /// Resolve the key, reading the environment when needed
    pub fn resolve_api_key(&self) -> Option<String> {
        if self.api_key_env.is_empty() {
            Some(self.api_key.clone())
        } else {
            std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
        }
    }
}

enum EndpointKey {
    Literal(&'static str),
    Env(&'static str),
}

/// Ordered endpoint list with environment-based filtering
#[derive(Debug, Clone)]
pub struct EndpointTable {
    endpoints: Vec<ApiEndpoint>,
}

impl Default for EndpointTable {
    fn default() -> Self {
        use EndpointKind::*;
        use EndpointKey::*;
        let chat = "/chat/completions";
        Self::new(vec![
            ApiEndpoint::new("deepseek-toolchat", ChatWithTools, "deepseek-chat", DEEPSEEK_BASE, Env("DEEPSEEK_API_KEY"), chat),
            ApiEndpoint::new("openai-toolchat", ChatWithTools, "gpt-4o", OPENAI_BASE, Env("OPENAI_API_KEY"), chat),
            ApiEndpoint::new("qwen-toolchat-72b", ChatWithTools, "qwen", GAIA_QWEN_72B_BASE, Literal("gaia"), chat),
            ApiEndpoint::new("llama-toolchat-70b", ChatWithTools, "llama", GAIA_LLAMA_70B_BASE, Literal("gaia"), chat),
            ApiEndpoint::new("llama-toolchat-8b", ChatWithTools, "llama", GAIA_LLAMA_8B_BASE, Literal("gaia"), chat),
            ApiEndpoint::new("openai-chat", ChatOnly, "gpt-4o", OPENAI_BASE, Env("OPENAI_API_KEY"), chat),
            ApiEndpoint::new("llama-chat", ChatOnly, "llama", GAIA_LLAMA_8B_BASE, Literal("gaia"), chat),
            ApiEndpoint::new("openai-tts", TextToSpeech, "tts-1", OPENAI_BASE, Env("OPENAI_API_KEY"), "/audio/speech"),
        ])
    }
}

impl EndpointTable {
    pub fn new(endpoints: Vec<ApiEndpoint>) -> Self {
        Self { endpoints }
    }

    /// Add endpoints ahead of the existing ones so they win lookups
    pub fn prepend(&mut self, extra: Vec<ApiEndpoint>) {
        let mut merged = extra;
        merged.append(&mut self.endpoints);
        self.endpoints = merged;
    }

    /// Apply `OPENAI_API_BASE` if set
    pub fn apply_env_overrides(&mut self) {
        if let Ok(base) = std::env::var(ENV_OPENAI_API_BASE) {
            if !base.is_empty() {
                self.override_base(OPENAI_BASE, &base);
            }
        }
    }

    fn override_base(&mut self, from: &str, to: &str) {
        for ep in self.endpoints.iter_mut().filter(|ep| ep.base == from) {
            ep.base = to.to_string();
        }
    }

    /// Usable endpoints of `kind` serving `model`, in table order
    pub fn lookup(&self, kind: EndpointKind, model: &str) -> Vec<ApiEndpoint> {
        self.endpoints
            .iter()
            .filter(|ep| ep.kind == kind && ep.model == model)
            .filter(|ep| ep.resolve_api_key().is_some())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> &[ApiEndpoint] {
        &self.endpoints
    }
}
