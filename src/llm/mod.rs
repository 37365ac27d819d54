pub mod chat;
pub mod sse;
use serde::{ Deserialize, Serialize };
use std::str::FromStr;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmType {
    OpenAI,
    Anthropic,
}

impl LlmType {
    pub const ALL: [LlmType; 2] = [LlmType::OpenAI, LlmType::Anthropic];

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmType::OpenAI => "openai",
            LlmType::Anthropic => "anthropic",
        }
    }

    /// Environment variable that carries this provider's API key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            LlmType::OpenAI => "OPENAI_API_KEY",
            LlmType::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            LlmType::OpenAI => "OpenAI",
            LlmType::Anthropic => "Anthropic",
        }
    }
}

impl fmt::Display for LlmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLlmTypeError {
    message: String,
}

impl fmt::Display for ParseLlmTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseLlmTypeError {}
impl FromStr for LlmType {
    type Err = ParseLlmTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmType::OpenAI),
            "anthropic" => Ok(LlmType::Anthropic),
            _ =>
                Err(ParseLlmTypeError {
                    message: format!(
                        "unknown provider: {}\n\nAvailable providers: openai, anthropic",
                        s
                    ),
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub llm_type: LlmType,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_type: LlmType::OpenAI,
            api_key: None,
            base_url: None,
        }
    }
}
