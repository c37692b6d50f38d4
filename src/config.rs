//! Credentials for the language model service.
//!
//! These are read from the command line or the environment exactly once, at
//! startup, and then passed explicitly to whatever needs them.

use std::fmt;

use clap::Args;

use crate::error::ConfigurationError;

/// Credential-related options.
#[derive(Args, Clone, Default)]
pub struct CredentialOpts {
    /// API key for the OpenAI-compatible LLM endpoint.
    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Override the LLM server URL, for LiteLLM, Ollama, Gemini's OpenAI
    /// endpoint and similar gateways.
    #[clap(long, env = "OPENAI_API_BASE")]
    pub api_base: Option<String>,
}

// Hand-written so the key never ends up in a log line.
impl fmt::Debug for CredentialOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialOpts")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .finish()
    }
}

/// Validated connection settings for the LLM service.
#[derive(Clone)]
pub struct LlmConfig {
    /// The API key. Never empty.
    pub api_key: String,

    /// An optional API base URL.
    pub api_base: Option<String>,
}

impl LlmConfig {
    /// Build an [`LlmConfig`] from command-line options.
    pub fn from_opts(opts: &CredentialOpts) -> Result<Self, ConfigurationError> {
        let api_key = opts
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(ConfigurationError::MissingCredential {
                var: "OPENAI_API_KEY",
                flag: "api-key",
            })?;
        let api_base = opts
            .api_base
            .as_deref()
            .map(str::trim)
            .filter(|base| !base.is_empty())
            .map(str::to_owned);
        Ok(Self {
            api_key: api_key.to_owned(),
            api_base,
        })
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .finish()
    }
}
