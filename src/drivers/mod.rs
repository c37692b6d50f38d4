//! LLM drivers.
//!
//! The pipeline only ever talks to a [`Driver`], so tests can swap in a
//! scripted model and production can talk to any OpenAI-compatible gateway.

use std::{error, fmt, ops::AddAssign, pin::Pin, time::Duration};

use clap::Args;
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::RetryResult;
use schemars::JsonSchema;
use tokio::time;

use crate::{prelude::*, prompt::RenderedPrompt, rate_limit::RateLimit, retry::IsKnownTransient};

pub mod openai;
#[cfg(test)]
pub mod scripted;

/// Our chat-related options.
#[derive(Args, Clone, Debug)]
pub struct LlmOpts {
    /// The model to use for structuring and refinement.
    #[clap(long, default_value = "gpt-4o-mini")]
    pub model: String,

    /// An upper limit on the number of completion tokens to generate. This may
    /// help prevent runaway responses, but it may also cause incomplete
    /// results.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// The temperature to use for sampling, between 0.0 and 2.0. Lower values
    /// make the output more repeatable. Defaults to the model's default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// The top-p sampling value to use, between 0.0 and 1.0. Defaults to the
    /// model's default.
    #[clap(long)]
    pub top_p: Option<f32>,

    /// A timeout, in seconds, for the LLM to return a complete response.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// A rate limit for LLM API requests, of the form "10/s", "60/m" or
    /// "1000/h". This is applied separately from `--jobs`.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// How many times to retry an LLM call that failed with a known transient
    /// error (timeouts, overloaded servers). Schema violations are never
    /// retried.
    #[clap(long, default_value = "0")]
    pub max_retries: u8,
}

impl Default for LlmOpts {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_owned(),
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            timeout: None,
            rate_limit: None,
            max_retries: 0,
        }
    }
}

impl LlmOpts {
    /// Apply our configured timeout (if any) to a future.
    ///
    /// `'fut` is the lifetime of anything `future` borrows. We box the result
    /// because the timeout and no-timeout branches have different types.
    pub fn apply_timeout<'fut, T, E>(
        &self,
        future: impl Future<Output = Result<T, E>> + Send + 'fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, LlmError<E>>> + Send + 'fut>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let future = future.map_err(LlmError::Native);
        if let Some(timeout) = self.timeout {
            time::timeout(Duration::from_secs(timeout), future)
                .map(|result| match result {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmError::Timeout),
                })
                .boxed()
        } else {
            future.boxed()
        }
    }
}

/// A [`RetryResult`] for LLM requests. This allows [`Driver`] instances to
/// distinguish between errors that may be transient, and errors that are
/// definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Interface trait for LLM drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Run a "chat completion" request whose response must be a JSON value
    /// matching `schema`.
    ///
    /// Drivers parse the response as JSON but do not validate it against the
    /// schema. That is the caller's job.
    async fn chat_completion(
        &self,
        prompt: &RenderedPrompt,
        schema: &Value,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse>;
}

/// A chat completion response.
#[derive(Debug)]
pub struct ChatCompletionResponse {
    /// Structured response from the LLM. This will not have been
    /// validated yet.
    pub response: Value,

    /// Token usage.
    pub token_usage: Option<TokenUsage>,
}

/// Token usage.
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// An error which occurred while calling an LLM.
#[derive(Debug)]
pub enum LlmError<E> {
    /// An error from the underlying client.
    Native(E),

    /// A timeout error.
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Runaway responses and slow servers often do better on a second try.
            LlmError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout => write!(f, "LLM request timed out"),
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[tokio::test]
    async fn apply_timeout_reports_elapsed_requests() {
        let opts = LlmOpts {
            timeout: Some(0),
            ..LlmOpts::default()
        };
        let slow = async {
            time::sleep(Duration::from_secs(5)).await;
            Ok::<_, io::Error>(())
        };
        let result = opts.apply_timeout(slow).await;
        assert!(matches!(result, Err(LlmError::Timeout)));
    }

    #[tokio::test]
    async fn apply_timeout_passes_native_errors_through() {
        let opts = LlmOpts::default();
        let failing = async { Err::<(), _>(io::Error::other("boom")) };
        let err = opts.apply_timeout(failing).await.unwrap_err();
        assert_eq!(err.to_string(), "LLM error: boom");
    }

    #[test]
    fn token_usage_adds_up() {
        let mut total = TokenUsage::default();
        assert!(total.is_zero());
        total += TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 3,
        };
        total += TokenUsage {
            prompt_tokens: 5,
            completion_tokens: 2,
        };
        assert_eq!(total.prompt_tokens, 15);
        assert_eq!(total.completion_tokens, 5);
    }
}
