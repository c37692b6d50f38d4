//! Structured LLM calls shared by the structuring and refinement stages.

use std::{
    fmt, iter,
    sync::{Arc, Mutex},
};

use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use leaky_bucket::RateLimiter;
use serde::de::DeserializeOwned;

use crate::{
    drivers::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage},
    prelude::*,
    prompt::{ChatPrompt, JsonObject, RenderedPrompt},
    schema::ResponseSchema,
};

/// A handle for making schema-checked LLM calls.
///
/// This is cheap to share between concurrent image pipelines. Rate limits and
/// token usage are tracked across all of them.
pub struct LlmClient {
    /// The driver that talks to the model.
    driver: Arc<dyn Driver>,

    /// Model and sampling options.
    llm_opts: LlmOpts,

    /// Our rate limiter, if any.
    rate_limiter: Option<RateLimiter>,

    /// Total tokens used so far.
    token_usage: Mutex<TokenUsage>,
}

impl LlmClient {
    /// Create a new client.
    pub fn new(driver: Arc<dyn Driver>, llm_opts: LlmOpts) -> Self {
        let rate_limiter = llm_opts.rate_limit.as_ref().map(|limit| {
            debug!(%limit, "Rate limiting LLM calls");
            limit.to_rate_limiter()
        });
        Self {
            driver,
            llm_opts,
            rate_limiter,
            token_usage: Mutex::new(TokenUsage::default()),
        }
    }

    /// The model we're calling.
    pub fn model(&self) -> &str {
        &self.llm_opts.model
    }

    /// Total token usage so far.
    pub fn token_usage(&self) -> TokenUsage {
        self.token_usage
            .lock()
            .map(|usage| usage.clone())
            .unwrap_or_default()
    }

    /// Render `prompt`, send it, and parse a reply matching `schema`.
    ///
    /// Known transient failures are retried up to `max_retries` times. A reply
    /// that does not match `schema` fails immediately.
    pub async fn complete<T>(
        &self,
        prompt: &ChatPrompt,
        bindings: &JsonObject,
        schema: &ResponseSchema,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let rendered = prompt.render(bindings).context("Error rendering prompt")?;
        trace!(?rendered, "Rendered prompt");

        let first = self.attempt(&rendered, schema).await;
        let response = if self.llm_opts.max_retries == 0 {
            match first {
                RetryResult::Ok { output, .. } => output,
                RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
                    return Err(error);
                }
            }
        } else {
            // Keep unit tests fast.
            let backoff_range_millis = if cfg!(test) { 1..=10 } else { 500..=30_000 };
            let jitter = ExponentialJitter::FromBackoffRange {
                backoff_range_millis,
                re_attempts: self.llm_opts.max_retries,
                jitter_ratio: 0.2,
            };
            let resolved = first
                .retry_with_async(|_| self.attempt(&rendered, schema))
                .with_exponential_jitter(|| jitter)
                .await;
            resolved_to_result(resolved)?
        };

        schema.validate(&response)?;
        serde_json::from_value(response).context("Error deserializing LLM response")
    }

    /// Make a single request.
    async fn attempt(
        &self,
        prompt: &RenderedPrompt,
        schema: &ResponseSchema,
    ) -> LlmRetryResult<Value> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }
        match self
            .driver
            .chat_completion(prompt, schema.json_schema(), &self.llm_opts)
            .await
        {
            RetryResult::Ok {
                reported_input,
                output:
                    ChatCompletionResponse {
                        response,
                        token_usage,
                    },
            } => {
                if let Some(usage) = token_usage {
                    if let Ok(mut total) = self.token_usage.lock() {
                        *total += usage;
                    }
                }
                RetryResult::Ok {
                    reported_input,
                    output: response,
                }
            }
            RetryResult::Transient { input, error } => {
                RetryResult::Transient { input, error }
            }
            RetryResult::Fatal { input, error } => RetryResult::Fatal { input, error },
        }
    }
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("driver", &self.driver)
            .field("llm_opts", &self.llm_opts)
            .finish_non_exhaustive()
    }
}

/// Collapse a [`ResolvedResult`] into a plain [`Result`], logging what
/// happened along the way.
fn resolved_to_result<T>(
    resolved: ResolvedResult<(), (), T, anyhow::Error>,
) -> Result<T> {
    match resolved {
        ResolvedResult::Ok { output, .. } => Ok(output),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => {
            warn!(
                "LLM call succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors.len(),
                keen_retry::loggable_retry_errors(&retry_errors)
            );
            Ok(output)
        }
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => {
            let attempts = retry_errors.len() + 1;
            let history = retry_errors
                .iter()
                .chain(iter::once(&fatal_error))
                .map(|err| format!("{err:#}"))
                .collect::<Vec<_>>()
                .join("; ");
            Err(fatal_error.context(format!(
                "LLM call failed after {attempts} attempts: [{history}]"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use schemars::JsonSchema;

    use super::*;
    use crate::drivers::scripted::ScriptedDriver;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Answer {
        answer: String,
    }

    fn prompt() -> ChatPrompt {
        toml::from_str(
            r#"
[[messages]]
user = "Say {{word}}"
"#,
        )
        .unwrap()
    }

    fn bindings() -> JsonObject {
        let mut bindings = JsonObject::new();
        bindings.insert("word".to_owned(), json!("hi"));
        bindings
    }

    #[tokio::test]
    async fn parses_valid_replies_and_counts_tokens() {
        let driver = Arc::new(ScriptedDriver::new(|title, prompt| {
            assert_eq!(title, "Answer");
            assert_eq!(prompt.last_user_message(), Some("Say hi"));
            Ok(json!({ "answer": "hi" }))
        }));
        let client = LlmClient::new(driver.clone(), LlmOpts::default());
        let schema = ResponseSchema::for_type::<Answer>().unwrap();

        let answer: Answer = client.complete(&prompt(), &bindings(), &schema).await.unwrap();
        assert_eq!(answer.answer, "hi");
        assert_eq!(driver.calls(), 1);
        assert_eq!(
            client.token_usage(),
            TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
            }
        );
    }

    #[tokio::test]
    async fn schema_violations_are_not_retried() {
        let driver = Arc::new(ScriptedDriver::new(|_, _| Ok(json!({ "wrong": 1 }))));
        let opts = LlmOpts {
            max_retries: 3,
            ..LlmOpts::default()
        };
        let client = LlmClient::new(driver.clone(), opts);
        let schema = ResponseSchema::for_type::<Answer>().unwrap();

        let result = client
            .complete::<Answer>(&prompt(), &bindings(), &schema)
            .await;
        assert!(result.is_err());
        assert_eq!(driver.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failures_fail_without_retries() {
        let driver = Arc::new(
            ScriptedDriver::new(|_, _| Ok(json!({ "answer": "hi" })))
                .with_transient_failures(1),
        );
        let client = LlmClient::new(driver.clone(), LlmOpts::default());
        let schema = ResponseSchema::for_type::<Answer>().unwrap();

        let result = client
            .complete::<Answer>(&prompt(), &bindings(), &schema)
            .await;
        assert!(result.is_err());
        assert_eq!(driver.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_when_enabled() {
        let driver = Arc::new(
            ScriptedDriver::new(|_, _| Ok(json!({ "answer": "hi" })))
                .with_transient_failures(2),
        );
        let opts = LlmOpts {
            max_retries: 3,
            ..LlmOpts::default()
        };
        let client = LlmClient::new(driver.clone(), opts);
        let schema = ResponseSchema::for_type::<Answer>().unwrap();

        let answer: Answer = client.complete(&prompt(), &bindings(), &schema).await.unwrap();
        assert_eq!(answer.answer, "hi");
        assert_eq!(driver.calls(), 3);
    }
}
