//! Scripted driver for unit tests.
//!
//! Each call is answered by a closure that sees the schema title and the
//! rendered prompt, so one driver can play both the structuring and the
//! refinement model.

use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use keen_retry::RetryResult;

use crate::{
    prelude::*,
    prompt::RenderedPrompt,
    retry::{retry_result_fatal, retry_result_ok},
    schema::schema_title,
};

use super::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage};

/// Signature of a scripted reply.
type ReplyFn = dyn Fn(&str, &RenderedPrompt) -> Result<Value> + Send + Sync;

/// A [`Driver`] that answers from a closure and counts its calls.
pub struct ScriptedDriver {
    reply: Box<ReplyFn>,
    calls: AtomicUsize,
    /// Number of leading calls that fail with a transient error.
    transient_failures: usize,
}

impl ScriptedDriver {
    /// Create a driver that answers every call with `reply`.
    pub fn new(
        reply: impl Fn(&str, &RenderedPrompt) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
            transient_failures: 0,
        }
    }

    /// Fail the first `count` calls with a transient error.
    pub fn with_transient_failures(mut self, count: usize) -> Self {
        self.transient_failures = count;
        self
    }

    /// A driver that fails the test if it is ever called.
    pub fn unreachable() -> Self {
        Self::new(|title, _| panic!("unexpected LLM call for {title}"))
    }

    /// How many times has this driver been called?
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ScriptedDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedDriver")
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn chat_completion(
        &self,
        prompt: &RenderedPrompt,
        schema: &Value,
        _llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        let call_idx = self.calls.fetch_add(1, Ordering::SeqCst);
        if call_idx < self.transient_failures {
            return RetryResult::Transient {
                input: (),
                error: anyhow!("scripted transient failure {call_idx}"),
            };
        }
        match (self.reply)(schema_title(schema), prompt) {
            Ok(response) => retry_result_ok(ChatCompletionResponse {
                response,
                token_usage: Some(TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 20,
                }),
            }),
            Err(error) => retry_result_fatal(error),
        }
    }
}
