//! Our OpenAI driver, which we also use for LiteLLM, Ollama, Gemini's
//! OpenAI-compatible endpoint and other gateways.

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, FinishReason, ResponseFormat,
        ResponseFormatJsonSchema,
    },
};

use crate::{
    config::LlmConfig,
    prelude::*,
    prompt::{RenderedMessage, RenderedPrompt},
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, try_fatal,
        try_potentially_transient, try_transient,
    },
    schema::schema_title,
};

use super::{ChatCompletionResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage};

/// Driver for any server speaking the OpenAI `/chat/completions` API.
#[derive(Debug)]
pub struct OpenAiDriver {
    /// The OpenAI client.
    client: Client<OpenAIConfig>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver from validated credentials.
    pub fn new(config: &LlmConfig) -> Self {
        let mut client_config = OpenAIConfig::new().with_api_key(config.api_key.clone());
        if let Some(api_base) = &config.api_base {
            client_config = client_config.with_api_base(api_base.clone());
        }
        Self {
            client: Client::with_config(client_config),
        }
    }
}

/// Convert a rendered prompt into OpenAI messages.
fn to_openai_messages(
    prompt: &RenderedPrompt,
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let mut messages = Vec::with_capacity(prompt.messages.len() + 1);
    if let Some(developer) = &prompt.developer {
        messages.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(developer.as_str())
                .build()?
                .into(),
        );
    }
    for message in &prompt.messages {
        messages.push(match message {
            RenderedMessage::User(text) => ChatCompletionRequestUserMessageArgs::default()
                .content(text.as_str())
                .build()?
                .into(),
            RenderedMessage::Assistant(json) => {
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(json.as_str())
                    .build()?
                    .into()
            }
        });
    }
    Ok(messages)
}

#[async_trait]
impl Driver for OpenAiDriver {
    #[instrument(level = "debug", skip_all, fields(model = %llm_opts.model))]
    async fn chat_completion(
        &self,
        prompt: &RenderedPrompt,
        schema: &Value,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        let messages = try_fatal!(to_openai_messages(prompt));

        // Ask for strict structured output.
        let json_schema = ResponseFormatJsonSchema {
            name: schema_title(schema).to_owned(),
            schema: Some(schema.clone()),
            strict: Some(true),
            description: None,
        };

        let mut req = CreateChatCompletionRequestArgs::default();
        req.model(llm_opts.model.clone())
            .messages(messages)
            .response_format(ResponseFormat::JsonSchema { json_schema })
            // Don't keep copies of exam content on the provider's side.
            .store(false);
        if let Some(max_completion_tokens) = llm_opts.max_completion_tokens {
            req.max_completion_tokens(max_completion_tokens);
        }
        if let Some(temperature) = llm_opts.temperature {
            req.temperature(temperature);
        }
        if let Some(top_p) = llm_opts.top_p {
            req.top_p(top_p);
        }
        let req = try_fatal!(req.build().context("Error building request"));
        trace!(?req, "Request");

        // Call the server.
        let chat = self.client.chat();
        let chat_result: Value =
            try_potentially_transient!(llm_opts.apply_timeout(chat.create_byot(&req)).await);
        debug!(%chat_result, "OpenAI response");
        let response = try_fatal!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
                .context("Error parsing OpenAI response")
        );

        let token_usage = response.usage.map(|usage| TokenUsage {
            prompt_tokens: u64::from(usage.prompt_tokens),
            completion_tokens: u64::from(usage.completion_tokens),
        });

        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("No choices in OpenAI response"));
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!(
                "Content filter triggered (may also be a RECITATION error for Gemini models)"
            ));
        }
        let content = choice.message.content.as_deref().unwrap_or_default();
        let response = try_transient!(
            // No JSON means the model ignored `response_format`. That can
            // clear up on another attempt.
            serde_json::from_str::<Value>(content).with_context(|| format!(
                "Error parsing OpenAI response content: {:?}",
                content
            ))
        );
        retry_result_ok(ChatCompletionResponse {
            response,
            token_usage,
        })
    }
}
