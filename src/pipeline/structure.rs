//! Turning OCR text into MCQs.

use std::sync::Arc;

use schemars::JsonSchema;

use crate::{
    error::StructuringError,
    llm_client::LlmClient,
    prelude::*,
    prompt::{ChatPrompt, JsonObject},
    schema::ResponseSchema,
};

use super::mcq::{Mcq, McqSet};

/// The built-in structuring prompt.
pub fn default_structure_prompt() -> ChatPrompt {
    ChatPrompt::builtin("structure", include_str!("prompts/structure.toml"))
}

/// What the model must return when structuring.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct StructuringResponse {
    /// Every MCQ found in the text, in reading order. Empty if there are none.
    pub mcqs: Vec<Mcq>,
}

/// Asks a language model to find the MCQs in some text.
#[derive(Debug)]
pub struct SchemaStructurer {
    client: Arc<LlmClient>,
    prompt: ChatPrompt,
    schema: ResponseSchema,
}

impl SchemaStructurer {
    /// Create a new structurer.
    pub fn new(client: Arc<LlmClient>, prompt: ChatPrompt) -> Result<Self> {
        Ok(Self {
            client,
            prompt,
            schema: ResponseSchema::for_type::<StructuringResponse>()?,
        })
    }

    /// Structure OCR text into MCQs. Makes at most one LLM call.
    ///
    /// Text that is entirely whitespace has no questions in it, so we don't
    /// bother asking.
    #[instrument(level = "debug", skip_all, fields(chars = text.len()))]
    pub async fn structure(&self, text: &str) -> Result<McqSet, StructuringError> {
        if text.trim().is_empty() {
            debug!("No text to structure");
            return Ok(vec![]);
        }

        let mut bindings = JsonObject::new();
        bindings.insert("text".to_owned(), Value::String(text.to_owned()));
        let response = self
            .client
            .complete::<StructuringResponse>(&self.prompt, &bindings, &self.schema)
            .await
            .map_err(|err| StructuringError::Llm(format!("{err:#}")))?;

        let mut mcqs = Vec::with_capacity(response.mcqs.len());
        for (index, mcq) in response.mcqs.into_iter().enumerate() {
            if let Some(mcq) = mcq.into_structured(index)? {
                mcqs.push(mcq);
            }
        }
        debug!(count = mcqs.len(), "Structured MCQs");
        Ok(mcqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drivers::{LlmOpts, scripted::ScriptedDriver},
        pipeline::mcq::NA,
    };

    fn structurer(driver: Arc<ScriptedDriver>) -> SchemaStructurer {
        let client = Arc::new(LlmClient::new(driver, LlmOpts::default()));
        SchemaStructurer::new(client, default_structure_prompt()).unwrap()
    }

    #[test]
    fn builtin_prompt_renders() {
        let mut bindings = JsonObject::new();
        bindings.insert("text".to_owned(), json!("a < b & c"));
        let rendered = default_structure_prompt().render(&bindings).unwrap();
        assert!(rendered.developer.is_some());
        assert!(rendered.last_user_message().unwrap().contains("a < b & c"));
    }

    #[tokio::test]
    async fn pads_and_cleans_model_output() {
        let driver = Arc::new(ScriptedDriver::new(|title, prompt| {
            assert_eq!(title, "StructuringResponse");
            assert!(prompt.last_user_message().unwrap().contains("What is 2+2?"));
            Ok(json!({
                "mcqs": [
                    { "question": "What is  2+2?", "options": ["3", "4", "5"] },
                    { "question": "  ", "options": ["x"] },
                ]
            }))
        }));
        let mcqs = structurer(driver.clone())
            .structure("1. What is 2+2? (a) 3 (b) 4 (c) 5")
            .await
            .unwrap();
        assert_eq!(mcqs, vec![Mcq::new("What is 2+2?", ["3", "4", "5", NA])]);
        assert_eq!(driver.calls(), 1);
    }

    #[tokio::test]
    async fn no_questions_is_an_empty_set() {
        let driver = Arc::new(ScriptedDriver::new(|_, _| Ok(json!({ "mcqs": [] }))));
        let mcqs = structurer(driver).structure("Chapter 1\nIntroduction").await.unwrap();
        assert!(mcqs.is_empty());
    }

    #[tokio::test]
    async fn blank_text_skips_the_model() {
        let driver = Arc::new(ScriptedDriver::unreachable());
        let mcqs = structurer(driver.clone()).structure(" \n\t").await.unwrap();
        assert!(mcqs.is_empty());
        assert_eq!(driver.calls(), 0);
    }

    #[tokio::test]
    async fn non_sequence_responses_are_errors() {
        let driver = Arc::new(ScriptedDriver::new(|_, _| {
            Ok(json!({ "mcqs": { "question": "Q", "options": ["a", "b", "c", "d"] } }))
        }));
        let err = structurer(driver).structure("some text").await.unwrap_err();
        assert!(matches!(err, StructuringError::Llm(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn llm_failures_are_errors() {
        let driver = Arc::new(ScriptedDriver::new(|_, _| Err(anyhow!("server on fire"))));
        let err = structurer(driver).structure("some text").await.unwrap_err();
        assert!(err.to_string().contains("server on fire"), "got {err}");
    }
}
