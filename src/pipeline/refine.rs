//! A second LLM pass to clean up structured MCQs.

use std::sync::Arc;

use schemars::JsonSchema;

use crate::{
    error::RefinementError,
    llm_client::LlmClient,
    prelude::*,
    prompt::{ChatPrompt, JsonObject},
    schema::ResponseSchema,
};

use super::mcq::{Mcq, McqSet};

/// The built-in refinement prompt.
pub fn default_refine_prompt() -> ChatPrompt {
    ChatPrompt::builtin("refine", include_str!("prompts/refine.toml"))
}

/// What the model must return when refining.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct RefinementResponse {
    /// The corrected MCQs, one for each input MCQ, in the same order.
    pub mcqs: Vec<Mcq>,
}

/// Fixes OCR damage in the wording of MCQs.
#[derive(Debug)]
pub struct Refiner {
    client: Arc<LlmClient>,
    prompt: ChatPrompt,
    schema: ResponseSchema,
}

impl Refiner {
    /// Create a new refiner.
    pub fn new(client: Arc<LlmClient>, prompt: ChatPrompt) -> Result<Self> {
        Ok(Self {
            client,
            prompt,
            schema: ResponseSchema::for_type::<RefinementResponse>()?,
        })
    }

    /// Refine all of `mcqs` in a single LLM call.
    ///
    /// An empty set is returned as-is without calling the model. Otherwise the
    /// result has exactly as many questions as the input, each with four
    /// options and "NA" wherever the input had one, or we fail.
    #[instrument(level = "debug", skip_all, fields(count = mcqs.len()))]
    pub async fn refine(&self, mcqs: McqSet) -> Result<McqSet, RefinementError> {
        if mcqs.is_empty() {
            debug!("Nothing to refine");
            return Ok(mcqs);
        }

        let mcqs_json = serde_json::to_string_pretty(&mcqs)
            .map_err(|err| RefinementError::Llm(format!("cannot serialize MCQs: {err}")))?;
        let mut bindings = JsonObject::new();
        bindings.insert("mcqs_json".to_owned(), Value::String(mcqs_json));
        bindings.insert("question_count".to_owned(), json!(mcqs.len()));

        let response = self
            .client
            .complete::<RefinementResponse>(&self.prompt, &bindings, &self.schema)
            .await
            .map_err(|err| RefinementError::Llm(format!("{err:#}")))?;

        if response.mcqs.len() != mcqs.len() {
            return Err(RefinementError::CountMismatch {
                expected: mcqs.len(),
                actual: response.mcqs.len(),
            });
        }
        response
            .mcqs
            .into_iter()
            .zip(&mcqs)
            .enumerate()
            .map(|(index, (refined, original))| refined.into_refined(index, original))
            .collect()
    }
}
