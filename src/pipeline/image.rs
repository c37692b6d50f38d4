//! Processing a single image from start to finish.

use std::panic::AssertUnwindSafe;

use futures::FutureExt as _;

use crate::{error::PipelineError, prelude::*};

use super::{
    extract::{RawImage, TextExtractor},
    mcq::McqSet,
    refine::Refiner,
    structure::SchemaStructurer,
};

/// OCR, then structuring, then refinement.
#[derive(Debug)]
pub struct ImagePipeline {
    extractor: TextExtractor,
    structurer: SchemaStructurer,
    refiner: Refiner,
}

impl ImagePipeline {
    /// Create a new pipeline from its stages.
    pub fn new(extractor: TextExtractor, structurer: SchemaStructurer, refiner: Refiner) -> Self {
        Self {
            extractor,
            structurer,
            refiner,
        }
    }

    /// Run every stage on `image`.
    ///
    /// Nothing escapes this function except a value: stage errors and panics
    /// both come back as a [`PipelineError`].
    #[instrument(level = "info", skip_all, fields(image = %image.name))]
    pub async fn run(&self, image: &RawImage) -> Result<McqSet, PipelineError> {
        match AssertUnwindSafe(self.run_stages(image)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown panic");
                error!(%msg, "Pipeline panicked");
                Err(PipelineError::Internal(msg.to_owned()))
            }
        }
    }

    async fn run_stages(&self, image: &RawImage) -> Result<McqSet, PipelineError> {
        let text = self.extractor.extract(image).await?;
        let mcqs = self.structurer.structure(&text).await?;
        let mcqs = self.refiner.refine(mcqs).await?;
        Ok(mcqs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        drivers::{LlmOpts, scripted::ScriptedDriver},
        error::RefinementError,
        llm_client::LlmClient,
        pipeline::{
            extract::tests::{StubOcrEngine, png_bytes},
            mcq::{Mcq, NA},
            refine::default_refine_prompt,
            structure::default_structure_prompt,
        },
    };

    /// Build a pipeline around a stub OCR engine and a scripted model.
    pub(crate) fn pipeline(ocr_text: &str, driver: Arc<ScriptedDriver>) -> ImagePipeline {
        let client = Arc::new(LlmClient::new(driver, LlmOpts::default()));
        ImagePipeline::new(
            TextExtractor::new(Arc::new(StubOcrEngine {
                text: ocr_text.to_owned(),
            })),
            SchemaStructurer::new(client.clone(), default_structure_prompt()).unwrap(),
            Refiner::new(client, default_refine_prompt()).unwrap(),
        )
    }

    /// A model that finds one three-option question and refines it unchanged.
    pub(crate) fn echo_model() -> ScriptedDriver {
        ScriptedDriver::new(|title, prompt| match title {
            "StructuringResponse" => Ok(json!({
                "mcqs": [{ "question": "Pick a colour", "options": ["red", "green", "blue"] }]
            })),
            "RefinementResponse" => {
                let user = prompt.last_user_message().unwrap_or_default();
                let start = user.find('[').ok_or_else(|| anyhow!("no MCQs in prompt"))?;
                let mcqs: Value = serde_json::from_str(&user[start..])?;
                Ok(json!({ "mcqs": mcqs }))
            }
            other => Err(anyhow!("unexpected schema {other}")),
        })
    }

    #[tokio::test]
    async fn three_options_are_padded_and_survive_refinement() {
        let driver = Arc::new(echo_model());
        let mcqs = pipeline("Pick a colour (a) red (b) green (c) blue", driver.clone())
            .run(&RawImage::from_bytes("img1.png", png_bytes()))
            .await
            .unwrap();
        assert_eq!(mcqs, vec![Mcq::new("Pick a colour", ["red", "green", "blue", NA])]);
        assert_eq!(driver.calls(), 2);
    }

    #[tokio::test]
    async fn padded_options_must_stay_na_through_refinement() {
        let driver = Arc::new(ScriptedDriver::new(|title, _| match title {
            "StructuringResponse" => Ok(json!({
                "mcqs": [{ "question": "Pick a colour", "options": ["red", "green", "blue"] }]
            })),
            _ => Ok(json!({
                "mcqs": [{ "question": "Pick a colour", "options": ["red", "green", "blue", "yellow"] }]
            })),
        }));
        let err = pipeline("Pick a colour (a) red (b) green (c) blue", driver.clone())
            .run(&RawImage::from_bytes("img1.png", png_bytes()))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                PipelineError::Refinement(RefinementError::SentinelChanged { option: 3, .. })
            ),
            "got {err:?}"
        );
        assert_eq!(driver.calls(), 2);
    }

    #[tokio::test]
    async fn blank_pages_make_no_model_calls() {
        let driver = Arc::new(ScriptedDriver::unreachable());
        let mcqs = pipeline("", driver.clone())
            .run(&RawImage::from_bytes("img1.png", png_bytes()))
            .await
            .unwrap();
        assert!(mcqs.is_empty());
        assert_eq!(driver.calls(), 0);
    }

    #[tokio::test]
    async fn refinement_failures_discard_structured_output() {
        let driver = Arc::new(ScriptedDriver::new(|title, _| match title {
            "StructuringResponse" => Ok(json!({
                "mcqs": [{ "question": "Q", "options": ["a", "b", "c", "d"] }]
            })),
            _ => Ok(json!({ "mcqs": [] })),
        }));
        let err = pipeline("Q a b c d", driver)
            .run(&RawImage::from_bytes("img1.png", png_bytes()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Refinement(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let driver = Arc::new(ScriptedDriver::new(|_, _| panic!("model exploded")));
        let err = pipeline("some text", driver)
            .run(&RawImage::from_bytes("img1.png", png_bytes()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Internal(ref msg) if msg.contains("model exploded")));
    }
}
