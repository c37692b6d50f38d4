//! The `extract` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    async_utils::io::write_json_pretty,
    config::{CredentialOpts, LlmConfig},
    drivers::{LlmOpts, openai::OpenAiDriver},
    llm_client::LlmClient,
    pipeline::{
        batch::BatchAggregator,
        extract::{TesseractOcrEngine, TesseractOpts, TextExtractor},
        image::ImagePipeline,
        refine::{Refiner, default_refine_prompt},
        structure::{SchemaStructurer, default_structure_prompt},
    },
    prelude::*,
    prompt::ChatPrompt,
    ui::{ProgressConfig, Ui},
};

use super::BatchOpts;

/// Options for the `extract` subcommand.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    #[clap(flatten)]
    pub batch: BatchOpts,

    #[clap(flatten)]
    pub credentials: CredentialOpts,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,

    #[clap(flatten)]
    pub tesseract_opts: TesseractOpts,

    /// A TOML or JSON prompt to use for structuring, instead of the built-in
    /// one. It will be passed `text`.
    #[clap(long)]
    pub structure_prompt: Option<PathBuf>,

    /// A TOML or JSON prompt to use for refinement, instead of the built-in
    /// one. It will be passed `mcqs_json` and `question_count`.
    #[clap(long)]
    pub refine_prompt: Option<PathBuf>,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    // Check our environment before touching any images.
    opts.batch.validate()?;
    let config = LlmConfig::from_opts(&opts.credentials)?;
    let engine = TesseractOcrEngine::new(opts.tesseract_opts.clone());
    engine.check_available().await?;

    let structure_prompt =
        ChatPrompt::load_or(opts.structure_prompt.as_deref(), default_structure_prompt)
            .await?;
    let refine_prompt =
        ChatPrompt::load_or(opts.refine_prompt.as_deref(), default_refine_prompt).await?;

    // Assemble our pipeline.
    let driver = Arc::new(OpenAiDriver::new(&config));
    let client = Arc::new(LlmClient::new(driver, opts.llm_opts.clone()));
    let pipeline = ImagePipeline::new(
        TextExtractor::new(Arc::new(engine)),
        SchemaStructurer::new(client.clone(), structure_prompt)?,
        Refiner::new(client.clone(), refine_prompt)?,
    );
    let aggregator = BatchAggregator::new(Arc::new(pipeline), opts.batch.job_count);

    // Run the batch.
    let images = opts.batch.raw_images();
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📝",
            msg: "Extracting MCQs",
            done_msg: "Extracted MCQs",
        },
        u64::try_from(images.len()).context("too many images")?,
    );
    info!(model = %client.model(), images = images.len(), "Starting batch");
    let result = aggregator.run_batch(images, Some(&pb)).await;
    pb.finish();

    write_json_pretty(opts.batch.output_path.as_deref(), &result).await?;

    let usage = client.token_usage();
    info!(
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "Token usage"
    );
    if !usage.is_zero() {
        ui.display_message(
            "📈",
            &format!(
                "{} input tokens and {} output tokens used",
                usage.prompt_tokens, usage.completion_tokens,
            ),
        );
    }
    opts.batch
        .check_failures(&ui, result.failure_count(), result.len())
}
