//! The `ocr` subcommand, which runs text extraction alone.

use std::sync::Arc;

use clap::Args;
use futures::StreamExt as _;
use schemars::JsonSchema;

use crate::{
    async_utils::io::write_json_pretty,
    pipeline::{
        batch::map_images_bounded,
        extract::{TesseractOcrEngine, TesseractOpts, TextExtractor},
    },
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use super::BatchOpts;

/// Options for the `ocr` subcommand.
#[derive(Debug, Args)]
pub struct OcrCmdOpts {
    #[clap(flatten)]
    pub batch: BatchOpts,

    #[clap(flatten)]
    pub tesseract_opts: TesseractOpts,
}

/// OCR output for one image.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct OcrRecord {
    /// The image name. Unique within one run.
    pub image: String,

    /// The extracted text, if OCR succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Why OCR failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrCmdOpts) -> Result<()> {
    opts.batch.validate()?;
    let engine = TesseractOcrEngine::new(opts.tesseract_opts.clone());
    engine.check_available().await?;
    let extractor = TextExtractor::new(Arc::new(engine));

    let images = opts.batch.raw_images();
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing images",
            done_msg: "OCRed images",
        },
        u64::try_from(images.len()).context("too many images")?,
    );
    let records = map_images_bounded(images, opts.batch.job_count, move |image| {
        let extractor = extractor.clone();
        async move {
            let result = extractor.extract(&image).await;
            match result {
                Ok(text) => OcrRecord {
                    image: image.name,
                    text: Some(text),
                    error: None,
                },
                Err(err) => {
                    warn!(image = %image.name, "OCR failed: {err}");
                    OcrRecord {
                        image: image.name,
                        text: None,
                        error: Some(err.to_string()),
                    }
                }
            }
        }
    });
    let records = pb.wrap_stream(records).collect::<Vec<_>>().await;
    pb.finish();

    write_json_pretty(opts.batch.output_path.as_deref(), &records).await?;
    let failure_count = records.iter().filter(|r| r.error.is_some()).count();
    opts.batch.check_failures(&ui, failure_count, records.len())
}
