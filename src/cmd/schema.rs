//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_json_pretty,
    cmd::ocr::OcrRecord,
    pipeline::{
        batch::{BatchResult, ImageOutcome},
        mcq::Mcq,
        refine::RefinementResponse,
        structure::StructuringResponse,
    },
    prelude::*,
    prompt::ChatPrompt,
    schema::strict_schema_for,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// A single MCQ.
    Mcq,
    /// The result for one image in `extract` output.
    ImageOutcome,
    /// The full `extract` output.
    BatchResult,
    /// One record of `ocr` output.
    OcrRecord,
    /// A prompt file for `--structure-prompt` or `--refine-prompt`.
    ChatPrompt,
    /// What the model must return when structuring.
    StructuringResponse,
    /// What the model must return when refining.
    RefinementResponse,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let to_value = |schema| serde_json::to_value(schema).context("failed to serialize schema");
    let schema = match schema_opts.schema_type {
        SchemaType::Mcq => to_value(schema_for!(Mcq))?,
        SchemaType::ImageOutcome => to_value(schema_for!(ImageOutcome))?,
        SchemaType::BatchResult => to_value(schema_for!(BatchResult))?,
        SchemaType::OcrRecord => to_value(schema_for!(OcrRecord))?,
        SchemaType::ChatPrompt => to_value(schema_for!(ChatPrompt))?,
        // These are the strict schemas we actually send to the model.
        SchemaType::StructuringResponse => strict_schema_for::<StructuringResponse>()?,
        SchemaType::RefinementResponse => strict_schema_for::<RefinementResponse>()?,
    };
    write_json_pretty(schema_opts.output_path.as_deref(), &schema).await
}
