//! Error types for the extraction pipeline.
//!
//! Per-image failures ([`ExtractionError`], [`StructuringError`] and
//! [`RefinementError`]) are wrapped in a [`PipelineError`] and recorded in the
//! batch output as text. Only a [`ConfigurationError`] may stop a batch before
//! any image has been processed.

use std::{io, path::PathBuf};

use thiserror::Error;

/// OCR could not turn an image into text.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The file extension is not one of the image types we accept.
    #[error("unsupported image format for {name:?} (expected png, jpeg, webp or bmp)")]
    UnsupportedFormat { name: String },

    /// We could not read the image data.
    #[error("cannot read image {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The image data could not be decoded.
    #[error("cannot decode image data: {0}")]
    Decode(#[from] image::ImageError),

    /// The OCR engine ran, but failed.
    #[error("OCR engine failed: {0}")]
    Engine(String),

    /// The OCR engine did not finish in time.
    #[error("OCR timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// The language model's response could not be turned into MCQs.
#[derive(Debug, Error)]
pub enum StructuringError {
    /// The LLM call failed, or its response did not match the schema.
    #[error("language model call failed: {0}")]
    Llm(String),

    /// A question came back with more than four options.
    #[error("question {index} has {count} options, but at most 4 are allowed")]
    TooManyOptions { index: usize, count: usize },
}

/// The refinement pass failed or changed the shape of the data.
#[derive(Debug, Error)]
pub enum RefinementError {
    /// The LLM call failed, or its response did not match the schema.
    #[error("language model call failed: {0}")]
    Llm(String),

    /// The model added or dropped questions.
    #[error("refinement returned {actual} questions, but {expected} were submitted")]
    CountMismatch { expected: usize, actual: usize },

    /// The model broke the four-option structure.
    #[error("refined question {index} has {count} options instead of 4")]
    OptionCount { index: usize, count: usize },

    /// The model blanked out a question.
    #[error("refined question {index} is empty")]
    EmptyQuestion { index: usize },

    /// The model filled in an option that was missing from the source.
    #[error("refined question {index} replaced missing option {option} with {value:?}")]
    SentinelChanged {
        index: usize,
        option: usize,
        value: String,
    },
}

/// A problem with the environment that stops us before any work is done.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A required credential was not supplied.
    #[error("missing credential: set {var} (or pass --{flag})")]
    MissingCredential {
        var: &'static str,
        flag: &'static str,
    },

    /// A required external tool is not installed.
    #[error("cannot run {tool:?}: {detail}")]
    MissingTool { tool: &'static str, detail: String },

    /// A setting has an unusable value.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Any failure while processing a single image.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("text extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("MCQ structuring failed: {0}")]
    Structuring(#[from] StructuringError),

    #[error("MCQ refinement failed: {0}")]
    Refinement(#[from] RefinementError),

    /// A stage panicked.
    #[error("internal error: {0}")]
    Internal(String),
}
