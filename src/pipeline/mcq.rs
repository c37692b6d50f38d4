//! Multiple-choice questions.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;

use crate::{
    error::{RefinementError, StructuringError},
    prelude::*,
};

/// Placeholder for an answer option that isn't present in the source.
pub const NA: &str = "NA";

/// Every question has exactly this many options once structured.
pub const OPTION_COUNT: usize = 4;

/// Runs of whitespace, including the newlines OCR likes to scatter around.
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("failed to compile regex"));

/// A multiple-choice question.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct Mcq {
    /// The question stem, without its number.
    pub question: String,

    /// The answer options, in order, without their labels. Missing options
    /// are "NA".
    pub options: Vec<String>,
}

/// The questions found on one image, in reading order.
pub type McqSet = Vec<Mcq>;

/// Collapse whitespace and trim.
pub fn normalize_text(text: &str) -> String {
    WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
}

/// Normalize a single option. Blank options become [`NA`].
fn normalize_option(option: &str) -> String {
    let option = normalize_text(option);
    if option.is_empty() {
        NA.to_owned()
    } else {
        option
    }
}

impl Mcq {
    /// Build a question, padding the options out with [`NA`].
    pub fn new<I, S>(question: &str, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = options
            .into_iter()
            .map(|option| normalize_option(option.as_ref()))
            .collect::<Vec<_>>();
        if options.len() < OPTION_COUNT {
            options.resize(OPTION_COUNT, NA.to_owned());
        }
        Self {
            question: normalize_text(question),
            options,
        }
    }

    /// Clean up a freshly structured question.
    ///
    /// Returns `Ok(None)` for questions with no text, which we drop. Surplus
    /// trailing [`NA`] options are discarded, but a question with more than
    /// four real options is an error.
    pub fn into_structured(self, index: usize) -> Result<Option<Self>, StructuringError> {
        let mut mcq = Self::new(&self.question, &self.options);
        if mcq.question.is_empty() {
            debug!(index, "Dropping question with no text");
            return Ok(None);
        }
        while mcq.options.len() > OPTION_COUNT && mcq.options.last().is_some_and(|o| o == NA)
        {
            mcq.options.pop();
        }
        if mcq.options.len() > OPTION_COUNT {
            return Err(StructuringError::TooManyOptions {
                index,
                count: mcq.options.len(),
            });
        }
        Ok(Some(mcq))
    }

    /// Check and clean up a refined version of `original`. Refinement must
    /// never change the shape of a question, so nothing is padded or dropped
    /// here, and options that were [`NA`] must stay that way.
    pub fn into_refined(self, index: usize, original: &Mcq) -> Result<Self, RefinementError> {
        if self.options.len() != OPTION_COUNT {
            return Err(RefinementError::OptionCount {
                index,
                count: self.options.len(),
            });
        }
        let question = normalize_text(&self.question);
        if question.is_empty() {
            return Err(RefinementError::EmptyQuestion { index });
        }
        let options = self
            .options
            .iter()
            .map(|o| normalize_option(o))
            .collect::<Vec<_>>();
        for (option, (before, after)) in original.options.iter().zip(&options).enumerate() {
            if before == NA && after != NA {
                return Err(RefinementError::SentinelChanged {
                    index,
                    option,
                    value: after.clone(),
                });
            }
        }
        Ok(Self { question, options })
    }
}
