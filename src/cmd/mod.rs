//! Command-line entry points.

use clap::Args;

use crate::{error::ConfigurationError, pipeline::extract::RawImage, prelude::*, ui::Ui};

pub mod extract;
pub mod ocr;
pub mod schema;

/// Common options for subcommands that process a batch of images.
#[derive(Debug, Clone, Args)]
pub struct BatchOpts {
    /// Image files to process (png, jpeg, webp or bmp).
    #[clap(required = true, value_name = "IMAGE")]
    pub images: Vec<PathBuf>,

    /// Write output to this file instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Max number of images to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// What portion of images may fail before we exit with an error? Specified
    /// as a number between 0.0 and 1.0. Output is written either way.
    #[clap(long, default_value = "1.0")]
    pub allowed_failure_rate: f32,
}

impl BatchOpts {
    /// Reject settings we can't work with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.job_count == 0 {
            return Err(ConfigurationError::Invalid(
                "--jobs must be at least 1".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.allowed_failure_rate) {
            return Err(ConfigurationError::Invalid(format!(
                "--allowed-failure-rate must be between 0.0 and 1.0, not {}",
                self.allowed_failure_rate
            )));
        }
        Ok(())
    }

    /// Our input images.
    pub fn raw_images(&self) -> Vec<RawImage> {
        self.images.iter().map(|path| RawImage::from_path(path)).collect()
    }

    /// Report failures, and fail if there were too many.
    pub fn check_failures(&self, ui: &Ui, failure_count: usize, total: usize) -> Result<()> {
        if failure_count > 0 {
            ui.display_message("❌", &format!("{failure_count} of {total} images could not be processed"));
        }
        if total == 0 {
            return Ok(());
        }
        let failure_rate = failure_count as f32 / total as f32;
        if failure_rate > self.allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of images failed, but only {:.2}% were allowed",
                failure_count,
                total,
                failure_rate * 100.0,
                self.allowed_failure_rate * 100.0
            ))
        } else {
            Ok(())
        }
    }
}
