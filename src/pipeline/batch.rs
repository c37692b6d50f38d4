//! Running the pipeline over a batch of images.

use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    sync::Arc,
};

use futures::{StreamExt as _, stream};
use indicatif::ProgressBar;
use schemars::{
    JsonSchema,
    r#gen::SchemaGenerator,
    schema::Schema,
};
use serde::ser::SerializeMap as _;

use crate::{async_utils::BoxedStream, prelude::*};

use super::{extract::RawImage, image::ImagePipeline, mcq::McqSet};

/// What happened to one image.
///
/// Serialized as either a list of MCQs or an error string, so consumers can
/// tell them apart by JSON type alone.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ImageOutcome {
    /// The MCQs found on the image. May be empty.
    Mcqs(McqSet),
    /// Why the image could not be processed.
    Error(String),
}

impl ImageOutcome {
    /// Did this image fail?
    pub fn is_error(&self) -> bool {
        matches!(self, ImageOutcome::Error(_))
    }
}

/// One outcome per submitted image, keyed by a unique image name, in
/// submission order. Serialized as a JSON object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchResult {
    entries: Vec<(String, ImageOutcome)>,
}

impl BatchResult {
    /// How many images are in this batch?
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Look up an image by name.
    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&ImageOutcome> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, outcome)| outcome)
    }

    /// Iterate over our entries in order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ImageOutcome)> {
        self.entries.iter().map(|(key, outcome)| (key.as_str(), outcome))
    }

    /// How many images failed?
    pub fn failure_count(&self) -> usize {
        self.entries.iter().filter(|(_, outcome)| outcome.is_error()).count()
    }

    /// How many MCQs did we find in total?
    pub fn mcq_count(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, outcome)| match outcome {
                ImageOutcome::Mcqs(mcqs) => mcqs.len(),
                ImageOutcome::Error(_) => 0,
            })
            .sum()
    }
}

impl FromIterator<(String, ImageOutcome)> for BatchResult {
    /// Collect entries, which must already have unique names.
    fn from_iter<I: IntoIterator<Item = (String, ImageOutcome)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<(String, ImageOutcome)> for BatchResult {
    fn extend<I: IntoIterator<Item = (String, ImageOutcome)>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl Serialize for BatchResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, outcome) in &self.entries {
            map.serialize_entry(key, outcome)?;
        }
        map.end()
    }
}

impl JsonSchema for BatchResult {
    fn schema_name() -> String {
        "BatchResult".to_owned()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        <BTreeMap<String, ImageOutcome>>::json_schema(generator)
    }
}

/// Give every image a distinct name. Repeated names become `name (2)`,
/// `name (3)` and so on.
pub fn unique_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let names = names.into_iter().collect::<Vec<_>>();
    // Reserve every original name first, so a literal "a.png (2)" later in the
    // batch doesn't collide with a renamed duplicate.
    let mut used = names.iter().copied().map(str::to_owned).collect::<HashSet<_>>();
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            if seen.insert(name) {
                return name.to_owned();
            }
            let mut n = 2;
            loop {
                let candidate = format!("{name} ({n})");
                if used.insert(candidate.clone()) {
                    return candidate;
                }
                n += 1;
            }
        })
        .collect()
}

/// Run `f` on every image, at most `job_count` at a time.
///
/// Each image is renamed with [`unique_names`] before `f` sees it. Results
/// come back in input order.
pub fn map_images_bounded<T, F, Fut>(
    images: Vec<RawImage>,
    job_count: usize,
    f: F,
) -> BoxedStream<T>
where
    F: Fn(RawImage) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let names = unique_names(images.iter().map(|image| image.name.as_str()));
    stream::iter(names.into_iter().zip(images))
        .map(move |(name, image)| f(RawImage { name, ..image }))
        .buffered(job_count.max(1))
        .boxed()
}

/// Runs an [`ImagePipeline`] over many images, a bounded number at a time.
#[derive(Debug, Clone)]
pub struct BatchAggregator {
    pipeline: Arc<ImagePipeline>,
    job_count: usize,
}

impl BatchAggregator {
    /// Create an aggregator running up to `job_count` images at once.
    pub fn new(pipeline: Arc<ImagePipeline>, job_count: usize) -> Self {
        Self {
            pipeline,
            job_count: job_count.max(1),
        }
    }

    /// Process images, yielding one named outcome per image in input order.
    pub fn process_stream(&self, images: Vec<RawImage>) -> BoxedStream<(String, ImageOutcome)> {
        let pipeline = self.pipeline.clone();
        map_images_bounded(images, self.job_count, move |image| {
            let pipeline = pipeline.clone();
            async move {
                let outcome = match pipeline.run(&image).await {
                    Ok(mcqs) => ImageOutcome::Mcqs(mcqs),
                    Err(err) => {
                        warn!(image = %image.name, "Image failed: {err}");
                        ImageOutcome::Error(err.to_string())
                    }
                };
                (image.name, outcome)
            }
        })
    }

    /// Process a whole batch, ticking `progress` once per finished image.
    #[instrument(level = "debug", skip_all, fields(images = images.len()))]
    pub async fn run_batch(
        &self,
        images: Vec<RawImage>,
        progress: Option<&ProgressBar>,
    ) -> BatchResult {
        let outcomes = self.process_stream(images);
        let result = match progress {
            Some(pb) => pb.wrap_stream(outcomes).collect::<BatchResult>().await,
            None => outcomes.collect::<BatchResult>().await,
        };
        info!(
            images = result.len(),
            failed = result.failure_count(),
            mcqs = result.mcq_count(),
            "Batch complete"
        );
        result
    }
}
