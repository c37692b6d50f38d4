//! The MCQ extraction pipeline.
//!
//! Each image goes through [`extract::TextExtractor`], then
//! [`structure::SchemaStructurer`], then [`refine::Refiner`], all wrapped up by
//! [`image::ImagePipeline`]. [`batch::BatchAggregator`] runs many images at once
//! and collects one outcome per image.

pub mod batch;
pub mod extract;
pub mod image;
pub mod mcq;
pub mod refine;
pub mod structure;
