//! Text extraction (OCR).
//!
//! Images are checked by extension, decoded, converted to grayscale and
//! re-encoded as PNG before they reach an [`OcrEngine`]. Engines therefore
//! only ever see clean single-channel PNGs.

use std::{fmt, io::Cursor, sync::Arc, time::Duration};

use clap::Args;
use image::{DynamicImage, ImageFormat};
use tokio::{process::Command, time};

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    cpu_limit::acquire_cpu_permit,
    error::{ConfigurationError, ExtractionError},
    prelude::*,
};

/// Image types we accept, by MIME type.
const SUPPORTED_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp", "image/bmp"];

/// OCR output for one image. May be empty.
pub type ExtractedText = String;

/// Where an image's bytes live.
#[derive(Clone)]
pub enum ImageSource {
    /// A file on disk.
    Path(PathBuf),
    /// Bytes already in memory.
    #[cfg(test)]
    Memory(Arc<[u8]>),
}

/// An image to process, plus the name we report results under.
#[derive(Clone)]
pub struct RawImage {
    /// Usually the file name.
    pub name: String,

    /// The image data.
    pub source: ImageSource,
}

impl fmt::Debug for RawImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RawImage");
        s.field("name", &self.name);
        match &self.source {
            ImageSource::Path(path) => s.field("path", path),
            #[cfg(test)]
            ImageSource::Memory(bytes) => s.field("bytes", &bytes.len()),
        };
        s.finish()
    }
}

impl RawImage {
    /// An image stored on disk, named after its file name.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            source: ImageSource::Path(path),
        }
    }

    /// An image held in memory.
    #[cfg(test)]
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            source: ImageSource::Memory(bytes.into()),
        }
    }

    /// Read our image data.
    async fn read(&self) -> Result<Arc<[u8]>, ExtractionError> {
        match &self.source {
            ImageSource::Path(path) => tokio::fs::read(path)
                .await
                .map(Arc::from)
                .map_err(|source| ExtractionError::Read {
                    path: path.clone(),
                    source,
                }),
            #[cfg(test)]
            ImageSource::Memory(bytes) => Ok(bytes.clone()),
        }
    }
}

/// OCR options.
#[derive(Args, Clone, Debug)]
pub struct TesseractOpts {
    /// Tesseract language code(s), such as "eng" or "eng+hin".
    #[clap(long, default_value = "eng")]
    pub lang: String,

    /// Tesseract page segmentation mode. The default, 6, treats each image as
    /// a single uniform block of text, which suits scans that have already
    /// been cropped and deskewed.
    #[clap(long, default_value = "6")]
    pub psm: u8,

    /// A timeout, in seconds, for OCR of a single image.
    #[clap(long)]
    pub ocr_timeout: Option<u64>,
}

impl Default for TesseractOpts {
    fn default() -> Self {
        Self {
            lang: "eng".to_owned(),
            psm: 6,
            ocr_timeout: None,
        }
    }
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: fmt::Debug + Send + Sync + 'static {
    /// Recognize the text in a grayscale PNG.
    async fn ocr_png(&self, name: &str, png: Vec<u8>) -> Result<ExtractedText, ExtractionError>;
}

/// Turns images into text.
#[derive(Clone, Debug)]
pub struct TextExtractor {
    engine: Arc<dyn OcrEngine>,
}

impl TextExtractor {
    /// Create a new extractor.
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine }
    }

    /// Extract the text from an image.
    #[instrument(level = "debug", skip_all, fields(image = %image.name))]
    pub async fn extract(&self, image: &RawImage) -> Result<ExtractedText, ExtractionError> {
        check_supported_format(&image.name)?;
        let bytes = image.read().await?;
        let png = spawn_blocking_propagating_panics(move || to_grayscale_png(&bytes))
            .await
            .map_err(|err| ExtractionError::Engine(format!("{err:#}")))??;
        let text = self.engine.ocr_png(&image.name, png).await?;
        debug!(chars = text.len(), "Extracted text");
        trace!(%text, "OCR output");
        Ok(text)
    }
}

/// Make sure an image name has an extension we know how to handle.
fn check_supported_format(name: &str) -> Result<(), ExtractionError> {
    let supported = mime_guess::from_path(name)
        .iter()
        .any(|mime| SUPPORTED_MIME_TYPES.contains(&mime.essence_str()));
    if supported {
        Ok(())
    } else {
        Err(ExtractionError::UnsupportedFormat {
            name: name.to_owned(),
        })
    }
}

/// Decode an image and re-encode it as a grayscale PNG.
fn to_grayscale_png(bytes: &[u8]) -> Result<Vec<u8>, ExtractionError> {
    let gray = image::load_from_memory(bytes)?.to_luma8();
    let mut png = Vec::new();
    DynamicImage::ImageLuma8(gray).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Debug)]
pub struct TesseractOcrEngine {
    opts: TesseractOpts,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(opts: TesseractOpts) -> Self {
        Self { opts }
    }

    /// Make sure we can actually run `tesseract`.
    pub async fn check_available(&self) -> Result<(), ConfigurationError> {
        let output = Command::new("tesseract")
            .arg("--version")
            .output()
            .await
            .map_err(|err| ConfigurationError::MissingTool {
                tool: "tesseract",
                detail: err.to_string(),
            })?;
        check_for_command_failure("tesseract", &output, None).map_err(|err| {
            ConfigurationError::MissingTool {
                tool: "tesseract",
                detail: format!("{err:#}"),
            }
        })
    }

    /// Run `tesseract` on a PNG file.
    async fn run(&self, png: Vec<u8>) -> Result<ExtractedText> {
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_base = tmpdir.path().join("output");
        tokio::fs::write(&input_path, &png)
            .await
            .context("cannot write tesseract input file")?;

        let output = Command::new("tesseract")
            .arg(&input_path)
            .arg(&output_base)
            .args(["-l", self.opts.lang.as_str()])
            .arg("--psm")
            .arg(self.opts.psm.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output, None)?;

        tokio::fs::read_to_string(output_base.with_extension("txt"))
            .await
            .context("cannot read tesseract output file")
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(image = %name))]
    async fn ocr_png(&self, name: &str, png: Vec<u8>) -> Result<ExtractedText, ExtractionError> {
        let _permit = acquire_cpu_permit()
            .await
            .map_err(|err| ExtractionError::Engine(format!("{err:#}")))?;
        let run = self.run(png);
        let result = match self.opts.ocr_timeout {
            Some(secs) => time::timeout(Duration::from_secs(secs), run)
                .await
                .map_err(|_| ExtractionError::Timeout { secs })?,
            None => run.await,
        };
        result.map_err(|err| ExtractionError::Engine(format!("{err:#}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{GrayImage, Luma, Rgb, RgbImage};

    use super::*;

    /// An OCR engine that returns canned text, or fails for names
    /// containing "fail". Any `{name}` in the text is replaced by the image
    /// name.
    #[derive(Debug)]
    pub(crate) struct StubOcrEngine {
        pub(crate) text: String,
    }

    #[async_trait]
    impl OcrEngine for StubOcrEngine {
        async fn ocr_png(
            &self,
            name: &str,
            png: Vec<u8>,
        ) -> Result<ExtractedText, ExtractionError> {
            let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png)?;
            assert!(matches!(decoded, DynamicImage::ImageLuma8(_)));
            if name.contains("fail") {
                Err(ExtractionError::Engine("stub OCR failure".to_owned()))
            } else {
                Ok(self.text.replace("{name}", name))
            }
        }
    }

    /// A tiny valid PNG.
    pub(crate) fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(4, 4, Rgb([200, 10, 10]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn extractor(text: &str) -> TextExtractor {
        TextExtractor::new(Arc::new(StubOcrEngine {
            text: text.to_owned(),
        }))
    }

    #[test]
    fn accepts_common_image_extensions() {
        for name in ["a.png", "b.JPG", "c.jpeg", "d.webp", "e.bmp"] {
            check_supported_format(name).unwrap();
        }
        for name in ["a.pdf", "b.txt", "noext"] {
            assert!(matches!(
                check_supported_format(name),
                Err(ExtractionError::UnsupportedFormat { .. })
            ));
        }
    }

    #[test]
    fn converts_color_images_to_grayscale_png() {
        let png = to_grayscale_png(&png_bytes()).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert!(matches!(decoded, DynamicImage::ImageLuma8(_)));
        assert_eq!((decoded.width(), decoded.height()), (4, 4));

        let gray = GrayImage::from_pixel(2, 2, Luma([7]));
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(gray)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        to_grayscale_png(&bytes).unwrap();
    }

    #[tokio::test]
    async fn extracts_text_from_memory_images() {
        let image = RawImage::from_bytes("page.png", png_bytes());
        let text = extractor("Q1. Hello").extract(&image).await.unwrap();
        assert_eq!(text, "Q1. Hello");
    }

    #[tokio::test]
    async fn corrupt_bytes_are_decode_errors() {
        let image = RawImage::from_bytes("page.png", b"not an image".to_vec());
        let err = extractor("").extract(&image).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Decode(_)));
    }

    #[tokio::test]
    async fn unsupported_formats_are_rejected_before_reading() {
        let image = RawImage::from_path("/nonexistent/scan.pdf");
        let err = extractor("").extract(&image).await.unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedFormat { .. }));
    }

    #[tokio::test]
    async fn missing_files_are_read_errors() {
        let image = RawImage::from_path("/nonexistent/scan.png");
        assert_eq!(image.name, "scan.png");
        let err = extractor("").extract(&image).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Read { .. }));
    }

    #[tokio::test]
    async fn reads_images_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        tokio::fs::write(&path, png_bytes()).await.unwrap();
        let text = extractor("disk text")
            .extract(&RawImage::from_path(&path))
            .await
            .unwrap();
        assert_eq!(text, "disk text");
    }

    #[tokio::test]
    #[ignore = "Needs tesseract installed"]
    async fn tesseract_reads_a_blank_page() {
        let engine = TesseractOcrEngine::new(TesseractOpts::default());
        engine.check_available().await.unwrap();
        let extractor = TextExtractor::new(Arc::new(engine));
        let text = extractor
            .extract(&RawImage::from_bytes("blank.png", png_bytes()))
            .await
            .unwrap();
        assert!(text.trim().is_empty());
    }
}
