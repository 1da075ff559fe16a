//! Host bridge adapters
//!
//! Two thin front doors over one [`PipelineController`]: [`TypedBridge`] takes
//! typed options and returns typed results, [`LegacyBridge`] takes a JSON
//! options map and answers through resolve/reject callbacks the way
//! promise-style host modules do. Neither contains pipeline logic.

use crate::{
    config::{parse_hex_color, CompositeRequest, OutputMode, RemovalConfig},
    error::{BgRemovalError, ErrorKind, Result},
    processor::PipelineController,
    services::ImageIOService,
    types::{ImageBuffer, ProcessingMetadata, RemovalResult},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;
use tokio_util::sync::CancellationToken;

/// Where the input image comes from
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    /// `file://` URI or plain path
    Uri(String),
    /// Encoded PNG or JPEG bytes
    Bytes(Vec<u8>),
    Decoded(ImageBuffer),
}

impl ImageSource {
    /// File name of a file-backed source, `None` for in-memory data
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        let path = match self {
            Self::Path(path) => Some(path.clone()),
            Self::Uri(uri) => uri_to_path(uri).ok(),
            Self::Bytes(_) | Self::Decoded(_) => None,
        };
        path.as_deref()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .map(str::to_string)
    }

    /// Decode the source into pixels
    ///
    /// # Errors
    /// - `Io` when a file cannot be read
    /// - `InvalidInput` for non-file URIs or undecodable data
    pub async fn load(self) -> Result<ImageBuffer> {
        match self {
            Self::Path(path) => read_image_file(&path).await,
            Self::Uri(uri) => read_image_file(&uri_to_path(&uri)?).await,
            Self::Bytes(bytes) => ImageIOService::load_from_bytes(&bytes),
            Self::Decoded(image) => Ok(image),
        }
    }
}

async fn read_image_file(path: &Path) -> Result<ImageBuffer> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| BgRemovalError::file_io_error("open image", path, &e))?;
    ImageIOService::load_from_reader(file).await
}

/// Percent-decoded path of a `file://` URI; plain paths pass through
fn uri_to_path(uri: &str) -> Result<PathBuf> {
    if uri.starts_with("file:") {
        let url = Url::parse(uri)
            .map_err(|e| BgRemovalError::invalid_input(format!("Malformed file URI '{uri}': {e}")))?;
        return url.to_file_path().map_err(|()| {
            BgRemovalError::invalid_input(format!("URI '{uri}' does not name a local file"))
        });
    }
    match uri.split_once("://") {
        Some((scheme, _)) => Err(BgRemovalError::invalid_input(format!(
            "Unsupported URI scheme '{scheme}', only file:// images can be read"
        ))),
        None => Ok(PathBuf::from(uri)),
    }
}

/// Background treatment requested by the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackgroundMode {
    #[default]
    Transparent,
    SolidColor,
    ReplacementImage,
}

/// How the result is handed back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputTarget {
    /// PNG in the bridge's output directory
    #[default]
    File,
    /// Encoded PNG bytes
    Bytes,
    /// Decoded RGBA pixels
    Decoded,
}

/// Host-facing options; absent fields fall back to the controller config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoveBackgroundOptions {
    pub mode: BackgroundMode,
    /// `#RRGGBB` or `#RRGGBBAA`, required for `solidColor`
    pub color: Option<String>,
    /// Path or `file://` URI, required for `replacementImage`
    pub replacement_image: Option<String>,
    pub feather_radius: Option<u32>,
    pub threshold: Option<f32>,
    pub output: OutputTarget,
}

impl RemoveBackgroundOptions {
    /// Resolve into a pipeline request, loading the replacement image if any
    ///
    /// # Errors
    /// - `InvalidConfig` for a missing or malformed colour / replacement
    /// - Load errors from the replacement image
    pub async fn to_request(&self, defaults: &RemovalConfig) -> Result<CompositeRequest> {
        let mode = match self.mode {
            BackgroundMode::Transparent => OutputMode::Transparent,
            BackgroundMode::SolidColor => {
                let color = self.color.as_deref().ok_or_else(|| {
                    BgRemovalError::invalid_config("mode 'solidColor' requires a color option")
                })?;
                OutputMode::SolidColor(parse_hex_color(color)?)
            },
            BackgroundMode::ReplacementImage => {
                let uri = self.replacement_image.as_deref().ok_or_else(|| {
                    BgRemovalError::invalid_config(
                        "mode 'replacementImage' requires a replacementImage option",
                    )
                })?;
                OutputMode::ReplacementImage(ImageSource::Uri(uri.to_string()).load().await?)
            },
        };

        let mut request = defaults.request(mode);
        if let Some(radius) = self.feather_radius {
            request = request.with_feather_radius(radius);
        }
        if let Some(threshold) = self.threshold {
            request = request.with_threshold(threshold);
        }
        request.validate()?;
        Ok(request)
    }
}

/// Result payload in the requested form
#[derive(Debug, Clone)]
pub enum OutputPayload {
    File(PathBuf),
    Bytes(Vec<u8>),
    Decoded(ImageBuffer),
}

#[derive(Debug, Clone)]
pub struct ImageOutput {
    pub payload: OutputPayload,
    pub metadata: ProcessingMetadata,
}

impl ImageOutput {
    /// Percent-encoded `file://` URI of a file payload
    #[must_use]
    pub fn file_uri(&self) -> Option<String> {
        match &self.payload {
            OutputPayload::File(path) => Url::from_file_path(path).ok().map(String::from),
            OutputPayload::Bytes(_) | OutputPayload::Decoded(_) => None,
        }
    }
}

/// Structured failure handed across the host boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&BgRemovalError> for BridgeError {
    fn from(error: &BgRemovalError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

impl From<BgRemovalError> for BridgeError {
    fn from(error: BgRemovalError) -> Self {
        Self::from(&error)
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BridgeError {}

/// Capability exposed to hosts
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    async fn remove_background(
        &self,
        source: ImageSource,
        options: RemoveBackgroundOptions,
    ) -> std::result::Result<ImageOutput, BridgeError>;
}

/// Typed front door
#[derive(Debug, Clone)]
pub struct TypedBridge {
    controller: Arc<PipelineController>,
    output_dir: PathBuf,
}

impl TypedBridge {
    /// Bridge writing file outputs to the system temp directory
    #[must_use]
    pub fn new(controller: Arc<PipelineController>) -> Self {
        Self {
            controller,
            output_dir: std::env::temp_dir(),
        }
    }

    #[must_use]
    pub fn with_output_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.output_dir = dir.into();
        self
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<PipelineController> {
        &self.controller
    }

    /// Full request with caller-controlled cancellation
    ///
    /// # Errors
    /// - Any pipeline, load or save error, unchanged
    pub async fn remove_background_with_cancellation(
        &self,
        source: ImageSource,
        options: RemoveBackgroundOptions,
        cancel: CancellationToken,
    ) -> Result<ImageOutput> {
        let request = options.to_request(self.controller.config()).await?;
        let file_name = source.file_name();
        let image = source.load().await?;
        log::debug!(
            "Bridge request for {}: {}x{}, mode {}",
            file_name.as_deref().unwrap_or("in-memory image"),
            image.width(),
            image.height(),
            request.mode.name()
        );

        let result = self.controller.process_async(image, request, cancel).await?;
        self.deliver(result, options.output, file_name).await
    }

    async fn deliver(
        &self,
        result: RemovalResult,
        target: OutputTarget,
        file_name: Option<String>,
    ) -> Result<ImageOutput> {
        let metadata = result.metadata.clone();
        let payload = match target {
            OutputTarget::Decoded => OutputPayload::Decoded(result.into_image_buffer()),
            OutputTarget::Bytes => OutputPayload::Bytes(result.to_png_bytes()?),
            OutputTarget::File => {
                let bytes = result.to_png_bytes()?;
                let dir = absolute_dir(&self.output_dir)?;
                let path = tokio::task::spawn_blocking(move || match file_name {
                    Some(name) => {
                        let path = dir.join(format!("{name}.png"));
                        persist_atomically(&dir, &path, &bytes).map(|()| path)
                    },
                    None => persist_unique(&dir, &bytes),
                })
                .await
                .map_err(|e| BgRemovalError::inference(format!("Output task failed: {e}")))??;
                OutputPayload::File(path)
            },
        };
        Ok(ImageOutput { payload, metadata })
    }
}

fn absolute_dir(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| BgRemovalError::file_io_error("resolve output directory", dir, &e))?;
    Ok(cwd.join(dir))
}

/// Write through a temp file in `dir` so readers never see a partial PNG
fn persist_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| BgRemovalError::file_io_error("create output directory", dir, &e))?;
    let mut file = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| BgRemovalError::file_io_error("create temporary output", dir, &e))?;
    file.write_all(bytes)
        .map_err(|e| BgRemovalError::file_io_error("write output", path, &e))?;
    file.persist(path)
        .map_err(|e| BgRemovalError::file_io_error("persist output", path, &e.error))?;
    Ok(())
}

/// Write an in-memory source's output under a fresh `image-*.png` name
fn persist_unique(dir: &Path, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .map_err(|e| BgRemovalError::file_io_error("create output directory", dir, &e))?;
    let mut file = tempfile::Builder::new()
        .prefix("image-")
        .suffix(".png")
        .tempfile_in(dir)
        .map_err(|e| BgRemovalError::file_io_error("create output", dir, &e))?;
    file.write_all(bytes)
        .map_err(|e| BgRemovalError::file_io_error("write output", file.path(), &e))?;
    let (_, path) = file
        .keep()
        .map_err(|e| BgRemovalError::file_io_error("keep output", dir, &e.error))?;
    Ok(path)
}

#[async_trait]
impl BackgroundRemover for TypedBridge {
    async fn remove_background(
        &self,
        source: ImageSource,
        options: RemoveBackgroundOptions,
    ) -> std::result::Result<ImageOutput, BridgeError> {
        self.remove_background_with_cancellation(source, options, CancellationToken::new())
            .await
            .map_err(BridgeError::from)
    }
}

/// Promise-style front door: JSON options, resolve/reject callbacks
#[derive(Debug, Clone)]
pub struct LegacyBridge {
    inner: TypedBridge,
}

impl LegacyBridge {
    #[must_use]
    pub fn new(inner: TypedBridge) -> Self {
        Self { inner }
    }

    /// Process `image_uri` and call exactly one of the callbacks
    ///
    /// `resolve` receives the `file://` URI of the written PNG. `reject`
    /// receives the error kind as its code and a human-readable message.
    /// A `null` options value means defaults.
    pub async fn remove_background<R, J>(
        &self,
        image_uri: String,
        options: serde_json::Value,
        resolve: R,
        reject: J,
    ) where
        R: FnOnce(String) + Send,
        J: FnOnce(String, String) + Send,
    {
        match self.run(image_uri, options).await {
            Ok(uri) => resolve(uri),
            Err(error) => {
                log::warn!("Legacy bridge request rejected: {error}");
                reject(error.kind.to_string(), error.message);
            },
        }
    }

    async fn run(
        &self,
        image_uri: String,
        options: serde_json::Value,
    ) -> std::result::Result<String, BridgeError> {
        let mut options: RemoveBackgroundOptions = if options.is_null() {
            RemoveBackgroundOptions::default()
        } else {
            serde_json::from_value(options).map_err(|e| {
                BridgeError::from(BgRemovalError::invalid_config(format!(
                    "Malformed options: {e}"
                )))
            })?
        };
        options.output = OutputTarget::File;

        let output = self
            .inner
            .remove_background(ImageSource::Uri(image_uri), options)
            .await?;
        output.file_uri().ok_or_else(|| {
            BridgeError::from(BgRemovalError::inference("Bridge produced no output file"))
        })
    }
}
