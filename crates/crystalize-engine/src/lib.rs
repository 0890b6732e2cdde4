use std::io::Cursor;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crystalize_contracts::density::Density;
use crystalize_contracts::events::{EventFields, EventLog};
use crystalize_contracts::palette::ColorSelection;
use crystalize_contracts::session::ProcessingResult;
use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Static filename for the downloadable artifact.
pub const OUTPUT_FILE_NAME: &str = "crystal-colorized.png";

const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const ERROR_SNIPPET_MAX_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no API key configured; set GEMINI_API_KEY or GOOGLE_API_KEY")]
    MissingCredential,
    #[error("could not decode image data ({0})")]
    Decode(String),
    #[error("model request failed ({0})")]
    Upstream(String),
    #[error("the model returned text instead of an image: {0}")]
    NoImageReturned(String),
    #[error("could not render the reconciled output ({0})")]
    Render(String),
}

impl PipelineError {
    /// Stable machine-readable tag, used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MissingCredential => "missing_credential",
            PipelineError::Decode(_) => "decode",
            PipelineError::Upstream(_) => "upstream",
            PipelineError::NoImageReturned(_) => "no_image_returned",
            PipelineError::Render(_) => "render",
        }
    }
}

/// An encoded image travelling to or from the model as an inline part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinePayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// One part of a model response, as an explicit tagged union rather than
/// ad hoc field probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    InlineImage {
        mime_type: Option<String>,
        bytes: Vec<u8>,
    },
    Text(String),
    Other,
}

pub trait ImageModel {
    fn name(&self) -> &str;
    fn generate(&self, prompt: &str, source: &InlinePayload)
        -> Result<InlinePayload, PipelineError>;
}

// ---------------------------------------------------------------------------
// Image loader

/// Decodes encoded image bytes and returns their natural pixel dimensions.
/// The decoded raster is dropped immediately; only the dimensions survive.
pub fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32), PipelineError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| PipelineError::Decode(format!("source image: {err}")))?;
    Ok((decoded.width(), decoded.height()))
}

fn mime_for_bytes(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::Bmp) => "image/bmp",
        Ok(ImageFormat::Tiff) => "image/tiff",
        _ => "image/png",
    }
}

// ---------------------------------------------------------------------------
// Prompt builder

/// Deterministic instruction text for the colorization request.
///
/// Total over valid inputs: a non-empty selection and an in-range density
/// always produce the same instruction string.
pub fn build_prompt(selection: &ColorSelection, density: Density) -> String {
    let colors = selection.prompt_values().join(" and ");
    let descriptor = density.bucket().descriptor();
    let coverage = density.coverage_percent();
    format!(
        "Act as a scientific image enhancement expert. \
         I am providing an SEM (Scanning Electron Microscope) micrograph of crystals.\n\
         \n\
         Task:\n\
         1. Identify individual crystals in the image.\n\
         2. Randomly select {descriptor} distinct crystals (approx {coverage}% coverage) to form a region of interest.\n\
         3. Colorize these selected crystals using vivid {colors} colors.\n\
         4. Keep the unselected crystals and the background in their original grayscale/black and white.\n\
         5. Ensure the coloring strictly respects the edges of the crystals and looks naturally integrated into the texture.\n\
         6. Do NOT add any visible watermarks, text overlays, or labels.\n\
         7. Maintain the original composition and perspective exactly.\n\
         8. Return ONLY the processed image."
    )
}

// ---------------------------------------------------------------------------
// Model invoker

/// Flattens a generateContent response into parts, preserving response order
/// across candidates. An empty candidate list is an upstream failure.
pub fn response_parts(payload: &Value) -> Result<Vec<ResponsePart>, PipelineError> {
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if candidates.is_empty() {
        return Err(PipelineError::Upstream(
            "response contained no candidates".to_string(),
        ));
    }

    let mut out = Vec::new();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object);
            if let Some(inline) = inline {
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !data.is_empty() {
                    let bytes = BASE64.decode(data.as_bytes()).map_err(|err| {
                        PipelineError::Upstream(format!("inline image base64: {err}"))
                    })?;
                    let mime_type = inline
                        .get("mimeType")
                        .or_else(|| inline.get("mime_type"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    out.push(ResponsePart::InlineImage { mime_type, bytes });
                    continue;
                }
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                out.push(ResponsePart::Text(text.to_string()));
            } else {
                out.push(ResponsePart::Other);
            }
        }
    }
    Ok(out)
}

/// Selects the first inline image part. A text part with no image anywhere
/// means the model declined to produce one, which is a content problem rather
/// than an infrastructure failure.
pub fn first_inline_image(parts: &[ResponsePart]) -> Result<InlinePayload, PipelineError> {
    for part in parts {
        if let ResponsePart::InlineImage { mime_type, bytes } = part {
            return Ok(InlinePayload {
                mime_type: mime_type
                    .clone()
                    .unwrap_or_else(|| "image/png".to_string()),
                bytes: bytes.clone(),
            });
        }
    }
    for part in parts {
        if let ResponsePart::Text(text) = part {
            return Err(PipelineError::NoImageReturned(truncate_text(
                text,
                ERROR_SNIPPET_MAX_CHARS,
            )));
        }
    }
    Err(PipelineError::Upstream(
        "no image data found in model response".to_string(),
    ))
}

pub struct GeminiModel {
    model: String,
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl GeminiModel {
    /// Resolves the credential and API base from the process environment.
    /// The key is checked again at call time; a missing key fails before any
    /// network I/O is attempted.
    pub fn from_env(model: impl Into<String>) -> Self {
        Self::with_credential(
            model,
            non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
        )
    }

    pub fn with_credential(model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            model: model.into(),
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            api_key,
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(prompt: &str, source: &InlinePayload) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt },
                    {
                        "inlineData": {
                            "mimeType": source.mime_type,
                            "data": BASE64.encode(&source.bytes),
                        }
                    },
                ],
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        })
    }
}

impl ImageModel for GeminiModel {
    fn name(&self) -> &str {
        "gemini"
    }

    /// Exactly one outbound call; failures surface immediately with no retry.
    fn generate(
        &self,
        prompt: &str,
        source: &InlinePayload,
    ) -> Result<InlinePayload, PipelineError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(PipelineError::MissingCredential);
        };

        let payload = Self::build_payload(prompt, source);
        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", api_key)])
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .map_err(|err| PipelineError::Upstream(format!("request failed: {err}")))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| PipelineError::Upstream(format!("reading response body: {err}")))?;
        if !status.is_success() {
            return Err(PipelineError::Upstream(format!(
                "HTTP {status}: {}",
                truncate_text(&body, ERROR_SNIPPET_MAX_CHARS)
            )));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|err| PipelineError::Upstream(format!("invalid JSON response: {err}")))?;
        let parts = response_parts(&parsed)?;
        first_inline_image(&parts)
    }
}

/// Offline stand-in that paints a solid color derived from the prompt hash.
/// Deterministic by construction, and deliberately sized unlike typical
/// sources so reconciliation is exercised.
pub struct DryrunModel {
    width: u32,
    height: u32,
}

impl DryrunModel {
    pub fn new() -> Self {
        Self {
            width: 512,
            height: 512,
        }
    }

    pub fn with_output_size(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for DryrunModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageModel for DryrunModel {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(
        &self,
        prompt: &str,
        _source: &InlinePayload,
    ) -> Result<InlinePayload, PipelineError> {
        let digest = Sha256::digest(prompt.as_bytes());
        let mut canvas = RgbImage::new(self.width, self.height);
        for pixel in canvas.pixels_mut() {
            *pixel = image::Rgb([digest[0], digest[1], digest[2]]);
        }
        let mut bytes = Vec::new();
        canvas
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| PipelineError::Upstream(format!("dryrun encode: {err}")))?;
        Ok(InlinePayload {
            mime_type: "image/png".to_string(),
            bytes,
        })
    }
}

// ---------------------------------------------------------------------------
// Canvas reconciler

/// Redraws the model output into a fresh buffer of exactly the target
/// dimensions, discarding whatever resolution the model chose, then encodes
/// it as PNG. The model gives no dimension guarantee, so this step is what
/// upholds the width/height invariant; aspect distortion is accepted.
pub fn reconcile(
    payload: &InlinePayload,
    target_width: u32,
    target_height: u32,
) -> Result<ProcessingResult, PipelineError> {
    let decoded = image::load_from_memory(&payload.bytes)
        .map_err(|err| PipelineError::Decode(format!("model output: {err}")))?;
    let redrawn = decoded.resize_exact(target_width, target_height, FilterType::Triangle);
    let mut png = Vec::new();
    redrawn
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|err| PipelineError::Render(format!("png encode: {err}")))?;
    Ok(ProcessingResult {
        png,
        width: target_width,
        height: target_height,
    })
}

// ---------------------------------------------------------------------------
// Pipeline

#[derive(Debug, Clone)]
pub struct ColorizeRequest {
    pub image: Vec<u8>,
    pub colors: ColorSelection,
    pub density: Density,
}

/// One sequential run per submission: decode, prompt, invoke, reconcile.
/// No partial results cross the boundary; any stage error propagates and the
/// caller's previous result stays untouched.
pub struct Pipeline<'a> {
    model: &'a dyn ImageModel,
    events: Option<EventLog>,
}

impl<'a> Pipeline<'a> {
    pub fn new(model: &'a dyn ImageModel) -> Self {
        Self {
            model,
            events: None,
        }
    }

    pub fn with_events(model: &'a dyn ImageModel, events: EventLog) -> Self {
        Self {
            model,
            events: Some(events),
        }
    }

    pub fn colorize(&self, request: &ColorizeRequest) -> Result<ProcessingResult, PipelineError> {
        match self.run(request) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.emit(
                    "pipeline_failed",
                    event_fields(json!({
                        "kind": err.kind(),
                        "message": err.to_string(),
                    })),
                );
                Err(err)
            }
        }
    }

    fn run(&self, request: &ColorizeRequest) -> Result<ProcessingResult, PipelineError> {
        let (width, height) = probe_dimensions(&request.image)?;
        self.emit(
            "image_loaded",
            event_fields(json!({ "width": width, "height": height })),
        );

        let prompt = build_prompt(&request.colors, request.density);
        self.emit(
            "prompt_built",
            event_fields(json!({
                "colors": request.colors.prompt_values(),
                "density": request.density.value(),
                "bucket": request.density.bucket().descriptor(),
            })),
        );

        let source = InlinePayload {
            mime_type: mime_for_bytes(&request.image).to_string(),
            bytes: request.image.clone(),
        };
        self.emit(
            "model_invoked",
            event_fields(json!({ "model": self.model.name() })),
        );
        let output = self.model.generate(&prompt, &source)?;
        self.emit(
            "image_received",
            event_fields(json!({
                "mime_type": output.mime_type,
                "bytes": output.bytes.len(),
            })),
        );

        let result = reconcile(&output, width, height)?;
        self.emit(
            "result_reconciled",
            event_fields(json!({
                "width": result.width,
                "height": result.height,
                "sha256": hex::encode(Sha256::digest(&result.png)),
            })),
        );
        Ok(result)
    }

    // Progress logging must never mask a pipeline outcome.
    fn emit(&self, event: &str, fields: EventFields) {
        if let Some(events) = &self.events {
            let _ = events.append(event, fields);
        }
    }
}

fn event_fields(value: Value) -> EventFields {
    value.as_object().cloned().unwrap_or_default()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.trim().to_string();
    }
    let cut: String = value.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}
