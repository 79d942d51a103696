//! Boundary to the external image and text generation services.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{Stream, StreamExt};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, ImageConfig, TextConfig};
use crate::error::GenerationError;
use crate::events::{self, StreamEvent};
use crate::sse::SseParser;
use crate::stream::ByteStream;

/// A generated character portrait.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArtifact {
    /// Decoded PNG bytes.
    pub png: Vec<u8>,
    pub seed: Option<u64>,
    /// Prompt the image was generated from.
    pub prompt: String,
    /// Short description of the selections behind the image.
    pub description: String,
}

impl ImageArtifact {
    pub fn file_name(&self) -> String {
        match self.seed {
            Some(seed) => format!("character-image-{}.png", seed),
            None => "character-image.png".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    System,
}

impl Role {
    /// Role name understood by the text service.
    fn api_name(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::System => "assistant",
        }
    }
}

/// One entry of a backstory conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// The two generation capabilities a wizard depends on.
#[async_trait]
pub trait GenerationGateway: Send + Sync {
    async fn generate_image(&self, prompt: &str) -> Result<ImageArtifact, GenerationError>;

    /// Generate a variation of `base`, guided by `prompt`.
    async fn regenerate_image(
        &self,
        prompt: &str,
        base: &ImageArtifact,
        strength: f32,
    ) -> Result<ImageArtifact, GenerationError>;

    /// Start a streamed text generation. Chunks are raw UTF-8 bytes.
    async fn generate_text(&self, messages: Vec<Message>) -> Result<ByteStream, GenerationError>;
}

#[derive(Serialize)]
struct TextPrompt<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct TextToImageRequest<'a> {
    text_prompts: [TextPrompt<'a>; 1],
    cfg_scale: f32,
    height: u32,
    width: u32,
    steps: u32,
    samples: u32,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    artifacts: Vec<GeneratedImage>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    base64: String,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Serialize)]
struct CreateThreadAndRun<'a> {
    assistant_id: &'a str,
    stream: bool,
    thread: ThreadInit<'a>,
}

#[derive(Serialize)]
struct ThreadInit<'a> {
    messages: Vec<ThreadMessage<'a>>,
}

#[derive(Serialize)]
struct ThreadMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Gateway over HTTP: a Stability-style image API and an Assistants-style text API.
pub struct HttpGateway {
    client: reqwest::Client,
    image: ImageConfig,
    text: TextConfig,
}

impl HttpGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            image: config.image.clone(),
            text: config.text.clone(),
        }
    }

    fn image_url(&self, operation: &str) -> String {
        format!(
            "{}/v1/generation/{}/{}",
            self.image.api_host.trim_end_matches('/'),
            self.image.engine,
            operation
        )
    }

    fn require_image_key(&self) -> Result<&str, GenerationError> {
        if self.image.api_key.is_empty() {
            return Err(GenerationError::Request(
                "missing image API key (IMAGE_API_KEY)".to_string(),
            ));
        }
        Ok(&self.image.api_key)
    }

    async fn read_image(
        response: reqwest::Response,
        prompt: &str,
    ) -> Result<ImageArtifact, GenerationError> {
        let response = check_status(response).await?;
        let body = response.bytes().await?;
        let parsed: GenerationResponse = serde_json::from_slice(&body)
            .map_err(|e| GenerationError::MalformedPayload(e.to_string()))?;

        let first = parsed.artifacts.into_iter().next().ok_or_else(|| {
            GenerationError::MalformedPayload("response has no artifacts".to_string())
        })?;
        if let Some(reason) = first.finish_reason.as_deref()
            && reason != "SUCCESS"
        {
            warn!(reason, "image_finish_reason");
        }
        let png = BASE64
            .decode(first.base64.as_bytes())
            .map_err(|e| GenerationError::MalformedPayload(format!("invalid base64: {}", e)))?;

        debug!(bytes = png.len(), seed = ?first.seed, "image_decoded");
        Ok(ImageArtifact {
            png,
            seed: first.seed,
            prompt: prompt.to_string(),
            description: String::new(),
        })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "generation_http_error");
    Err(GenerationError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl GenerationGateway for HttpGateway {
    async fn generate_image(&self, prompt: &str) -> Result<ImageArtifact, GenerationError> {
        let key = self.require_image_key()?;
        let body = TextToImageRequest {
            text_prompts: [TextPrompt { text: prompt }],
            cfg_scale: self.image.cfg_scale,
            height: self.image.height,
            width: self.image.width,
            steps: self.image.steps,
            samples: 1,
        };

        info!(engine = %self.image.engine, "text_to_image_request");
        let response = self
            .client
            .post(self.image_url("text-to-image"))
            .bearer_auth(key)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        Self::read_image(response, prompt).await
    }

    async fn regenerate_image(
        &self,
        prompt: &str,
        base: &ImageArtifact,
        strength: f32,
    ) -> Result<ImageArtifact, GenerationError> {
        let key = self.require_image_key()?;
        let init_image = multipart::Part::bytes(base.png.clone())
            .file_name("init_image.png")
            .mime_str("image/png")?;
        let form = multipart::Form::new()
            .part("init_image", init_image)
            .text("init_image_mode", "IMAGE_STRENGTH")
            .text("image_strength", strength.to_string())
            .text("text_prompts[0][text]", prompt.to_string())
            .text("cfg_scale", self.image.cfg_scale.to_string())
            .text("steps", self.image.steps.to_string())
            .text("samples", "1");

        info!(engine = %self.image.engine, strength, "image_to_image_request");
        let response = self
            .client
            .post(self.image_url("image-to-image"))
            .bearer_auth(key)
            .header("Accept", "application/json")
            .multipart(form)
            .send()
            .await?;
        Self::read_image(response, prompt).await
    }

    async fn generate_text(&self, messages: Vec<Message>) -> Result<ByteStream, GenerationError> {
        if self.text.api_key.is_empty() {
            return Err(GenerationError::Request(
                "missing text API key (OPENAI_API_KEY)".to_string(),
            ));
        }
        let body = CreateThreadAndRun {
            assistant_id: &self.text.assistant_id,
            stream: true,
            thread: ThreadInit {
                messages: messages
                    .iter()
                    .map(|m| ThreadMessage {
                        role: m.role.api_name(),
                        content: &m.content,
                    })
                    .collect(),
            },
        };

        info!(messages = messages.len(), "text_stream_request");
        let response = self
            .client
            .post(format!(
                "{}/threads/runs",
                self.text.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.text.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()));
        Ok(Box::pin(text_chunks(bytes)))
    }
}

struct TextStreamState {
    bytes: Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>,
    parser: SseParser,
    ready: VecDeque<Result<Vec<u8>, GenerationError>>,
    finished: bool,
}

impl TextStreamState {
    fn absorb(&mut self, sse_events: Vec<crate::sse::SseEvent>) {
        for sse_event in sse_events {
            match events::classify(&sse_event) {
                StreamEvent::TextDelta(text) => {
                    if !text.is_empty() {
                        self.ready.push_back(Ok(text.into_bytes()));
                    }
                }
                StreamEvent::Done => {
                    self.finished = true;
                    return;
                }
                StreamEvent::Error(message) => {
                    warn!(%message, "text_stream_error_event");
                    self.ready.push_back(Err(GenerationError::Stream(message)));
                    self.finished = true;
                    return;
                }
                StreamEvent::Ignored => {}
            }
        }
    }
}

/// Turn a raw server-sent event byte stream into a stream of story text bytes.
fn text_chunks(
    bytes: impl Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = Result<Vec<u8>, GenerationError>> + Send {
    futures::stream::unfold(
        TextStreamState {
            bytes: Box::pin(bytes),
            parser: SseParser::new(),
            ready: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.ready.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let sse_events = state.parser.push(&chunk);
                        state.absorb(sse_events);
                    }
                    Some(Err(e)) => {
                        state.ready.push_back(Err(e.into()));
                        state.finished = true;
                    }
                    None => {
                        let tail = state.parser.finish().into_iter().collect();
                        state.absorb(tail);
                        state.finished = true;
                    }
                }
            }
        },
    )
}
