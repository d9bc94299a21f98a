// lm.rs - OpenAI-compatible model client
//
// Talks to LM Studio / Ollama style endpoints:
// - POST {base}/v1/chat/completions for text generation and vision
// - POST {base}/v1/embeddings for theme embeddings
// - POST {base}/v1/audio/transcriptions (multipart) for voice notes
//
// The pipeline only sees the TextGenerator / ImageDescriber / Embedder /
// Transcriber traits,
// so tests can swap in fakes. Retries are not done here; callers wrap each
// call in retry::Executor.

use crate::error::{DigestError, DigestResult};
use crate::observe::Observer;
use crate::vis::{create_vision_message, load_image_for_vision};
use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

static THINK_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<think>.*?</think>").expect("think block pattern is valid")
});

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> DigestResult<String>;
}

#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe_image(&self, prompt: &str, image_path: &Path) -> DigestResult<String>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> DigestResult<Vec<f32>>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> DigestResult<String>;
}

/// Connection settings for one model on one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct LmSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: u64,
    pub temperature: f32,
    pub max_tokens: i32,
}

// API Request/Response structures
#[derive(Serialize)]
struct ChatRequest<'a, M: Serialize> {
    model: &'a str,
    messages: Vec<M>,
    temperature: f32,
    max_tokens: i32,
    stream: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MultimodalChatMessage {
    pub role: String,
    pub content: Vec<MessageContent>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum MessageContent {
    Text { #[serde(rename = "type")] content_type: String, text: String },
    Image { #[serde(rename = "type")] content_type: String, image_url: ImageUrl },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct LmClient {
    client: reqwest::Client,
    settings: LmSettings,
    observer: Observer,
}

impl LmClient {
    pub fn new(settings: LmSettings, observer: &Observer) -> DigestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout))
            .build()?;
        Ok(Self {
            client,
            settings,
            observer: observer.scoped("lm"),
        })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> DigestResult<R> {
        let url = self.endpoint(path);
        let request = self.client.post(&url).json(body);
        self.send(&url, request).await
    }

    async fn send<R: DeserializeOwned>(&self, url: &str, mut request: reqwest::RequestBuilder) -> DigestResult<R> {
        debug!(target: self.observer.target(), "📡 POST {} (model '{}')", url, self.settings.model);
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(DigestError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        self.observer.payload("response", &text);
        serde_json::from_str(&text)
            .map_err(|e| DigestError::MalformedResponse(format!("{} returned unexpected JSON: {}", url, e)))
    }

    async fn complete<M: Serialize>(&self, messages: Vec<M>) -> DigestResult<String> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            stream: false,
        };
        let response: CompletionResponse = self.post_json("/v1/chat/completions", &request).await?;
        extract_completion(response)
    }
}

#[async_trait]
impl TextGenerator for LmClient {
    async fn generate(&self, prompt: &str) -> DigestResult<String> {
        self.observer.payload("prompt", prompt);
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        self.complete(messages).await
    }
}

#[async_trait]
impl ImageDescriber for LmClient {
    async fn describe_image(&self, prompt: &str, image_path: &Path) -> DigestResult<String> {
        self.observer
            .payload("image prompt", &format!("{}\nImage Path: {}", prompt, image_path.display()));
        let (base64_image, content_type) = load_image_for_vision(image_path, &self.observer).await?;
        let messages = create_vision_message(prompt, &base64_image, &content_type);
        self.complete(messages).await
    }
}

#[async_trait]
impl Transcriber for LmClient {
    async fn transcribe(&self, audio_path: &Path) -> DigestResult<String> {
        let bytes = tokio::fs::read(audio_path).await?;
        debug!(
            target: self.observer.target(),
            "🎙️ Loaded voice note {} ({} bytes)",
            audio_path.display(),
            bytes.len()
        );
        let file_name = audio_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let content_type = mime_guess::from_path(audio_path).first_or_octet_stream().to_string();

        let file = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&content_type)?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.settings.model.clone())
            .text("response_format", "json")
            .part("file", file);

        let url = self.endpoint("/v1/audio/transcriptions");
        let response: TranscriptionResponse = self.send(&url, self.client.post(&url).multipart(form)).await?;
        Ok(response.text.trim().to_string())
    }
}

#[async_trait]
impl Embedder for LmClient {
    async fn embed(&self, text: &str) -> DigestResult<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.settings.model,
            input: text,
        };
        let response: EmbeddingResponse = self.post_json("/v1/embeddings", &request).await?;
        extract_embedding(response)
    }
}

fn extract_completion(response: CompletionResponse) -> DigestResult<String> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| DigestError::MalformedResponse("completion has no message content".to_string()))?;
    Ok(strip_think(&content))
}

fn extract_embedding(mut response: EmbeddingResponse) -> DigestResult<Vec<f32>> {
    response.data.sort_by_key(|entry| entry.index);
    let embedding = response
        .data
        .into_iter()
        .next()
        .map(|entry| entry.embedding)
        .ok_or_else(|| DigestError::MalformedResponse("embedding response has no data".to_string()))?;
    if embedding.is_empty() {
        return Err(DigestError::MalformedResponse("embedding vector is empty".to_string()));
    }
    Ok(embedding)
}

/// Reasoning models wrap their scratchpad in <think> tags; keep only the answer.
pub fn strip_think(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_think() {
        let raw = "<think>\nplanning the answer\n</think>\n\nHiking trip on Saturday.";
        assert_eq!(strip_think(raw), "Hiking trip on Saturday.");
        assert_eq!(strip_think("  plain  "), "plain");
    }

    #[test]
    fn test_extract_completion_first_choice() {
        let response: CompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":" A summary. "}},{"message":{"content":"ignored"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_completion(response).unwrap(), "A summary.");
    }

    #[test]
    fn test_extract_completion_without_choices_is_malformed() {
        let response: CompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            extract_completion(response),
            Err(DigestError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_extract_embedding_orders_by_index() {
        let response: EmbeddingResponse = serde_json::from_str(
            r#"{"data":[{"index":1,"embedding":[9.0]},{"index":0,"embedding":[0.5,0.25]}]}"#,
        )
        .unwrap();
        assert_eq!(extract_embedding(response).unwrap(), vec![0.5, 0.25]);
    }

    #[test]
    fn test_transcription_response() {
        let response: TranscriptionResponse =
            serde_json::from_str(r#"{"text":"  Meet at the car park at eight. "}"#).unwrap();
        assert_eq!(response.text.trim(), "Meet at the car park at eight.");
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let settings = LmSettings {
            base_url: "http://localhost:1234/".to_string(),
            model: "whisper-1".to_string(),
            api_key: None,
            timeout: 5,
            temperature: 0.3,
            max_tokens: 16,
        };
        let client = LmClient::new(settings, &Observer::default()).unwrap();
        assert_eq!(
            client.endpoint("/v1/audio/transcriptions"),
            "http://localhost:1234/v1/audio/transcriptions"
        );
    }

    #[test]
    fn test_vision_request_serializes_as_openai_multimodal() {
        let request = ChatRequest {
            model: "llava",
            messages: create_vision_message("Describe", "QUJD", "image/png"),
            temperature: 0.3,
            max_tokens: 256,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        let user = &json["messages"][1]["content"];
        assert_eq!(user[0]["type"], "text");
        assert_eq!(user[1]["type"], "image_url");
        assert_eq!(user[1]["image_url"]["url"], "data:image/png;base64,QUJD");
        assert_eq!(json["stream"], false);
    }
}
