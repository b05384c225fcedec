//! The remote chat-completion collaborator.
//!
//! [`Completion`] is the seam the conversation controller talks to.  [`OpenAi`] implements it
//! over HTTP against any OpenAI-compatible `chat/completions` endpoint.

use std::env;
use std::time::{Duration, Instant};

use log::debug;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response as HttpResponse};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{Error, RemoteErrorKind, Result};
use crate::message::{Message, Role};
use crate::observability::{CLIENT_REQUEST_DURATION, CLIENT_REQUEST_ERRORS, CLIENT_REQUESTS};
use crate::sse::process_sse;
use crate::stream::DeltaStream;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable consulted when no API key is passed explicitly.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// What the completion service returned.
pub enum Response {
    /// A single complete message.
    Complete(Message),
    /// A lazy sequence of deltas to be reduced.
    Streaming(DeltaStream),
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Complete(message) => f.debug_tuple("Complete").field(message).finish(),
            Response::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// A service that continues a conversation.
#[async_trait::async_trait]
pub trait Completion: Send + Sync {
    /// Sends the full history and returns the reply, streamed when `config.stream` is set.
    ///
    /// # Errors
    ///
    /// Every failure is reported as `Error::Remote`.
    async fn complete(&self, messages: &[Message], config: &ModelConfig) -> Result<Response>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    n: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    role: Role,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ApiErrorBody>,
}

/// The `error` object the service puts in failed responses and error events.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default, rename = "type")]
    pub(crate) error_type: Option<String>,
}

/// Client for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone)]
pub struct OpenAi {
    api_key: Option<String>,
    client: ReqwestClient,
    base_url: String,
}

impl OpenAi {
    /// Create a new client.
    ///
    /// The API key can be provided directly or read from the `OPENAI_API_KEY` environment
    /// variable.  A missing key is only reported when a request is made.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::with_options(api_key, None)
    }

    /// Create a new client with a custom base URL.
    pub fn with_options(api_key: Option<String>, base_url: Option<String>) -> Result<Self> {
        let api_key = api_key
            .or_else(|| env::var(API_KEY_ENV).ok())
            .filter(|key| !key.is_empty());
        let client = ReqwestClient::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::remote(
                    RemoteErrorKind::Connection,
                    format!("Failed to build HTTP client: {e}"),
                    None,
                    Some(Box::new(e)),
                )
            })?;
        let mut base_url = base_url.unwrap_or_else(|| DEFAULT_API_URL.to_string());
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            api_key,
            client,
            base_url,
        })
    }

    /// The endpoint requests are sent to.
    pub fn endpoint(&self) -> String {
        format!("{}chat/completions", self.base_url)
    }

    fn headers(&self, stream: bool) -> Result<HeaderMap> {
        let Some(api_key) = &self.api_key else {
            return Err(Error::remote(
                RemoteErrorKind::Authentication,
                format!("API key not provided and {API_KEY_ENV} environment variable not set"),
                None,
                None,
            ));
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        headers.insert(header::ACCEPT, HeaderValue::from_static(accept));
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            Error::remote(
                RemoteErrorKind::Authentication,
                "API key contains characters that cannot be sent in a header",
                None,
                None,
            )
        })?;
        headers.insert(header::AUTHORIZATION, bearer);
        Ok(headers)
    }

    async fn post(&self, messages: &[Message], config: &ModelConfig) -> Result<HttpResponse> {
        let body = ChatRequest {
            model: &config.model,
            messages,
            temperature: config.temperature,
            n: 1,
            stream: config.stream,
        };
        let headers = self.headers(config.stream)?;
        debug!(
            "POST {} model={} messages={} stream={}",
            self.endpoint(),
            config.model,
            messages.len(),
            config.stream
        );
        let response = self
            .client
            .post(self.endpoint())
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::remote(
                        RemoteErrorKind::Timeout,
                        format!("Request timed out: {e}"),
                        None,
                        Some(Box::new(e)),
                    )
                } else if e.is_connect() {
                    Error::remote(
                        RemoteErrorKind::Connection,
                        format!("Connection error: {e}"),
                        None,
                        Some(Box::new(e)),
                    )
                } else {
                    Error::remote(
                        RemoteErrorKind::Connection,
                        format!("Request failed: {e}"),
                        None,
                        Some(Box::new(e)),
                    )
                }
            })?;
        if !response.status().is_success() {
            return Err(Self::process_error_response(response).await);
        }
        Ok(response)
    }

    /// Process API response errors and convert to our Error type.
    async fn process_error_response(response: HttpResponse) -> Error {
        let status_code = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .map(String::from);
        match response.text().await {
            Ok(body) => map_error(status_code, retry_after.as_deref(), &body),
            Err(e) => Error::remote(
                RemoteErrorKind::Api,
                format!("Failed to read error response: {e}"),
                Some(status_code),
                Some(Box::new(e)),
            ),
        }
    }

    /// Send the conversation and wait for the whole reply.
    pub async fn send(&self, messages: &[Message], config: &ModelConfig) -> Result<Message> {
        let config = ModelConfig {
            stream: false,
            ..config.clone()
        };
        let response = self.post(messages, &config).await?;
        let body = response.text().await.map_err(|e| {
            Error::remote(
                RemoteErrorKind::Connection,
                format!("Failed to read response: {e}"),
                None,
                Some(Box::new(e)),
            )
        })?;
        parse_completion(&body)
    }

    /// Send the conversation and get the reply as a stream of deltas.
    pub async fn stream(&self, messages: &[Message], config: &ModelConfig) -> Result<DeltaStream> {
        let config = ModelConfig {
            stream: true,
            ..config.clone()
        };
        let response = self.post(messages, &config).await?;
        Ok(Box::pin(process_sse(response.bytes_stream())))
    }
}

#[async_trait::async_trait]
impl Completion for OpenAi {
    async fn complete(&self, messages: &[Message], config: &ModelConfig) -> Result<Response> {
        CLIENT_REQUESTS.click();
        let start = Instant::now();
        let result = if config.stream {
            self.stream(messages, config).await.map(Response::Streaming)
        } else {
            self.send(messages, config).await.map(Response::Complete)
        };
        CLIENT_REQUEST_DURATION.add(start.elapsed().as_secs_f64());
        if result.is_err() {
            CLIENT_REQUEST_ERRORS.click();
        }
        result
    }
}

/// Maps a non-success status and its body to a remote error.
fn map_error(status_code: u16, retry_after: Option<&str>, body: &str) -> Error {
    let detail = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.error);
    let error_type = detail.as_ref().and_then(|d| d.error_type.clone());
    let mut message = detail
        .and_then(|d| d.message)
        .unwrap_or_else(|| body.trim().to_string());
    if message.is_empty() {
        message = format!("HTTP {status_code}");
    }
    let kind = match status_code {
        400 | 422 => RemoteErrorKind::BadRequest,
        401 => RemoteErrorKind::Authentication,
        403 => RemoteErrorKind::Permission,
        404 => RemoteErrorKind::NotFound,
        408 => RemoteErrorKind::Timeout,
        429 => RemoteErrorKind::RateLimit,
        500..=599 => RemoteErrorKind::Server,
        _ => RemoteErrorKind::Api,
    };
    if let Some(error_type) = error_type {
        message = format!("{error_type}: {message}");
    }
    if let (RemoteErrorKind::RateLimit, Some(retry_after)) = (kind, retry_after) {
        message = format!("{message} (retry after {retry_after} seconds)");
    }
    Error::remote(kind, message, Some(status_code), None)
}

/// Maps a non-streaming response body to the reply message.
fn parse_completion(body: &str) -> Result<Message> {
    let completion: ChatCompletion = serde_json::from_str(body).map_err(|e| {
        Error::remote(
            RemoteErrorKind::Api,
            format!("Failed to parse response: {e}"),
            None,
            Some(Box::new(e)),
        )
    })?;
    let Some(choice) = completion.choices.into_iter().next() else {
        return Err(Error::remote(
            RemoteErrorKind::Api,
            "response contained no choices",
            None,
            None,
        ));
    };
    Ok(Message::new(
        choice.message.role,
        choice.message.content.unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn client_creation() {
        let client = OpenAi::new(Some("test-key".to_string())).unwrap();
        assert_eq!(client.api_key.as_deref(), Some("test-key"));
        assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");

        let client = OpenAi::with_options(
            Some("test-key".to_string()),
            Some("http://localhost:8080/v1".to_string()),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn request_body_shape() {
        let messages = vec![Message::system("be brief"), Message::user("hi")];
        let body = ChatRequest {
            model: "gpt-4",
            messages: &messages,
            temperature: 0.0,
            n: 1,
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "gpt-4",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"},
                ],
                "temperature": 0.0,
                "n": 1,
                "stream": true,
            })
        );
    }

    #[test]
    fn parse_single_completion() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"Hello"},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_completion(body).unwrap(), Message::assistant("Hello"));
    }

    #[test]
    fn completion_without_choices_is_an_error() {
        let err = parse_completion(r#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::Api));
    }

    #[test]
    fn status_codes_map_to_kinds() {
        let body = r#"{"error":{"message":"Incorrect API key","type":"invalid_request_error"}}"#;
        let err = map_error(401, None, body);
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::Authentication));
        assert!(err.to_string().contains("Incorrect API key"));

        let err = map_error(429, Some("20"), "{}");
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::RateLimit));
        assert!(err.to_string().contains("retry after 20"));

        let err = map_error(503, None, "upstream unavailable");
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::Server));
        assert_eq!(err.status_code(), Some(503));
    }

    #[tokio::test]
    async fn missing_key_fails_at_request_time() {
        let client = OpenAi {
            api_key: None,
            client: ReqwestClient::new(),
            base_url: DEFAULT_API_URL.to_string(),
        };
        let err = client
            .complete(&[Message::user("hi")], &ModelConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::Authentication));
    }

    #[tokio::test]
    #[ignore] // Requires a real API key.
    async fn live_stream() {
        if env::var(API_KEY_ENV).is_err() {
            println!("Skipping live_stream: {API_KEY_ENV} not set");
            return;
        }
        let client = OpenAi::new(None).unwrap();
        let config = ModelConfig {
            stream: true,
            ..ModelConfig::default()
        };
        let mut deltas = client
            .stream(&[Message::user("Say hello.")], &config)
            .await
            .unwrap();
        let mut received = false;
        while let Some(delta) = deltas.next().await {
            delta.unwrap();
            received = true;
        }
        assert!(received, "Expected to receive some deltas");
    }
}
