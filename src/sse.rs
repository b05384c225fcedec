//! Server-Sent Events (SSE) processing for streaming chat completions.
//!
//! The service sends one `data: {json}` event per chunk and finishes with `data: [DONE]`.
//! This module turns the raw byte stream into a stream of [`Delta`]s.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use crate::client::ApiErrorBody;
use crate::error::{Error, RemoteErrorKind, Result};
use crate::message::Role;
use crate::stream::Delta;

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// What one complete SSE event amounted to.
#[derive(Debug)]
enum Event {
    /// A chunk carrying a delta, or a broken chunk.
    Delta(Result<Delta>),
    /// A comment, keep-alive, or chunk without choices.
    Skip,
    /// The `[DONE]` marker.
    Done,
}

fn streaming_error(message: impl Into<String>) -> Error {
    Error::remote(RemoteErrorKind::Streaming, message, None, None)
}

/// Process a stream of bytes into a stream of deltas.
///
/// The output ends at the `[DONE]` marker or when the byte stream ends, whichever comes first.
pub fn process_sse<S, E>(byte_stream: S) -> impl Stream<Item = Result<Delta>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let stream = byte_stream.map(|result| {
        result.map_err(|e| {
            Error::remote(
                RemoteErrorKind::Streaming,
                format!("Error in HTTP stream: {e}"),
                None,
                Some(Box::new(e)),
            )
        })
    });

    stream::unfold(
        (stream, Vec::<u8>::new(), false),
        move |(mut stream, mut buffer, mut done)| async move {
            loop {
                if done {
                    return None;
                }
                if let Some((event, rest)) = extract_event(&buffer) {
                    buffer = rest;
                    match event {
                        Event::Delta(delta) => return Some((delta, (stream, buffer, done))),
                        Event::Skip => continue,
                        Event::Done => {
                            done = true;
                            continue;
                        }
                    }
                }

                match stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        return Some((Err(e), (stream, buffer, true)));
                    }
                    None => {
                        // A final event may arrive without its trailing blank line.
                        if !buffer.iter().all(u8::is_ascii_whitespace) {
                            buffer.extend_from_slice(b"\n\n");
                            continue;
                        }
                        return None;
                    }
                }
            }
        },
    )
}

fn find_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Extract a complete SSE event from the front of the buffer.
fn extract_event(buffer: &[u8]) -> Option<(Event, Vec<u8>)> {
    let (end, sep) = find_boundary(buffer)?;
    let rest = buffer[end + sep..].to_vec();
    let event_text = match std::str::from_utf8(&buffer[..end]) {
        Ok(text) => text,
        Err(e) => {
            return Some((
                Event::Delta(Err(streaming_error(format!("Invalid UTF-8 in stream: {e}")))),
                rest,
            ));
        }
    };

    let mut data = Vec::new();
    for line in event_text.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if data.is_empty() {
        return Some((Event::Skip, rest));
    }
    let data = data.join("\n");
    if data.trim() == "[DONE]" {
        return Some((Event::Done, rest));
    }
    Some((parse_chunk(&data), rest))
}

fn parse_chunk(data: &str) -> Event {
    let chunk = match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            return Event::Delta(Err(Error::remote(
                RemoteErrorKind::Streaming,
                format!("Failed to parse event JSON: {e}"),
                None,
                Some(Box::new(e)),
            )));
        }
    };
    if let Some(error) = chunk.error {
        return Event::Delta(Err(Error::remote(
            RemoteErrorKind::Api,
            error.message.unwrap_or_else(|| "error event in stream".to_string()),
            None,
            None,
        )));
    }
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Event::Skip;
    };
    let role = match choice.delta.role.as_deref().map(str::parse::<Role>) {
        None => None,
        Some(Ok(role)) => Some(role),
        Some(Err(e)) => return Event::Delta(Err(streaming_error(e.to_string()))),
    };
    Event::Delta(Ok(Delta {
        role,
        content: choice.delta.content,
    }))
}
