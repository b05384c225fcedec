//! Reduces a streamed response into live snapshots and one final message.
//!
//! [`StreamReducer`] is the pure fold: feed it [`Delta`]s, get back growing [`Snapshot`]s, and
//! call [`StreamReducer::finish`] for the completed [`Message`].  [`SnapshotStream`] drives the
//! same fold over an async delta stream so that a display can consume snapshots while the final
//! message is delivered through a oneshot channel once the stream is drained.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use log::debug;

use crate::error::{Error, Result};
use crate::message::{Message, Role};
use crate::observability::{STREAM_DELTAS, STREAM_EMPTY};

/// One incremental piece of a streamed response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    /// Role assignment, usually only on the first delta.
    pub role: Option<Role>,
    /// Text to append to the running content.
    pub content: Option<String>,
}

impl Delta {
    /// A delta that assigns the role.
    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            content: None,
        }
    }

    /// A delta that appends text.
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            role: None,
            content: Some(content.into()),
        }
    }
}

/// The response as it stands after some number of deltas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// The role seen so far, if any.
    pub role: Option<Role>,
    /// All content received so far.
    pub content: String,
}

/// Folds deltas into snapshots.
#[derive(Debug, Default)]
pub struct StreamReducer {
    state: Snapshot,
    deltas: usize,
}

impl StreamReducer {
    /// Creates a reducer with no role and empty content.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one delta and returns the resulting snapshot.
    ///
    /// A later role replaces an earlier one.
    pub fn apply(&mut self, delta: Delta) -> &Snapshot {
        if let Some(role) = delta.role {
            if self.state.role.is_some_and(|r| r != role) {
                debug!("stream changed role from {:?} to {role:?}", self.state.role);
            }
            self.state.role = Some(role);
        }
        if let Some(content) = delta.content {
            self.state.content.push_str(&content);
        }
        self.deltas += 1;
        STREAM_DELTAS.click();
        &self.state
    }

    /// The number of deltas applied.
    pub fn deltas(&self) -> usize {
        self.deltas
    }

    /// Turns the last snapshot into the final message.
    ///
    /// A stream that never named a role is taken to be from the assistant.
    ///
    /// # Errors
    ///
    /// Returns `EmptyStream` if no delta was ever applied.
    pub fn finish(self) -> Result<Message> {
        if self.deltas == 0 {
            STREAM_EMPTY.click();
            return Err(Error::EmptyStream);
        }
        let role = self.state.role.unwrap_or(Role::Assistant);
        Ok(Message::new(role, self.state.content))
    }
}

/// Reduces a complete sequence of deltas, discarding the intermediate snapshots.
pub fn reduce<I>(deltas: I) -> Result<Message>
where
    I: IntoIterator<Item = Delta>,
{
    let mut reducer = StreamReducer::new();
    for delta in deltas {
        reducer.apply(delta);
    }
    reducer.finish()
}

/// A boxed stream of deltas, as returned by the completion client.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Delta>> + Send>>;

/// A stream wrapper that yields a [`Snapshot`] per delta and reduces them into a final message.
///
/// When the inner stream ends, the final message (or `EmptyStream`) is sent through the
/// receiver returned by [`SnapshotStream::new`].  If the inner stream yields an error, the error
/// is passed through and the receiver is closed without a value.
pub struct SnapshotStream {
    inner: DeltaStream,
    reducer: Option<StreamReducer>,
    message_tx: Option<tokio::sync::oneshot::Sender<Result<Message>>>,
}

impl SnapshotStream {
    /// Wraps a delta stream.
    pub fn new<S>(stream: S) -> (Self, tokio::sync::oneshot::Receiver<Result<Message>>)
    where
        S: Stream<Item = Result<Delta>> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let this = Self {
            inner: Box::pin(stream),
            reducer: Some(StreamReducer::new()),
            message_tx: Some(tx),
        };
        (this, rx)
    }
}

impl Stream for SnapshotStream {
    type Item = Result<Snapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.reducer.is_none() {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(delta))) => {
                let snapshot = match self.reducer.as_mut() {
                    Some(reducer) => reducer.apply(delta).clone(),
                    None => return Poll::Ready(None),
                };
                Poll::Ready(Some(Ok(snapshot)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.reducer = None;
                self.message_tx.take();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if let (Some(reducer), Some(tx)) = (self.reducer.take(), self.message_tx.take()) {
                    let _ = tx.send(reducer.finish());
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
