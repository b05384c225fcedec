// Public modules
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod message;
pub mod observability;
pub mod prompt;
pub mod render;
pub mod sse;
pub mod store;
pub mod stream;
pub mod tokens;

// Re-exports
pub use client::{Completion, OpenAi, Response};
pub use config::{Args, Config, ModelConfig, SessionCommand};
pub use conversation::{Conversation, LineSource, Outcome, Request, is_quit};
pub use error::{Error, RemoteErrorKind, Result};
pub use message::{Message, Role};
pub use observability::register_biometrics;
pub use prompt::{PromptLibrary, PromptTemplate};
pub use render::{PlainTextRenderer, Renderer, WaitIndicator, extract_content};
pub use store::{DEFAULT_SESSION, LegacyCodec, SessionCodec, SessionStore, YamlCodec};
pub use stream::{Delta, DeltaStream, Snapshot, SnapshotStream, StreamReducer};
pub use tokens::TokenEstimate;
