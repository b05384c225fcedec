//! The conversation controller.
//!
//! [`Conversation::handle`] takes one invocation of the command line through its whole life:
//! load the session, add the user's turn, ask the completion service, append the reply, persist,
//! and optionally keep going interactively.  Nothing is written to the session file until a reply
//! has been obtained, so a failed exchange leaves the stored history as it was.

use futures::StreamExt;
use log::{debug, info};

use crate::client::{Completion, Response};
use crate::config::{Config, ModelConfig};
use crate::error::{Error, RemoteErrorKind, Result};
use crate::message::{Message, Role};
use crate::observability::{EXCHANGE_ERRORS, EXCHANGES};
use crate::prompt::PromptTemplate;
use crate::render::Renderer;
use crate::store::SessionStore;
use crate::stream::SnapshotStream;
use crate::tokens::estimate_all;

/// Prompt shown when reading interactive input.
pub const INPUT_PROMPT: &str = "query (type 'quit' to exit): ";

const QUIT_COMMANDS: &[&str] = &["quit", "exit", "/quit", "/exit", "/q"];

/// Returns true if the line asks to leave interactive mode.
pub fn is_quit(line: &str) -> bool {
    let line = line.trim();
    QUIT_COMMANDS.iter().any(|q| q.eq_ignore_ascii_case(line))
}

/// Supplies lines of input in interactive mode.
pub trait LineSource {
    /// Reads one line.  Returns `None` at end of input.
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// One invocation of the controller.
#[derive(Clone, Debug, Default)]
pub struct Request {
    /// Session to work on.
    pub session: String,
    /// Text of the user's turn, if any.
    pub query: Option<String>,
    /// Template that seeds a new session.
    pub prompt: Option<PromptTemplate>,
    /// Keep reading queries after the first exchange.
    pub interactive: bool,
    /// Report token estimates instead of calling the service.
    pub tokens_only: bool,
    /// Start from an empty history, replacing whatever the session held once a reply arrives.
    pub fresh: bool,
}

/// What a handled request left behind.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    /// The session's messages when the controller finished.
    pub messages: Vec<Message>,
    /// Number of completed exchanges.
    pub exchanges: usize,
}

/// Drives sessions between the store, the completion service and the display.
pub struct Conversation<C: Completion> {
    store: SessionStore,
    client: C,
    config: Config,
}

impl<C: Completion> Conversation<C> {
    /// Creates a controller.
    pub fn new(store: SessionStore, client: C, config: Config) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// The store sessions are persisted to.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// The completion service.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Handles one request.
    ///
    /// # Errors
    ///
    /// - `ConflictingInit` if a prompt template is given for a session with history and the
    ///   request does not start fresh.
    /// - `NothingToDo` if there is no history, no query, and the request is not interactive.
    /// - Any store or remote error from the first exchange.  In interactive mode, remote errors
    ///   of later exchanges are reported to the renderer and the loop continues.
    pub async fn handle(
        &self,
        request: Request,
        renderer: &mut dyn Renderer,
        lines: &mut dyn LineSource,
    ) -> Result<Outcome> {
        let name = request.session.as_str();
        let mut messages = if request.fresh {
            self.store.session_path(name)?;
            Vec::new()
        } else {
            self.store.open_session(name)?
        };
        if !messages.is_empty() && request.prompt.is_some() {
            return Err(Error::conflicting_init(name));
        }
        let prompt = request.prompt.as_ref();
        let model = self.config.model_config(prompt);
        if let Some(query) = request.query.as_deref().filter(|q| !q.trim().is_empty()) {
            append_query(&mut messages, prompt, query);
        }
        if messages.is_empty() && !request.interactive {
            return Err(Error::NothingToDo);
        }

        if request.tokens_only {
            renderer.print_tokens(&messages, &estimate_all(&messages));
            return Ok(Outcome {
                messages,
                exchanges: 0,
            });
        }

        let mut exchanges = 0;
        if messages.last().is_some_and(|m| m.role == Role::User) {
            self.exchange(name, &mut messages, 0, &model, renderer)
                .await?;
            exchanges += 1;
        } else if !messages.is_empty() {
            renderer.print_messages(&messages);
        }

        if request.interactive {
            while let Some(line) = lines.read_line(INPUT_PROMPT)? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if is_quit(line) {
                    break;
                }
                let checkpoint = messages.clone();
                append_query(&mut messages, prompt, line);
                let shown = messages.len() - 1;
                match self
                    .exchange(name, &mut messages, shown, &model, renderer)
                    .await
                {
                    Ok(()) => exchanges += 1,
                    Err(err) if err.is_remote() || err.is_empty_stream() => {
                        messages = checkpoint;
                        renderer.print_error(&err.to_string());
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(Outcome {
            messages,
            exchanges,
        })
    }

    /// Completes the conversation, then appends and persists the reply.
    ///
    /// `messages[shown..]` is displayed along with the reply.  On failure `messages` is left
    /// untouched and nothing is saved.
    async fn exchange(
        &self,
        name: &str,
        messages: &mut Vec<Message>,
        shown: usize,
        model: &ModelConfig,
        renderer: &mut dyn Renderer,
    ) -> Result<()> {
        EXCHANGES.click();
        if self.config.debug() {
            for (idx, message) in messages.iter().enumerate() {
                debug!("request[{idx}] {}: {:?}", message.role, message.content);
            }
        }
        let reply = match self.reply(messages, shown, model, renderer).await {
            Ok(reply) => reply,
            Err(err) => {
                EXCHANGE_ERRORS.click();
                return Err(err);
            }
        };
        info!(
            "session {name}: {} message(s), reply of {} bytes",
            messages.len() + 1,
            reply.content.len()
        );
        let mut updated = messages.clone();
        updated.push(reply);
        self.store.save(name, &updated)?;
        *messages = updated;
        Ok(())
    }

    async fn reply(
        &self,
        messages: &[Message],
        shown: usize,
        model: &ModelConfig,
        renderer: &mut dyn Renderer,
    ) -> Result<Message> {
        let waiting = renderer.start_waiting();
        let response = self.client.complete(messages, model).await;
        drop(waiting);
        match response? {
            Response::Complete(reply) => {
                let mut shown_messages = messages[shown..].to_vec();
                shown_messages.push(reply.clone());
                renderer.print_messages(&shown_messages);
                Ok(reply)
            }
            Response::Streaming(deltas) => {
                renderer.print_messages(&messages[shown..]);
                let (mut snapshots, final_message) = SnapshotStream::new(deltas);
                let mut failure = None;
                while let Some(snapshot) = snapshots.next().await {
                    match snapshot {
                        Ok(snapshot) => renderer.update(&snapshot),
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                renderer.finish_stream();
                if let Some(err) = failure {
                    return Err(err);
                }
                final_message.await.unwrap_or_else(|_| {
                    Err(Error::remote(
                        RemoteErrorKind::Streaming,
                        "stream ended without a result",
                        None,
                        None,
                    ))
                })
            }
        }
    }
}

/// Adds the user's turn, seeding a new session with the template's system message.
///
/// An unanswered user turn at the end of the history absorbs the new query rather than being
/// followed by a second user turn.
fn append_query(messages: &mut Vec<Message>, prompt: Option<&PromptTemplate>, query: &str) {
    if messages.is_empty() {
        if let Some(prompt) = prompt {
            messages.push(Message::system(prompt.system.clone()));
        }
    }
    match messages.pop() {
        Some(last) if last.role == Role::User => {
            messages.push(Message::user(format!("{}\n\n{query}", last.content)));
        }
        Some(last) => {
            messages.push(last);
            messages.push(Message::user(query));
        }
        None => messages.push(Message::user(query)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::Mutex;

    use futures::stream;
    use tempfile::TempDir;

    use super::*;
    use crate::stream::{Delta, Snapshot};
    use crate::tokens::TokenEstimate;

    enum Scripted {
        Reply(&'static str),
        Deltas(Vec<Delta>),
        Fail(RemoteErrorKind),
    }

    #[derive(Default)]
    struct ScriptedCompletion {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<(Vec<Message>, ModelConfig)>>,
    }

    impl ScriptedCompletion {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requests: Mutex::default(),
            }
        }

        fn requests(&self) -> Vec<(Vec<Message>, ModelConfig)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Completion for ScriptedCompletion {
        async fn complete(&self, messages: &[Message], config: &ModelConfig) -> Result<Response> {
            self.requests
                .lock()
                .unwrap()
                .push((messages.to_vec(), config.clone()));
            let next = self.script.lock().unwrap().pop_front();
            match next.expect("unexpected request") {
                Scripted::Reply(text) => Ok(Response::Complete(Message::assistant(text))),
                Scripted::Deltas(deltas) => Ok(Response::Streaming(Box::pin(stream::iter(
                    deltas.into_iter().map(Ok::<Delta, Error>),
                )))),
                Scripted::Fail(kind) => Err(Error::remote(kind, "scripted failure", None, None)),
            }
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        printed: Vec<Message>,
        snapshots: Vec<Snapshot>,
        tokens: Vec<TokenEstimate>,
        errors: Vec<String>,
        streams_finished: usize,
    }

    impl Renderer for RecordingRenderer {
        fn print_messages(&mut self, messages: &[Message]) {
            self.printed.extend_from_slice(messages);
        }

        fn print_tokens(&mut self, messages: &[Message], estimates: &[TokenEstimate]) {
            self.printed.extend_from_slice(messages);
            self.tokens.extend_from_slice(estimates);
        }

        fn update(&mut self, snapshot: &Snapshot) {
            self.snapshots.push(snapshot.clone());
        }

        fn finish_stream(&mut self) {
            self.streams_finished += 1;
        }

        fn print_error(&mut self, error: &str) {
            self.errors.push(error.to_string());
        }

        fn print_info(&mut self, _: &str) {}
    }

    struct ScriptedLines(VecDeque<&'static str>);

    impl ScriptedLines {
        fn none() -> Self {
            Self(VecDeque::new())
        }
    }

    impl LineSource for ScriptedLines {
        fn read_line(&mut self, _: &str) -> Result<Option<String>> {
            Ok(self.0.pop_front().map(String::from))
        }
    }

    fn request(query: Option<&str>) -> Request {
        Request {
            session: "test".to_string(),
            query: query.map(String::from),
            ..Request::default()
        }
    }

    fn conversation(dir: &TempDir, script: Vec<Scripted>) -> Conversation<ScriptedCompletion> {
        Conversation::new(
            SessionStore::new(dir.path()),
            ScriptedCompletion::new(script),
            Config::new(),
        )
    }

    async fn run(
        conversation: &Conversation<ScriptedCompletion>,
        request: Request,
    ) -> Result<Outcome> {
        conversation
            .handle(
                request,
                &mut RecordingRenderer::default(),
                &mut ScriptedLines::none(),
            )
            .await
    }

    #[tokio::test]
    async fn exchanges_append_and_persist() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(
            &dir,
            vec![Scripted::Reply("r1"), Scripted::Reply("r2")],
        );
        run(&conversation, request(Some("hi"))).await.unwrap();
        let outcome = run(&conversation, request(Some("again"))).await.unwrap();
        let expected = vec![
            Message::user("hi"),
            Message::assistant("r1"),
            Message::user("again"),
            Message::assistant("r2"),
        ];
        assert_eq!(outcome.messages, expected);
        assert_eq!(conversation.store().load("test").unwrap(), expected);
        let requests = conversation.client().requests();
        assert_eq!(requests[1].0, expected[..3].to_vec());
    }

    #[tokio::test]
    async fn prompt_seeds_new_session() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(&dir, vec![Scripted::Reply("ok")]);
        let mut request = request(Some("hi"));
        request.prompt = Some(PromptTemplate {
            system: "be brief".to_string(),
            model: Some("gpt-4".to_string()),
            temperature: None,
        });
        let outcome = run(&conversation, request).await.unwrap();
        assert_eq!(outcome.messages[0], Message::system("be brief"));
        assert_eq!(conversation.client().requests()[0].1.model, "gpt-4");
    }

    #[tokio::test]
    async fn conflicting_init_leaves_session_alone() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(&dir, vec![]);
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        conversation.store().save("test", &history).unwrap();
        let mut request = request(Some("more"));
        request.prompt = Some(PromptTemplate::new("system"));
        let err = run(&conversation, request).await.unwrap_err();
        assert!(err.is_conflicting_init());
        assert_eq!(conversation.store().load("test").unwrap(), history);
        assert!(conversation.client().requests().is_empty());
    }

    #[tokio::test]
    async fn fresh_request_replaces_history() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(&dir, vec![Scripted::Reply("ok")]);
        let history = vec![Message::user("earlier"), Message::assistant("answer")];
        conversation.store().save("test", &history).unwrap();
        let mut request = request(Some("brand new"));
        request.fresh = true;
        request.prompt = Some(PromptTemplate::new("be brief"));
        let outcome = run(&conversation, request).await.unwrap();
        let expected = vec![
            Message::system("be brief"),
            Message::user("brand new"),
            Message::assistant("ok"),
        ];
        assert_eq!(outcome.messages, expected);
        assert_eq!(conversation.client().requests()[0].0, expected[..2].to_vec());
        assert_eq!(conversation.store().load("test").unwrap(), expected);
    }

    #[tokio::test]
    async fn fresh_tokens_only_ignores_history() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(&dir, vec![]);
        let history = vec![Message::user("earlier"), Message::assistant("answer")];
        conversation.store().save("test", &history).unwrap();
        let mut request = request(Some("brand new"));
        request.fresh = true;
        request.tokens_only = true;
        let mut renderer = RecordingRenderer::default();
        conversation
            .handle(request, &mut renderer, &mut ScriptedLines::none())
            .await
            .unwrap();
        assert_eq!(renderer.printed, vec![Message::user("brand new")]);
        assert_eq!(conversation.store().load("test").unwrap(), history);
    }

    #[tokio::test]
    async fn storage_failure_aborts_exchange() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(
            &dir,
            vec![Scripted::Reply("r1"), Scripted::Reply("lost")],
        );
        let mut first = request(Some("hi"));
        first.session = "kept".to_string();
        run(&conversation, first).await.unwrap();
        let blocker = conversation.store().session_path("test").unwrap();
        fs::create_dir_all(blocker.join("occupied")).unwrap();

        let mut second = request(Some("again"));
        second.fresh = true;
        let err = run(&conversation, second).await.unwrap_err();
        assert!(err.is_storage_write(), "{err}");
        assert_eq!(conversation.client().requests().len(), 2);
        assert_eq!(
            conversation.store().load("kept").unwrap(),
            vec![Message::user("hi"), Message::assistant("r1")]
        );
        assert!(blocker.join("occupied").is_dir());
        let leftovers: Vec<_> = fs::read_dir(conversation.store().root())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn cold_start_without_query_is_nothing_to_do() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(&dir, vec![]);
        let err = run(&conversation, request(None)).await.unwrap_err();
        assert!(err.is_nothing_to_do());
        let err = run(&conversation, request(Some("   "))).await.unwrap_err();
        assert!(err.is_nothing_to_do());
    }

    #[tokio::test]
    async fn remote_failure_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(
            &dir,
            vec![
                Scripted::Reply("r1"),
                Scripted::Fail(RemoteErrorKind::RateLimit),
            ],
        );
        run(&conversation, request(Some("hi"))).await.unwrap();
        let err = run(&conversation, request(Some("again"))).await.unwrap_err();
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::RateLimit));
        assert_eq!(
            conversation.store().load("test").unwrap(),
            vec![Message::user("hi"), Message::assistant("r1")]
        );
    }

    #[tokio::test]
    async fn tokens_only_neither_calls_nor_saves() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(&dir, vec![]);
        let mut request = request(Some("how much?"));
        request.tokens_only = true;
        let mut renderer = RecordingRenderer::default();
        let outcome = conversation
            .handle(request, &mut renderer, &mut ScriptedLines::none())
            .await
            .unwrap();
        assert_eq!(outcome.exchanges, 0);
        assert_eq!(renderer.tokens.len(), 3);
        assert!(conversation.client().requests().is_empty());
        assert!(!conversation.store().exists("test").unwrap());
    }

    #[tokio::test]
    async fn existing_session_without_query_is_shown() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(&dir, vec![]);
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        conversation.store().save("test", &history).unwrap();
        let mut renderer = RecordingRenderer::default();
        let outcome = conversation
            .handle(request(None), &mut renderer, &mut ScriptedLines::none())
            .await
            .unwrap();
        assert_eq!(outcome.exchanges, 0);
        assert_eq!(renderer.printed, history);
    }

    #[tokio::test]
    async fn streaming_reply_is_reduced_and_saved() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(
            &dir,
            vec![Scripted::Deltas(vec![
                Delta::role(Role::Assistant),
                Delta::content("Hel"),
                Delta::content("lo"),
            ])],
        );
        let mut renderer = RecordingRenderer::default();
        conversation
            .handle(
                request(Some("hi")),
                &mut renderer,
                &mut ScriptedLines::none(),
            )
            .await
            .unwrap();
        let contents: Vec<&str> = renderer
            .snapshots
            .iter()
            .map(|s| s.content.as_str())
            .collect();
        assert_eq!(contents, vec!["", "Hel", "Hello"]);
        assert_eq!(renderer.streams_finished, 1);
        assert_eq!(
            conversation.store().load("test").unwrap(),
            vec![Message::user("hi"), Message::assistant("Hello")]
        );
    }

    #[tokio::test]
    async fn empty_stream_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(&dir, vec![Scripted::Deltas(vec![])]);
        let err = run(&conversation, request(Some("hi"))).await.unwrap_err();
        assert!(err.is_empty_stream());
        assert!(!conversation.store().exists("test").unwrap());
    }

    #[tokio::test]
    async fn interactive_prints_newest_exchange_only() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(
            &dir,
            vec![
                Scripted::Reply("r1"),
                Scripted::Fail(RemoteErrorKind::Server),
                Scripted::Reply("r2"),
            ],
        );
        let mut request = request(Some("hi"));
        request.interactive = true;
        let mut renderer = RecordingRenderer::default();
        let mut lines = ScriptedLines(VecDeque::from(["", "broken", "again", "quit", "never"]));
        let outcome = conversation
            .handle(request, &mut renderer, &mut lines)
            .await
            .unwrap();
        let expected = vec![
            Message::user("hi"),
            Message::assistant("r1"),
            Message::user("again"),
            Message::assistant("r2"),
        ];
        assert_eq!(outcome.exchanges, 2);
        assert_eq!(outcome.messages, expected);
        assert_eq!(conversation.store().load("test").unwrap(), expected);
        assert_eq!(renderer.errors.len(), 1);
        assert_eq!(renderer.printed, expected);
        assert_eq!(lines.0, VecDeque::from(["never"]));
    }

    #[tokio::test]
    async fn interactive_cold_start_ends_at_end_of_input() {
        let dir = TempDir::new().unwrap();
        let conversation = conversation(&dir, vec![]);
        let mut request = request(None);
        request.interactive = true;
        let outcome = run(&conversation, request).await.unwrap();
        assert!(outcome.messages.is_empty());
        assert!(!conversation.store().exists("test").unwrap());
    }

    #[test]
    fn unanswered_user_turn_absorbs_query() {
        let mut messages = vec![Message::user("first")];
        append_query(&mut messages, None, "second");
        assert_eq!(messages, vec![Message::user("first\n\nsecond")]);
    }

    #[test]
    fn quit_commands() {
        for line in ["quit", "EXIT", " /q ", "/quit", "/exit"] {
            assert!(is_quit(line), "{line}");
        }
        assert!(!is_quit("quite"));
    }
}
