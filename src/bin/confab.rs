//! Command-line chat client with persistent sessions.
//!
//! # Usage
//!
//! ```bash
//! # Ask a question; it starts a new conversation in the default session
//! confab what is a monad
//!
//! # Continue the conversation
//! confab --last can you give an example
//!
//! # Print only the JSON or code block of the last reply
//! confab --extract
//!
//! # Start a named session from a prompt config, streaming the reply
//! confab --session review --prompt-config reviewer --stream < diff.patch
//!
//! # See what would be sent and what it would cost
//! confab --tokens --session review
//!
//! # Manage sessions
//! confab --session-list
//! confab --session review --session-rename old-review
//! ```

use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use confab::{
    Args, Config, Conversation, Error, LineSource, OpenAi, PlainTextRenderer, PromptLibrary,
    Renderer, Request, Result, SessionCommand, SessionStore,
};

/// Line separating piped input from the query.
const PIPE_SEPARATOR: &str = "----------------";

/// Reads interactive input with line editing.  Ctrl+C re-prompts.
#[derive(Default)]
struct Prompter {
    editor: Option<DefaultEditor>,
}

impl LineSource for Prompter {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        if self.editor.is_none() {
            self.editor = Some(DefaultEditor::new().map_err(input_error)?);
        }
        let Some(editor) = self.editor.as_mut() else {
            return Ok(None);
        };
        loop {
            match editor.readline(prompt) {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    return Ok(Some(line));
                }
                Err(ReadlineError::Interrupted) => {
                    println!();
                    continue;
                }
                Err(ReadlineError::Eof) => return Ok(None),
                Err(err) => return Err(input_error(err)),
            }
        }
    }
}

fn input_error(err: ReadlineError) -> Error {
    Error::io("cannot read input", io::Error::other(err))
}

/// Joins the query words, placing piped input above them.
fn assemble_query(words: &[String], piped: Option<String>) -> Option<String> {
    let query = words.join(" ");
    let piped = piped.filter(|p| !p.trim().is_empty());
    match (piped, query.trim().is_empty()) {
        (Some(piped), true) => Some(piped),
        (Some(piped), false) => Some(format!("{piped}\n{PIPE_SEPARATOR}\n{query}")),
        (None, true) => None,
        (None, false) => Some(query),
    }
}

fn read_piped_input() -> Result<Option<String>> {
    let mut stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let mut piped = String::new();
    stdin
        .read_to_string(&mut piped)
        .map_err(|err| Error::io("cannot read standard input", err))?;
    Ok(Some(piped))
}

fn run_session_command(
    store: &SessionStore,
    name: &str,
    command: SessionCommand,
    renderer: &mut dyn Renderer,
) -> Result<()> {
    match command {
        SessionCommand::List => {
            for session in store.list()? {
                renderer.print_info(&session);
            }
        }
        SessionCommand::Path => match store.existing_session_path(name)? {
            Some(path) => renderer.print_info(&path.display().to_string()),
            None => return Err(Error::session_not_found(name)),
        },
        SessionCommand::Dump => {
            let dump = store.dump(name)?;
            renderer.print_info(dump.trim_end());
        }
        SessionCommand::Delete => {
            store.delete(name)?;
            renderer.print_info(&format!("deleted session {name}"));
        }
        SessionCommand::Rename(new) => {
            store.rename(name, &new)?;
            renderer.print_info(&format!("renamed session {name} to {new}"));
        }
    }
    Ok(())
}

async fn run(config: Config, words: Vec<String>, renderer: &mut dyn Renderer) -> Result<()> {
    let store = SessionStore::open()?;
    let name = config.session_name().to_string();
    if let Some(command) = config.command.clone() {
        return run_session_command(&store, &name, command, renderer);
    }

    let query = assemble_query(&words, read_piped_input()?);
    let prompt = config
        .prompt_config
        .as_deref()
        .map(|p| PromptLibrary::from_environment().load(p))
        .transpose()?;
    let request = Request {
        session: name,
        query,
        prompt,
        interactive: config.interactive,
        tokens_only: config.tokens_only,
        fresh: !config.continues_session(),
    };
    let client = OpenAi::with_options(config.api_key.clone(), config.base_url.clone())?;
    let conversation = Conversation::new(store, client, config);
    conversation
        .handle(request, renderer, &mut Prompter::default())
        .await?;
    Ok(())
}

/// Main entry point for confab.
#[tokio::main]
async fn main() -> ExitCode {
    let (args, words) = Args::from_command_line_relaxed("confab [OPTIONS] [QUERY]...");
    let config = match Config::try_from(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("confab: {err}");
            return ExitCode::from(2);
        }
    };

    env_logger::Builder::new()
        .filter_level(config.log_level)
        .parse_default_env()
        .init();

    let explicit = config.session.is_some() || config.interactive;
    let mut renderer = PlainTextRenderer::with_color(config.use_color)
        .raw(config.raw)
        .extract(config.extract);
    match run(config, words, &mut renderer).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::NothingToDo) if !explicit => {
            log::info!("no session and no query; nothing to do");
            eprintln!("confab: no query given; see confab --help");
            ExitCode::SUCCESS
        }
        Err(err) => {
            renderer.print_error(&err.to_string());
            ExitCode::FAILURE
        }
    }
}
