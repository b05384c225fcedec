//! Configuration types for confab.
//!
//! This module provides CLI argument parsing via `arrrg` and the resolved configuration the
//! binary and the conversation controller run with.

use arrrg_derive::CommandLine;
use log::LevelFilter;

use crate::error::{Error, Result};
use crate::prompt::PromptTemplate;
use crate::store::DEFAULT_SESSION;

/// Model used when neither the command line nor a prompt config names one.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Sampling temperature used when none is given.
pub const DEFAULT_TEMPERATURE: f32 = 0.0;

const MAX_TEMPERATURE: f32 = 2.0;

/// Command-line arguments for confab.
///
/// Free arguments are the words of the query.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct Args {
    /// Session to use.
    #[arrrg(optional, "Session name (default: last)", "NAME")]
    pub session: Option<String>,

    /// Prompt config used to start a new session.
    #[arrrg(optional, "Prompt config name, or file containing a prompt", "NAME_OR_PATH")]
    pub prompt_config: Option<String>,

    /// Model to use.
    #[arrrg(optional, "Model to use (default: gpt-3.5-turbo)", "MODEL")]
    pub model: Option<String>,

    /// Sampling temperature.
    #[arrrg(optional, "Sampling temperature between 0 and 2 (default: 0)", "T")]
    pub temperature: Option<String>,

    /// API key.
    #[arrrg(optional, "API key; can also be set as OPENAI_API_KEY", "KEY")]
    pub openai_api_key: Option<String>,

    /// Endpoint of an OpenAI-compatible API.
    #[arrrg(optional, "Base URL of the API (default: https://api.openai.com/v1/)", "URL")]
    pub base_url: Option<String>,

    /// Continue the default session instead of starting over.
    #[arrrg(flag, "Continue the last conversation, or display it if no query is given")]
    pub last: bool,

    /// Keep reading queries after the first exchange.
    #[arrrg(flag, "Start an interactive chat session; continues the conversation")]
    pub interactive: bool,

    /// Stream the reply as it is generated.
    #[arrrg(flag, "Stream the response")]
    pub stream: bool,

    /// Show what would be sent and what it would cost, without sending it.
    #[arrrg(flag, "Display what would be sent, token counts and estimated costs")]
    pub tokens: bool,

    /// Print the last reply as plain text.
    #[arrrg(flag, "Print the last response as pure text")]
    pub raw: bool,

    /// Print only the JSON or code block in the last reply.
    #[arrrg(flag, "Extract JSON or a code block from the response if possible")]
    pub extract: bool,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,

    /// Log at debug level.
    #[arrrg(flag, "Print debug logging")]
    pub debug: bool,

    /// List sessions.
    #[arrrg(flag, "List sessions")]
    pub session_list: bool,

    /// Print the path of the session file.
    #[arrrg(flag, "Show the path of the session file")]
    pub session_path: bool,

    /// Print the session file.
    #[arrrg(flag, "Dump the session as YAML")]
    pub session_dump: bool,

    /// Delete the session.
    #[arrrg(flag, "Delete the session")]
    pub session_delete: bool,

    /// Rename the session.
    #[arrrg(optional, "Rename the session", "NEW")]
    pub session_rename: Option<String>,
}

/// The model parameters handed to the completion service.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whether to stream the reply.
    pub stream: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            stream: false,
        }
    }
}

/// A session-management operation that works on the store directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCommand {
    /// List all sessions.
    List,
    /// Print the session's file path.
    Path,
    /// Print the session file.
    Dump,
    /// Delete the session.
    Delete,
    /// Rename the session.
    Rename(String),
}

/// The resolved configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Session named on the command line, if any.
    pub session: Option<String>,
    /// Prompt config requested for a new session.
    pub prompt_config: Option<String>,
    /// Model given on the command line.
    pub model: Option<String>,
    /// Temperature given on the command line.
    pub temperature: Option<f32>,
    /// Whether to stream replies.
    pub stream: bool,
    /// API key given on the command line.
    pub api_key: Option<String>,
    /// Base URL of the API.
    pub base_url: Option<String>,
    /// Whether to continue the default session.
    pub last: bool,
    /// Whether to keep reading queries.
    pub interactive: bool,
    /// Whether to only report token estimates.
    pub tokens_only: bool,
    /// Whether to print the last reply only, unstyled.
    pub raw: bool,
    /// Whether to print only the JSON or code block of the last reply.
    pub extract: bool,
    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,
    /// Level for the logger.
    pub log_level: LevelFilter,
    /// Session-management operation, if one was requested.
    pub command: Option<SessionCommand>,
}

impl Config {
    /// Creates a new Config with default values.
    ///
    /// Defaults:
    /// - Session: the default session
    /// - Model: gpt-3.5-turbo, temperature 0, not streaming
    /// - Color: enabled
    /// - Log level: warn
    pub fn new() -> Self {
        Self {
            session: None,
            prompt_config: None,
            model: None,
            temperature: None,
            stream: false,
            api_key: None,
            base_url: None,
            last: false,
            interactive: false,
            tokens_only: false,
            raw: false,
            extract: false,
            use_color: true,
            log_level: LevelFilter::Warn,
            command: None,
        }
    }

    /// Sets the session.
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Sets the prompt config.
    pub fn with_prompt_config(mut self, prompt_config: impl Into<String>) -> Self {
        self.prompt_config = Some(prompt_config.into());
        self
    }

    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets whether replies are streamed.
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Sets whether the default session is continued.
    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    /// Sets whether only the payload of the last reply is printed.
    pub fn with_extract(mut self, extract: bool) -> Self {
        self.extract = extract;
        self
    }

    /// Sets interactive mode.
    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Sets tokens-only mode.
    pub fn with_tokens_only(mut self, tokens_only: bool) -> Self {
        self.tokens_only = tokens_only;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }

    /// Sets the log level.
    pub fn with_log_level(mut self, log_level: LevelFilter) -> Self {
        self.log_level = log_level;
        self
    }

    /// The session to work on.
    pub fn session_name(&self) -> &str {
        self.session.as_deref().unwrap_or(DEFAULT_SESSION)
    }

    /// Whether the run builds on the session's stored history.
    ///
    /// A run that names no session and asks for neither `--last`, `--interactive`, `--raw` nor
    /// `--extract` starts a new conversation in the default session.
    pub fn continues_session(&self) -> bool {
        self.session.is_some() || self.last || self.interactive || self.raw || self.extract
    }

    /// Whether debug output was requested.
    pub fn debug(&self) -> bool {
        self.log_level >= LevelFilter::Debug
    }

    /// The model parameters for a request.
    ///
    /// A prompt config's model and temperature replace the defaults, but values given on the
    /// command line take precedence over both.
    pub fn model_config(&self, template: Option<&PromptTemplate>) -> ModelConfig {
        let model = self
            .model
            .clone()
            .or_else(|| template.and_then(|t| t.model.clone()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let temperature = self
            .temperature
            .or_else(|| template.and_then(|t| t.temperature))
            .unwrap_or(DEFAULT_TEMPERATURE);
        ModelConfig {
            model,
            temperature,
            stream: self.stream,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_temperature(text: &str) -> Result<f32> {
    let temperature: f32 = text.trim().parse().map_err(|_| {
        Error::validation(
            format!("{text:?} is not a number"),
            Some("temperature".to_string()),
        )
    })?;
    if !(0.0..=MAX_TEMPERATURE).contains(&temperature) {
        return Err(Error::validation(
            format!("temperature must be between 0 and {MAX_TEMPERATURE}, got {temperature}"),
            Some("temperature".to_string()),
        ));
    }
    Ok(temperature)
}

impl TryFrom<Args> for Config {
    type Error = Error;

    fn try_from(args: Args) -> Result<Self> {
        let temperature = args.temperature.as_deref().map(parse_temperature).transpose()?;
        let command = if args.session_list {
            Some(SessionCommand::List)
        } else if args.session_path {
            Some(SessionCommand::Path)
        } else if args.session_dump {
            Some(SessionCommand::Dump)
        } else if args.session_delete {
            Some(SessionCommand::Delete)
        } else {
            args.session_rename.map(SessionCommand::Rename)
        };
        Ok(Config {
            session: args.session,
            prompt_config: args.prompt_config,
            model: args.model,
            temperature,
            stream: args.stream,
            api_key: args.openai_api_key,
            base_url: args.base_url,
            last: args.last,
            interactive: args.interactive,
            tokens_only: args.tokens,
            raw: args.raw,
            extract: args.extract,
            use_color: !args.no_color && !args.raw && !args.extract,
            log_level: if args.debug {
                LevelFilter::Debug
            } else {
                LevelFilter::Warn
            },
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::new();
        assert_eq!(config.session_name(), DEFAULT_SESSION);
        assert_eq!(config.model_config(None), ModelConfig::default());
        assert!(config.use_color);
        assert!(!config.debug());
        assert!(config.command.is_none());
    }

    #[test]
    fn config_from_args_custom() {
        let args = Args {
            session: Some("work".to_string()),
            model: Some("gpt-4".to_string()),
            temperature: Some("0.7".to_string()),
            stream: true,
            no_color: true,
            debug: true,
            ..Args::default()
        };
        let config = Config::try_from(args).unwrap();
        assert_eq!(config.session_name(), "work");
        assert_eq!(
            config.model_config(None),
            ModelConfig {
                model: "gpt-4".to_string(),
                temperature: 0.7,
                stream: true,
            }
        );
        assert!(!config.use_color);
        assert!(config.debug());
    }

    #[test]
    fn temperature_out_of_range() {
        let args = Args {
            temperature: Some("3".to_string()),
            ..Args::default()
        };
        assert!(matches!(
            Config::try_from(args),
            Err(Error::Validation { .. })
        ));
        let args = Args {
            temperature: Some("warm".to_string()),
            ..Args::default()
        };
        assert!(Config::try_from(args).is_err());
    }

    #[test]
    fn session_commands() {
        let args = Args {
            session_rename: Some("new".to_string()),
            ..Args::default()
        };
        let config = Config::try_from(args).unwrap();
        assert_eq!(config.command, Some(SessionCommand::Rename("new".to_string())));

        let args = Args {
            session_list: true,
            ..Args::default()
        };
        assert_eq!(
            Config::try_from(args).unwrap().command,
            Some(SessionCommand::List)
        );
    }

    #[test]
    fn plain_query_starts_over() {
        assert!(!Config::new().continues_session());
        assert!(!Config::new().with_prompt_config("p").continues_session());
        assert!(Config::new().with_last(true).continues_session());
        assert!(Config::new().with_session("work").continues_session());
        assert!(Config::new().with_interactive(true).continues_session());
        assert!(Config::new().with_extract(true).continues_session());

        let args = Args {
            raw: true,
            ..Args::default()
        };
        let config = Config::try_from(args).unwrap();
        assert!(config.continues_session());
        assert!(!config.use_color);
    }

    #[test]
    fn template_overrides_defaults_but_not_arguments() {
        let template = PromptTemplate {
            system: "x".to_string(),
            model: Some("gpt-4".to_string()),
            temperature: Some(0.5),
        };
        let config = Config::new();
        let model = config.model_config(Some(&template));
        assert_eq!(model.model, "gpt-4");
        assert_eq!(model.temperature, 0.5);

        let config = Config::new().with_model("gpt-4-1106-preview").with_temperature(0.1);
        let model = config.model_config(Some(&template));
        assert_eq!(model.model, "gpt-4-1106-preview");
        assert_eq!(model.temperature, 0.1);
    }

    #[test]
    fn config_builder_pattern() {
        let config = Config::new()
            .with_session("s")
            .with_prompt_config("p")
            .with_stream(true)
            .with_interactive(true)
            .with_tokens_only(true)
            .without_color()
            .with_log_level(LevelFilter::Debug);
        assert_eq!(config.session.as_deref(), Some("s"));
        assert_eq!(config.prompt_config.as_deref(), Some("p"));
        assert!(config.stream && config.interactive && config.tokens_only);
        assert!(!config.use_color);
        assert!(config.debug());
    }
}
