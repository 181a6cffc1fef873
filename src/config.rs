//! Configuration for the bot.
//!
//! Built once at startup from the environment (after loading `.env`) and then
//! passed by reference into the generator and engine constructors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::platform::RepoRef;

/// Full bot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub github: GitHubConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub generator: GeneratorConfig,
    pub history: HistoryConfig,
}

/// Code-hosting platform settings.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: SecretString,
    pub api_url: String,
    /// Login of the account the bot acts as.
    pub login: String,
}

/// Model service settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// How many times a throttled request is replayed before the 429 is returned.
    pub rate_limit_retries: u32,
}

/// Agent engine settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_turns: usize,
    pub branch_prefix: String,
    /// Remote validation; `None` disables the validation tool.
    pub validation: Option<ValidationConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 40,
            branch_prefix: "issuebot".to_string(),
            validation: None,
        }
    }
}

/// Remote validation pipeline settings.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Workflow file name or id, e.g. `ci.yml`.
    pub workflow: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl ValidationConfig {
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            poll_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Task generator settings.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub poll_interval: Duration,
    /// If non-empty, only these repositories are considered.
    pub repos: Vec<RepoRef>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            repos: Vec::new(),
        }
    }
}

/// Conversation history persistence settings.
#[derive(Debug, Clone, Default)]
pub struct HistoryConfig {
    /// Directory for saved transcripts; `None` disables the store.
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Build configuration from environment variables.
    ///
    /// Call `dotenvy::dotenv()` first if a `.env` file should be honoured.
    pub fn from_env() -> Result<Self, ConfigError> {
        let github = GitHubConfig {
            token: SecretString::from(required("GITHUB_TOKEN")?),
            api_url: optional("ISSUEBOT_GITHUB_API_URL")
                .unwrap_or_else(|| "https://api.github.com".to_string()),
            login: required("ISSUEBOT_LOGIN")?,
        };

        let llm = LlmConfig {
            api_key: SecretString::from(required("ANTHROPIC_API_KEY")?),
            base_url: optional("ISSUEBOT_LLM_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            model: optional("ISSUEBOT_MODEL")
                .unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            max_tokens: parse_or("ISSUEBOT_MAX_TOKENS", 8192)?,
            rate_limit_retries: parse_or("ISSUEBOT_RATE_LIMIT_RETRIES", 5)?,
        };

        let validation = match optional("ISSUEBOT_VALIDATION_WORKFLOW") {
            Some(workflow) => Some(ValidationConfig {
                workflow,
                poll_interval: Duration::from_secs(parse_or(
                    "ISSUEBOT_VALIDATION_POLL_SECS",
                    15,
                )?),
                timeout: Duration::from_secs(parse_or(
                    "ISSUEBOT_VALIDATION_TIMEOUT_SECS",
                    30 * 60,
                )?),
            }),
            None => None,
        };

        let defaults = AgentConfig::default();
        let agent = AgentConfig {
            max_turns: parse_or("ISSUEBOT_MAX_TURNS", defaults.max_turns)?,
            branch_prefix: optional("ISSUEBOT_BRANCH_PREFIX").unwrap_or(defaults.branch_prefix),
            validation,
        };

        let generator = GeneratorConfig {
            poll_interval: Duration::from_secs(parse_or("ISSUEBOT_POLL_INTERVAL_SECS", 60)?),
            repos: match optional("ISSUEBOT_REPOS") {
                Some(raw) => parse_repo_list(&raw)?,
                None => Vec::new(),
            },
        };

        let history = HistoryConfig {
            dir: optional("ISSUEBOT_HISTORY_DIR").map(PathBuf::from),
        };

        let config = Self {
            github,
            llm,
            agent,
            generator,
            history,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides, then re-check the whole config.
    pub fn apply_overrides(
        &mut self,
        poll_interval: Option<Duration>,
        history_dir: Option<PathBuf>,
    ) -> Result<(), ConfigError> {
        if let Some(interval) = poll_interval {
            self.generator.poll_interval = interval;
        }
        if history_dir.is_some() {
            self.history.dir = history_dir;
        }
        self.validate()
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.github.login.trim().is_empty() {
            return Err(invalid("ISSUEBOT_LOGIN", "must not be empty"));
        }
        if self.agent.max_turns == 0 {
            return Err(invalid("ISSUEBOT_MAX_TURNS", "must be at least 1"));
        }
        if self.agent.branch_prefix.is_empty() || self.agent.branch_prefix.ends_with('/') {
            return Err(invalid(
                "ISSUEBOT_BRANCH_PREFIX",
                "must be non-empty and must not end with '/'",
            ));
        }
        if self.generator.poll_interval.is_zero() {
            return Err(invalid("ISSUEBOT_POLL_INTERVAL_SECS", "must be positive"));
        }
        if let Some(v) = &self.agent.validation {
            if v.poll_interval.is_zero() {
                return Err(invalid("ISSUEBOT_VALIDATION_POLL_SECS", "must be positive"));
            }
        }
        Ok(())
    }
}

/// Parse a comma-separated `owner/name` list.
pub fn parse_repo_list(raw: &str) -> Result<Vec<RepoRef>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            RepoRef::from_str(s).map_err(|message| ConfigError::InvalidValue {
                key: "ISSUEBOT_REPOS".to_string(),
                message,
            })
        })
        .collect()
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &str) -> Result<String, ConfigError> {
    optional(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &e.to_string())),
        None => Ok(default),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
