use super::config::LogLevel;
use thiserror::Error;
use tracing_subscriber::filter::Directive;

const LEVEL_NAMES: &str = "error, warn, info, debug, trace";

#[derive(Error, Debug)]
pub enum InitializationError {
    #[error("Unknown log level '{0}' (expected one of: {LEVEL_NAMES})")]
    UnknownLevel(String),

    #[error("Logging system initialization failed: {details}")]
    LoggingInitFailed {
        details: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Parse a level name, accepting `warning` as an alias.
pub fn parse_level(input: &str) -> Result<LogLevel, InitializationError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "error" => Ok(LogLevel::Error),
        "warn" | "warning" => Ok(LogLevel::Warn),
        "info" => Ok(LogLevel::Info),
        "debug" => Ok(LogLevel::Debug),
        "trace" => Ok(LogLevel::Trace),
        _ => Err(InitializationError::UnknownLevel(input.trim().to_string())),
    }
}

/// How one filter entry ended up in the subscriber's filter.
#[derive(Debug)]
pub enum FilterEntry {
    /// Accepted as written.
    Exact(Directive),
    /// The target was kept but its level was unusable.
    Fallback {
        directive: Directive,
        reason: InitializationError,
    },
    /// Nothing salvageable; the entry is dropped.
    Rejected { entry: String },
}

impl FilterEntry {
    /// Resolve one comma-separated filter entry. Anything `EnvFilter` accepts
    /// is kept verbatim; a `target=level` pair with a bad level keeps the
    /// target at `fallback`.
    pub fn resolve(entry: &str, fallback: LogLevel) -> Self {
        let entry = entry.trim();
        if let Ok(directive) = entry.parse::<Directive>() {
            return FilterEntry::Exact(directive);
        }

        let rejected = || FilterEntry::Rejected {
            entry: entry.to_string(),
        };
        let Some((target, level)) = entry.split_once('=') else {
            return rejected();
        };
        let target = target.trim();
        if target.is_empty() || level.contains('=') {
            return rejected();
        }

        match parse_level(level) {
            Ok(level) => match format!("{target}={}", level.as_str()).parse() {
                Ok(directive) => FilterEntry::Exact(directive),
                Err(_) => rejected(),
            },
            Err(reason) => match format!("{target}={}", fallback.as_str()).parse() {
                Ok(directive) => FilterEntry::Fallback { directive, reason },
                Err(_) => rejected(),
            },
        }
    }

    pub fn directive(&self) -> Option<&Directive> {
        match self {
            FilterEntry::Exact(directive) | FilterEntry::Fallback { directive, .. } => {
                Some(directive)
            }
            FilterEntry::Rejected { .. } => None,
        }
    }
}
