use super::config::{LogFormat, LogLevel};
use super::initialization::{FilterEntry, InitializationError};
use parking_lot::{Mutex, RwLock};
use std::sync::Once;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Transport crates that are quieted to `warn` by default.
const NOISY_TARGETS: &[&str] = &["hyper", "h2", "tower", "tonic", "axum"];

pub struct LoggingSystem {
    directives: RwLock<Vec<Directive>>,
    fallback_level: LogLevel,
}

impl LoggingSystem {
    pub fn new() -> Self {
        Self {
            directives: RwLock::new(Vec::new()),
            fallback_level: LogLevel::Info,
        }
    }

    /// Add one filter directive. A bad level keeps the target at the fallback
    /// level and an unparseable entry is skipped; neither is fatal.
    pub fn add_directive(&self, entry: &str) -> FilterEntry {
        let resolved = FilterEntry::resolve(entry, self.fallback_level);
        match &resolved {
            FilterEntry::Exact(directive) => self.directives.write().push(directive.clone()),
            FilterEntry::Fallback { directive, reason } => {
                eprintln!("Warning: {reason} in '{}', using {directive}", entry.trim());
                self.directives.write().push(directive.clone());
            }
            FilterEntry::Rejected { entry } => {
                eprintln!("Warning: skipping malformed log directive '{entry}'");
            }
        }
        resolved
    }

    /// Add every entry of a comma-separated `RUST_LOG` style list.
    pub fn add_directives_from(&self, list: &str) {
        for entry in list.split(',').filter(|entry| !entry.trim().is_empty()) {
            self.add_directive(entry);
        }
    }

    pub fn add_default_directives(&self) {
        for target in NOISY_TARGETS {
            self.add_directive(&format!("{target}=warn"));
        }
    }

    /// Build the filter: the default level first, then directives in the
    /// order they were added so later ones override earlier ones.
    pub fn build_env_filter(&self, default_level: LogLevel) -> EnvFilter {
        self.directives
            .read()
            .iter()
            .cloned()
            .fold(EnvFilter::new(default_level.as_str()), EnvFilter::add_directive)
    }

    /// Install the global subscriber. `RUST_LOG` entries, when set, are
    /// added after the built-in directives.
    pub fn initialize_tracing(
        &self,
        default_level: LogLevel,
        format: LogFormat,
    ) -> Result<(), InitializationError> {
        if let Ok(extra) = std::env::var("RUST_LOG") {
            self.add_directives_from(&extra);
        }
        let env_filter = self.build_env_filter(default_level);

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_current_span(true)
                        .with_target(true),
                )
                .try_init(),
            LogFormat::Compact => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(true).compact())
                .try_init(),
        };

        result.map_err(|e| InitializationError::LoggingInitFailed {
            details: "Failed to set global tracing subscriber".to_string(),
            source: Box::new(e),
        })
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Set up process logging once. Later calls report the outcome of the first.
pub fn setup_logging(level: LogLevel, format: LogFormat) -> Result<(), InitializationError> {
    static INIT: Once = Once::new();
    static INIT_FAILURE: Mutex<Option<String>> = Mutex::new(None);

    INIT.call_once(|| {
        let logging_system = LoggingSystem::new();
        logging_system.add_default_directives();
        if let Err(e) = logging_system.initialize_tracing(level, format) {
            *INIT_FAILURE.lock() = Some(e.to_string());
        }
    });

    match INIT_FAILURE.lock().as_ref() {
        None => Ok(()),
        Some(details) => Err(InitializationError::LoggingInitFailed {
            details: details.clone(),
            source: Box::new(std::io::Error::other("logging was not initialized")),
        }),
    }
}
