//! Console and optional rolling file logging.
use std::path::PathBuf;

use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, layer::SubscriberExt};

/// Filters console output.
pub const CONSOLE_LOG_ENV: &str = "CERTDEPOT_LOG";

/// Filters file output.
pub const FILE_LOG_ENV: &str = "CERTDEPOT_FILE_LOG";

/// Enables JSON file logs in the given directory, rotated hourly.
pub const FILE_LOG_DIRECTORY_ENV: &str = "CERTDEPOT_LOG_DIRECTORY";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// Where and how verbosely to log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingSettings {
    pub default_level: LevelFilter,
    pub file_log_dir: Option<PathBuf>,
}

impl LoggingSettings {
    pub fn from_env() -> Self {
        Self {
            default_level: LevelFilter::INFO,
            file_log_dir: std::env::var_os(FILE_LOG_DIRECTORY_ENV).map(PathBuf::from),
        }
    }

    /// Installs the subscribers. File logs are flushed when the returned
    /// guard is dropped, so keep it alive for the whole run.
    pub fn init(&self) -> Result<Option<WorkerGuard>> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Sync + Send>> = Vec::new();
        let mut guard = None;

        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter_builder(CONSOLE_LOG_ENV, self.default_level))
                .boxed(),
        );

        if let Some(file_log_dir) = &self.file_log_dir {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::HOURLY)
                .filename_prefix("certdepot")
                .filename_suffix("tracing-rs.json")
                .build(file_log_dir)
                .context(InitRollingFileAppenderSnafu)?;
            let (writer, worker_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(worker_guard);

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(env_filter_builder(FILE_LOG_ENV, self.default_level))
                    .boxed(),
            );
        }

        tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
            .context(SetGlobalDefaultSubscriberSnafu)?;

        Ok(guard)
    }
}

fn env_filter_builder(env_var: &str, default_directive: impl Into<Directive>) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(env_var)
        .with_default_directive(default_directive.into())
        .from_env_lossy()
}
