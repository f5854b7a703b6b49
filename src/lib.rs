// Toolpilot - An adaptive tool selection engine driven by tabular Q-learning
// Learns which tool fits which request from completed executions

pub mod config;
pub mod engine;
pub mod error;
pub mod reinforcement;
pub mod sql;
pub mod types;

use error::PilotResult;
use tracing::info;

pub use config::{RlConfig, UpdateMode};
pub use engine::{LearningStats, RlEngine};
pub use error::{PilotError, PilotResult as Result};
pub use sql::DbConnection;
pub use types::{
    Episode, ExecutionRecord, InMemoryStats, SessionOutcome, StatsProvider, ToolRecommendation,
    ToolStats,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Initialize the engine's logging with default settings
/// This method is kept for embedders that do not configure tracing themselves
pub fn init() -> PilotResult<()> {
    // Default to colored output for CLI usage
    init_with_logger(true)
}

/// Initialize the engine's logging with custom configuration
///
/// @param ansi_colors - Whether to enable ANSI color codes in logs
/// When embedded behind a machine-readable protocol, this should be false
pub fn init_with_logger(ansi_colors: bool) -> PilotResult<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    if !ansi_colors {
        // Minimal configuration that cannot interfere with a protocol stream
        fmt::Subscriber::builder()
            .with_ansi(false)
            .with_writer(std::io::stderr) // Write logs to stderr instead of stdout
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .without_time()
            .init();

        info!(
            "Initializing toolpilot v{} (minimal log format)",
            version()
        );
    } else {
        // Default configuration for CLI usage
        fmt::Subscriber::builder()
            .with_ansi(true)
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(true)
            .init();

        info!("Initializing toolpilot v{}", version());
    }

    Ok(())
}
