//! Process bootstrap: decides what this process is from its command line
//! and carries it through sandboxing, channel setup and dispatch.

mod classify;
mod context;
#[cfg(unix)]
mod pipeline;

pub use classify::ClassificationError;
pub use classify::FEATURES_ENV_VAR;
pub use classify::classify;
pub use context::ProcessContext;
pub use context::Stage;
pub use context::StageStatus;
pub use context::StageTrace;
#[cfg(unix)]
pub use pipeline::ProcessOutcome;
#[cfg(unix)]
pub use pipeline::handle_app_start;
#[cfg(unix)]
pub use pipeline::run_process;
