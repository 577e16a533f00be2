//! Types shared by every stage of the subprocess bootstrap: the role a
//! process was launched as, the read-only environment it started with, the
//! exit codes its parent depends on, and the frames exchanged on the parent
//! channel.

mod descriptor;
mod env;
mod exit;
mod role;
pub mod wire;

pub use descriptor::ChannelId;
pub use descriptor::FeatureFlags;
pub use descriptor::InvalidChannelId;
pub use descriptor::RoleDescriptor;
pub use env::EnvSnapshot;
pub use exit::CrashPayload;
pub use exit::EXIT_CHANNEL_ERROR;
pub use exit::EXIT_CLASSIFICATION_ERROR;
pub use exit::EXIT_OK;
pub use exit::EXIT_PARENT_LOST;
pub use exit::EXIT_RUNTIME_FAULT;
pub use exit::EXIT_SANDBOX_ERROR;
pub use exit::EXIT_STARTUP_ERROR;
pub use exit::ExitCategory;
pub use exit::ExitReport;
pub use exit::Termination;
pub use role::ProcessRole;
