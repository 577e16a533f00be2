//! Stand-in run loops for the `chassis-subprocess` binary.
//!
//! Every child role gets an [`EchoRunLoop`]; the main process gets a
//! [`BrowserRunLoop`] that launches and supervises the children named by
//! `--spawn`.
#![cfg(unix)]

mod browser;
mod echo;

use chassis_dispatch::RunLoopRegistry;
use chassis_protocol::ProcessRole;

pub use browser::BrowserRunLoop;
pub use browser::DEFAULT_MAX_RESPAWNS;
pub use browser::MAX_RESPAWNS_FLAG;
pub use browser::SPAWN_FLAG;
pub use echo::EchoRunLoop;
pub use echo::FAIL_RUN_LOOP_FLAG;
pub use echo::PANIC_RUN_LOOP_FLAG;

/// Run loops for every role this executable can be launched as.
pub fn default_registry() -> RunLoopRegistry {
    ProcessRole::ALL
        .into_iter()
        .filter(|role| role.is_child())
        .fold(
            RunLoopRegistry::new().register(ProcessRole::Main, BrowserRunLoop),
            |registry, role| registry.register(role, EchoRunLoop),
        )
}
