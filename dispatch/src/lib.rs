//! Runs a role's run loop and walks the process through
//! `Initializing -> Running -> Draining -> Terminated`, producing exactly one
//! exit report on the way out.
#![cfg(unix)]

mod dispatcher;
mod parent_watch;
mod reporter;
mod run_loop;
mod state;

pub use dispatcher::DispatchResult;
pub use dispatcher::DispatchTiming;
pub use dispatcher::Dispatcher;
pub use parent_watch::ParentWatcher;
pub use parent_watch::process_alive;
pub use reporter::ExitCause;
pub use reporter::ExitReporter;
pub use reporter::FaultInfo;
pub use run_loop::RunContext;
pub use run_loop::RunLoop;
pub use run_loop::RunLoopRegistry;
pub use run_loop::RunOutcome;
pub use run_loop::RuntimeFault;
pub use state::DispatchState;
pub use state::StateMachine;
