use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chassis_ipc::ChannelHandle;
use chassis_ipc::ChildHost;
use chassis_protocol::ExitCategory;
use chassis_protocol::ProcessRole;
use chassis_protocol::RoleDescriptor;
use tokio_util::sync::CancellationToken;

use crate::DispatchState;

/// Everything a run loop is handed when it starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    descriptor: Arc<RoleDescriptor>,
    channel: Option<ChannelHandle>,
    host: Option<Arc<ChildHost>>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        descriptor: Arc<RoleDescriptor>,
        channel: Option<ChannelHandle>,
        host: Option<Arc<ChildHost>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            channel,
            host,
            cancel,
        }
    }

    pub fn descriptor(&self) -> &RoleDescriptor {
        &self.descriptor
    }

    pub fn role(&self) -> ProcessRole {
        self.descriptor.role()
    }

    /// The parent channel; `None` for the main process.
    pub fn channel(&self) -> Option<&ChannelHandle> {
        self.channel.as_ref()
    }

    /// Spawns children; only the main process has one.
    pub fn host(&self) -> Option<&Arc<ChildHost>> {
        self.host.as_ref()
    }

    /// Cancelled when the run loop should stop.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The role's work is done.
    Completed,
    /// The loop stopped because its cancellation token fired.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeFault {
    #[error("run loop failed: {0}")]
    Failed(String),

    #[error("run loop panicked: {0}")]
    Panicked(String),

    #[error("host process {pid} exited")]
    ParentExited { pid: u32 },

    #[error("parent channel closed unexpectedly")]
    ChannelLost,

    #[error("no run loop registered for the {0} role")]
    NoRunLoop(ProcessRole),

    #[error("invalid dispatcher transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: DispatchState,
        to: DispatchState,
    },
}

impl RuntimeFault {
    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }

    pub fn category(&self) -> ExitCategory {
        match self {
            RuntimeFault::ParentExited { .. } | RuntimeFault::ChannelLost => {
                ExitCategory::ParentLost
            }
            RuntimeFault::Failed(_)
            | RuntimeFault::Panicked(_)
            | RuntimeFault::NoRunLoop(_)
            | RuntimeFault::InvalidTransition { .. } => ExitCategory::RuntimeFault,
        }
    }

    /// Losing the parent is a normal way for a child to end; the rest are bugs.
    pub fn is_expected(&self) -> bool {
        self.category() == ExitCategory::ParentLost
    }
}

/// The role-specific work of a process. The dispatcher knows nothing else
/// about what a role does.
#[async_trait]
pub trait RunLoop: Send + Sync {
    async fn run(&self, ctx: RunContext) -> Result<RunOutcome, RuntimeFault>;
}

#[derive(Clone, Default)]
pub struct RunLoopRegistry {
    loops: HashMap<ProcessRole, Arc<dyn RunLoop>>,
}

impl RunLoopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<R>(mut self, role: ProcessRole, run_loop: R) -> Self
    where
        R: RunLoop + 'static,
    {
        self.loops.insert(role, Arc::new(run_loop));
        self
    }

    pub fn register_shared(mut self, role: ProcessRole, run_loop: Arc<dyn RunLoop>) -> Self {
        self.loops.insert(role, run_loop);
        self
    }

    pub fn get(&self, role: ProcessRole) -> Option<Arc<dyn RunLoop>> {
        self.loops.get(&role).cloned()
    }
}

impl fmt::Debug for RunLoopRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut roles: Vec<_> = self.loops.keys().collect();
        roles.sort();
        f.debug_struct("RunLoopRegistry")
            .field("roles", &roles)
            .finish()
    }
}
