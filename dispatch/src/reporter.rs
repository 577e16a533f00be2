use chassis_protocol::ExitCategory;
use chassis_protocol::ExitReport;
use chassis_protocol::ProcessRole;
use chassis_protocol::RoleDescriptor;
use chassis_protocol::Termination;

use crate::DispatchState;
use crate::RuntimeFault;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultInfo {
    pub category: ExitCategory,
    pub reason: String,
    pub expected: bool,
}

impl FaultInfo {
    pub fn new(category: ExitCategory, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
            expected: false,
        }
    }
}

impl From<&RuntimeFault> for FaultInfo {
    fn from(fault: &RuntimeFault) -> Self {
        Self {
            category: fault.category(),
            reason: fault.to_string(),
            expected: fault.is_expected(),
        }
    }
}

/// Why the process is exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    Completed,
    ShutdownRequested,
    Fault(FaultInfo),
}

/// Produces the single [`ExitReport`] of this process. `report` takes the
/// reporter by value, so a second report cannot be produced.
#[derive(Debug)]
pub struct ExitReporter {
    role: ProcessRole,
    index: u32,
}

impl ExitReporter {
    pub fn new(descriptor: &RoleDescriptor) -> Self {
        Self {
            role: descriptor.role(),
            index: descriptor.index(),
        }
    }

    /// For failures before a role is known.
    pub fn unclassified() -> Self {
        Self {
            role: ProcessRole::Main,
            index: 0,
        }
    }

    pub fn report(self, state: DispatchState, cause: ExitCause) -> ExitReport {
        let Self { role, index } = self;
        let report = match cause {
            ExitCause::Completed => ExitReport::clean(Termination::Completed),
            ExitCause::ShutdownRequested => ExitReport::clean(Termination::ShutdownRequested),
            ExitCause::Fault(fault) => {
                ExitReport::fault(fault.category, fault.reason, fault.expected)
            }
        };

        match &report.crash {
            None => tracing::info!(%role, index, ?state, termination = ?report.termination, "exiting"),
            Some(crash) if crash.expected => tracing::warn!(
                %role, index, ?state, code = report.code, "exiting: {}", crash.reason
            ),
            Some(crash) => tracing::error!(
                %role, index, ?state, code = report.code, "exiting: {}", crash.reason
            ),
        }
        report
    }
}
