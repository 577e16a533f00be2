use serde::Deserialize;
use serde::Serialize;

/// Normal exit, including an exit requested by the parent.
pub const EXIT_OK: i32 = 0;
/// The command line could not be resolved to exactly one role.
pub const EXIT_CLASSIFICATION_ERROR: i32 = 20;
/// The sandbox profile for the role could not be applied.
pub const EXIT_SANDBOX_ERROR: i32 = 21;
/// The parent channel could not be opened or the handshake failed.
pub const EXIT_CHANNEL_ERROR: i32 = 22;
/// The role's run loop faulted (returned an error or panicked).
pub const EXIT_RUNTIME_FAULT: i32 = 23;
/// The parent process or its channel went away while running.
pub const EXIT_PARENT_LOST: i32 = 24;
/// Configuration could not be loaded or the async runtime failed to start.
pub const EXIT_STARTUP_ERROR: i32 = 25;

/// Reserved non-zero exit categories. The numeric values are part of the
/// contract with the parent process and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCategory {
    Classification,
    Sandbox,
    Channel,
    RuntimeFault,
    ParentLost,
    Startup,
}

impl ExitCategory {
    pub const fn code(self) -> i32 {
        match self {
            ExitCategory::Classification => EXIT_CLASSIFICATION_ERROR,
            ExitCategory::Sandbox => EXIT_SANDBOX_ERROR,
            ExitCategory::Channel => EXIT_CHANNEL_ERROR,
            ExitCategory::RuntimeFault => EXIT_RUNTIME_FAULT,
            ExitCategory::ParentLost => EXIT_PARENT_LOST,
            ExitCategory::Startup => EXIT_STARTUP_ERROR,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            EXIT_CLASSIFICATION_ERROR => Some(ExitCategory::Classification),
            EXIT_SANDBOX_ERROR => Some(ExitCategory::Sandbox),
            EXIT_CHANNEL_ERROR => Some(ExitCategory::Channel),
            EXIT_RUNTIME_FAULT => Some(ExitCategory::RuntimeFault),
            EXIT_PARENT_LOST => Some(ExitCategory::ParentLost),
            EXIT_STARTUP_ERROR => Some(ExitCategory::Startup),
            _ => None,
        }
    }

    /// Whether spawning a fresh process for the same role can be expected to
    /// succeed. Classification, sandbox and startup failures come from the
    /// command line or the host environment and would fail again.
    pub fn should_respawn(self) -> bool {
        matches!(self, ExitCategory::Channel | ExitCategory::RuntimeFault)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The run loop finished on its own.
    Completed,
    /// The parent (or a termination signal) asked the process to stop.
    ShutdownRequested,
    /// The process stopped because of a fault.
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashPayload {
    pub category: ExitCategory,
    pub reason: String,
    /// Set when the fault is a known, anticipated way to stop, such as the
    /// parent disappearing, rather than a bug.
    pub expected: bool,
}

/// Terminal state of one process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub code: i32,
    pub termination: Termination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash: Option<CrashPayload>,
}

impl ExitReport {
    pub fn clean(termination: Termination) -> Self {
        Self {
            code: EXIT_OK,
            termination,
            crash: None,
        }
    }

    pub fn fault(category: ExitCategory, reason: impl Into<String>, expected: bool) -> Self {
        Self {
            code: category.code(),
            termination: Termination::Fault,
            crash: Some(CrashPayload {
                category,
                reason: reason.into(),
                expected,
            }),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code == EXIT_OK
    }

    pub fn category(&self) -> Option<ExitCategory> {
        self.crash.as_ref().map(|crash| crash.category)
    }
}
