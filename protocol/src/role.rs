use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The functional identity a process instance adopts for its lifetime.
///
/// Every role except [`ProcessRole::Main`] is selected with `--type=<token>`;
/// `Main` is what a process is when no `--type` flag is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProcessRole {
    #[serde(rename = "main")]
    Main,
    #[serde(rename = "renderer")]
    Renderer,
    #[serde(rename = "gpu-process")]
    GpuProcess,
    #[serde(rename = "utility")]
    UtilityProcess,
    #[serde(rename = "zygote")]
    ZygoteProcess,
}

impl ProcessRole {
    pub const ALL: [ProcessRole; 5] = [
        ProcessRole::Main,
        ProcessRole::Renderer,
        ProcessRole::GpuProcess,
        ProcessRole::UtilityProcess,
        ProcessRole::ZygoteProcess,
    ];

    /// Resolves the value of a `--type=` flag. `Main` has no type token, so
    /// it is never returned here.
    pub fn from_type_flag(value: &str) -> Option<Self> {
        match value {
            "renderer" => Some(ProcessRole::Renderer),
            "gpu-process" => Some(ProcessRole::GpuProcess),
            "utility" => Some(ProcessRole::UtilityProcess),
            "zygote" => Some(ProcessRole::ZygoteProcess),
            _ => None,
        }
    }

    /// The `--type=` token a parent passes to launch a child in this role.
    pub fn type_flag(self) -> Option<&'static str> {
        match self {
            ProcessRole::Main => None,
            ProcessRole::Renderer => Some("renderer"),
            ProcessRole::GpuProcess => Some("gpu-process"),
            ProcessRole::UtilityProcess => Some("utility"),
            ProcessRole::ZygoteProcess => Some("zygote"),
        }
    }

    /// Whether the role runs under a sandbox profile and talks to a parent.
    pub fn is_child(self) -> bool {
        !matches!(self, ProcessRole::Main)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_flag().unwrap_or("main"))
    }
}
