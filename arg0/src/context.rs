use std::ffi::OsString;

use chassis_protocol::EnvSnapshot;

/// The inputs a process starts from, captured once and passed down
/// explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessContext {
    argv: Vec<OsString>,
    env: EnvSnapshot,
}

impl ProcessContext {
    pub fn new(argv: Vec<OsString>, env: EnvSnapshot) -> Self {
        Self { argv, env }
    }

    /// Captures this process's command line and environment.
    pub fn from_os() -> Self {
        Self::new(std::env::args_os().collect(), EnvSnapshot::capture())
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub fn env(&self) -> &EnvSnapshot {
        &self.env
    }
}

/// Bootstrap stages in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Classify,
    Sandbox,
    Config,
    Runtime,
    Channel,
    Dispatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Ok,
    Failed,
}

/// The stages a process went through, in the order they finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageTrace(Vec<(Stage, StageStatus)>);

impl StageTrace {
    pub(crate) fn record(&mut self, stage: Stage, status: StageStatus) {
        tracing::debug!(?stage, ?status, "bootstrap stage finished");
        self.0.push((stage, status));
    }

    pub fn entries(&self) -> &[(Stage, StageStatus)] {
        &self.0
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.0.iter().map(|(stage, _)| *stage).collect()
    }

    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.0
            .iter()
            .find(|(recorded, _)| *recorded == stage)
            .map(|(_, status)| *status)
    }
}
