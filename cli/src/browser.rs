use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chassis_config::ChassisConfig;
use chassis_dispatch::RunContext;
use chassis_dispatch::RunLoop;
use chassis_dispatch::RunOutcome;
use chassis_dispatch::RuntimeFault;
use chassis_ipc::ChannelError;
use chassis_ipc::ChildExit;
use chassis_ipc::ChildHost;
use chassis_ipc::ChildProcess;
use chassis_protocol::FeatureFlags;
use chassis_protocol::ProcessRole;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Comma-separated `--type` tokens of the children to launch.
pub const SPAWN_FLAG: &str = "spawn";
/// How often one child may be restarted after a crash.
pub const MAX_RESPAWNS_FLAG: &str = "max-respawns";
pub const DEFAULT_MAX_RESPAWNS: u32 = 3;

/// The main process's loop: launches one child per `--spawn` entry and
/// restarts crashed children until they run out of respawns.
///
/// Completes once every child has exited cleanly. Flags other than its own
/// are passed through to the children.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserRunLoop;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LaunchPlan {
    roles: Vec<ProcessRole>,
    max_respawns: u32,
    child_flags: FeatureFlags,
}

impl LaunchPlan {
    fn from_flags(flags: &FeatureFlags) -> Result<Self, RuntimeFault> {
        let roles = flags
            .get(SPAWN_FLAG)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                ProcessRole::from_type_flag(token).ok_or_else(|| {
                    RuntimeFault::failed(format!("cannot spawn unknown process type `{token}`"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let max_respawns = match flags.get(MAX_RESPAWNS_FLAG) {
            Some(value) => value.parse().map_err(|_| {
                RuntimeFault::failed(format!("--{MAX_RESPAWNS_FLAG}={value} is not a number"))
            })?,
            None => DEFAULT_MAX_RESPAWNS,
        };
        let child_flags = flags
            .iter()
            .filter(|(name, _)| ![SPAWN_FLAG, MAX_RESPAWNS_FLAG].contains(name))
            .collect();
        Ok(Self {
            roles,
            max_respawns,
            child_flags,
        })
    }
}

#[async_trait]
impl RunLoop for BrowserRunLoop {
    async fn run(&self, ctx: RunContext) -> Result<RunOutcome, RuntimeFault> {
        let host = ctx
            .host()
            .cloned()
            .ok_or_else(|| RuntimeFault::failed("main process has no child host"))?;
        let plan = LaunchPlan::from_flags(ctx.descriptor().flags())?;
        if plan.roles.is_empty() {
            tracing::info!("no children requested");
            return Ok(RunOutcome::Completed);
        }

        let stop = ctx.cancellation().child_token();
        let mut supervisors = JoinSet::new();
        for role in plan.roles {
            supervisors.spawn(supervise(
                Arc::clone(&host),
                role,
                plan.child_flags.clone(),
                plan.max_respawns,
                stop.clone(),
            ));
        }

        let mut first_fault = None;
        while let Some(joined) = supervisors.join_next().await {
            let result = joined.unwrap_or_else(|err| {
                Err(RuntimeFault::failed(format!(
                    "child supervisor ended abnormally: {err}"
                )))
            });
            if let Err(fault) = result {
                // One child giving up takes the others down with it.
                stop.cancel();
                first_fault.get_or_insert(fault);
            }
        }

        match first_fault {
            Some(fault) => Err(fault),
            None if ctx.cancellation().is_cancelled() => Ok(RunOutcome::Cancelled),
            None => Ok(RunOutcome::Completed),
        }
    }
}

async fn supervise(
    host: Arc<ChildHost>,
    role: ProcessRole,
    flags: FeatureFlags,
    max_respawns: u32,
    stop: CancellationToken,
) -> Result<(), RuntimeFault> {
    let mut respawns = 0;
    loop {
        let exit = match host.spawn(role, &flags).await {
            Ok(child) => run_child(child, &host, &stop).await,
            Err(err) => Err(err),
        };
        if stop.is_cancelled() {
            return Ok(());
        }

        let crash = match exit {
            Ok(exit) if exit.is_clean() => return Ok(()),
            Ok(exit) if !exit.should_respawn() => {
                return Err(RuntimeFault::failed(format!(
                    "{role} exited with {:?} and cannot be restarted",
                    exit.code
                )));
            }
            Ok(exit) => format!("exited with {:?}", exit.code),
            Err(err) => err.to_string(),
        };
        if respawns >= max_respawns {
            return Err(RuntimeFault::failed(format!(
                "{role} crashed {} times, last: {crash}",
                respawns + 1
            )));
        }
        respawns += 1;
        tracing::warn!(%role, respawns, "child crashed ({crash}); respawning");
    }
}

/// Waits for `child` to exit, asking it to shut down first if `stop` fires.
async fn run_child(
    mut child: ChildProcess,
    host: &ChildHost,
    stop: &CancellationToken,
) -> Result<ChildExit, ChannelError> {
    tokio::select! {
        exit = child.wait() => exit,
        _ = stop.cancelled() => {
            if let Err(err) = child.request_shutdown(Some("host shutting down".to_string())).await {
                tracing::debug!(role = %child.role(), "shutdown request not sent: {err}");
            }
            let budget = child_stop_budget(host.config());
            match tokio::time::timeout(budget, child.wait()).await {
                Ok(exit) => exit,
                Err(_) => {
                    tracing::warn!(role = %child.role(), "child ignored shutdown for {budget:?}; killing");
                    child.kill()?;
                    child.wait().await
                }
            }
        }
    }
}

/// How long a child may take to exit after a shutdown request. The
/// dispatcher aborts this run loop once `shutdown_grace` has passed, so a
/// longer wait would end in `kill_on_drop` with the child's report lost.
fn child_stop_budget(config: &ChassisConfig) -> Duration {
    config.shutdown_grace()
}
