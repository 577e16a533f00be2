use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chassis_config::ChassisConfig;
use chassis_ipc::IpcChannel;
use chassis_ipc::ParentLink;
use chassis_protocol::ExitReport;
use chassis_protocol::RoleDescriptor;
use tokio::task::JoinError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::DispatchState;
use crate::ExitCause;
use crate::ExitReporter;
use crate::FaultInfo;
use crate::ParentWatcher;
use crate::RunContext;
use crate::RunLoopRegistry;
use crate::RunOutcome;
use crate::RuntimeFault;
use crate::StateMachine;

/// Time budgets for leaving `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTiming {
    pub shutdown_grace: Duration,
    pub drain_grace: Duration,
    pub fault_flush_timeout: Duration,
    pub parent_poll_interval: Duration,
}

impl From<&ChassisConfig> for DispatchTiming {
    fn from(config: &ChassisConfig) -> Self {
        Self {
            shutdown_grace: config.shutdown_grace(),
            drain_grace: config.drain_grace(),
            fault_flush_timeout: config.fault_flush_timeout(),
            parent_poll_interval: config.parent_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub report: ExitReport,
    /// States entered, in order.
    pub states: Vec<DispatchState>,
}

type RunTask = JoinHandle<Result<RunOutcome, RuntimeFault>>;

enum Wakeup {
    Shutdown,
    ParentGone(u32),
    Finished(Result<Result<RunOutcome, RuntimeFault>, JoinError>),
    ChannelLost,
}

#[derive(Debug)]
pub struct Dispatcher {
    registry: RunLoopRegistry,
    timing: DispatchTiming,
}

impl Dispatcher {
    pub fn new(registry: RunLoopRegistry, timing: DispatchTiming) -> Self {
        Self { registry, timing }
    }

    /// Runs the role's loop until it completes, the parent asks for shutdown,
    /// or something faults, then drains, reports and closes the channel.
    ///
    /// `external_shutdown` is treated exactly like a `shutdown` frame; the
    /// process entry point cancels it on termination signals.
    pub async fn dispatch(
        &self,
        descriptor: Arc<RoleDescriptor>,
        link: ParentLink,
        reporter: ExitReporter,
        external_shutdown: CancellationToken,
    ) -> DispatchResult {
        let role = descriptor.role();
        let mut machine = StateMachine::new();
        let (channel, host) = match link {
            ParentLink::Attached(channel) => (Some(channel), None),
            ParentLink::Root(host) => (None, Some(Arc::new(host))),
        };

        if let Err(fault) = machine.transition(DispatchState::Running) {
            return self
                .finish(machine, reporter, channel, fault_cause(&fault))
                .await;
        }

        let Some(run_loop) = self.registry.get(role) else {
            let fault = RuntimeFault::NoRunLoop(role);
            return self
                .leave_running(machine, reporter, channel, fault_cause(&fault))
                .await;
        };

        let cancel = CancellationToken::new();
        let ctx = RunContext::new(
            Arc::clone(&descriptor),
            channel.as_ref().map(IpcChannel::handle),
            host,
            cancel.clone(),
        );
        let mut task: RunTask = tokio::spawn(async move { run_loop.run(ctx).await });
        tracing::debug!(%role, index = descriptor.index(), "run loop started");

        let parent_shutdown = channel
            .as_ref()
            .map(IpcChannel::shutdown_requested)
            .unwrap_or_default();
        let peer_closed = channel
            .as_ref()
            .map(IpcChannel::peer_closed)
            .unwrap_or_default();
        let watcher = match descriptor.host_process_id() {
            Some(pid) if descriptor.exit_if_parent_closed() => Some((
                pid,
                ParentWatcher::spawn(pid, self.timing.parent_poll_interval),
            )),
            _ => None,
        };
        let (watched_pid, parent_gone) = match &watcher {
            Some((pid, watcher)) => (*pid, watcher.gone()),
            None => (0, CancellationToken::new()),
        };

        let wakeup = tokio::select! {
            biased;
            _ = external_shutdown.cancelled() => Wakeup::Shutdown,
            _ = parent_shutdown.cancelled() => Wakeup::Shutdown,
            _ = parent_gone.cancelled() => Wakeup::ParentGone(watched_pid),
            joined = &mut task => Wakeup::Finished(joined),
            _ = peer_closed.cancelled() => Wakeup::ChannelLost,
        };
        drop(watcher);

        let shutdown_pending = external_shutdown.is_cancelled() || parent_shutdown.is_cancelled();
        let cause = match wakeup {
            Wakeup::Shutdown => {
                cancel.cancel();
                self.await_cancelled_run_loop(&mut task).await;
                ExitCause::ShutdownRequested
            }
            // A shutdown request that raced with completion still wins.
            Wakeup::Finished(Ok(Ok(_))) if shutdown_pending => ExitCause::ShutdownRequested,
            Wakeup::Finished(Ok(Ok(outcome))) => {
                tracing::debug!(%role, ?outcome, "run loop returned");
                ExitCause::Completed
            }
            Wakeup::Finished(Ok(Err(fault))) => fault_cause(&fault),
            Wakeup::Finished(Err(join_err)) => fault_cause(&join_fault(join_err)),
            Wakeup::ParentGone(pid) => fault_cause(&RuntimeFault::ParentExited { pid }),
            Wakeup::ChannelLost => fault_cause(&RuntimeFault::ChannelLost),
        };

        if matches!(cause, ExitCause::Fault(_)) {
            // No graceful shutdown on the fault path.
            cancel.cancel();
            task.abort();
        }

        self.leave_running(machine, reporter, channel, cause).await
    }

    async fn await_cancelled_run_loop(&self, task: &mut RunTask) {
        match tokio::time::timeout(self.timing.shutdown_grace, &mut *task).await {
            Ok(Ok(Ok(outcome))) => tracing::debug!(?outcome, "run loop stopped"),
            Ok(Ok(Err(fault))) => tracing::warn!("run loop failed while stopping: {fault}"),
            Ok(Err(join_err)) => tracing::warn!("{}", join_fault(join_err)),
            Err(_) => {
                tracing::warn!(
                    "run loop ignored cancellation for {:?}; aborting",
                    self.timing.shutdown_grace
                );
                task.abort();
            }
        }
    }

    /// `Running -> Draining`: flush for the cause's budget, then report.
    async fn leave_running(
        &self,
        mut machine: StateMachine,
        reporter: ExitReporter,
        channel: Option<IpcChannel>,
        mut cause: ExitCause,
    ) -> DispatchResult {
        if let Err(fault) = machine.transition(DispatchState::Draining) {
            cause = fault_cause(&fault);
        }
        if let (Some(channel), ExitCause::Completed | ExitCause::ShutdownRequested) =
            (&channel, &cause)
        {
            channel.drain(self.timing.drain_grace).await;
        }
        self.finish(machine, reporter, channel, cause).await
    }

    /// Reports, delivers the report best-effort, closes the channel and
    /// enters `Terminated`.
    async fn finish(
        &self,
        mut machine: StateMachine,
        reporter: ExitReporter,
        channel: Option<IpcChannel>,
        cause: ExitCause,
    ) -> DispatchResult {
        let budget = match cause {
            ExitCause::Fault(_) => self.timing.fault_flush_timeout,
            ExitCause::Completed | ExitCause::ShutdownRequested => self.timing.drain_grace,
        };
        let report = reporter.report(machine.current(), cause);

        if let Some(channel) = channel {
            let delivered = tokio::time::timeout(budget, async {
                channel.send_exit_report(&report).await?;
                channel.flush().await
            })
            .await;
            match delivered {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!("exit report not delivered: {err}"),
                Err(_) => tracing::debug!("exit report not delivered within {budget:?}"),
            }
            channel.close(budget).await;
        }

        if let Err(fault) = machine.transition(DispatchState::Terminated) {
            tracing::error!("{fault}");
        }
        DispatchResult {
            report,
            states: machine.into_history(),
        }
    }
}

fn fault_cause(fault: &RuntimeFault) -> ExitCause {
    ExitCause::Fault(FaultInfo::from(fault))
}

fn join_fault(err: JoinError) -> RuntimeFault {
    match err.try_into_panic() {
        Ok(payload) => RuntimeFault::Panicked(panic_message(payload.as_ref())),
        Err(err) => RuntimeFault::Failed(format!("run loop task ended abnormally: {err}")),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
