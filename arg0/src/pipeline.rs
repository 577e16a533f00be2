use std::fmt;
use std::sync::Arc;

use chassis_config::ChassisConfig;
use chassis_config::ConfigSource;
use chassis_dispatch::DispatchState;
use chassis_dispatch::DispatchTiming;
use chassis_dispatch::Dispatcher;
use chassis_dispatch::ExitCause;
use chassis_dispatch::ExitReporter;
use chassis_dispatch::FaultInfo;
use chassis_dispatch::RunLoopRegistry;
use chassis_ipc::establish;
use chassis_protocol::ExitCategory;
use chassis_protocol::ExitReport;
use chassis_sandbox::OsSandbox;
use chassis_sandbox::SandboxBackend;
use chassis_sandbox::SandboxStatus;
use tokio_util::sync::CancellationToken;

use crate::ProcessContext;
use crate::Stage;
use crate::StageStatus;
use crate::StageTrace;
use crate::classify;

const WORKER_THREAD_NAME: &str = "chassis-worker";

/// Everything a finished bootstrap leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub report: ExitReport,
    pub trace: StageTrace,
    /// Dispatcher states entered; only `Initializing` when startup failed.
    pub states: Vec<DispatchState>,
    /// `None` when the process never reached the sandbox stage.
    pub sandbox: Option<SandboxStatus>,
}

/// Entry point for every process built from this executable: resolves the
/// role from the command line, runs it to completion and exits with the
/// reported code.
///
/// `SIGINT` and `SIGTERM` are handled like a parent shutdown request.
pub fn handle_app_start(registry: RunLoopRegistry) -> ! {
    let outcome = run(
        ProcessContext::from_os(),
        registry,
        &OsSandbox,
        CancellationToken::new(),
        true,
    );
    std::process::exit(outcome.report.code)
}

/// Runs the bootstrap for `ctx`: classify, read the config file, sandbox,
/// resolve the config, start the async runtime, establish the channel and
/// dispatch.
///
/// Cancelling `shutdown` has the same effect as a shutdown frame from the
/// parent.
pub fn run_process(
    ctx: ProcessContext,
    registry: RunLoopRegistry,
    backend: &dyn SandboxBackend,
    shutdown: CancellationToken,
) -> ProcessOutcome {
    run(ctx, registry, backend, shutdown, false)
}

fn run(
    ctx: ProcessContext,
    registry: RunLoopRegistry,
    backend: &dyn SandboxBackend,
    shutdown: CancellationToken,
    forward_signals: bool,
) -> ProcessOutcome {
    let mut trace = StageTrace::default();

    let descriptor = match classify(ctx.argv(), ctx.env()) {
        Ok(descriptor) => descriptor,
        Err(err) => {
            trace.record(Stage::Classify, StageStatus::Failed);
            return startup_failure(
                ExitReporter::unclassified(),
                ExitCategory::Classification,
                err,
                trace,
                None,
            );
        }
    };
    trace.record(Stage::Classify, StageStatus::Ok);
    let role = descriptor.role();
    let index = descriptor.index();
    let reporter = ExitReporter::new(&descriptor);
    tracing::debug!(%role, index, flags = descriptor.flags().len(), "classified process");

    // Only the raw file read happens before the sandbox.
    let config_source = match ConfigSource::read(ctx.env()) {
        Ok(source) => source,
        Err(err) => {
            trace.record(Stage::Config, StageStatus::Failed);
            return startup_failure(reporter, ExitCategory::Startup, err, trace, None);
        }
    };

    // Still single-threaded here, so every runtime thread inherits the
    // restrictions.
    let sandbox = match chassis_sandbox::initialize(&descriptor, ctx.env(), backend) {
        Ok(sandbox) => sandbox,
        Err(err) => {
            trace.record(Stage::Sandbox, StageStatus::Failed);
            return startup_failure(reporter, ExitCategory::Sandbox, err, trace, None);
        }
    };
    trace.record(Stage::Sandbox, StageStatus::Ok);
    let sandbox_status = Some(sandbox.status());

    let config = match ChassisConfig::resolve(config_source, ctx.env()) {
        Ok(config) => config,
        Err(err) => {
            trace.record(Stage::Config, StageStatus::Failed);
            return startup_failure(reporter, ExitCategory::Startup, err, trace, sandbox_status);
        }
    };
    trace.record(Stage::Config, StageStatus::Ok);

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            trace.record(Stage::Runtime, StageStatus::Failed);
            return startup_failure(reporter, ExitCategory::Startup, err, trace, sandbox_status);
        }
    };
    trace.record(Stage::Runtime, StageStatus::Ok);

    runtime.block_on(async move {
        if forward_signals {
            tokio::spawn(forward_termination_signals(shutdown.clone()));
        }

        let link = match establish(&descriptor, &sandbox, &config).await {
            Ok(link) => link,
            Err(err) => {
                trace.record(Stage::Channel, StageStatus::Failed);
                return startup_failure(
                    reporter,
                    ExitCategory::Channel,
                    err,
                    trace,
                    sandbox_status,
                );
            }
        };
        trace.record(Stage::Channel, StageStatus::Ok);

        let result = Dispatcher::new(registry, DispatchTiming::from(&config))
            .dispatch(Arc::new(descriptor), link, reporter, shutdown)
            .await;
        let status = if result.report.is_clean() {
            StageStatus::Ok
        } else {
            StageStatus::Failed
        };
        trace.record(Stage::Dispatch, status);
        ProcessOutcome {
            report: result.report,
            trace,
            states: result.states,
            sandbox: sandbox_status,
        }
    })
}

/// Reports a failure that happened before the dispatcher took over.
fn startup_failure(
    reporter: ExitReporter,
    category: ExitCategory,
    err: impl fmt::Display,
    trace: StageTrace,
    sandbox: Option<SandboxStatus>,
) -> ProcessOutcome {
    let report = reporter.report(
        DispatchState::Initializing,
        ExitCause::Fault(FaultInfo::new(category, err.to_string())),
    );
    ProcessOutcome {
        report,
        trace,
        states: vec![DispatchState::Initializing],
        sandbox,
    }
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name(WORKER_THREAD_NAME)
        .build()
}

async fn forward_termination_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            tracing::warn!("failed to install SIGTERM handler: {err}");
            return;
        }
    };
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted; shutting down"),
        _ = terminate.recv() => tracing::info!("terminated; shutting down"),
    }
    shutdown.cancel();
}
