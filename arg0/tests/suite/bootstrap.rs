//! Full bootstrap runs against a scripted parent on another thread.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use anyhow::Context;
use async_trait::async_trait;
use chassis_arg0::ProcessContext;
use chassis_arg0::Stage;
use chassis_arg0::StageStatus;
use chassis_arg0::run_process;
use chassis_dispatch::DispatchState;
use chassis_dispatch::RunContext;
use chassis_dispatch::RunLoop;
use chassis_dispatch::RunLoopRegistry;
use chassis_dispatch::RunOutcome;
use chassis_dispatch::RuntimeFault;
use chassis_ipc::FrameCodec;
use chassis_protocol::EXIT_CHANNEL_ERROR;
use chassis_protocol::EXIT_CLASSIFICATION_ERROR;
use chassis_protocol::EXIT_OK;
use chassis_protocol::EXIT_SANDBOX_ERROR;
use chassis_protocol::EXIT_STARTUP_ERROR;
use chassis_protocol::EnvSnapshot;
use chassis_protocol::ExitReport;
use chassis_protocol::ProcessRole;
use chassis_protocol::Termination;
use chassis_protocol::wire::Frame;
use chassis_protocol::wire::HelloAck;
use chassis_protocol::wire::PROTOCOL_VERSION;
use chassis_sandbox::AppliedRestrictions;
use chassis_sandbox::InitError;
use chassis_sandbox::SandboxBackend;
use chassis_sandbox::SandboxProfile;
use chassis_sandbox::SandboxStatus;
use futures::SinkExt;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::net::UnixListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

type EventLog = Arc<Mutex<Vec<&'static str>>>;

fn log_event(log: &EventLog, event: &'static str) {
    if let Ok(mut events) = log.lock() {
        events.push(event);
    }
}

fn events(log: &EventLog) -> Vec<&'static str> {
    log.lock().map(|events| events.clone()).unwrap_or_default()
}

/// Pretends to lock the sandbox and logs when it did.
struct RecordingBackend {
    log: EventLog,
    fail: bool,
}

impl RecordingBackend {
    fn new(log: &EventLog) -> Self {
        Self {
            log: Arc::clone(log),
            fail: false,
        }
    }
}

impl SandboxBackend for RecordingBackend {
    fn apply(
        &self,
        profile: &SandboxProfile,
        _env: &EnvSnapshot,
    ) -> Result<AppliedRestrictions, InitError> {
        log_event(&self.log, "sandbox");
        if self.fail {
            return Err(InitError::Unsupported("test backend refuses".to_string()));
        }
        Ok(AppliedRestrictions::enforcing(profile))
    }
}

/// Runs until cancelled and remembers that it started.
#[derive(Clone, Default)]
struct Idle {
    started: Arc<AtomicBool>,
}

#[async_trait]
impl RunLoop for Idle {
    async fn run(&self, ctx: RunContext) -> Result<RunOutcome, RuntimeFault> {
        self.started.store(true, Ordering::SeqCst);
        if ctx.role() == ProcessRole::Main {
            return Ok(RunOutcome::Completed);
        }
        ctx.cancellation().cancelled().await;
        Ok(RunOutcome::Cancelled)
    }
}

fn registry(run_loop: &Idle) -> RunLoopRegistry {
    ProcessRole::ALL
        .into_iter()
        .fold(RunLoopRegistry::new(), |registry, role| {
            registry.register(role, run_loop.clone())
        })
}

fn context(args: &[&str], env: &[(&str, &str)]) -> ProcessContext {
    let argv = std::iter::once("chassis-subprocess")
        .chain(args.iter().copied())
        .map(OsString::from)
        .collect();
    ProcessContext::new(argv, env.iter().copied().collect())
}

fn renderer_args() -> [&'static str; 3] {
    ["--type=renderer", "--channel=abc123", "--index=4"]
}

/// What the scripted parent does once the child has sent its hello.
#[derive(Clone, Copy)]
enum ParentScript {
    AckThenShutdown,
    NeverAck,
}

/// Binds the child's socket in `dir` and serves it from a separate thread.
/// Returns every frame the parent saw after the hello.
fn spawn_parent(
    dir: &Path,
    script: ParentScript,
    log: &EventLog,
) -> anyhow::Result<JoinHandle<anyhow::Result<Vec<Frame>>>> {
    let listener = std::os::unix::net::UnixListener::bind(dir.join("abc123.sock"))?;
    listener.set_nonblocking(true)?;
    let log = Arc::clone(log);
    Ok(std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async move {
            let listener = UnixListener::from_std(listener)?;
            let (stream, _) = listener.accept().await?;
            log_event(&log, "connected");
            let mut parent = Framed::new(stream, FrameCodec::new(1 << 20));
            match parent.next().await {
                Some(Ok(Frame::Hello(hello))) => {
                    anyhow::ensure!(hello.role == ProcessRole::Renderer && hello.index == 4);
                }
                other => anyhow::bail!("expected hello, got {other:?}"),
            }
            if let ParentScript::AckThenShutdown = script {
                parent
                    .send(Frame::HelloAck(HelloAck {
                        protocol_version: PROTOCOL_VERSION,
                    }))
                    .await?;
                parent
                    .send(Frame::Shutdown {
                        reason: Some("test finished".to_string()),
                    })
                    .await?;
            }
            let mut seen = Vec::new();
            while let Some(frame) = parent.next().await {
                seen.push(frame?);
            }
            Ok(seen)
        })
    }))
}

fn join_parent(parent: JoinHandle<anyhow::Result<Vec<Frame>>>) -> anyhow::Result<Vec<Frame>> {
    parent
        .join()
        .map_err(|_| anyhow::anyhow!("parent thread panicked"))?
}

#[test]
fn renderer_attaches_and_exits_cleanly_on_parent_shutdown() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ipc_dir = dir.path().to_str().context("utf-8 temp dir")?;
    let log = EventLog::default();
    let parent = spawn_parent(dir.path(), ParentScript::AckThenShutdown, &log)?;

    let run_loop = Idle::default();
    let outcome = run_process(
        context(&renderer_args(), &[("CHASSIS_IPC_DIR", ipc_dir)]),
        registry(&run_loop),
        &RecordingBackend::new(&log),
        CancellationToken::new(),
    );
    let seen = join_parent(parent)?;

    assert_eq!(outcome.report.code, EXIT_OK);
    assert_eq!(
        outcome.states,
        vec![
            DispatchState::Initializing,
            DispatchState::Running,
            DispatchState::Draining,
            DispatchState::Terminated,
        ]
    );
    assert!(matches!(outcome.sandbox, Some(SandboxStatus::Locked(_))));
    assert_eq!(
        outcome.trace.stages(),
        vec![
            Stage::Classify,
            Stage::Sandbox,
            Stage::Config,
            Stage::Runtime,
            Stage::Channel,
            Stage::Dispatch,
        ]
    );
    assert_eq!(events(&log), vec!["sandbox", "connected"]);
    assert_eq!(
        seen,
        vec![Frame::Exit(ExitReport::clean(Termination::ShutdownRequested))]
    );
    assert!(run_loop.started.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn unacknowledged_handshake_exits_with_channel_code() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ipc_dir = dir.path().to_str().context("utf-8 temp dir")?;
    let log = EventLog::default();
    let parent = spawn_parent(dir.path(), ParentScript::NeverAck, &log)?;

    let run_loop = Idle::default();
    let outcome = run_process(
        context(
            &renderer_args(),
            &[
                ("CHASSIS_IPC_DIR", ipc_dir),
                ("CHASSIS_HANDSHAKE_TIMEOUT_MS", "200"),
            ],
        ),
        registry(&run_loop),
        &RecordingBackend::new(&log),
        CancellationToken::new(),
    );
    join_parent(parent)?;

    assert_eq!(outcome.report.code, EXIT_CHANNEL_ERROR);
    assert_eq!(outcome.trace.status(Stage::Channel), Some(StageStatus::Failed));
    assert_eq!(outcome.trace.status(Stage::Dispatch), None);
    assert_eq!(outcome.states, vec![DispatchState::Initializing]);
    assert!(!run_loop.started.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn main_runs_without_a_sandbox() {
    let log = EventLog::default();
    let run_loop = Idle::default();
    let outcome = run_process(
        context(&["--enable-logging"], &[]),
        registry(&run_loop),
        &RecordingBackend::new(&log),
        CancellationToken::new(),
    );

    assert_eq!(outcome.report, ExitReport::clean(Termination::Completed));
    assert_eq!(outcome.sandbox, Some(SandboxStatus::Unrestricted));
    assert_eq!(events(&log), Vec::<&str>::new());
    assert!(run_loop.started.load(Ordering::SeqCst));
}

#[test]
fn malformed_role_stops_before_the_sandbox() {
    let log = EventLog::default();
    let outcome = run_process(
        context(&["--type=browser", "--channel=abc123", "--index=1"], &[]),
        registry(&Idle::default()),
        &RecordingBackend::new(&log),
        CancellationToken::new(),
    );

    assert_eq!(outcome.report.code, EXIT_CLASSIFICATION_ERROR);
    assert_eq!(
        outcome.trace.entries(),
        &[(Stage::Classify, StageStatus::Failed)]
    );
    assert_eq!(outcome.sandbox, None);
    assert_eq!(events(&log), Vec::<&str>::new());
}

#[test]
fn sandbox_failure_never_opens_the_channel() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ipc_dir = dir.path().to_str().context("utf-8 temp dir")?;
    let log = EventLog::default();
    let backend = RecordingBackend {
        fail: true,
        ..RecordingBackend::new(&log)
    };
    let outcome = run_process(
        context(&renderer_args(), &[("CHASSIS_IPC_DIR", ipc_dir)]),
        registry(&Idle::default()),
        &backend,
        CancellationToken::new(),
    );

    assert_eq!(outcome.report.code, EXIT_SANDBOX_ERROR);
    assert_eq!(outcome.report.crash.map(|crash| crash.expected), Some(false));
    assert_eq!(outcome.trace.status(Stage::Sandbox), Some(StageStatus::Failed));
    assert_eq!(outcome.trace.status(Stage::Channel), None);
    assert_eq!(events(&log), vec!["sandbox"]);
    Ok(())
}

#[test]
fn unreadable_config_is_a_startup_failure() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("missing.toml");
    let config_path = config_path.to_str().context("utf-8 temp dir")?;
    let log = EventLog::default();

    let outcome = run_process(
        context(&renderer_args(), &[("CHASSIS_CONFIG", config_path)]),
        registry(&Idle::default()),
        &RecordingBackend::new(&log),
        CancellationToken::new(),
    );

    assert_eq!(outcome.report.code, EXIT_STARTUP_ERROR);
    assert_eq!(
        outcome.trace.entries(),
        &[
            (Stage::Classify, StageStatus::Ok),
            (Stage::Config, StageStatus::Failed),
        ]
    );
    assert_eq!(outcome.sandbox, None);
    assert_eq!(events(&log), Vec::<&str>::new());
    Ok(())
}

#[test]
fn config_is_parsed_only_after_the_sandbox() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("chassis.toml");
    std::fs::write(&config_path, "handshake_timeout_ms = 0\n")?;
    let config_path = config_path.to_str().context("utf-8 temp dir")?;
    let log = EventLog::default();

    let outcome = run_process(
        context(&renderer_args(), &[("CHASSIS_CONFIG", config_path)]),
        registry(&Idle::default()),
        &RecordingBackend::new(&log),
        CancellationToken::new(),
    );

    assert_eq!(outcome.report.code, EXIT_STARTUP_ERROR);
    assert_eq!(
        outcome.trace.entries(),
        &[
            (Stage::Classify, StageStatus::Ok),
            (Stage::Sandbox, StageStatus::Ok),
            (Stage::Config, StageStatus::Failed),
        ]
    );
    assert!(matches!(outcome.sandbox, Some(SandboxStatus::Locked(_))));
    assert_eq!(events(&log), vec!["sandbox"]);
    Ok(())
}
