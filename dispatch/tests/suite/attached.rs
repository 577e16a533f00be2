//! Dispatching a child role whose channel is attached to a scripted parent.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chassis_config::ChassisConfig;
use chassis_dispatch::DispatchResult;
use chassis_dispatch::DispatchState;
use chassis_dispatch::DispatchTiming;
use chassis_dispatch::Dispatcher;
use chassis_dispatch::ExitReporter;
use chassis_dispatch::RunContext;
use chassis_dispatch::RunLoop;
use chassis_dispatch::RunLoopRegistry;
use chassis_dispatch::RunOutcome;
use chassis_dispatch::RuntimeFault;
use chassis_ipc::FrameCodec;
use chassis_ipc::establish;
use chassis_ipc::socket_path;
use chassis_protocol::ChannelId;
use chassis_protocol::EXIT_PARENT_LOST;
use chassis_protocol::EnvSnapshot;
use chassis_protocol::ExitReport;
use chassis_protocol::FeatureFlags;
use chassis_protocol::ProcessRole;
use chassis_protocol::RoleDescriptor;
use chassis_protocol::Termination;
use chassis_protocol::wire::Frame;
use chassis_protocol::wire::HelloAck;
use chassis_protocol::wire::PROTOCOL_VERSION;
use chassis_sandbox::OsSandbox;
use futures::SinkExt;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

type ParentSide = Framed<UnixStream, FrameCodec>;

/// Echoes every payload back until cancelled. A channel that ends without
/// a shutdown request counts as losing the parent.
struct Echo;

#[async_trait]
impl RunLoop for Echo {
    async fn run(&self, ctx: RunContext) -> Result<RunOutcome, RuntimeFault> {
        let channel = ctx.channel().ok_or(RuntimeFault::ChannelLost)?.clone();
        loop {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Ok(RunOutcome::Cancelled),
                payload = channel.recv() => match payload {
                    Some(data) => channel.send(data).map_err(RuntimeFault::failed)?,
                    None => return Err(RuntimeFault::ChannelLost),
                },
            }
        }
    }
}

fn config(ipc_dir: &Path) -> ChassisConfig {
    ChassisConfig {
        ipc_dir: Some(ipc_dir.to_path_buf()),
        handshake_timeout_ms: 2_000,
        drain_grace_ms: 500,
        shutdown_grace_ms: 500,
        ..ChassisConfig::default()
    }
}

async fn accept_and_ack(listener: UnixListener) -> anyhow::Result<ParentSide> {
    let (stream, _) = listener.accept().await?;
    let mut framed = Framed::new(stream, FrameCodec::new(1 << 20));
    match framed.next().await {
        Some(Ok(Frame::Hello(_))) => {}
        other => anyhow::bail!("expected hello, got {other:?}"),
    }
    framed
        .send(Frame::HelloAck(HelloAck {
            protocol_version: PROTOCOL_VERSION,
        }))
        .await?;
    Ok(framed)
}

/// Attaches a renderer to a scripted parent and dispatches it with [`Echo`].
async fn dispatch_renderer<F, Fut>(script: F) -> anyhow::Result<(DispatchResult, Vec<Frame>)>
where
    F: FnOnce(ParentSide) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Frame>>> + Send,
{
    let dir = tempfile::tempdir()?;
    let config = config(dir.path());
    let flags: FeatureFlags = [("no-sandbox", "")].into_iter().collect();
    let descriptor = RoleDescriptor::child(ProcessRole::Renderer, ChannelId::new("abc123")?, 4)
        .context("renderer is a child role")?
        .with_flags(flags);
    let listener = UnixListener::bind(socket_path(
        dir.path(),
        descriptor.channel_id().context("channel")?,
    ))?;
    let parent = tokio::spawn(async move { script(accept_and_ack(listener).await?).await });

    let sandbox = chassis_sandbox::initialize(&descriptor, &EnvSnapshot::default(), &OsSandbox)?;
    let link = establish(&descriptor, &sandbox, &config).await?;
    let reporter = ExitReporter::new(&descriptor);
    let registry = RunLoopRegistry::new().register(ProcessRole::Renderer, Echo);
    let result = Dispatcher::new(registry, DispatchTiming::from(&config))
        .dispatch(Arc::new(descriptor), link, reporter, CancellationToken::new())
        .await;
    let seen = tokio::time::timeout(Duration::from_secs(5), parent).await???;
    Ok((result, seen))
}

async fn collect_until_eof(mut parent: ParentSide) -> anyhow::Result<Vec<Frame>> {
    let mut seen = Vec::new();
    while let Some(frame) = parent.next().await {
        seen.push(frame?);
    }
    Ok(seen)
}

#[tokio::test]
async fn parent_shutdown_drains_and_reports_success() -> anyhow::Result<()> {
    let (result, seen) = dispatch_renderer(|mut parent| async move {
        parent
            .send(Frame::Payload {
                data: b"ping".to_vec(),
            })
            .await?;
        let echoed = parent.next().await.context("echo")??;
        parent.send(Frame::Shutdown { reason: None }).await?;
        let mut seen = vec![echoed];
        seen.extend(collect_until_eof(parent).await?);
        Ok(seen)
    })
    .await?;

    assert_eq!(
        result.report,
        ExitReport::clean(Termination::ShutdownRequested)
    );
    assert_eq!(
        result.states,
        vec![
            DispatchState::Initializing,
            DispatchState::Running,
            DispatchState::Draining,
            DispatchState::Terminated,
        ]
    );
    assert_eq!(
        seen,
        vec![
            Frame::Payload {
                data: b"ping".to_vec()
            },
            Frame::Exit(ExitReport::clean(Termination::ShutdownRequested)),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn vanished_parent_channel_is_parent_lost() -> anyhow::Result<()> {
    let (result, seen) = dispatch_renderer(|parent| async move {
        drop(parent);
        Ok(Vec::new())
    })
    .await?;

    assert_eq!(result.report.code, EXIT_PARENT_LOST);
    assert!(seen.is_empty());
    Ok(())
}
