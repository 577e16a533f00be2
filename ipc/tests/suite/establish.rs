use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use assert_matches::assert_matches;
use chassis_config::ChassisConfig;
use chassis_ipc::ChannelError;
use chassis_ipc::FrameCodec;
use chassis_ipc::ParentLink;
use chassis_ipc::establish;
use chassis_ipc::socket_path;
use chassis_protocol::ChannelId;
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
use chassis_sandbox::SandboxState;
use futures::SinkExt;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::net::UnixListener;
use tokio_util::codec::Framed;

fn renderer(channel: &str) -> anyhow::Result<(RoleDescriptor, SandboxState)> {
    let flags: FeatureFlags = [("no-sandbox", "")].into_iter().collect();
    let descriptor = RoleDescriptor::child(ProcessRole::Renderer, ChannelId::new(channel)?, 4)
        .context("renderer is a child role")?
        .with_flags(flags);
    let sandbox = chassis_sandbox::initialize(&descriptor, &EnvSnapshot::default(), &OsSandbox)?;
    Ok((descriptor, sandbox))
}

fn config(ipc_dir: &Path, handshake_timeout_ms: u64) -> ChassisConfig {
    ChassisConfig {
        ipc_dir: Some(ipc_dir.to_path_buf()),
        handshake_timeout_ms,
        connect_timeout_ms: 1_000,
        ..ChassisConfig::default()
    }
}

#[tokio::test]
async fn child_attaches_and_exchanges_frames() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (descriptor, sandbox) = renderer("abc123")?;
    let listener = UnixListener::bind(socket_path(
        dir.path(),
        descriptor.channel_id().context("channel")?,
    ))?;

    let parent = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut framed = Framed::new(stream, FrameCodec::new(1 << 20));
        let hello = match framed.next().await {
            Some(Ok(Frame::Hello(hello))) => hello,
            other => anyhow::bail!("expected hello, got {other:?}"),
        };
        framed
            .send(Frame::HelloAck(HelloAck {
                protocol_version: PROTOCOL_VERSION,
            }))
            .await?;
        framed
            .send(Frame::Payload {
                data: b"ping".to_vec(),
            })
            .await?;
        let mut rest = Vec::new();
        while let Some(frame) = framed.next().await {
            rest.push(frame?);
        }
        Ok::<_, anyhow::Error>((hello, rest))
    });

    let channel = match establish(&descriptor, &sandbox, &config(dir.path(), 2_000)).await? {
        ParentLink::Attached(channel) => channel,
        ParentLink::Root(_) => anyhow::bail!("renderer must attach to its parent"),
    };
    let handle = channel.handle();
    assert_eq!(handle.recv().await, Some(b"ping".to_vec()));
    handle.send(b"pong".to_vec())?;
    channel
        .send_exit_report(&ExitReport::clean(Termination::Completed))
        .await?;
    channel.close(Duration::from_secs(2)).await;

    let (hello, rest) = parent.await??;
    assert_eq!(hello.role, ProcessRole::Renderer);
    assert_eq!(hello.index, 4);
    assert_eq!(hello.pid, std::process::id());
    assert_eq!(
        rest,
        vec![
            Frame::Payload {
                data: b"pong".to_vec()
            },
            Frame::Exit(ExitReport::clean(Termination::Completed)),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn unacknowledged_handshake_times_out() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (descriptor, sandbox) = renderer("silent")?;
    let listener = UnixListener::bind(socket_path(
        dir.path(),
        descriptor.channel_id().context("channel")?,
    ))?;
    // Accept, then never answer.
    let parent = tokio::spawn(async move { listener.accept().await });

    let result = establish(&descriptor, &sandbox, &config(dir.path(), 150)).await;
    assert_matches!(
        result,
        Err(ChannelError::HandshakeTimeout { timeout }) if timeout == Duration::from_millis(150)
    );
    drop(parent.await?);
    Ok(())
}

#[tokio::test]
async fn missing_parent_socket_fails_to_open() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (descriptor, sandbox) = renderer("nobody-home")?;
    let result = establish(&descriptor, &sandbox, &config(dir.path(), 150)).await;
    assert_matches!(result, Err(ChannelError::OpenFailed { channel, .. }) if channel == "nobody-home");
    Ok(())
}

#[tokio::test]
async fn main_becomes_a_child_host() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let descriptor = RoleDescriptor::main();
    let sandbox = chassis_sandbox::initialize(&descriptor, &EnvSnapshot::default(), &OsSandbox)?;
    let link = establish(&descriptor, &sandbox, &config(dir.path(), 150)).await?;
    assert_matches!(link, ParentLink::Root(_));
    Ok(())
}
