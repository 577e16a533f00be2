//! A test process playing the main role for real `chassis-subprocess`
//! children.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chassis_cli::FAIL_RUN_LOOP_FLAG;
use chassis_cli::PANIC_RUN_LOOP_FLAG;
use chassis_config::ChassisConfig;
use chassis_ipc::ChannelError;
use chassis_ipc::ChildHost;
use chassis_protocol::EXIT_OK;
use chassis_protocol::EXIT_RUNTIME_FAULT;
use chassis_protocol::EXIT_SANDBOX_ERROR;
use chassis_protocol::ExitCategory;
use chassis_protocol::ExitReport;
use chassis_protocol::FeatureFlags;
use chassis_protocol::ProcessRole;
use chassis_protocol::Termination;
use pretty_assertions::assert_eq;

const SUBPROCESS_EXE: &str = env!("CARGO_BIN_EXE_chassis-subprocess");

fn host(ipc_dir: &Path) -> ChildHost {
    let config = ChassisConfig {
        ipc_dir: Some(ipc_dir.to_path_buf()),
        ..ChassisConfig::default()
    };
    ChildHost::new(SUBPROCESS_EXE, config)
}

fn flags(extra: &[(&str, &str)]) -> FeatureFlags {
    std::iter::once(("no-sandbox", ""))
        .chain(extra.iter().copied())
        .collect()
}

#[tokio::test]
async fn renderer_echoes_and_honours_shutdown() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = host(dir.path());
    let mut child = host.spawn(ProcessRole::Renderer, &flags(&[])).await?;
    assert_eq!(child.index(), 1);

    let channel = child.handle();
    channel.send(b"ping".to_vec())?;
    let echoed = tokio::time::timeout(Duration::from_secs(5), channel.recv())
        .await?
        .context("renderer hung up")?;
    assert_eq!(echoed, b"ping".to_vec());

    child.request_shutdown(Some("test done".to_string())).await?;
    let exit = child.wait().await?;
    assert_eq!(exit.code, Some(EXIT_OK));
    assert_eq!(
        exit.report,
        Some(ExitReport::clean(Termination::ShutdownRequested))
    );
    assert!(!exit.should_respawn());
    Ok(())
}

#[tokio::test]
async fn failing_run_loop_reports_a_runtime_fault() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = host(dir.path());
    let mut child = host
        .spawn(ProcessRole::UtilityProcess, &flags(&[(FAIL_RUN_LOOP_FLAG, "boom")]))
        .await?;

    let exit = child.wait().await?;
    assert_eq!(exit.code, Some(EXIT_RUNTIME_FAULT));
    let crash = exit.report.as_ref().and_then(|report| report.crash.clone());
    assert_eq!(
        crash.map(|crash| (crash.category, crash.reason, crash.expected)),
        Some((
            ExitCategory::RuntimeFault,
            "run loop failed: boom".to_string(),
            false
        ))
    );
    assert!(exit.should_respawn());
    Ok(())
}

#[tokio::test]
async fn panicking_run_loop_still_exits_with_a_report() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = host(dir.path());
    let mut child = host
        .spawn(ProcessRole::GpuProcess, &flags(&[(PANIC_RUN_LOOP_FLAG, "")]))
        .await?;

    let exit = child.wait().await?;
    assert_eq!(exit.code, Some(EXIT_RUNTIME_FAULT));
    assert_eq!(exit.category(), Some(ExitCategory::RuntimeFault));
    Ok(())
}

#[tokio::test]
async fn killed_child_has_no_code_and_is_respawnable() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = host(dir.path());
    let mut child = host.spawn(ProcessRole::ZygoteProcess, &flags(&[])).await?;
    child.kill()?;

    let exit = child.wait().await?;
    assert_eq!(exit.code, None);
    assert_eq!(exit.report, None);
    assert!(exit.should_respawn());
    Ok(())
}

#[tokio::test]
async fn sandboxed_children_still_echo_and_exit_cleanly() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = host(dir.path());
    for role in [
        ProcessRole::Renderer,
        ProcessRole::GpuProcess,
        ProcessRole::UtilityProcess,
        ProcessRole::ZygoteProcess,
    ] {
        let mut child = match host.spawn(role, &FeatureFlags::new()).await {
            Ok(child) => child,
            Err(ChannelError::ChildExited {
                code: Some(EXIT_SANDBOX_ERROR),
            }) => {
                eprintln!("skipping {role}: sandbox unavailable on this kernel");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let channel = child.handle();
        channel.send(role.to_string().into_bytes())?;
        let echoed = tokio::time::timeout(Duration::from_secs(5), channel.recv())
            .await?
            .context("sandboxed child hung up")?;
        assert_eq!(echoed, role.to_string().into_bytes());

        child.request_shutdown(None).await?;
        let exit = child.wait().await?;
        assert_eq!(exit.code, Some(EXIT_OK), "{role}");
        assert_eq!(
            exit.report,
            Some(ExitReport::clean(Termination::ShutdownRequested))
        );
    }
    Ok(())
}
