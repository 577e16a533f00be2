//! Exit codes of the binary run directly.

use std::path::Path;
use std::process::Command;

use chassis_protocol::EXIT_CLASSIFICATION_ERROR;
use chassis_protocol::EXIT_OK;
use chassis_protocol::EXIT_RUNTIME_FAULT;
use pretty_assertions::assert_eq;

fn run(ipc_dir: &Path, args: &[&str]) -> std::io::Result<Option<i32>> {
    let status = Command::new(env!("CARGO_BIN_EXE_chassis-subprocess"))
        .args(args)
        .env("CHASSIS_IPC_DIR", ipc_dir)
        .env_remove("CHASSIS_FEATURES")
        .env_remove("CHASSIS_CONFIG")
        .status()?;
    Ok(status.code())
}

#[test]
fn main_without_children_exits_cleanly() -> std::io::Result<()> {
    let dir = tempfile::tempdir()?;
    assert_eq!(run(dir.path(), &[])?, Some(EXIT_OK));
    Ok(())
}

#[test]
fn malformed_role_exits_with_classification_code() -> std::io::Result<()> {
    let dir = tempfile::tempdir()?;
    for args in [
        &["--type=browser", "--channel=abc123", "--index=1"][..],
        &["--type=renderer", "--index=1"][..],
    ] {
        assert_eq!(
            run(dir.path(), args)?,
            Some(EXIT_CLASSIFICATION_ERROR),
            "{args:?}"
        );
    }
    Ok(())
}

#[test]
fn main_gives_up_after_exhausting_respawns() -> std::io::Result<()> {
    let dir = tempfile::tempdir()?;
    let code = run(
        dir.path(),
        &[
            "--spawn=renderer",
            "--max-respawns=1",
            "--no-sandbox",
            "--fail-run-loop=always",
        ],
    )?;
    assert_eq!(code, Some(EXIT_RUNTIME_FAULT));
    Ok(())
}
