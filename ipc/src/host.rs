use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chassis_config::ChassisConfig;
use chassis_config::IPC_DIR_ENV_VAR;
use chassis_protocol::ChannelId;
use chassis_protocol::EXIT_OK;
use chassis_protocol::ExitCategory;
use chassis_protocol::ExitReport;
use chassis_protocol::FeatureFlags;
use chassis_protocol::ProcessRole;
use tokio::net::UnixListener;
use tokio::process::Child;
use tokio::process::Command;
use uuid::Uuid;

use crate::ChannelError;
use crate::ChannelHandle;
use crate::IpcChannel;
use crate::address::socket_path;
use crate::channel::Transport;
use crate::handshake::host_handshake;

/// Flags the host sets itself; callers cannot pass them through.
const RESERVED_FLAGS: [&str; 5] = [
    "type",
    "channel",
    "index",
    "host-process-id",
    "exit-if-parent-process-closed",
];

/// Removes a listening socket's path once the child has connected or the
/// spawn failed.
struct SocketFileGuard(PathBuf);

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// The main process's side of child creation: one fresh channel and one
/// process per [`ChildHost::spawn`].
#[derive(Debug)]
pub struct ChildHost {
    exe: PathBuf,
    config: ChassisConfig,
    host_pid: u32,
    next_index: AtomicU32,
}

impl ChildHost {
    pub fn new(exe: impl Into<PathBuf>, config: ChassisConfig) -> Self {
        Self {
            exe: exe.into(),
            config,
            host_pid: std::process::id(),
            next_index: AtomicU32::new(1),
        }
    }

    /// A host that re-invokes the running executable.
    pub fn for_current_exe(config: ChassisConfig) -> Result<Self, ChannelError> {
        let exe = std::env::current_exe().map_err(ChannelError::Spawn)?;
        Ok(Self::new(exe, config))
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn config(&self) -> &ChassisConfig {
        &self.config
    }

    /// Launches a child in `role` and completes the handshake with it.
    ///
    /// The child is killed if the returned [`ChildProcess`] is dropped, and on
    /// Linux also when the spawning thread goes away.
    pub async fn spawn(
        &self,
        role: ProcessRole,
        flags: &FeatureFlags,
    ) -> Result<ChildProcess, ChannelError> {
        let Some(type_flag) = role.type_flag() else {
            return Err(ChannelError::UnsupportedRole(role));
        };
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let channel = ChannelId::new(format!(
            "{}-{index}-{}",
            self.host_pid,
            Uuid::new_v4().simple()
        ))
        .map_err(|err| ChannelError::InvalidAddress(err.0))?;

        let ipc_dir = self.config.ipc_dir();
        std::fs::create_dir_all(&ipc_dir)?;
        let path = socket_path(&ipc_dir, &channel);
        let listener = UnixListener::bind(&path).map_err(|source| ChannelError::OpenFailed {
            channel: channel.to_string(),
            source,
        })?;
        let _socket_file = SocketFileGuard(path);

        let mut command = Command::new(&self.exe);
        command
            .arg(format!("--type={type_flag}"))
            .arg(format!("--channel={channel}"))
            .arg(format!("--index={index}"))
            .arg(format!("--host-process-id={}", self.host_pid))
            .args(
                flags
                    .iter()
                    .filter(|(name, _)| !RESERVED_FLAGS.contains(name))
                    .collect::<FeatureFlags>()
                    .to_args(),
            )
            .env(IPC_DIR_ENV_VAR, &ipc_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        #[cfg(target_os = "linux")]
        unsafe {
            let parent_pid = libc::getpid();
            command.pre_exec(move || set_parent_death_signal(parent_pid));
        }

        let mut child = command.spawn().map_err(ChannelError::Spawn)?;
        let pid = child.id();
        tracing::debug!(%role, index, ?pid, %channel, "spawned child");

        let connect_timeout = self.config.connect_timeout();
        let stream = tokio::select! {
            accepted = tokio::time::timeout(connect_timeout, listener.accept()) => match accepted {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(source)) => {
                    return Err(ChannelError::OpenFailed { channel: channel.to_string(), source });
                }
                Err(_) => return Err(ChannelError::HandshakeTimeout { timeout: connect_timeout }),
            },
            status = child.wait() => {
                return Err(ChannelError::ChildExited { code: status?.code() });
            }
        };

        let mut transport = Transport::new(stream, self.config.max_frame_bytes);
        tokio::select! {
            handshake = host_handshake(&mut transport, role, index, self.config.handshake_timeout()) => {
                handshake?;
            }
            status = child.wait() => {
                return Err(ChannelError::ChildExited { code: status?.code() });
            }
        }

        let channel = IpcChannel::start(
            transport,
            self.config.send_buffer,
            format!("host->{role}#{index}"),
        );
        Ok(ChildProcess {
            role,
            index,
            pid,
            channel,
            child,
            exit_report_wait: self.config.drain_grace(),
        })
    }
}

/// Delivers `SIGKILL` to the child when the thread that spawned it exits.
/// Runs between `fork` and `exec`.
#[cfg(target_os = "linux")]
fn set_parent_death_signal(parent_pid: libc::pid_t) -> std::io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    // The parent may have died before prctl took effect.
    if unsafe { libc::getppid() } != parent_pid {
        unsafe {
            libc::raise(libc::SIGKILL);
        }
    }
    Ok(())
}

/// A running, handshaken child.
#[derive(Debug)]
pub struct ChildProcess {
    role: ProcessRole,
    index: u32,
    pid: Option<u32>,
    channel: IpcChannel,
    child: Child,
    exit_report_wait: Duration,
}

impl ChildProcess {
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn handle(&self) -> ChannelHandle {
        self.channel.handle()
    }

    pub async fn request_shutdown(&self, reason: Option<String>) -> Result<(), ChannelError> {
        self.channel.request_shutdown(reason).await
    }

    pub fn kill(&mut self) -> Result<(), ChannelError> {
        self.child.start_kill()?;
        Ok(())
    }

    /// Waits for the child to exit and collects the report it sent, if any.
    pub async fn wait(&mut self) -> Result<ChildExit, ChannelError> {
        let status = self.child.wait().await?;
        // The exit frame can still be in flight when the process is reaped.
        let _ = tokio::time::timeout(self.exit_report_wait, self.channel.peer_closed().cancelled())
            .await;
        let exit = ChildExit {
            role: self.role,
            index: self.index,
            code: status.code(),
            report: self.channel.peer_exit(),
        };
        tracing::debug!(role = %self.role, index = self.index, ?exit, "child exited");
        Ok(exit)
    }
}

/// How a child ended, as seen by its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub role: ProcessRole,
    pub index: u32,
    /// `None` when the child was killed by a signal.
    pub code: Option<i32>,
    pub report: Option<ExitReport>,
}

impl ChildExit {
    pub fn is_clean(&self) -> bool {
        self.code == Some(EXIT_OK)
    }

    pub fn category(&self) -> Option<ExitCategory> {
        self.report
            .as_ref()
            .and_then(ExitReport::category)
            .or_else(|| self.code.and_then(ExitCategory::from_code))
    }

    /// Whether the host should start a replacement. Signals and unknown
    /// codes count as crashes.
    pub fn should_respawn(&self) -> bool {
        match self.code {
            Some(EXIT_OK) => false,
            Some(_) => self.category().is_none_or(ExitCategory::should_respawn),
            None => true,
        }
    }
}
