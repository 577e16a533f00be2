//! The duplex channel between a child process and the process that spawned
//! it.
//!
//! Children attach to the channel named on their command line with
//! [`establish`]; the main process instead gets a [`ChildHost`] that creates
//! one channel per child it launches.
#![cfg(unix)]

mod address;
mod channel;
mod codec;
mod error;
mod handshake;
mod host;

use std::io;
use std::os::fd::FromRawFd;
use std::os::fd::RawFd;
use std::time::Duration;

use chassis_config::ChassisConfig;
use chassis_protocol::ChannelId;
use chassis_protocol::RoleDescriptor;
use chassis_protocol::wire::Hello;
use chassis_protocol::wire::PROTOCOL_VERSION;
use chassis_sandbox::SandboxState;
use tokio::net::UnixStream;

pub use address::ChannelAddress;
pub use address::socket_path;
pub use channel::ChannelHandle;
pub use channel::IpcChannel;
pub use codec::FrameCodec;
pub use error::ChannelError;
pub use host::ChildExit;
pub use host::ChildHost;
pub use host::ChildProcess;

use crate::channel::Transport;

/// What this process is connected to once the channel stage is done.
#[derive(Debug)]
pub enum ParentLink {
    /// No parent: the main process, able to host children.
    Root(ChildHost),
    /// A child attached to its parent.
    Attached(IpcChannel),
}

/// Opens the channel named by `descriptor` and completes the handshake.
///
/// Taking the [`SandboxState`] ties this stage to a finished sandbox stage.
pub async fn establish(
    descriptor: &RoleDescriptor,
    sandbox: &SandboxState,
    config: &ChassisConfig,
) -> Result<ParentLink, ChannelError> {
    let role = descriptor.role();
    let Some(channel) = descriptor.channel_id() else {
        tracing::debug!(%role, "no parent channel; acting as child host");
        return Ok(ParentLink::Root(ChildHost::for_current_exe(config.clone())?));
    };
    let index = descriptor.index();
    tracing::debug!(%role, index, %channel, sandbox = ?sandbox.status(), "attaching to parent");

    let address = ChannelAddress::resolve(channel, &config.ipc_dir())?;
    let stream = connect(&address, channel, config.connect_timeout()).await?;
    let mut transport = Transport::new(stream, config.max_frame_bytes);
    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        pid: std::process::id(),
        role,
        index,
    };
    handshake::client_handshake(&mut transport, hello, config.handshake_timeout()).await?;
    tracing::debug!(%role, index, "handshake acknowledged");

    Ok(ParentLink::Attached(IpcChannel::start(
        transport,
        config.send_buffer,
        format!("{role}#{index}"),
    )))
}

async fn connect(
    address: &ChannelAddress,
    channel: &ChannelId,
    timeout: Duration,
) -> Result<UnixStream, ChannelError> {
    let open_failed = |source: io::Error| ChannelError::OpenFailed {
        channel: channel.to_string(),
        source,
    };
    match address {
        ChannelAddress::Socket(path) => {
            match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
                Ok(stream) => stream.map_err(open_failed),
                Err(_) => Err(open_failed(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {timeout:?}"),
                ))),
            }
        }
        ChannelAddress::InheritedFd(fd) => adopt_inherited_socket(*fd).map_err(open_failed),
    }
}

fn adopt_inherited_socket(fd: RawFd) -> io::Result<UnixStream> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("fd {fd} is not a socket"),
        ));
    }
    // From here on this process owns the descriptor.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}
