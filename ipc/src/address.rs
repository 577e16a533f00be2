use std::os::fd::RawFd;
use std::path::Path;
use std::path::PathBuf;

use chassis_protocol::ChannelId;

use crate::ChannelError;

const INHERITED_FD_PREFIX: &str = "fd:";

/// Where a channel id points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddress {
    /// A connected Unix socket the parent left open across `exec`.
    InheritedFd(RawFd),
    /// A Unix socket the parent is listening on.
    Socket(PathBuf),
}

impl ChannelAddress {
    /// `fd:<n>` names an inherited descriptor; anything else names
    /// `<ipc_dir>/<id>.sock`.
    pub fn resolve(channel: &ChannelId, ipc_dir: &Path) -> Result<Self, ChannelError> {
        match channel.as_str().strip_prefix(INHERITED_FD_PREFIX) {
            Some(fd) => match fd.parse::<RawFd>() {
                // 0-2 are stdio, never a channel.
                Ok(fd) if fd > 2 => Ok(Self::InheritedFd(fd)),
                _ => Err(ChannelError::InvalidAddress(channel.to_string())),
            },
            None => Ok(Self::Socket(socket_path(ipc_dir, channel))),
        }
    }
}

pub fn socket_path(ipc_dir: &Path, channel: &ChannelId) -> PathBuf {
    ipc_dir.join(format!("{channel}.sock"))
}
