use chassis_protocol::ProcessRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemPolicy {
    Unrestricted,
    /// Read anywhere; write only to `/dev/null` and, when allowed, the temp
    /// directory.
    ReadOnly { allow_temp_writes: bool },
    /// Read/write beneath `/dev`, read beneath `/sys`, nothing else.
    DevicesOnly,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPolicy {
    Unrestricted,
    /// Only `AF_UNIX` sockets may be created, which is what the parent
    /// channel needs.
    LocalIpcOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallPolicy {
    Unrestricted,
    /// Denies debugging other processes, `io_uring`, kernel module and
    /// `bpf`/`perf` interfaces.
    Baseline,
    /// Baseline plus no `exec` and no new namespaces.
    Strict,
}

/// Minimum-privilege policy for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxProfile {
    pub filesystem: FilesystemPolicy,
    pub network: NetworkPolicy,
    pub syscalls: SyscallPolicy,
}

impl SandboxProfile {
    pub const fn unrestricted() -> Self {
        Self {
            filesystem: FilesystemPolicy::Unrestricted,
            network: NetworkPolicy::Unrestricted,
            syscalls: SyscallPolicy::Unrestricted,
        }
    }

    pub const fn for_role(role: ProcessRole) -> Self {
        match role {
            // The main process spawns every child and needs broad privilege.
            ProcessRole::Main => Self::unrestricted(),
            ProcessRole::Renderer => Self {
                filesystem: FilesystemPolicy::Denied,
                network: NetworkPolicy::LocalIpcOnly,
                syscalls: SyscallPolicy::Strict,
            },
            ProcessRole::GpuProcess => Self {
                filesystem: FilesystemPolicy::DevicesOnly,
                network: NetworkPolicy::LocalIpcOnly,
                syscalls: SyscallPolicy::Baseline,
            },
            ProcessRole::UtilityProcess => Self {
                filesystem: FilesystemPolicy::ReadOnly {
                    allow_temp_writes: true,
                },
                network: NetworkPolicy::Unrestricted,
                syscalls: SyscallPolicy::Baseline,
            },
            // Forks new children, so it keeps exec and clone.
            ProcessRole::ZygoteProcess => Self {
                filesystem: FilesystemPolicy::ReadOnly {
                    allow_temp_writes: false,
                },
                network: NetworkPolicy::LocalIpcOnly,
                syscalls: SyscallPolicy::Baseline,
            },
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        *self == Self::unrestricted()
    }

    pub fn restricts_filesystem(&self) -> bool {
        self.filesystem != FilesystemPolicy::Unrestricted
    }

    pub fn restricts_network(&self) -> bool {
        self.network != NetworkPolicy::Unrestricted
    }

    pub fn restricts_syscalls(&self) -> bool {
        self.syscalls != SyscallPolicy::Unrestricted
    }
}
