use chassis_protocol::ProcessRole;

use crate::FilesystemPolicy;
use crate::NetworkPolicy;
use crate::SandboxProfile;
use crate::SyscallPolicy;

/// What a backend actually put in place for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedRestrictions {
    pub filesystem: FilesystemPolicy,
    pub network: NetworkPolicy,
    pub syscalls: SyscallPolicy,
    pub no_new_privs: bool,
    pub core_dumps_disabled: bool,
}

impl AppliedRestrictions {
    /// Restrictions matching `profile` with every process-level hardening
    /// step in place.
    pub fn enforcing(profile: &SandboxProfile) -> Self {
        Self {
            filesystem: profile.filesystem,
            network: profile.network,
            syscalls: profile.syscalls,
            no_new_privs: true,
            core_dumps_disabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    /// The role's profile carries no restrictions.
    Unrestricted,
    /// The role has a profile but `--no-sandbox` was passed.
    Bypassed,
    Locked(AppliedRestrictions),
}

/// Sandbox outcome for this process.
///
/// Only this crate can construct one, and there is no way to move a locked
/// state back to an unlocked one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxState {
    role: ProcessRole,
    status: SandboxStatus,
}

impl SandboxState {
    pub(crate) fn unrestricted(role: ProcessRole) -> Self {
        Self {
            role,
            status: SandboxStatus::Unrestricted,
        }
    }

    pub(crate) fn bypassed(role: ProcessRole) -> Self {
        Self {
            role,
            status: SandboxStatus::Bypassed,
        }
    }

    pub(crate) fn locked(role: ProcessRole, applied: AppliedRestrictions) -> Self {
        Self {
            role,
            status: SandboxStatus::Locked(applied),
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn status(&self) -> SandboxStatus {
        self.status
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.status, SandboxStatus::Locked(_))
    }

    pub fn restrictions(&self) -> Option<&AppliedRestrictions> {
        match &self.status {
            SandboxStatus::Locked(applied) => Some(applied),
            SandboxStatus::Unrestricted | SandboxStatus::Bypassed => None,
        }
    }
}
