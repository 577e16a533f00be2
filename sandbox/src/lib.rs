//! Applies the OS isolation profile for a process role.
//!
//! This runs before the parent channel is opened and before the async runtime
//! exists. A failure here is fatal and is never retried.

#[cfg(target_os = "linux")]
mod hardening;
#[cfg(target_os = "linux")]
mod landlock;
mod profile;
mod state;

use std::path::PathBuf;

use chassis_protocol::EnvSnapshot;
use chassis_protocol::RoleDescriptor;

pub use profile::FilesystemPolicy;
pub use profile::NetworkPolicy;
pub use profile::SandboxProfile;
pub use profile::SyscallPolicy;
pub use state::AppliedRestrictions;
pub use state::SandboxState;
pub use state::SandboxStatus;

/// Feature flag that leaves a restricted role unsandboxed.
pub const NO_SANDBOX_FLAG: &str = "no-sandbox";

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("sandbox not supported: {0}")]
    Unsupported(String),
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("landlock ruleset was not enforced by the kernel")]
    LandlockNotEnforced,
    #[cfg(target_os = "linux")]
    #[error("failed to build landlock ruleset: {0}")]
    Landlock(#[from] ::landlock::RulesetError),
    #[cfg(target_os = "linux")]
    #[error("failed to install seccomp filter: {0}")]
    Seccomp(#[from] seccompiler::Error),
}

/// Something that can put a [`SandboxProfile`] in place for the current
/// process.
pub trait SandboxBackend {
    fn apply(
        &self,
        profile: &SandboxProfile,
        env: &EnvSnapshot,
    ) -> Result<AppliedRestrictions, InitError>;
}

/// Enforces profiles with the host OS's primitives.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSandbox;

impl SandboxBackend for OsSandbox {
    #[cfg(target_os = "linux")]
    fn apply(
        &self,
        profile: &SandboxProfile,
        env: &EnvSnapshot,
    ) -> Result<AppliedRestrictions, InitError> {
        hardening::harden_current_process(env)?;
        landlock::apply_profile_to_current_thread(profile, &temp_dir(env))
    }

    #[cfg(not(target_os = "linux"))]
    fn apply(
        &self,
        profile: &SandboxProfile,
        env: &EnvSnapshot,
    ) -> Result<AppliedRestrictions, InitError> {
        let _ = env;
        Err(InitError::Unsupported(format!(
            "cannot enforce {profile:?} on {}",
            std::env::consts::OS
        )))
    }
}

/// Applies the profile for `descriptor`'s role and returns the resulting
/// state. `Main` is never restricted.
pub fn initialize(
    descriptor: &RoleDescriptor,
    env: &EnvSnapshot,
    backend: &dyn SandboxBackend,
) -> Result<SandboxState, InitError> {
    let role = descriptor.role();
    let profile = SandboxProfile::for_role(role);

    if profile.is_unrestricted() {
        tracing::debug!(%role, "no sandbox profile for role");
        return Ok(SandboxState::unrestricted(role));
    }

    if descriptor.flags().is_enabled(NO_SANDBOX_FLAG) {
        tracing::warn!(%role, "sandbox disabled by --{NO_SANDBOX_FLAG}");
        return Ok(SandboxState::bypassed(role));
    }

    let applied = backend.apply(&profile, env)?;
    tracing::debug!(%role, ?applied, "sandbox locked");
    Ok(SandboxState::locked(role, applied))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn temp_dir(env: &EnvSnapshot) -> PathBuf {
    env.get("TMPDIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}
