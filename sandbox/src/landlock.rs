//! Linux enforcement of a [`SandboxProfile`]: `no_new_privs`, landlock
//! filesystem rules and a seccomp filter.
//!
//! Everything here applies to the calling thread and is inherited by the
//! threads and processes it creates afterwards, so it has to run before the
//! async runtime spawns its workers.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use landlock::ABI;
use landlock::Access;
use landlock::AccessFs;
use landlock::CompatLevel;
use landlock::Compatible;
use landlock::Ruleset;
use landlock::RulesetAttr;
use landlock::RulesetCreatedAttr;
use seccompiler::BpfProgram;
use seccompiler::SeccompAction;
use seccompiler::SeccompCmpArgLen;
use seccompiler::SeccompCmpOp;
use seccompiler::SeccompCondition;
use seccompiler::SeccompFilter;
use seccompiler::SeccompRule;
use seccompiler::TargetArch;
use seccompiler::apply_filter;

use crate::AppliedRestrictions;
use crate::FilesystemPolicy;
use crate::InitError;
use crate::NetworkPolicy;
use crate::SandboxProfile;
use crate::SyscallPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Grant {
    Read,
    ReadWrite,
}

pub(crate) fn apply_profile_to_current_thread(
    profile: &SandboxProfile,
    temp_dir: &Path,
) -> Result<AppliedRestrictions, InitError> {
    // Required for seccomp without CAP_SYS_ADMIN; also stops setuid escalation.
    set_no_new_privs()?;

    if let Some(grants) = filesystem_grants(profile.filesystem, temp_dir) {
        install_filesystem_landlock_rules_on_current_thread(&grants)?;
    }

    if profile.restricts_network() || profile.restricts_syscalls() {
        let program = build_seccomp_program(profile.network, profile.syscalls)?;
        apply_filter(&program)?;
    }

    Ok(AppliedRestrictions::enforcing(profile))
}

fn set_no_new_privs() -> Result<(), InitError> {
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        return Err(InitError::Os {
            call: "prctl(PR_SET_NO_NEW_PRIVS)",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Paths left reachable under a filesystem policy. `None` means no landlock
/// ruleset is installed at all; an empty list denies everything.
pub(crate) fn filesystem_grants(
    policy: FilesystemPolicy,
    temp_dir: &Path,
) -> Option<Vec<(PathBuf, Grant)>> {
    match policy {
        FilesystemPolicy::Unrestricted => None,
        FilesystemPolicy::Denied => Some(Vec::new()),
        FilesystemPolicy::DevicesOnly => Some(vec![
            (PathBuf::from("/dev"), Grant::ReadWrite),
            (PathBuf::from("/sys"), Grant::Read),
        ]),
        FilesystemPolicy::ReadOnly { allow_temp_writes } => {
            let mut grants = vec![
                (PathBuf::from("/"), Grant::Read),
                (PathBuf::from("/dev/null"), Grant::ReadWrite),
            ];
            if allow_temp_writes {
                grants.push((temp_dir.to_path_buf(), Grant::ReadWrite));
            }
            Some(grants)
        }
    }
}

fn install_filesystem_landlock_rules_on_current_thread(
    grants: &[(PathBuf, Grant)],
) -> Result<(), InitError> {
    let abi = ABI::V5;
    let access_rw = AccessFs::from_all(abi);
    let access_ro = AccessFs::from_read(abi);

    let mut ruleset = Ruleset::default()
        .set_compatibility(CompatLevel::BestEffort)
        .handle_access(access_rw)?
        .create()?
        .no_new_privs(true);

    for (path, grant) in grants {
        let access = match grant {
            Grant::Read => access_ro,
            Grant::ReadWrite => access_rw,
        };
        ruleset = ruleset.add_rules(landlock::path_beneath_rules([path], access))?;
    }

    let status = ruleset.restrict_self()?;
    require_enforced(status.ruleset)
}

fn require_enforced(status: landlock::RulesetStatus) -> Result<(), InitError> {
    match status {
        landlock::RulesetStatus::NotEnforced => Err(InitError::LandlockNotEnforced),
        landlock::RulesetStatus::PartiallyEnforced | landlock::RulesetStatus::FullyEnforced => {
            Ok(())
        }
    }
}

/// Syscalls matched by the filter. A rule list that is empty matches
/// unconditionally; matched calls fail with `EPERM`.
pub(crate) fn seccomp_rules(
    network: NetworkPolicy,
    syscalls: SyscallPolicy,
) -> Result<BTreeMap<i64, Vec<SeccompRule>>, seccompiler::Error> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    let mut deny_syscall = |nr: i64| {
        rules.insert(nr, vec![]);
    };

    if syscalls != SyscallPolicy::Unrestricted {
        deny_syscall(libc::SYS_ptrace);
        deny_syscall(libc::SYS_process_vm_readv);
        deny_syscall(libc::SYS_process_vm_writev);
        deny_syscall(libc::SYS_io_uring_setup);
        deny_syscall(libc::SYS_io_uring_enter);
        deny_syscall(libc::SYS_io_uring_register);
        deny_syscall(libc::SYS_kexec_load);
        deny_syscall(libc::SYS_init_module);
        deny_syscall(libc::SYS_finit_module);
        deny_syscall(libc::SYS_delete_module);
        deny_syscall(libc::SYS_bpf);
        deny_syscall(libc::SYS_perf_event_open);
    }
    if syscalls == SyscallPolicy::Strict {
        deny_syscall(libc::SYS_execve);
        deny_syscall(libc::SYS_execveat);
        deny_syscall(libc::SYS_unshare);
        deny_syscall(libc::SYS_setns);
    }

    if network == NetworkPolicy::LocalIpcOnly {
        // Matches when the domain (first argument) is anything but AF_UNIX.
        let unix_only_rule = SeccompRule::new(vec![SeccompCondition::new(
            0,
            SeccompCmpArgLen::Dword,
            SeccompCmpOp::Ne,
            libc::AF_UNIX as u64,
        )?])?;
        rules.insert(libc::SYS_socket, vec![unix_only_rule.clone()]);
        rules.insert(libc::SYS_socketpair, vec![unix_only_rule]);
    }

    Ok(rules)
}

fn build_seccomp_program(
    network: NetworkPolicy,
    syscalls: SyscallPolicy,
) -> Result<BpfProgram, InitError> {
    let Some(arch) = target_arch() else {
        return Err(InitError::Unsupported(format!(
            "no seccomp support for {}",
            std::env::consts::ARCH
        )));
    };
    let rules = seccomp_rules(network, syscalls)?;
    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        arch,
    )
    .map_err(seccompiler::Error::from)?;
    let program: BpfProgram = filter.try_into().map_err(seccompiler::Error::from)?;
    Ok(program)
}

fn target_arch() -> Option<TargetArch> {
    if cfg!(target_arch = "x86_64") {
        Some(TargetArch::x86_64)
    } else if cfg!(target_arch = "aarch64") {
        Some(TargetArch::aarch64)
    } else {
        None
    }
}
