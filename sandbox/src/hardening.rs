//! Process-wide hardening applied together with every restricted profile.

use chassis_protocol::EnvSnapshot;

use crate::InitError;

/// Loader variables that were already honored by the time we run. The
/// environment is never modified here; they are only reported.
const LOADER_ENV_PREFIXES: [&str; 2] = ["LD_", "DYLD_"];

pub(crate) fn harden_current_process(env: &EnvSnapshot) -> Result<(), InitError> {
    // Blocks ptrace attach from same-uid processes and /proc/<pid>/mem reads.
    let ret_code = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) };
    if ret_code != 0 {
        return Err(InitError::Os {
            call: "prctl(PR_SET_DUMPABLE)",
            source: std::io::Error::last_os_error(),
        });
    }

    set_core_file_size_limit_to_zero()?;

    for key in loader_env_keys(env) {
        tracing::warn!("{key} is set in a sandboxed process");
    }
    Ok(())
}

fn set_core_file_size_limit_to_zero() -> Result<(), InitError> {
    let rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret_code = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlim) };
    if ret_code != 0 {
        return Err(InitError::Os {
            call: "setrlimit(RLIMIT_CORE)",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn loader_env_keys(env: &EnvSnapshot) -> Vec<&str> {
    LOADER_ENV_PREFIXES
        .iter()
        .flat_map(|prefix| env.keys_with_prefix(prefix))
        .collect()
}
