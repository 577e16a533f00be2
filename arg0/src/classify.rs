use std::ffi::OsString;

use chassis_protocol::ChannelId;
use chassis_protocol::EnvSnapshot;
use chassis_protocol::FeatureFlags;
use chassis_protocol::ProcessRole;
use chassis_protocol::RoleDescriptor;

/// Comma-separated feature flags (`a,b=1`) applied before the command line.
pub const FEATURES_ENV_VAR: &str = "CHASSIS_FEATURES";

const TYPE_FLAG: &str = "type";
const CHANNEL_FLAG: &str = "channel";
const INDEX_FLAG: &str = "index";
const HOST_PROCESS_ID_FLAG: &str = "host-process-id";
const EXIT_IF_PARENT_CLOSED_FLAG: &str = "exit-if-parent-process-closed";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassificationError {
    #[error("malformed role arguments: {0}")]
    MalformedRole(String),
}

fn malformed(reason: impl Into<String>) -> ClassificationError {
    ClassificationError::MalformedRole(reason.into())
}

/// Flags that shape the descriptor itself. Each may appear at most once.
#[derive(Debug, Default)]
struct RoleArgs {
    role_type: Option<String>,
    channel: Option<String>,
    index: Option<String>,
    host_process_id: Option<String>,
    exit_if_parent_closed: bool,
}

impl RoleArgs {
    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            TYPE_FLAG => Some(&mut self.role_type),
            CHANNEL_FLAG => Some(&mut self.channel),
            INDEX_FLAG => Some(&mut self.index),
            HOST_PROCESS_ID_FLAG => Some(&mut self.host_process_id),
            _ => None,
        }
    }
}

/// Resolves `argv` (program name first) to the role this process runs as.
///
/// No `--type` means [`ProcessRole::Main`]. Anything ambiguous is rejected
/// rather than guessed at.
pub fn classify(
    argv: &[OsString],
    env: &EnvSnapshot,
) -> Result<RoleDescriptor, ClassificationError> {
    let mut role_args = RoleArgs::default();
    let mut flags = env
        .get(FEATURES_ENV_VAR)
        .map(parse_feature_list)
        .unwrap_or_default();
    let mut positional = Vec::new();
    let mut flags_done = false;

    for raw in argv.iter().skip(1) {
        let token = raw
            .to_str()
            .ok_or_else(|| malformed(format!("argument {raw:?} is not valid UTF-8")))?;

        if flags_done || !token.starts_with("--") {
            positional.push(token.to_string());
            continue;
        }
        if token == "--" {
            flags_done = true;
            continue;
        }

        let body = &token[2..];
        let (name, value) = match body.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (body, None),
        };
        if name.is_empty() {
            return Err(malformed(format!("`{token}` has no flag name")));
        }

        if name == EXIT_IF_PARENT_CLOSED_FLAG {
            if value.is_some() {
                return Err(malformed(format!("--{name} takes no value")));
            }
            if role_args.exit_if_parent_closed {
                return Err(malformed(format!("--{name} given more than once")));
            }
            role_args.exit_if_parent_closed = true;
        } else if let Some(slot) = role_args.slot(name) {
            let value = value
                .filter(|value| !value.is_empty())
                .ok_or_else(|| malformed(format!("--{name} requires a value")))?;
            if slot.replace(value.to_string()).is_some() {
                return Err(malformed(format!("--{name} given more than once")));
            }
        } else {
            flags.insert(name, value.unwrap_or_default());
        }
    }

    build_descriptor(role_args, flags, positional)
}

fn build_descriptor(
    args: RoleArgs,
    flags: FeatureFlags,
    positional: Vec<String>,
) -> Result<RoleDescriptor, ClassificationError> {
    let descriptor = match args.role_type {
        None => {
            if args.channel.is_some() || args.index.is_some() {
                return Err(malformed(format!(
                    "--{CHANNEL_FLAG} and --{INDEX_FLAG} require --{TYPE_FLAG}"
                )));
            }
            RoleDescriptor::main().with_positional(positional)
        }
        Some(role_type) => {
            let role = ProcessRole::from_type_flag(&role_type)
                .ok_or_else(|| malformed(format!("unknown process type `{role_type}`")))?;
            let channel = args.channel.ok_or_else(|| {
                malformed(format!("--{TYPE_FLAG}={role_type} requires --{CHANNEL_FLAG}"))
            })?;
            let channel = ChannelId::new(channel).map_err(|err| malformed(err.to_string()))?;
            let index = args.index.ok_or_else(|| {
                malformed(format!("--{TYPE_FLAG}={role_type} requires --{INDEX_FLAG}"))
            })?;
            let index = parse_u32(INDEX_FLAG, &index)?;
            if let Some(first) = positional.first() {
                return Err(malformed(format!(
                    "unexpected argument `{first}` for the {role} role"
                )));
            }
            RoleDescriptor::child(role, channel, index)
                .ok_or_else(|| malformed(format!("{role} cannot be launched as a child")))?
        }
    };

    let descriptor = match args.host_process_id {
        Some(pid) => {
            let pid = parse_u32(HOST_PROCESS_ID_FLAG, &pid)?;
            descriptor.with_host_process(pid, args.exit_if_parent_closed)
        }
        None if args.exit_if_parent_closed => {
            return Err(malformed(format!(
                "--{EXIT_IF_PARENT_CLOSED_FLAG} requires --{HOST_PROCESS_ID_FLAG}"
            )));
        }
        None => descriptor,
    };
    Ok(descriptor.with_flags(flags))
}

/// Plain decimal digits only; `str::parse` alone would also take a sign.
fn parse_u32(name: &str, value: &str) -> Result<u32, ClassificationError> {
    let invalid = || malformed(format!("--{name}={value} is not a valid number"));
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    value.parse().map_err(|_| invalid())
}

fn parse_feature_list(list: &str) -> FeatureFlags {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.split_once('=').unwrap_or((entry, "")))
        .collect()
}
