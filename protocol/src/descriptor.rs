use std::collections::BTreeMap;
use std::fmt;

use crate::ProcessRole;

/// Opaque name of the channel a child attaches to.
///
/// Ids are restricted to `[A-Za-z0-9._:-]` so that they can be embedded in a
/// socket file name or an `fd:<n>` reference without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid channel id `{0}`")]
pub struct InvalidChannelId(pub String);

impl ChannelId {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidChannelId> {
        let value = value.into();
        let valid = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidChannelId(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Feature switches passed on the command line as `--name` or `--name=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFlags(BTreeMap<String, String>);

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// A switch is enabled when present with no value or with any value
    /// other than `0`/`false`.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|value| !matches!(value, "0" | "false"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders the flags back into command-line tokens for a child process.
    pub fn to_args(&self) -> Vec<String> {
        self.iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    format!("--{name}")
                } else {
                    format!("--{name}={value}")
                }
            })
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for FeatureFlags
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParentLink {
    channel: ChannelId,
    index: u32,
}

/// What this process is, resolved once from its command line.
///
/// A descriptor for a child role always carries the channel id and process
/// index it was launched with; a `Main` descriptor never does. There are no
/// setters: the `with_*` methods consume the value while it is being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDescriptor {
    role: ProcessRole,
    parent: Option<ParentLink>,
    flags: FeatureFlags,
    host_process_id: Option<u32>,
    exit_if_parent_closed: bool,
    positional: Vec<String>,
}

impl RoleDescriptor {
    pub fn main() -> Self {
        Self {
            role: ProcessRole::Main,
            parent: None,
            flags: FeatureFlags::default(),
            host_process_id: None,
            exit_if_parent_closed: false,
            positional: Vec::new(),
        }
    }

    /// Returns `None` for [`ProcessRole::Main`], which has no parent channel.
    pub fn child(role: ProcessRole, channel: ChannelId, index: u32) -> Option<Self> {
        role.is_child().then(|| Self {
            role,
            parent: Some(ParentLink { channel, index }),
            flags: FeatureFlags::default(),
            host_process_id: None,
            exit_if_parent_closed: false,
            positional: Vec::new(),
        })
    }

    pub fn with_flags(mut self, flags: FeatureFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_host_process(mut self, pid: u32, exit_if_parent_closed: bool) -> Self {
        self.host_process_id = Some(pid);
        self.exit_if_parent_closed = exit_if_parent_closed;
        self
    }

    pub fn with_positional(mut self, positional: Vec<String>) -> Self {
        self.positional = positional;
        self
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.parent.as_ref().map(|link| &link.channel)
    }

    /// Process index assigned by the parent; `0` for `Main`.
    pub fn index(&self) -> u32 {
        self.parent.as_ref().map_or(0, |link| link.index)
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn host_process_id(&self) -> Option<u32> {
        self.host_process_id
    }

    pub fn exit_if_parent_closed(&self) -> bool {
        self.exit_if_parent_closed
    }

    pub fn positional(&self) -> &[String] {
        &self.positional
    }
}
