//! Configuration sent to the container init process.
//!
//! The parent serializes an [`InitConfig`] to the sync socket once the
//! grandchild pid is known. The parent itself only consumes a handful
//! of fields (namespaces, rlimits, oom score, hooks, networks, cgroup
//! paths, labels); everything else is applied on the child side.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::runtime::hooks::Hooks;

/// Kernel namespace kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// Mount namespace.
    Mount,
    /// UTS namespace.
    Uts,
    /// IPC namespace.
    Ipc,
    /// User namespace.
    User,
    /// Pid namespace.
    Pid,
    /// Network namespace.
    Net,
    /// Cgroup namespace.
    Cgroup,
}

/// A namespace the container is placed in. Without a path a new
/// namespace is created; with a path the child enters the existing one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace kind.
    #[serde(rename = "type")]
    pub typ: NamespaceType,
    /// Path of a pre-existing namespace to enter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// The set of namespaces configured for a container.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespaces(Vec<Namespace>);

impl Namespaces {
    /// Whether a namespace of `typ` is configured.
    pub fn contains(&self, typ: NamespaceType) -> bool {
        self.0.iter().any(|ns| ns.typ == typ)
    }

    /// Path of the pre-existing namespace of `typ`, if one is
    /// configured.
    pub fn path_of(&self, typ: NamespaceType) -> Option<&Path> {
        self.0
            .iter()
            .find(|ns| ns.typ == typ)
            .and_then(|ns| ns.path.as_deref())
    }
}

impl From<Vec<Namespace>> for Namespaces {
    fn from(namespaces: Vec<Namespace>) -> Self {
        Namespaces(namespaces)
    }
}

/// A uid or gid mapping for a user namespace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdMap {
    /// First id inside the container.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of mapped ids.
    pub size: u32,
}

/// A mount performed by the init process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mount {
    /// Mount source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Mount target.
    pub target: PathBuf,
    /// Filesystem type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fstype: Option<String>,
    /// Mount flags, MS_* bits.
    #[serde(default)]
    pub flags: u64,
    /// Filesystem specific mount data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Resources limited via rlimits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum RlimitResource {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Locks,
    Memlock,
    Msgqueue,
    Nice,
    Nofile,
    Nproc,
    Rss,
    Rtprio,
    Rttime,
    Sigpending,
    Stack,
}

/// A resource limit installed on the container process while the parent
/// still has the privilege to raise it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limited resource.
    #[serde(rename = "type")]
    pub resource: RlimitResource,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// A network attached to the container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Network {
    /// Strategy kind, e.g. "loopback".
    #[serde(rename = "type")]
    pub typ: String,
    /// Interface name inside the container. May be assigned by the
    /// strategy.
    #[serde(default)]
    pub name: String,
    /// Interface address in CIDR notation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Gateway address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Container configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Configuration format version.
    pub version: String,
    /// Namespaces to create or enter.
    #[serde(default)]
    pub namespaces: Namespaces,
    /// Mounts performed by the init process.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    /// Uid mappings for the user namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMap>,
    /// Gid mappings for the user namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMap>,
    /// oom_score_adj installed on the container process. Zero is the
    /// kernel default and is not written.
    #[serde(default)]
    pub oom_score_adj: i32,
    /// Lifecycle hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    /// Networks to create interfaces for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,
    /// Cgroup path per controller, used when attaching an additional
    /// process to a running container.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cgroup_paths: HashMap<String, String>,
    /// Free form `key=value` labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

impl Config {
    /// Value of the first `key=value` label matching `key`.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .filter_map(|label| label.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// The payload sent to the init process after the pid handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitConfig {
    /// Container configuration.
    pub config: Config,
    /// Resource limits installed from the parent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,
    /// Networks materialized by the parent, interface names assigned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn namespaces(namespaces: &[(NamespaceType, Option<&str>)]) -> Namespaces {
        namespaces
            .iter()
            .map(|(typ, path)| Namespace {
                typ: *typ,
                path: path.map(PathBuf::from),
            })
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn namespace_contains() {
        let namespaces = namespaces(&[(NamespaceType::Mount, None), (NamespaceType::Pid, None)]);
        assert!(namespaces.contains(NamespaceType::Mount));
        assert!(!namespaces.contains(NamespaceType::Net));
    }

    #[test]
    fn namespace_path_of() {
        let namespaces = namespaces(&[
            (NamespaceType::Net, Some("/var/run/netns/blue")),
            (NamespaceType::Cgroup, None),
        ]);
        assert_eq!(
            namespaces.path_of(NamespaceType::Net),
            Some(Path::new("/var/run/netns/blue"))
        );
        assert_eq!(namespaces.path_of(NamespaceType::Cgroup), None);
        assert_eq!(namespaces.path_of(NamespaceType::Pid), None);
    }

    #[test]
    fn namespace_wire_format() {
        let ns = Namespace {
            typ: NamespaceType::Cgroup,
            path: None,
        };
        assert_eq!(
            serde_json::to_string(&ns).unwrap(),
            "{\"type\":\"cgroup\"}"
        );
    }

    #[test]
    fn label_lookup() {
        let config = Config {
            version: "1.0.0".into(),
            namespaces: Namespaces::default(),
            mounts: vec![],
            uid_mappings: vec![],
            gid_mappings: vec![],
            oom_score_adj: 0,
            hooks: None,
            networks: vec![],
            cgroup_paths: HashMap::new(),
            labels: vec!["bundle=/var/lib/cnt/abc".into(), "tier=prod".into()],
        };
        assert_eq!(config.label("bundle"), Some("/var/lib/cnt/abc"));
        assert_eq!(config.label("tier"), Some("prod"));
        assert_eq!(config.label("missing"), None);
    }

    #[test]
    fn rlimit_wire_format() {
        let rlimit = Rlimit {
            resource: RlimitResource::Nofile,
            soft: 1024,
            hard: 4096,
        };
        assert_eq!(
            serde_json::to_string(&rlimit).unwrap(),
            "{\"type\":\"NOFILE\",\"soft\":1024,\"hard\":4096}"
        );
    }
}
