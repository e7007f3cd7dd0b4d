use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// A hypervisor node that can host guests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub online: bool,
}

/// Guest operating system family; decides how the OS gets installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Some(Self::Linux),
            "windows" => Some(Self::Windows),
            _ => None,
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The guest's single NIC, bound to the address allocated for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub bridge: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub vlan: Option<u16>,
    pub rate_limit_mbps: Option<u32>,
}

/// How the guest OS gets onto the root disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsInstall {
    /// Full clone of an existing template guest, looked up by name.
    CloneFromTemplate { template: String },
    /// Fresh guest whose root disk is imported from a named template image.
    NamedTemplate { template: String },
    /// Fresh guest booting an installer ISO from the given device.
    IsoBoot { iso: String, device: String },
}

/// Everything the hypervisor needs to create a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub vmid: u32,
    pub name: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub storage: String,
    pub os_family: OsFamily,
    pub network: NetworkInterface,
    pub nameserver: Option<Ipv4Addr>,
    pub install: OsInstall,
}

/// Hypervisor-reported guest state, verbatim (`running`, `stopped`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmStatus {
    pub status: String,
}

/// Handle of an asynchronous remote task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef(pub String);

/// A backup archive as listed by the hypervisor's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupVolume {
    pub volid: String,
    pub size_bytes: Option<u64>,
    pub created_at: Option<i64>,
}
