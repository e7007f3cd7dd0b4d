use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Every Proxmox response body is wrapped in `{"data": ...}`.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub data: T,
}

// ── Auth ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Ticket {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_token: String,
    pub username: String,
}

// ── Nodes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSummary {
    pub node: String,
    pub status: Option<String>,
    pub maxcpu: Option<u32>,
    pub maxmem: Option<u64>,
    pub mem: Option<u64>,
}

// ── QEMU ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct QemuSummary {
    pub vmid: u32,
    pub name: Option<String>,
    pub status: String,
    /// `1` for templates. Older releases send it as a string or omit it.
    #[serde(default)]
    pub template: Option<serde_json::Value>,
}

impl QemuSummary {
    pub fn is_template(&self) -> bool {
        match &self.template {
            Some(serde_json::Value::Number(n)) => n.as_u64() == Some(1),
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s == "1",
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QemuStatus {
    pub status: String,
    pub name: Option<String>,
    pub qmpstatus: Option<String>,
    pub uptime: Option<u64>,
}

/// Power actions under `/nodes/{node}/qemu/{vmid}/status/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Start,
    Stop,
    Reset,
    Shutdown,
}

impl StatusAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reset => "reset",
            Self::Shutdown => "shutdown",
        }
    }
}

// ── Tasks ───────────────────────────────────────────────────────────

/// Unique process id of an asynchronous Proxmox task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Upid(pub String);

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Proxmox reports `OK`, or `WARNINGS: n` for tasks that completed with warnings.
    pub fn succeeded(&self) -> bool {
        matches!(
            self.exitstatus.as_deref(),
            Some(s) if s == "OK" || s.starts_with("WARNINGS")
        )
    }
}

// ── Storage ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StorageVolume {
    pub volid: String,
    pub size: Option<u64>,
    pub ctime: Option<i64>,
    pub format: Option<String>,
    pub vmid: Option<u32>,
    pub content: Option<String>,
}

// ── Form parameters ─────────────────────────────────────────────────

/// Form-encoded request parameters, kept sorted so requests are reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl Serialize for Params {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}
