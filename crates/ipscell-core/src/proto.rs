use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::IpsCellError;

/// Derived life-cycle state of a sandbox. Never stored; always recomputed
/// from host observations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    None,
    Provisioning,
    Failed,
    Stop,
    Boot,
    Ready,
    Archiving,
    Archived,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::None => "NONE",
            State::Provisioning => "PROVISIONING",
            State::Failed => "FAILED",
            State::Stop => "STOP",
            State::Boot => "BOOT",
            State::Ready => "READY",
            State::Archiving => "ARCHIVING",
            State::Archived => "ARCHIVED",
        };
        write!(f, "{name}")
    }
}

/// Control event accepted by the sandbox state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Provisioning,
    Start,
    OpenNetwork,
    LameduckNetwork,
    Shutdown,
    Reboot,
    Stop,
    Destroy,
    Archive,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Provisioning => "PROVISIONING",
            Event::Start => "START",
            Event::OpenNetwork => "OPEN_NETWORK",
            Event::LameduckNetwork => "LAMEDUCK_NETWORK",
            Event::Shutdown => "SHUTDOWN",
            Event::Reboot => "REBOOT",
            Event::Stop => "STOP",
            Event::Destroy => "DESTROY",
            Event::Archive => "ARCHIVE",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for Event {
    type Err = IpsCellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROVISIONING" => Ok(Event::Provisioning),
            "START" => Ok(Event::Start),
            "OPEN_NETWORK" => Ok(Event::OpenNetwork),
            "LAMEDUCK_NETWORK" => Ok(Event::LameduckNetwork),
            "SHUTDOWN" => Ok(Event::Shutdown),
            "REBOOT" => Ok(Event::Reboot),
            "STOP" => Ok(Event::Stop),
            "DESTROY" => Ok(Event::Destroy),
            "ARCHIVE" => Ok(Event::Archive),
            other => Err(IpsCellError::Config(format!("unknown event: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// `(role, owner)` identity grouping versioned sandboxes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenericName {
    pub role: String,
    pub owner: String,
}

impl GenericName {
    pub fn new(role: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            owner: owner.into(),
        }
    }

    /// Owner with dots replaced by dashes, as used in registry names and
    /// link paths.
    pub fn owner_dashed(&self) -> String {
        self.owner.replace('.', "-")
    }

    /// Registry-internal generic name, `ips-sandbox_<role>.<owner-dashed>`.
    pub fn internal_name(&self) -> String {
        format!("ips-sandbox_{}.{}", self.role, self.owner_dashed())
    }

    /// Recovers a GenericName from the suffix of an internal name
    /// (`<role>.<owner-dashed>`). Splits on `.` and maps dashes back to
    /// dots in both segments; owners that legitimately contained dots do
    /// not survive this round trip, matching the registry's behavior.
    pub fn from_internal_suffix(suffix: &str) -> Option<Self> {
        let mut parts = suffix.trim().split('.');
        let role = parts.next()?.replace('-', ".");
        let owner = parts.next()?.replace('-', ".");
        Some(Self { role, owner })
    }
}

/// Resource requirements of a provisioning request.
///
/// `ports` entries are the raw port-file lines, so an entry may carry flags
/// after the port number (e.g. `"8080 statusz"`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub disk: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

impl Requirements {
    pub fn is_empty(&self) -> bool {
        self.disk.is_empty() && self.ports.is_empty()
    }
}

/// On-disk sandbox record, stored as `sandbox.proto` next to the container
/// configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRecord {
    #[serde(default)]
    pub sandbox_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub system_options: String,
    #[serde(default)]
    pub provisioning_time: i64,
    #[serde(default)]
    pub requirements: Requirements,
}

impl SandboxRecord {
    pub fn generic_name(&self) -> GenericName {
        GenericName::new(self.role.clone(), self.owner.clone())
    }

    /// Renders the record in the protobuf-style text form kept on disk.
    /// Default-valued fields are omitted.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        push_string_field(&mut out, 0, "sandbox_id", &self.sandbox_id);
        push_string_field(&mut out, 0, "role", &self.role);
        push_string_field(&mut out, 0, "owner", &self.owner);
        push_string_field(&mut out, 0, "version", &self.version);
        push_string_field(&mut out, 0, "system", &self.system);
        push_string_field(&mut out, 0, "system_options", &self.system_options);
        if self.provisioning_time != 0 {
            out.push_str(&format!("provisioning_time: {}\n", self.provisioning_time));
        }
        if !self.requirements.is_empty() {
            out.push_str("requirements {\n");
            push_string_field(&mut out, 2, "disk", &self.requirements.disk);
            for port in &self.requirements.ports {
                push_string_field(&mut out, 2, "ports", port);
            }
            out.push_str("}\n");
        }
        out
    }

    /// Parses the text form. Unknown keys are ignored so records written by
    /// older agents still load.
    pub fn from_text(text: &str) -> Result<Self, IpsCellError> {
        let mut record = SandboxRecord::default();
        let mut in_requirements = false;
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if line == "requirements {" {
                in_requirements = true;
                continue;
            }
            if line == "}" {
                in_requirements = false;
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(IpsCellError::MalformedRecord(format!(
                    "expected 'key: value', got '{line}'"
                )));
            };
            let key = key.trim();
            let value = value.trim();
            if in_requirements {
                match key {
                    "disk" => record.requirements.disk = parse_string(value)?,
                    "ports" => record.requirements.ports.push(parse_string(value)?),
                    _ => {}
                }
                continue;
            }
            match key {
                "sandbox_id" => record.sandbox_id = parse_string(value)?,
                "role" => record.role = parse_string(value)?,
                "owner" => record.owner = parse_string(value)?,
                "version" => record.version = parse_string(value)?,
                "system" => record.system = parse_string(value)?,
                "system_options" => record.system_options = parse_string(value)?,
                "provisioning_time" => {
                    record.provisioning_time = value.parse().map_err(|_| {
                        IpsCellError::MalformedRecord(format!(
                            "provisioning_time is not an integer: '{value}'"
                        ))
                    })?;
                }
                _ => {}
            }
        }
        Ok(record)
    }
}

fn push_string_field(out: &mut String, indent: usize, key: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    out.push_str(&format!("{:indent$}{key}: \"{escaped}\"\n", ""));
}

fn parse_string(value: &str) -> Result<String, IpsCellError> {
    if let Some(inner) = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Ok(inner.replace("\\\"", "\"").replace("\\\\", "\\"))
    } else if value.starts_with('"') {
        Err(IpsCellError::MalformedRecord(format!(
            "unterminated string: {value}"
        )))
    } else {
        // Bare scalars show up for numeric fields read as strings.
        Ok(value.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendEventRequest {
    pub event: Event,
    /// Provisioning request payload; required for `PROVISIONING`, ignored
    /// for everything else.
    #[serde(default)]
    pub spec: Option<SandboxRecord>,
}

impl SendEventRequest {
    pub fn new(event: Event) -> Self {
        Self { event, spec: None }
    }

    pub fn provisioning(spec: SandboxRecord) -> Self {
        Self {
            event: Event::Provisioning,
            spec: Some(spec),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendEventResponse {
    pub status: ResponseStatus,
    pub description: String,
}

impl SendEventResponse {
    pub fn success(description: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            description: description.into(),
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failed,
            description: description.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetStateResponse {
    pub state: State,
    /// Task progress while PROVISIONING or ARCHIVING, empty otherwise.
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlternativesMode {
    Auto,
    Manual,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlternativeEntry {
    pub sandbox: SandboxRecord,
    pub priority: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetAlternativesResponse {
    pub mode: AlternativesMode,
    pub current_sandbox_id: String,
    pub alternatives: Vec<AlternativeEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetAlternativeResponse {
    pub status: ResponseStatus,
    pub description: String,
}
