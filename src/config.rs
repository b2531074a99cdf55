use ipscell_core::IpsCellError;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_sandbox_vgname() -> String {
    String::new()
}
fn default_dev() -> String {
    "eth0".into()
}
fn default_shared_dir() -> String {
    "/srv/ips/users".into()
}
fn default_data_dir() -> String {
    "./ipscell.data".into()
}

/// Process-wide agent options.
///
/// `sandbox_vgname` empty means LVM-backed sandboxes cannot be provisioned
/// on this host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_sandbox_vgname")]
    pub sandbox_vgname: String,
    /// Host device whose first IPv4 address fronts the DNAT rules.
    #[serde(default = "default_dev")]
    pub dev: String,
    /// Parent of the per-owner shared directories bind-mounted into
    /// sandboxes.
    #[serde(default = "default_shared_dir")]
    pub shared_dir: String,
    /// Where the agent keeps its own state (log files).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_vgname: default_sandbox_vgname(),
            dev: default_dev(),
            shared_dir: default_shared_dir(),
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Loads `ipscell.yaml` (or `$IPSCELL_CONFIG`), then applies
    /// environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self, IpsCellError> {
        let path =
            std::env::var("IPSCELL_CONFIG").unwrap_or_else(|_| "ipscell.yaml".to_string());
        let mut config = Self::load_file(Path::new(&path))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, IpsCellError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|e| {
            IpsCellError::Config(format!("failed to parse {}: {e}", path.display()))
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(vg) = std::env::var("IPSCELL_VGNAME") {
            self.sandbox_vgname = vg;
        }
        if let Ok(dev) = std::env::var("IPSCELL_DEV") {
            self.dev = dev;
        }
        if let Ok(dir) = std::env::var("IPSCELL_SHARED_DIR") {
            self.shared_dir = dir;
        }
        if let Ok(dir) = std::env::var("IPSCELL_DATA_DIR") {
            self.data_dir = dir;
        }
    }

    pub fn lvm_available(&self) -> bool {
        !self.sandbox_vgname.is_empty()
    }
}
