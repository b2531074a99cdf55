use std::sync::Arc;

use ipscell_core::proto::{
    AlternativeEntry, AlternativesMode, GenericName, GetAlternativesResponse, SandboxRecord,
    SetAlternativeResponse,
};
use ipscell_core::IpsCellError;
use ipscell_host::HostAdapter;

use crate::layout;

const INTERNAL_PREFIX: &str = "ips-sandbox_";

/// Registry view parsed from `update-alternatives --query`.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryQuery {
    pub mode: AlternativesMode,
    pub current_target: String,
    pub alternatives: Vec<(String, i64)>,
}

/// Group of sandbox versions registered under one generic name.
///
/// Thin façade over the host `update-alternatives` database: each sandbox
/// directory is an alternative with its provisioning time as priority, and
/// the link under `/var/lib/ips-cell/sandbox` points at the current one.
pub struct Alternatives {
    name: GenericName,
    host: Arc<dyn HostAdapter>,
}

impl Alternatives {
    pub fn new(name: GenericName, host: Arc<dyn HostAdapter>) -> Self {
        Self { name, host }
    }

    pub fn name(&self) -> &GenericName {
        &self.name
    }

    /// Raw registry state for this generic name.
    pub async fn query(&self) -> Result<RegistryQuery, IpsCellError> {
        let out = self
            .host
            .exec(&format!(
                "update-alternatives --query {}",
                self.name.internal_name()
            ))
            .await?;
        Ok(parse_query(&out))
    }

    /// Registry view with each alternative's on-disk sandbox record
    /// attached. An unregistered name yields an empty MANUAL view.
    pub async fn get_alternatives(&self) -> GetAlternativesResponse {
        let query = match self.query().await {
            Ok(query) => query,
            Err(e) => {
                tracing::debug!(name = %self.name.internal_name(), "registry query failed: {e}");
                return GetAlternativesResponse {
                    mode: AlternativesMode::Manual,
                    current_sandbox_id: String::new(),
                    alternatives: Vec::new(),
                };
            }
        };

        let mut alternatives = Vec::new();
        for (target, priority) in &query.alternatives {
            let record = self
                .host
                .read_file(&format!("{target}/sandbox.proto"))
                .await
                .ok()
                .and_then(|text| SandboxRecord::from_text(&text).ok())
                .unwrap_or_default();
            alternatives.push(AlternativeEntry {
                sandbox: record,
                priority: *priority,
            });
        }
        GetAlternativesResponse {
            mode: query.mode,
            current_sandbox_id: basename(&query.current_target),
            alternatives,
        }
    }

    /// Current sandbox id for this generic name, if any.
    pub async fn current_sandbox_id(&self) -> Option<String> {
        let id = self.get_alternatives().await.current_sandbox_id;
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    /// Pins `sandbox_id` as the current alternative, or switches to AUTO
    /// (highest priority wins) when no id is given.
    pub async fn set(&self, sandbox_id: Option<&str>) -> SetAlternativeResponse {
        let name = self.name.internal_name();
        let cmd = match sandbox_id {
            Some(id) => format!(
                "update-alternatives --set {name} {}",
                layout::sandbox_dir(id)
            ),
            None => format!("update-alternatives --auto {name}"),
        };
        match self.host.exec(&cmd).await {
            Ok(_) => SetAlternativeResponse {
                status: ipscell_core::proto::ResponseStatus::Success,
                description: String::new(),
            },
            Err(e) => SetAlternativeResponse {
                status: ipscell_core::proto::ResponseStatus::Failed,
                description: e.output(),
            },
        }
    }

    /// Registers a sandbox under this generic name, creating the per-owner
    /// link directory on first use.
    pub async fn install(&self, sandbox_id: &str, priority: i64) -> Result<String, IpsCellError> {
        let link_dir = layout::alternatives_link_dir(&self.name);
        if !self.host.exists(&link_dir).await {
            self.host.make_dir(&link_dir, 0o755).await?;
        }
        let cmd = format!(
            "update-alternatives --install {} {} {} {priority}",
            layout::alternatives_link(&self.name),
            self.name.internal_name(),
            layout::sandbox_dir(sandbox_id),
        );
        self.host.exec(&cmd).await
    }

    pub async fn remove(&self, sandbox_id: &str) -> Result<String, IpsCellError> {
        let cmd = format!(
            "update-alternatives --remove {} {}",
            self.name.internal_name(),
            layout::sandbox_dir(sandbox_id),
        );
        self.host.exec(&cmd).await
    }

    /// Every generic name present in the registry.
    ///
    /// Parses `--get-selections` output; the suffix after the prefix is
    /// split on `.` into role and owner, dashes mapped back to dots.
    pub async fn generic_names(
        host: &Arc<dyn HostAdapter>,
    ) -> Result<Vec<GenericName>, IpsCellError> {
        let out = host.exec("update-alternatives --get-selections").await?;
        let mut names = Vec::new();
        for line in out.lines() {
            let Some(token) = line.split_whitespace().next() else {
                continue;
            };
            let Some(suffix) = token.strip_prefix(INTERNAL_PREFIX) else {
                continue;
            };
            match GenericName::from_internal_suffix(suffix) {
                Some(name) => names.push(name),
                None => {
                    tracing::warn!(token, "skipping malformed registry selection");
                }
            }
        }
        Ok(names)
    }
}

fn parse_query(out: &str) -> RegistryQuery {
    let mut mode = AlternativesMode::Manual;
    let mut current_target = String::new();
    let mut alternatives: Vec<(String, i64)> = Vec::new();
    for line in out.lines() {
        if let Some(status) = line.strip_prefix("Status:") {
            if status.trim() == "auto" {
                mode = AlternativesMode::Auto;
            }
        } else if let Some(value) = line.strip_prefix("Value:") {
            current_target = value.trim().to_string();
        } else if let Some(target) = line.strip_prefix("Alternative:") {
            alternatives.push((target.trim().to_string(), 0));
        } else if let Some(priority) = line.strip_prefix("Priority:") {
            if let (Some(last), Ok(priority)) =
                (alternatives.last_mut(), priority.trim().parse::<i64>())
            {
                last.1 = priority;
            }
        }
    }
    RegistryQuery {
        mode,
        current_target,
        alternatives,
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or("").to_string()
}
