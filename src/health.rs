use std::sync::Arc;

use ipscell_host::HostAdapter;

use crate::network::NetworkController;
use crate::ports::PortsStore;

const FALLBACK_READY_PORT: u16 = 22;

/// Infers liveness and readiness from host observations.
///
/// Readiness prefers the statusz HTTP endpoint when one is declared and
/// falls back to a TCP connect on the first reserved port. Probe failures
/// of any kind read as "not ready"; they are never errors.
#[derive(Clone)]
pub struct HealthProber {
    host: Arc<dyn HostAdapter>,
    sandbox_id: String,
    ports: PortsStore,
    network: NetworkController,
}

impl HealthProber {
    pub fn new(host: Arc<dyn HostAdapter>, sandbox_id: impl Into<String>) -> Self {
        let sandbox_id = sandbox_id.into();
        Self {
            ports: PortsStore::new(host.clone(), sandbox_id.clone()),
            network: NetworkController::new(host.clone(), sandbox_id.clone()),
            host,
            sandbox_id,
        }
    }

    /// True when the container runtime reports the sandbox RUNNING.
    pub async fn container_running(&self) -> bool {
        let cmd = format!("lxc-info -n {} | grep state:", self.sandbox_id);
        match self.host.exec(&cmd).await {
            Ok(out) => out
                .split(':')
                .nth(1)
                .map(|state| state.trim() == "RUNNING")
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn ready_port(&self) -> u16 {
        self.ports
            .reserved_ports()
            .await
            .first()
            .copied()
            .unwrap_or(FALLBACK_READY_PORT)
    }

    async fn probe(&self) -> bool {
        let address = match self.network.ipv4_address().await {
            Ok(Some(address)) => address,
            _ => return false,
        };
        if let Some(port) = self.ports.statusz_port().await {
            let url = format!("http://{address}:{port}/healthz");
            return matches!(self.host.url_get(&url).await, Ok(body) if body == "ok");
        }
        self.host.connect_ok(&address, self.ready_port().await).await
    }

    /// RUNNING and answering its readiness probe.
    pub async fn is_ready(&self) -> bool {
        self.container_running().await && self.probe().await
    }

    /// RUNNING but not yet (or no longer) answering its readiness probe.
    pub async fn is_boot(&self) -> bool {
        self.container_running().await && !self.probe().await
    }
}
