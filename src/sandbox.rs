use std::sync::Arc;

use ipscell_core::proto::{
    Event, GetStateResponse, SandboxRecord, SendEventRequest, SendEventResponse, State,
};
use ipscell_core::IpsCellError;
use ipscell_host::HostAdapter;
use tokio::sync::Semaphore;

use crate::alternatives::Alternatives;
use crate::config::Config;
use crate::health::HealthProber;
use crate::layout;
use crate::network::NetworkController;
use crate::ports::PortsStore;
use crate::tasks::{ArchiveTask, ProvisioningTask};
use crate::worker::{LongTask, TaskKind, TaskStatus, TaskWorker};

/// One managed sandbox and its state machine.
///
/// State is derived, never stored: every query probes the container
/// runtime, the on-disk layout and the health endpoint, in a fixed order
/// that the allowed-event matrix depends on. Long-running work
/// (provisioning, archiving) goes through the sandbox's single-slot
/// [`TaskWorker`]; everything else runs synchronously on the caller.
pub struct Sandbox {
    id: String,
    host: Arc<dyn HostAdapter>,
    config: Arc<Config>,
    ports: PortsStore,
    network: NetworkController,
    prober: HealthProber,
    worker: TaskWorker,
    gate: Arc<Semaphore>,
}

fn allowed_events(state: State) -> &'static [Event] {
    match state {
        State::None => &[Event::Provisioning],
        State::Failed => &[Event::Provisioning],
        State::Stop => &[Event::Start, Event::Archive],
        State::Boot => &[
            Event::Reboot,
            Event::Shutdown,
            Event::LameduckNetwork,
            Event::Stop,
        ],
        State::Ready => &[
            Event::Reboot,
            Event::Shutdown,
            Event::OpenNetwork,
            Event::LameduckNetwork,
            Event::Stop,
        ],
        State::Archived => &[Event::Destroy],
        State::Provisioning | State::Archiving => &[],
    }
}

impl Sandbox {
    pub fn new(
        sandbox_id: impl Into<String>,
        host: Arc<dyn HostAdapter>,
        config: Arc<Config>,
        gate: Arc<Semaphore>,
    ) -> Self {
        let id = sandbox_id.into();
        Self {
            ports: PortsStore::new(host.clone(), id.clone()),
            network: NetworkController::new(host.clone(), id.clone()),
            prober: HealthProber::new(host.clone(), id.clone()),
            worker: TaskWorker::spawn(),
            host,
            config,
            id,
            gate,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network(&self) -> &NetworkController {
        &self.network
    }

    pub async fn record(&self) -> SandboxRecord {
        read_record(&self.host, &self.id).await
    }

    fn task_matches(&self, kind: TaskKind, status: TaskStatus) -> Option<String> {
        let task = self.worker.current_task()?;
        (task.kind == kind && task.status == status).then_some(task.progress)
    }

    /// Derives the current state. The probe order is load-bearing.
    pub async fn state(&self) -> GetStateResponse {
        if self.prober.is_ready().await {
            return plain(State::Ready);
        }
        if self.prober.is_boot().await {
            return plain(State::Boot);
        }
        if let Some(progress) = self.task_matches(TaskKind::Provisioning, TaskStatus::Creating) {
            return GetStateResponse {
                state: State::Provisioning,
                description: progress,
            };
        }
        if let Some(progress) = self.task_matches(TaskKind::Archive, TaskStatus::Archiving) {
            return GetStateResponse {
                state: State::Archiving,
                description: progress,
            };
        }

        let config_exists = self.host.exists(&layout::config_path(&self.id)).await;
        let archive_exists = self.host.exists(&layout::archive_path(&self.id)).await;
        if !config_exists && archive_exists {
            return plain(State::Archived);
        }
        if let Some(progress) = self.task_matches(TaskKind::Provisioning, TaskStatus::Failed) {
            return GetStateResponse {
                state: State::Failed,
                description: progress,
            };
        }
        if !self.prober.container_running().await && config_exists && !archive_exists {
            return plain(State::Stop);
        }
        if !config_exists && !archive_exists && self.worker.current_task().is_none() {
            return plain(State::None);
        }
        tracing::debug!(sandbox_id = %self.id, "no state predicate matched; reporting NONE");
        plain(State::None)
    }

    /// Events acceptable in the current derived state.
    pub async fn valid_events(&self) -> Vec<Event> {
        allowed_events(self.state().await.state).to_vec()
    }

    pub async fn send_event(&self, request: SendEventRequest) -> SendEventResponse {
        let current = self.state().await;
        if !allowed_events(current.state).contains(&request.event) {
            return SendEventResponse::failed(format!(
                "{} not allowed in the current status.",
                request.event
            ));
        }
        let result = match request.event {
            Event::Start => self.start().await,
            Event::Reboot => self.reboot().await,
            Event::Shutdown => self.shutdown().await,
            Event::Stop => self.stop().await,
            Event::Destroy => destroy_sandbox(&self.host, &self.id).await,
            Event::OpenNetwork => self.network.open_network(None).await,
            Event::LameduckNetwork => self.network.lameduck(false).await,
            Event::Archive => self.archive(),
            Event::Provisioning => self.provisioning(&request),
        };
        match result {
            Ok(description) => SendEventResponse::success(description),
            Err(e) => SendEventResponse::failed(e.to_string()),
        }
    }

    async fn start(&self) -> Result<String, IpsCellError> {
        self.network.set_accept_ra().await?;
        let out = self.host.exec(&format!("lxc-start -d -n {}", self.id)).await?;
        // Open the statusz port right away so readiness is probeable
        // before the operator decides to take traffic.
        if let Some(port) = self.ports.statusz_port().await {
            self.network.open_network(Some(vec![port])).await?;
        }
        Ok(out)
    }

    async fn reboot(&self) -> Result<String, IpsCellError> {
        self.host.exec(&format!("lxc-shutdown -r -n {}", self.id)).await
    }

    async fn shutdown(&self) -> Result<String, IpsCellError> {
        let mut out = self.host.exec(&format!("lxc-shutdown -n {}", self.id)).await?;
        out.push_str(&self.network.lameduck(true).await?);
        Ok(out)
    }

    async fn stop(&self) -> Result<String, IpsCellError> {
        let mut out = self.host.exec(&format!("lxc-stop -n {}", self.id)).await?;
        out.push_str(&self.network.lameduck(true).await?);
        Ok(out)
    }

    fn archive(&self) -> Result<String, IpsCellError> {
        let task = ArchiveTask::new(self.host.clone(), self.id.clone());
        let progress = task.handle().snapshot().progress;
        self.worker.enqueue(Box::new(task))?;
        Ok(progress)
    }

    fn provisioning(&self, request: &SendEventRequest) -> Result<String, IpsCellError> {
        let spec = request.spec.clone().ok_or_else(|| {
            IpsCellError::Config("provisioning request is missing its sandbox spec".into())
        })?;
        if spec.role.contains('.') || spec.role.contains('-') {
            return Err(IpsCellError::InvalidRoleName(spec.role));
        }
        if spec.owner.contains('-') {
            return Err(IpsCellError::InvalidOwnerName(spec.owner));
        }
        tracing::info!(sandbox_id = %self.id, role = %spec.role, "queueing provisioning task");
        let task = ProvisioningTask::new(
            self.host.clone(),
            self.config.clone(),
            self.id.clone(),
            spec,
            self.gate.clone(),
        );
        let progress = task.handle().snapshot().progress;
        self.worker.enqueue(Box::new(task))?;
        Ok(progress)
    }

    /// Free-text operator view: runtime info, memory accounting, and the
    /// sandbox's addresses.
    pub async fn info(&self) -> String {
        let mut infos = Vec::new();
        if let Ok(out) = self.host.exec(&format!("lxc-info -n {}", self.id)).await {
            if !out.is_empty() {
                infos.push(out);
            }
        }
        let cgroup = layout::cgroup_path(&self.id, "memory.stat");
        if self.host.exists(&cgroup).await {
            if let Ok(stat) = self.host.read_file(&cgroup).await {
                if !stat.is_empty() {
                    infos.push(stat);
                }
            }
        }
        if let Ok(Some(mac)) = self.network.hw_address().await {
            infos.push(mac);
        }
        if let Ok(Some(address)) = self.network.ipv4_address().await {
            infos.push(address);
        }
        if let Ok(Some(address)) = self.network.ipv6_address().await {
            infos.push(address);
        }
        infos.join("\n")
    }

    pub async fn help(&self) -> String {
        let path = layout::help_path(&self.id);
        if self.host.exists(&path).await {
            if let Ok(text) = self.host.read_file(&path).await {
                return text;
            }
        }
        format!("There's no help for this sandbox: {}", self.id)
    }
}

fn plain(state: State) -> GetStateResponse {
    GetStateResponse {
        state,
        description: String::new(),
    }
}

pub(crate) async fn read_record(host: &Arc<dyn HostAdapter>, sandbox_id: &str) -> SandboxRecord {
    match host.read_file(&layout::record_path(sandbox_id)).await {
        Ok(text) => SandboxRecord::from_text(&text).unwrap_or_else(|e| {
            tracing::warn!(sandbox_id, "unreadable sandbox record: {e}");
            SandboxRecord::default()
        }),
        Err(e) => {
            tracing::warn!(sandbox_id, "failed to read sandbox record: {e}");
            SandboxRecord::default()
        }
    }
}

/// Removes the container and its registry entry. Shared by the DESTROY
/// handler and the tail of archiving. The record is read before
/// `lxc-destroy` wipes the sandbox directory.
pub(crate) async fn destroy_sandbox(
    host: &Arc<dyn HostAdapter>,
    sandbox_id: &str,
) -> Result<String, IpsCellError> {
    let record = read_record(host, sandbox_id).await;
    let mut out = host.exec(&format!("lxc-destroy -n {sandbox_id}")).await?;
    let alternatives = Alternatives::new(record.generic_name(), host.clone());
    out.push_str(&alternatives.remove(sandbox_id).await?);
    Ok(out)
}
