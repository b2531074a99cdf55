use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use ipscell_core::proto::{
    Event, GenericName, GetAlternativesResponse, GetStateResponse, SendEventRequest,
    SendEventResponse, SetAlternativeResponse, State,
};
use ipscell_host::HostAdapter;
use tokio::sync::Semaphore;

use crate::alternatives::Alternatives;
use crate::config::Config;
use crate::layout;
use crate::sandbox::Sandbox;

/// Control-plane façade over the sandboxes on this host.
///
/// Resolves sandbox ids to live [`Sandbox`] instances (one worker each) and
/// carries the process-wide provisioning gate. Operations never fail at
/// this boundary; they answer with response records.
pub struct LxcSandboxService {
    host: Arc<dyn HostAdapter>,
    config: Arc<Config>,
    gate: Arc<Semaphore>,
    sandboxes: Mutex<HashMap<String, Arc<Sandbox>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl LxcSandboxService {
    pub fn new(host: Arc<dyn HostAdapter>, config: Config) -> Self {
        Self {
            host,
            config: Arc::new(config),
            gate: Arc::new(Semaphore::new(1)),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Live sandbox instance for `sandbox_id`, created on first use so its
    /// worker and task history survive across requests.
    pub fn sandbox(&self, sandbox_id: &str) -> Arc<Sandbox> {
        let mut sandboxes = lock(&self.sandboxes);
        sandboxes
            .entry(sandbox_id.to_string())
            .or_insert_with(|| {
                Arc::new(Sandbox::new(
                    sandbox_id,
                    self.host.clone(),
                    self.config.clone(),
                    self.gate.clone(),
                ))
            })
            .clone()
    }

    /// Known sandbox ids: the container listing plus every archive
    /// tarball, sorted. The listing filter drops RUNNING/FROZEN/STOPPED
    /// lines, which hides most live containers; kept for compatibility
    /// with existing clients (see CHANGELOG).
    pub async fn get_sandboxes(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();

        let cmd = "lxc-ls | grep -v RUNNING | grep -v FROZEN | grep -v STOPPED| grep -v \"^$\"";
        match self.host.exec(cmd).await {
            Ok(out) => {
                for line in out.lines() {
                    let id = line.trim();
                    if !id.is_empty() {
                        ids.insert(id.to_string());
                    }
                }
            }
            Err(e) => {
                tracing::debug!("container listing failed: {e}");
            }
        }

        for archive in self
            .host
            .glob(&format!("{}/*.tar.bz2", layout::ARCHIVE_DIR))
            .await
        {
            let name = archive.rsplit('/').next().unwrap_or("");
            // Strip the two-part .tar.bz2 extension; dots in the id
            // itself survive.
            let parts: Vec<&str> = name.split('.').collect();
            if parts.len() > 2 {
                ids.insert(parts[..parts.len() - 2].join("."));
            }
        }

        ids.into_iter().collect()
    }

    /// Sandboxes in a workable state (STOP, BOOT or READY).
    pub async fn get_available_sandboxes(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for id in self.get_sandboxes().await {
            let state = self.sandbox(&id).state().await.state;
            if matches!(state, State::Stop | State::Boot | State::Ready) {
                ids.push(id);
            }
        }
        ids
    }

    pub async fn get_generic_names(&self) -> Vec<GenericName> {
        match Alternatives::generic_names(&self.host).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("failed to enumerate generic names: {e}");
                Vec::new()
            }
        }
    }

    pub async fn get_alternatives(&self, name: &GenericName) -> GetAlternativesResponse {
        Alternatives::new(name.clone(), self.host.clone())
            .get_alternatives()
            .await
    }

    pub async fn set_alternative(
        &self,
        name: &GenericName,
        sandbox_id: Option<&str>,
    ) -> SetAlternativeResponse {
        Alternatives::new(name.clone(), self.host.clone())
            .set(sandbox_id)
            .await
    }

    /// Host-wide container listing, as printed by the container tool.
    pub async fn get_status(&self) -> String {
        match self.host.exec("lxc-list").await {
            Ok(out) => out,
            Err(e) => e.to_string(),
        }
    }

    pub async fn get_info(&self, sandbox_id: &str) -> String {
        self.sandbox(sandbox_id).info().await
    }

    pub async fn get_state(&self, sandbox_id: &str) -> GetStateResponse {
        self.sandbox(sandbox_id).state().await
    }

    pub async fn get_valid_events(&self, sandbox_id: &str) -> Vec<Event> {
        self.sandbox(sandbox_id).valid_events().await
    }

    pub async fn get_help(&self, sandbox_id: &str) -> String {
        self.sandbox(sandbox_id).help().await
    }

    pub async fn send_event(
        &self,
        sandbox_id: &str,
        request: SendEventRequest,
    ) -> SendEventResponse {
        self.sandbox(sandbox_id).send_event(request).await
    }
}
