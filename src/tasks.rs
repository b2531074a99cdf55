use std::sync::Arc;

use async_trait::async_trait;
use ipscell_core::proto::SandboxRecord;
use ipscell_core::IpsCellError;
use ipscell_host::HostAdapter;
use tokio::sync::Semaphore;

use crate::alternatives::Alternatives;
use crate::config::Config;
use crate::layout;
use crate::network::NetworkController;
use crate::rootfs::RootfsMounter;
use crate::worker::{LongTask, TaskHandle, TaskKind, TaskStatus};

/// Creates a sandbox from a template and prepares its on-disk environment.
///
/// The heavy `lxc-create` step is serialized host-wide by the provisioning
/// gate; the cleanup, registration and record write run outside it. Any
/// failure flips the task to FAILED with the accumulated tool output as its
/// progress.
pub struct ProvisioningTask {
    host: Arc<dyn HostAdapter>,
    config: Arc<Config>,
    sandbox_id: String,
    spec: SandboxRecord,
    network: NetworkController,
    handle: TaskHandle,
    gate: Arc<Semaphore>,
}

impl ProvisioningTask {
    pub fn new(
        host: Arc<dyn HostAdapter>,
        config: Arc<Config>,
        sandbox_id: impl Into<String>,
        spec: SandboxRecord,
        gate: Arc<Semaphore>,
    ) -> Self {
        let sandbox_id = sandbox_id.into();
        Self {
            network: NetworkController::new(host.clone(), sandbox_id.clone()),
            host,
            config,
            sandbox_id,
            spec,
            handle: TaskHandle::new(TaskKind::Provisioning, TaskStatus::Creating),
            gate,
        }
    }

    fn wants_lvm(&self) -> bool {
        let disk = &self.spec.requirements.disk;
        !disk.is_empty() && disk != "-1"
    }

    async fn create(&self) -> Result<(), IpsCellError> {
        let mut cmd = format!(
            "lxc-create -n \"{}\" -t \"{}\"",
            self.sandbox_id, self.spec.system
        );
        if self.wants_lvm() {
            if !self.config.lvm_available() {
                return Err(IpsCellError::Config(
                    "No storage requirement is supported on this machine. \
                     Check the sandbox_vgname option."
                        .into(),
                ));
            }
            cmd.push_str(&format!(" -B lvm --vgname \"{}\"", self.config.sandbox_vgname));
            if !self.spec.requirements.disk.is_empty() {
                cmd.push_str(&format!(" --fssize \"{}\"", self.spec.requirements.disk));
            }
        }
        if !self.spec.system_options.is_empty() {
            cmd.push_str(&format!(" -- {}", self.spec.system_options));
        }

        let handle = self.handle.clone();
        let mut sink = |line: &str| handle.set_progress(line);
        self.host.exec_stream(&cmd, &mut sink).await?;
        Ok(())
    }

    async fn write_ports(&self) -> Result<(), IpsCellError> {
        if self.spec.requirements.ports.is_empty() {
            return Ok(());
        }
        let mut contents = String::new();
        for port in &self.spec.requirements.ports {
            contents.push_str(port);
            contents.push('\n');
        }
        let path = layout::ports_path(&self.sandbox_id);
        self.host.write_file(&format!("{path}.bak"), &contents).await?;
        self.host.rename(&format!("{path}.bak"), &path).await?;
        Ok(())
    }

    async fn setup_shared_storage(&self) -> Result<(), IpsCellError> {
        let shared = format!("{}/{}", self.config.shared_dir, self.spec.owner);
        if !self.host.exists(&shared).await {
            self.host.make_dir(&shared, 0o1777).await?;
        }

        // Replace any earlier shared-dir entry, then append ours.
        let fstab = layout::fstab_path(&self.sandbox_id);
        let existing = self.host.read_file(&fstab).await?;
        let mut kept = String::new();
        for line in existing.lines() {
            if !line.contains(&self.config.shared_dir) {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        self.host.write_file(&format!("{fstab}.t"), &kept).await?;
        self.host.rename(&format!("{fstab}.t"), &fstab).await?;
        self.host
            .append_file(&fstab, &format!("{shared} mnt none rbind 0 0\n"))
            .await?;
        Ok(())
    }

    async fn edit_rootfs(&self) -> Result<(), IpsCellError> {
        let mounter = RootfsMounter::new(self.host.clone(), self.sandbox_id.clone());
        let guard = mounter.acquire().await?;
        let rootfs = guard.path().to_string();
        let result = self.rootfs_edits(&rootfs).await;
        guard.release().await;
        result
    }

    async fn rootfs_edits(&self, rootfs: &str) -> Result<(), IpsCellError> {
        // A forced umount of the bind mount can take the host filesystem
        // down with it; strip -f from the guest's umountfs script.
        let umountfs = format!("{rootfs}/etc/init.d/umountfs");
        if self.host.exists(&umountfs).await {
            let script = self.host.read_file(&umountfs).await?;
            let tmp = format!("{rootfs}/tmp/umountfs.tmp");
            self.host
                .write_file(&tmp, &script.replace("umount -f", "umount"))
                .await?;
            self.host.rename(&tmp, &umountfs).await?;
        }

        let mac = self.network.hw_address().await?.ok_or_else(|| {
            IpsCellError::Config(format!(
                "no hardware address configured for sandbox {}",
                self.sandbox_id
            ))
        })?;
        let hostname = mac.replace(':', "-");
        self.host
            .write_file(&format!("{rootfs}/etc/hostname"), &hostname)
            .await?;
        self.host
            .append_file(
                &format!("{rootfs}/etc/hosts"),
                &format!("\n127.0.2.1\t{hostname}\n"),
            )
            .await?;

        let host_address = self.host.host_address().await?;
        let banner = format!(
            "{}/{}/{}@{host_address}",
            self.spec.role, self.spec.version, self.spec.owner
        );
        self.host
            .write_file(&format!("{rootfs}/etc/issue"), &format!("{banner} \\l\n\n"))
            .await?;
        self.host
            .write_file(&format!("{rootfs}/etc/debian_chroot"), &banner)
            .await?;
        Ok(())
    }

    async fn register(&self) -> Result<(), IpsCellError> {
        let alternatives = Alternatives::new(self.spec.generic_name(), self.host.clone());
        alternatives
            .install(&self.sandbox_id, self.spec.provisioning_time)
            .await?;
        Ok(())
    }

    async fn write_record(&self) -> Result<(), IpsCellError> {
        let path = layout::record_path(&self.sandbox_id);
        self.host
            .write_file(&format!("{path}.t"), &self.spec.to_text())
            .await?;
        self.host.rename(&format!("{path}.t"), &path).await?;
        Ok(())
    }

    async fn run_inner(&self) -> Result<(), IpsCellError> {
        {
            let _permit = self.gate.acquire().await.map_err(|_| {
                IpsCellError::Config("provisioning gate is closed".into())
            })?;
            self.create().await?;
        }
        self.write_ports().await?;
        self.setup_shared_storage().await?;
        self.edit_rootfs().await?;
        self.register().await?;
        self.write_record().await?;
        Ok(())
    }
}

#[async_trait]
impl LongTask for ProvisioningTask {
    fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    async fn run(self: Box<Self>) {
        tracing::info!(sandbox_id = %self.sandbox_id, "provisioning started");
        match self.run_inner().await {
            Ok(()) => {
                self.handle.set_status(TaskStatus::Created);
                tracing::info!(sandbox_id = %self.sandbox_id, "provisioning finished");
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %self.sandbox_id, "failed to create sandbox: {e}");
                self.handle.set_progress(e.output());
                self.handle.set_status(TaskStatus::Failed);
            }
        }
    }
}

/// Compresses a stopped sandbox into the archive tarball, then destroys the
/// live container and its registry entry.
pub struct ArchiveTask {
    host: Arc<dyn HostAdapter>,
    sandbox_id: String,
    handle: TaskHandle,
}

impl ArchiveTask {
    pub fn new(host: Arc<dyn HostAdapter>, sandbox_id: impl Into<String>) -> Self {
        Self {
            host,
            sandbox_id: sandbox_id.into(),
            handle: TaskHandle::new(TaskKind::Archive, TaskStatus::Archiving),
        }
    }

    async fn run_inner(&self) -> Result<(), IpsCellError> {
        let mounter = RootfsMounter::new(self.host.clone(), self.sandbox_id.clone());
        let guard = mounter.acquire().await?;

        let archive = layout::archive_path(&self.sandbox_id);
        let cmd = format!(
            "tar --checkpoint=1000 -jcf {archive}.$$ -C {} {} && mv {archive}.$$ {archive}",
            layout::LXC_DIR,
            self.sandbox_id
        );
        let handle = self.handle.clone();
        let mut sink = |line: &str| handle.set_progress(line);
        let result = self.host.exec_stream(&cmd, &mut sink).await;
        guard.release().await;
        result?;

        crate::sandbox::destroy_sandbox(&self.host, &self.sandbox_id).await?;
        Ok(())
    }
}

#[async_trait]
impl LongTask for ArchiveTask {
    fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    async fn run(self: Box<Self>) {
        tracing::info!(sandbox_id = %self.sandbox_id, "archiving started");
        match self.run_inner().await {
            Ok(()) => {
                self.handle.set_status(TaskStatus::Archived);
                tracing::info!(sandbox_id = %self.sandbox_id, "archiving finished");
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %self.sandbox_id, "failed to archive sandbox: {e}");
                self.handle.set_progress(e.output());
                self.handle.set_status(TaskStatus::Failed);
            }
        }
    }
}
