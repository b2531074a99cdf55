use std::sync::Arc;

use ipscell_core::IpsCellError;
use ipscell_host::HostAdapter;

use crate::layout;

/// Scoped access to a sandbox root filesystem.
///
/// LVM-backed sandboxes keep their rootfs on a block device that is only
/// mounted while an on-disk edit is in flight. `acquire` mounts if needed
/// and returns a guard; callers must `release` it on every path. Nested
/// acquisitions are not supported.
#[derive(Clone)]
pub struct RootfsMounter {
    host: Arc<dyn HostAdapter>,
    sandbox_id: String,
}

impl RootfsMounter {
    pub fn new(host: Arc<dyn HostAdapter>, sandbox_id: impl Into<String>) -> Self {
        Self {
            host,
            sandbox_id: sandbox_id.into(),
        }
    }

    /// LVM backing device from the container config, if declared
    /// (`lxc.rootfs` key with a `/dev/` value).
    async fn lvm_device(&self) -> Result<Option<String>, IpsCellError> {
        let config = self
            .host
            .read_file(&layout::config_path(&self.sandbox_id))
            .await?;
        for line in config.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.trim().starts_with("lxc.rootfs") && value.trim().starts_with("/dev/") {
                return Ok(Some(value.trim().to_string()));
            }
        }
        Ok(None)
    }

    pub async fn acquire(&self) -> Result<RootfsGuard, IpsCellError> {
        let mut rootfs = None;
        for candidate in layout::rootfs_candidates(&self.sandbox_id) {
            if self.host.exists(&candidate).await {
                rootfs = Some(candidate);
                break;
            }
        }
        let Some(path) = rootfs else {
            return Err(IpsCellError::Config(format!(
                "no rootfs found for sandbox {}",
                self.sandbox_id
            )));
        };

        let mounted = match self.lvm_device().await? {
            Some(device) => {
                self.host.exec(&format!("mount {device} {path}")).await?;
                true
            }
            None => false,
        };
        Ok(RootfsGuard {
            host: self.host.clone(),
            path,
            mounted,
            released: false,
        })
    }
}

pub struct RootfsGuard {
    host: Arc<dyn HostAdapter>,
    path: String,
    mounted: bool,
    released: bool,
}

impl RootfsGuard {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Unmounts the LVM backing if one was mounted. Tolerates an already
    /// absent mount.
    pub async fn release(mut self) {
        self.released = true;
        if !self.mounted {
            return;
        }
        if let Err(e) = self.host.exec(&format!("umount {}", self.path)).await {
            tracing::warn!(path = %self.path, "failed to unmount rootfs: {e}");
        }
    }
}

impl Drop for RootfsGuard {
    fn drop(&mut self) {
        if !self.released && self.mounted {
            tracing::warn!(
                path = %self.path,
                "rootfs guard dropped without release; mount left behind"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipscell_host::fake::FakeHost;

    #[tokio::test]
    async fn test_acquire_plain_rootfs() {
        let host = Arc::new(
            FakeHost::new()
                .with_file("/var/lib/lxc/x/config", "lxc.network.link = lxcbr0\n")
                .with_dir("/var/lib/lxc/x/rootfs"),
        );
        let mounter = RootfsMounter::new(host.clone(), "x");
        let guard = mounter.acquire().await.unwrap();
        assert_eq!(guard.path(), "/var/lib/lxc/x/rootfs");
        guard.release().await;
        // No mount/umount for a directory-backed rootfs.
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_prefers_first_candidate() {
        let host = Arc::new(
            FakeHost::new()
                .with_file("/var/lib/lxc/x/config", "")
                .with_dir("/var/lib/lxc/x/rootfs")
                .with_dir("/var/lib/lxc/x/x/rootfs"),
        );
        let guard = RootfsMounter::new(host, "x").acquire().await.unwrap();
        assert_eq!(guard.path(), "/var/lib/lxc/x/rootfs");
        guard.release().await;
    }

    #[tokio::test]
    async fn test_acquire_mounts_and_release_unmounts_lvm() {
        let host = Arc::new(
            FakeHost::new()
                .with_file(
                    "/var/lib/lxc/x/config",
                    "lxc.rootfs = /dev/vg0/x\nlxc.network.link = lxcbr0\n",
                )
                .with_dir("/var/lib/lxc/x/rootfs")
                .with_cmd("mount /dev/vg0/x /var/lib/lxc/x/rootfs", "")
                .with_cmd("umount /var/lib/lxc/x/rootfs", ""),
        );
        let guard = RootfsMounter::new(host.clone(), "x").acquire().await.unwrap();
        guard.release().await;
        assert_eq!(
            host.calls(),
            vec![
                "mount /dev/vg0/x /var/lib/lxc/x/rootfs",
                "umount /var/lib/lxc/x/rootfs"
            ]
        );
    }

    #[tokio::test]
    async fn test_release_tolerates_missing_mount() {
        let host = Arc::new(
            FakeHost::new()
                .with_file("/var/lib/lxc/x/config", "lxc.rootfs = /dev/vg0/x\n")
                .with_dir("/var/lib/lxc/x/rootfs")
                .with_cmd("mount /dev/vg0/x /var/lib/lxc/x/rootfs", ""),
        );
        // umount is not configured, so it fails; release still completes.
        let guard = RootfsMounter::new(host, "x").acquire().await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn test_acquire_without_rootfs_fails() {
        let host = Arc::new(FakeHost::new().with_file("/var/lib/lxc/x/config", ""));
        assert!(RootfsMounter::new(host, "x").acquire().await.is_err());
    }
}
