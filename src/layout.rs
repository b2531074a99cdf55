//! On-disk contract paths. These are fixed interfaces shared with the
//! container tooling and must not be made configurable.

use ipscell_core::proto::GenericName;

pub const LXC_DIR: &str = "/var/lib/lxc";
pub const CELL_DIR: &str = "/var/lib/ips-cell/sandbox";
pub const ARCHIVE_DIR: &str = "/var/lib/ips-cell/sandbox/archive";
pub const LEASES_GLOB: &str = "/var/lib/misc/dnsmasq*.leases";

pub fn sandbox_dir(sandbox_id: &str) -> String {
    format!("{LXC_DIR}/{sandbox_id}")
}

pub fn config_path(sandbox_id: &str) -> String {
    format!("{LXC_DIR}/{sandbox_id}/config")
}

pub fn ports_path(sandbox_id: &str) -> String {
    format!("{LXC_DIR}/{sandbox_id}/ports")
}

pub fn record_path(sandbox_id: &str) -> String {
    format!("{LXC_DIR}/{sandbox_id}/sandbox.proto")
}

pub fn help_path(sandbox_id: &str) -> String {
    format!("{LXC_DIR}/{sandbox_id}/help")
}

pub fn fstab_path(sandbox_id: &str) -> String {
    format!("{LXC_DIR}/{sandbox_id}/fstab")
}

pub fn archive_path(sandbox_id: &str) -> String {
    format!("{ARCHIVE_DIR}/{sandbox_id}.tar.bz2")
}

/// Candidate rootfs locations, in probe order.
pub fn rootfs_candidates(sandbox_id: &str) -> [String; 2] {
    [
        format!("{LXC_DIR}/{sandbox_id}/rootfs"),
        format!("{LXC_DIR}/{sandbox_id}/{sandbox_id}/rootfs"),
    ]
}

/// Cgroup field path, e.g. `memory.stat` lands under the `memory`
/// subsystem hierarchy.
pub fn cgroup_path(sandbox_id: &str, field: &str) -> String {
    let subsystem = field.split('.').next().unwrap_or(field);
    format!("/sys/fs/cgroup/{subsystem}/lxc/{sandbox_id}/{field}")
}

pub fn accept_ra_path(link: &str) -> String {
    format!("/proc/sys/net/ipv6/conf/{link}/accept_ra")
}

/// Directory holding the per-owner alternatives links.
pub fn alternatives_link_dir(name: &GenericName) -> String {
    format!("{CELL_DIR}/{}", name.owner_dashed())
}

/// The link clients follow to reach the current sandbox of a generic name.
pub fn alternatives_link(name: &GenericName) -> String {
    let owner = name.owner_dashed();
    format!("{CELL_DIR}/{owner}/{}.{owner}", name.role)
}
