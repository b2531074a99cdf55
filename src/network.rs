use std::collections::HashSet;
use std::sync::Arc;

use ipscell_core::IpsCellError;
use ipscell_host::HostAdapter;
use regex::Regex;

use crate::layout;
use crate::ports::PortsStore;

/// DNAT exposure policy for one sandbox.
///
/// The host's IPv4 address fronts every sandbox; opening a port installs a
/// PREROUTING/OUTPUT DNAT rule pair redirecting `host:port` to the
/// sandbox's leased address. Lameducking removes the rules so existing
/// connections drain while the statusz port stays probeable. Also resolves
/// the sandbox's link device, hardware address and leased addresses, all of
/// which come from the container config and the dnsmasq leases.
#[derive(Clone)]
pub struct NetworkController {
    host: Arc<dyn HostAdapter>,
    sandbox_id: String,
    ports: PortsStore,
}

impl NetworkController {
    pub fn new(host: Arc<dyn HostAdapter>, sandbox_id: impl Into<String>) -> Self {
        let sandbox_id = sandbox_id.into();
        let ports = PortsStore::new(host.clone(), sandbox_id.clone());
        Self {
            host,
            sandbox_id,
            ports,
        }
    }

    async fn config_value(&self, key: &str) -> Result<Option<String>, IpsCellError> {
        let path = layout::config_path(&self.sandbox_id);
        if !self.host.exists(&path).await {
            return Ok(None);
        }
        let config = self.host.read_file(&path).await?;
        for line in config.lines() {
            let Some((lhs, rhs)) = line.split_once('=') else {
                continue;
            };
            if lhs.trim() == key {
                let value = rhs.trim();
                if !value.is_empty() {
                    return Ok(Some(value.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Bridge device the sandbox is attached to.
    pub async fn link_interface(&self) -> Result<Option<String>, IpsCellError> {
        self.config_value("lxc.network.link").await
    }

    pub async fn hw_address(&self) -> Result<Option<String>, IpsCellError> {
        self.config_value("lxc.network.hwaddr").await
    }

    /// Leased IPv4 address, from the dnsmasq leases matching the sandbox
    /// hardware address. `None` until a lease exists.
    pub async fn ipv4_address(&self) -> Result<Option<String>, IpsCellError> {
        let Some(mac) = self.hw_address().await? else {
            return Ok(None);
        };
        for lease_file in self.host.glob(layout::LEASES_GLOB).await {
            let leases = self.host.read_file(&lease_file).await?;
            for line in leases.lines() {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() >= 3 && fields[1].eq_ignore_ascii_case(&mac) {
                    return Ok(Some(fields[2].to_string()));
                }
            }
        }
        Ok(None)
    }

    /// IPv6 address discovered via the neighbor table after a multicast
    /// ping on the link device. Best effort; probe failures yield `None`.
    pub async fn ipv6_address(&self) -> Result<Option<String>, IpsCellError> {
        let Some(link) = self.link_interface().await? else {
            return Ok(None);
        };
        let Some(mac) = self.hw_address().await? else {
            return Ok(None);
        };
        let cmd = format!("(ping6 -c 1 -I {link} ff02::1 && ip -6 neigh show)");
        let out = match self.host.exec(&cmd).await {
            Ok(out) => out,
            Err(e) => {
                tracing::debug!(sandbox_id = %self.sandbox_id, "IPv6 discovery failed: {e}");
                return Ok(None);
            }
        };
        if out.starts_with("connect:") {
            return Ok(None);
        }
        for line in out.lines() {
            if line.contains(&mac) {
                return Ok(line.split_whitespace().next().map(str::to_string));
            }
        }
        Ok(None)
    }

    /// Enables router-advertisement acceptance on the link device so the
    /// host picks up the IPv6 prefix sandboxes live in. Idempotent.
    pub async fn set_accept_ra(&self) -> Result<(), IpsCellError> {
        let Some(link) = self.link_interface().await? else {
            return Ok(());
        };
        let path = layout::accept_ra_path(&link);
        let current = self.host.read_file(&path).await?;
        if current.trim() != "2" {
            self.host.write_file(&path, "2").await?;
        }
        Ok(())
    }

    fn dnat_rules(host_address: &str, sandbox_address: &str, port: u16) -> [String; 2] {
        [
            format!(
                "PREROUTING -t nat -p tcp -d {host_address} --dport {port} \
                 -jDNAT --to-destination {sandbox_address}"
            ),
            format!(
                "OUTPUT -t nat -p tcp -d {host_address} --dport {port} \
                 -jDNAT --to-destination {sandbox_address}"
            ),
        ]
    }

    /// Installs DNAT rules for `ports` (all reserved ports when `None`),
    /// skipping ports that are already open. Returns a per-rule report.
    /// A sandbox without a lease is a silent no-op.
    pub async fn open_network(&self, ports: Option<Vec<u16>>) -> Result<String, IpsCellError> {
        let Some(sandbox_address) = self.ipv4_address().await? else {
            tracing::debug!(sandbox_id = %self.sandbox_id, "sandbox address unknown; not opening");
            return Ok(String::new());
        };
        let ports = match ports {
            Some(ports) => ports,
            None => self.ports.reserved_ports().await,
        };
        let enabled: HashSet<u16> = self.enabled_ports().await?.into_iter().collect();
        let host_address = self.host.host_address().await?;

        let mut results = Vec::new();
        for port in ports {
            if enabled.contains(&port) {
                continue;
            }
            for rule in Self::dnat_rules(&host_address, &sandbox_address, port) {
                let out = self.host.exec(&format!("/sbin/iptables -I {rule}")).await?;
                results.push(format!("Opened {rule}: {out}"));
            }
        }
        Ok(results.join("\n"))
    }

    /// Removes DNAT rules for every open port, keeping the statusz port
    /// unless `reject_statusz` is set.
    pub async fn lameduck(&self, reject_statusz: bool) -> Result<String, IpsCellError> {
        let Some(sandbox_address) = self.ipv4_address().await? else {
            tracing::debug!(sandbox_id = %self.sandbox_id, "sandbox address unknown; not lameducking");
            return Ok(String::new());
        };
        let statusz = self.ports.statusz_port().await;
        let host_address = self.host.host_address().await?;

        let mut results = Vec::new();
        for port in self.enabled_ports().await? {
            if !reject_statusz && statusz == Some(port) {
                continue;
            }
            for rule in Self::dnat_rules(&host_address, &sandbox_address, port) {
                let out = self.host.exec(&format!("/sbin/iptables -D {rule}")).await?;
                results.push(format!("Closed {rule}: {out}"));
            }
        }
        Ok(results.join("\n"))
    }

    /// Ports with a live PREROUTING DNAT rule pointing at this sandbox.
    pub async fn enabled_ports(&self) -> Result<Vec<u16>, IpsCellError> {
        let Some(sandbox_address) = self.ipv4_address().await? else {
            return Ok(Vec::new());
        };
        let host_address = self.host.host_address().await?;
        let pattern = format!(
            r"^DNAT\s+tcp\s+--\s+{}\s+{}\s+tcp\s+dpt:(\d+)\s+to:{}\s*$",
            regex::escape("0.0.0.0/0"),
            regex::escape(&host_address),
            regex::escape(&sandbox_address),
        );
        let rule_re = Regex::new(&pattern)
            .map_err(|e| IpsCellError::Config(format!("bad DNAT pattern: {e}")))?;

        let listing = self
            .host
            .exec("/sbin/iptables -L PREROUTING -t nat -n")
            .await?;
        let mut ports = Vec::new();
        for line in listing.lines() {
            if let Some(caps) = rule_re.captures(line) {
                if let Ok(port) = caps[1].parse() {
                    ports.push(port);
                }
            }
        }
        Ok(ports)
    }
}
