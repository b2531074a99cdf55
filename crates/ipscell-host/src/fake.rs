//! Recording fake for [`HostAdapter`], used across the workspace tests.
//!
//! Commands, files and URLs are served from canned maps, every `exec` is
//! recorded, and the host nat table is simulated so DNAT insert/delete and
//! `iptables -L` listing stay consistent within a test. A command may be
//! given side effects (files it deposits or removes) to model tools like
//! `lxc-create` that populate the sandbox directory.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use glob::Pattern;
use ipscell_core::IpsCellError;
use regex::Regex;

use crate::{HostAdapter, LineSink};

#[derive(Clone, Debug)]
pub enum FakeEffect {
    WriteFile(String, String),
    RemoveFile(String),
    MakeDir(String),
}

#[derive(Default)]
pub struct FakeHost {
    cmds: Mutex<HashMap<String, String>>,
    cmd_effects: Mutex<HashMap<String, Vec<FakeEffect>>>,
    files: Mutex<HashMap<String, String>>,
    dirs: Mutex<HashSet<String>>,
    dir_modes: Mutex<HashMap<String, u32>>,
    urls: Mutex<HashMap<String, String>>,
    globs: Mutex<HashMap<String, Vec<String>>>,
    reachable: Mutex<HashSet<(String, u16)>>,
    address: Mutex<String>,
    nat_rules: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FakeHost {
    /// A fake host whose IPv4 address is `192.168.1.254`.
    pub fn new() -> Self {
        let host = Self::default();
        *lock(&host.address) = "192.168.1.254".to_string();
        host
    }

    pub fn with_cmd(self, cmd: impl Into<String>, out: impl Into<String>) -> Self {
        lock(&self.cmds).insert(cmd.into(), out.into());
        self
    }

    pub fn with_cmd_effect(self, cmd: impl Into<String>, effect: FakeEffect) -> Self {
        lock(&self.cmd_effects)
            .entry(cmd.into())
            .or_default()
            .push(effect);
        self
    }

    pub fn with_file(self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        lock(&self.files).insert(path.into(), contents.into());
        self
    }

    pub fn with_dir(self, path: impl Into<String>) -> Self {
        lock(&self.dirs).insert(path.into());
        self
    }

    pub fn with_url(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        lock(&self.urls).insert(url.into(), body.into());
        self
    }

    pub fn with_glob(self, pattern: impl Into<String>, paths: Vec<String>) -> Self {
        lock(&self.globs).insert(pattern.into(), paths);
        self
    }

    pub fn with_reachable(self, addr: impl Into<String>, port: u16) -> Self {
        lock(&self.reachable).insert((addr.into(), port));
        self
    }

    pub fn with_address(self, addr: impl Into<String>) -> Self {
        *lock(&self.address) = addr.into();
        self
    }

    // Mid-test mutation, for scenarios that change host responses between
    // steps.
    pub fn set_cmd(&self, cmd: impl Into<String>, out: impl Into<String>) {
        lock(&self.cmds).insert(cmd.into(), out.into());
    }

    pub fn set_file(&self, path: impl Into<String>, contents: impl Into<String>) {
        lock(&self.files).insert(path.into(), contents.into());
    }

    pub fn set_dir(&self, path: impl Into<String>) {
        lock(&self.dirs).insert(path.into());
    }

    pub fn set_url(&self, url: impl Into<String>, body: impl Into<String>) {
        lock(&self.urls).insert(url.into(), body.into());
    }

    pub fn remove_file(&self, path: &str) {
        lock(&self.files).remove(path);
    }

    /// Every command executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    pub fn dir_mode(&self, path: &str) -> Option<u32> {
        lock(&self.dir_modes).get(path).copied()
    }

    fn resolve(&self, cmd: &str) -> Result<String, IpsCellError> {
        lock(&self.calls).push(cmd.to_string());

        let canned = lock(&self.cmds).get(cmd).cloned();
        if let Some(out) = canned {
            self.apply_effects(cmd);
            return Ok(out);
        }

        if let Some(rule) = cmd.strip_prefix("/sbin/iptables -I ") {
            lock(&self.nat_rules).push(rule.to_string());
            return Ok(String::new());
        }
        if let Some(rule) = cmd.strip_prefix("/sbin/iptables -D ") {
            let mut rules = lock(&self.nat_rules);
            match rules.iter().position(|r| r == rule) {
                Some(idx) => {
                    rules.remove(idx);
                    return Ok(String::new());
                }
                None => {
                    return Err(IpsCellError::CommandFailed {
                        cmd: cmd.to_string(),
                        code: 1,
                        out: "iptables: Bad rule (does a matching rule exist in that chain?)."
                            .into(),
                    });
                }
            }
        }
        if cmd == "/sbin/iptables -L PREROUTING -t nat -n" {
            return Ok(self.render_nat());
        }

        Err(IpsCellError::CommandFailed {
            cmd: cmd.to_string(),
            code: 127,
            out: format!("FakeHost: no output configured for command: {cmd}"),
        })
    }

    fn apply_effects(&self, cmd: &str) {
        let effects = lock(&self.cmd_effects).get(cmd).cloned().unwrap_or_default();
        for effect in effects {
            match effect {
                FakeEffect::WriteFile(path, contents) => {
                    lock(&self.files).insert(path, contents);
                }
                FakeEffect::RemoveFile(path) => {
                    lock(&self.files).remove(&path);
                }
                FakeEffect::MakeDir(path) => {
                    lock(&self.dirs).insert(path);
                }
            }
        }
    }

    fn render_nat(&self) -> String {
        let mut out = String::from(
            "Chain PREROUTING (policy ACCEPT)\ntarget     prot opt source               destination\n",
        );
        for rule in lock(&self.nat_rules).iter() {
            if !rule.starts_with("PREROUTING ") {
                continue;
            }
            if let Some(line) = nat_listing_line(rule) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }
}

fn nat_listing_line(rule: &str) -> Option<String> {
    let re = Regex::new(r"-p tcp -d (\S+) --dport (\S+) -jDNAT --to-destination (\S+)").ok()?;
    let caps = re.captures(rule)?;
    Some(format!(
        "DNAT       tcp  --  0.0.0.0/0            {}         tcp dpt:{} to:{}",
        &caps[1], &caps[2], &caps[3]
    ))
}

#[async_trait]
impl HostAdapter for FakeHost {
    async fn exec(&self, cmd: &str) -> Result<String, IpsCellError> {
        self.resolve(cmd)
    }

    async fn exec_stream(&self, cmd: &str, on_line: LineSink<'_>) -> Result<String, IpsCellError> {
        let out = self.resolve(cmd)?;
        for line in out.lines() {
            on_line(line);
        }
        Ok(out)
    }

    async fn read_file(&self, path: &str) -> Result<String, IpsCellError> {
        Ok(lock(&self.files).get(path).cloned().unwrap_or_default())
    }

    async fn exists(&self, path: &str) -> bool {
        lock(&self.files).contains_key(path) || lock(&self.dirs).contains(path)
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), IpsCellError> {
        lock(&self.files).insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn append_file(&self, path: &str, contents: &str) -> Result<(), IpsCellError> {
        lock(&self.files)
            .entry(path.to_string())
            .or_default()
            .push_str(contents);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), IpsCellError> {
        let mut files = lock(&self.files);
        match files.remove(from) {
            Some(contents) => {
                files.insert(to.to_string(), contents);
                Ok(())
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("FakeHost: no such file: {from}"),
            )
            .into()),
        }
    }

    async fn make_dir(&self, path: &str, mode: u32) -> Result<(), IpsCellError> {
        lock(&self.dirs).insert(path.to_string());
        lock(&self.dir_modes).insert(path.to_string(), mode);
        Ok(())
    }

    async fn glob(&self, pattern: &str) -> Vec<String> {
        if let Some(paths) = lock(&self.globs).get(pattern) {
            return paths.clone();
        }
        let Ok(matcher) = Pattern::new(pattern) else {
            return Vec::new();
        };
        let mut paths: Vec<String> = lock(&self.files)
            .keys()
            .chain(lock(&self.dirs).iter())
            .filter(|path| matcher.matches(path))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    async fn url_get(&self, url: &str) -> Result<String, IpsCellError> {
        lock(&self.urls)
            .get(url)
            .cloned()
            .ok_or_else(|| IpsCellError::Config(format!("FakeHost: no body for URL: {url}")))
    }

    async fn connect_ok(&self, addr: &str, port: u16) -> bool {
        lock(&self.reachable).contains(&(addr.to_string(), port))
    }

    async fn host_address(&self) -> Result<String, IpsCellError> {
        Ok(lock(&self.address).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_and_serves_commands() {
        let host = FakeHost::new().with_cmd("lxc-list", "NAME STATE");
        assert_eq!(host.exec("lxc-list").await.unwrap(), "NAME STATE");
        assert!(host.exec("unknown-tool").await.is_err());
        assert_eq!(host.calls(), vec!["lxc-list", "unknown-tool"]);
    }

    #[tokio::test]
    async fn test_nat_simulation_inserts_lists_and_deletes() {
        let host = FakeHost::new();
        let rule = "PREROUTING -t nat -p tcp -d 192.168.1.254 --dport 80 \
                    -jDNAT --to-destination 192.168.1.1";
        host.exec(&format!("/sbin/iptables -I {rule}")).await.unwrap();

        let listing = host.exec("/sbin/iptables -L PREROUTING -t nat -n").await.unwrap();
        assert!(listing.contains("dpt:80 to:192.168.1.1"), "{listing}");

        host.exec(&format!("/sbin/iptables -D {rule}")).await.unwrap();
        let listing = host.exec("/sbin/iptables -L PREROUTING -t nat -n").await.unwrap();
        assert!(!listing.contains("dpt:80"));

        // Deleting again is a bad rule, as with real iptables.
        assert!(host.exec(&format!("/sbin/iptables -D {rule}")).await.is_err());
    }

    #[tokio::test]
    async fn test_output_rules_are_not_listed_in_prerouting() {
        let host = FakeHost::new();
        host.exec(
            "/sbin/iptables -I OUTPUT -t nat -p tcp -d 192.168.1.254 --dport 80 \
             -jDNAT --to-destination 192.168.1.1",
        )
        .await
        .unwrap();
        let listing = host.exec("/sbin/iptables -L PREROUTING -t nat -n").await.unwrap();
        assert!(!listing.contains("dpt:80"));
    }

    #[tokio::test]
    async fn test_command_effects_touch_files() {
        let host = FakeHost::new()
            .with_cmd("make-it", "done")
            .with_cmd_effect(
                "make-it",
                FakeEffect::WriteFile("/var/lib/lxc/x/config".into(), "".into()),
            );
        assert!(!host.exists("/var/lib/lxc/x/config").await);
        host.exec("make-it").await.unwrap();
        assert!(host.exists("/var/lib/lxc/x/config").await);
    }

    #[tokio::test]
    async fn test_exec_stream_splits_lines() {
        let host = FakeHost::new().with_cmd("chatty", "one\ntwo\n");
        let mut seen = Vec::new();
        let mut sink = |line: &str| seen.push(line.to_string());
        host.exec_stream("chatty", &mut sink).await.unwrap();
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_file_operations() {
        let host = FakeHost::new();
        host.write_file("/a/b", "x").await.unwrap();
        host.append_file("/a/b", "y").await.unwrap();
        assert_eq!(host.read_file("/a/b").await.unwrap(), "xy");
        host.rename("/a/b", "/a/c").await.unwrap();
        assert_eq!(host.read_file("/a/b").await.unwrap(), "");
        assert_eq!(host.read_file("/a/c").await.unwrap(), "xy");
    }

    #[tokio::test]
    async fn test_glob_falls_back_to_pattern_matching() {
        let host = FakeHost::new()
            .with_file("/var/lib/misc/dnsmasq.leases", "")
            .with_file("/var/lib/misc/dnsmasq-lxcbr0.leases", "")
            .with_file("/var/lib/misc/other.txt", "");
        let matches = host.glob("/var/lib/misc/dnsmasq*.leases").await;
        assert_eq!(
            matches,
            vec![
                "/var/lib/misc/dnsmasq-lxcbr0.leases",
                "/var/lib/misc/dnsmasq.leases"
            ]
        );
    }
}
