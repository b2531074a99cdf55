use std::sync::Arc;

use ipscell_host::HostAdapter;

use crate::layout;

/// Reads the per-sandbox reserved-port declarations.
///
/// One port per line; trailing whitespace-separated tokens are flags. The
/// `statusz` flag marks the readiness HTTP endpoint.
#[derive(Clone)]
pub struct PortsStore {
    host: Arc<dyn HostAdapter>,
    sandbox_id: String,
}

impl PortsStore {
    pub fn new(host: Arc<dyn HostAdapter>, sandbox_id: impl Into<String>) -> Self {
        Self {
            host,
            sandbox_id: sandbox_id.into(),
        }
    }

    async fn lines(&self) -> Vec<String> {
        let path = layout::ports_path(&self.sandbox_id);
        if !self.host.exists(&path).await {
            return Vec::new();
        }
        match self.host.read_file(&path).await {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                tracing::warn!(sandbox_id = %self.sandbox_id, "failed to read ports file: {e}");
                Vec::new()
            }
        }
    }

    /// Reserved ports in declaration order. Lines whose first token is not
    /// a decimal port are skipped.
    pub async fn reserved_ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for line in self.lines().await {
            let token = line.split_whitespace().next().unwrap_or("");
            match token.parse::<u16>() {
                Ok(port) => ports.push(port),
                Err(_) => {
                    tracing::warn!(
                        sandbox_id = %self.sandbox_id,
                        line,
                        "ignoring malformed ports line"
                    );
                }
            }
        }
        ports
    }

    /// First port flagged `statusz`, if any.
    pub async fn statusz_port(&self) -> Option<u16> {
        for line in self.lines().await {
            let mut tokens = line.split_whitespace();
            let port = tokens.next()?.parse::<u16>().ok();
            if tokens.any(|flag| flag == "statusz") {
                if let Some(port) = port {
                    return Some(port);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipscell_host::fake::FakeHost;

    fn store(contents: &str) -> PortsStore {
        let host = Arc::new(FakeHost::new().with_file("/var/lib/lxc/example/ports", contents));
        PortsStore::new(host, "example")
    }

    #[tokio::test]
    async fn test_reserved_ports_in_order() {
        assert_eq!(store("1\n2 statusz\n3").reserved_ports().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_statusz_port() {
        assert_eq!(store("1\n2 statusz\n3").statusz_port().await, Some(2));
        assert_eq!(store("1\n3").statusz_port().await, None);
    }

    #[tokio::test]
    async fn test_blank_lines_and_garbage_ignored() {
        let s = store("\n80 statusz extra\n\nnot-a-port\n443\n");
        assert_eq!(s.reserved_ports().await, vec![80, 443]);
        assert_eq!(s.statusz_port().await, Some(80));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let host = Arc::new(FakeHost::new());
        let s = PortsStore::new(host, "example");
        assert!(s.reserved_ports().await.is_empty());
        assert_eq!(s.statusz_port().await, None);
    }
}
