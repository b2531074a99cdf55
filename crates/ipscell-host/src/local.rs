use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ipscell_core::IpsCellError;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::{HostAdapter, LineSink};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Production adapter running commands through `/bin/sh` on this host.
pub struct LocalHost {
    dev: String,
    http: reqwest::Client,
}

impl LocalHost {
    pub fn new(dev: impl Into<String>) -> Self {
        Self {
            dev: dev.into(),
            http: reqwest::Client::new(),
        }
    }

    fn shell(cmd: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(cmd).stdin(Stdio::null());
        command
    }

    fn failure(cmd: &str, code: Option<i32>, out: String) -> IpsCellError {
        IpsCellError::CommandFailed {
            cmd: cmd.to_string(),
            code: code.unwrap_or(-1),
            out,
        }
    }
}

#[async_trait]
impl HostAdapter for LocalHost {
    async fn exec(&self, cmd: &str) -> Result<String, IpsCellError> {
        tracing::debug!(cmd, "executing host command");
        let output = Self::shell(cmd).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let mut out = stdout;
            out.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(Self::failure(cmd, output.status.code(), out));
        }
        Ok(stdout)
    }

    async fn exec_stream(&self, cmd: &str, on_line: LineSink<'_>) -> Result<String, IpsCellError> {
        tracing::debug!(cmd, "streaming host command");
        let mut child = Self::shell(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IpsCellError::Config("child stdout unavailable".into()))?;

        let mut lines = BufReader::new(stdout).lines();
        let mut out = String::new();
        while let Some(line) = lines.next_line().await? {
            on_line(&line);
            out.push_str(&line);
            out.push('\n');
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            out.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(Self::failure(cmd, output.status.code(), out));
        }
        Ok(out)
    }

    async fn read_file(&self, path: &str) -> Result<String, IpsCellError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), IpsCellError> {
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn append_file(&self, path: &str, contents: &str) -> Result<(), IpsCellError> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), IpsCellError> {
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn make_dir(&self, path: &str, mode: u32) -> Result<(), IpsCellError> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::create_dir_all(path).await?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn glob(&self, pattern: &str) -> Vec<String> {
        let mut paths: Vec<String> = match glob::glob(pattern) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|path| path.to_string_lossy().into_owned())
                .collect(),
            Err(e) => {
                tracing::warn!(pattern, "bad glob pattern: {e}");
                Vec::new()
            }
        };
        paths.sort();
        paths
    }

    async fn url_get(&self, url: &str) -> Result<String, IpsCellError> {
        let body = self.http.get(url).send().await?.text().await?;
        Ok(body)
    }

    async fn connect_ok(&self, addr: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                CONNECT_TIMEOUT,
                tokio::net::TcpStream::connect((addr, port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn host_address(&self) -> Result<String, IpsCellError> {
        let out = self.exec(&format!("ip -4 -o addr show dev {}", self.dev)).await?;
        let re = Regex::new(r"inet (\d+\.\d+\.\d+\.\d+)").map_err(|e| {
            IpsCellError::Config(format!("address pattern failed to compile: {e}"))
        })?;
        re.captures(&out)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| {
                IpsCellError::Config(format!("no IPv4 address on device {}", self.dev))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn test_dir() -> PathBuf {
        std::env::temp_dir().join(format!("ipscell_local_test_{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let host = LocalHost::new("eth0");
        let out = host.exec("printf hello").await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_exec_failure_carries_command_and_output() {
        let host = LocalHost::new("eth0");
        let err = host.exec("echo oops >&2; exit 3").await.unwrap_err();
        match err {
            IpsCellError::CommandFailed { cmd, code, out } => {
                assert_eq!(cmd, "echo oops >&2; exit 3");
                assert_eq!(code, 3);
                assert!(out.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_exec_stream_delivers_lines() {
        let host = LocalHost::new("eth0");
        let mut seen = Vec::new();
        let mut sink = |line: &str| seen.push(line.to_string());
        let out = host
            .exec_stream("printf 'a\\nb\\n'", &mut sink)
            .await
            .unwrap();
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(out, "a\nb\n");
    }

    #[tokio::test]
    async fn test_read_file_absent_is_empty() {
        let host = LocalHost::new("eth0");
        let out = host.read_file("/definitely/not/here").await.unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn test_file_round_trip_and_rename() {
        let host = LocalHost::new("eth0");
        let dir = test_dir();
        host.make_dir(dir.to_str().unwrap(), 0o755).await.unwrap();
        let tmp = dir.join("f.t");
        let dst = dir.join("f");
        host.write_file(tmp.to_str().unwrap(), "one\n").await.unwrap();
        host.append_file(tmp.to_str().unwrap(), "two\n").await.unwrap();
        host.rename(tmp.to_str().unwrap(), dst.to_str().unwrap())
            .await
            .unwrap();
        assert!(host.exists(dst.to_str().unwrap()).await);
        assert!(!host.exists(tmp.to_str().unwrap()).await);
        assert_eq!(host.read_file(dst.to_str().unwrap()).await.unwrap(), "one\ntwo\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_glob_matches_created_files() {
        let host = LocalHost::new("eth0");
        let dir = test_dir();
        host.make_dir(dir.to_str().unwrap(), 0o755).await.unwrap();
        host.write_file(dir.join("a.leases").to_str().unwrap(), "")
            .await
            .unwrap();
        host.write_file(dir.join("b.leases").to_str().unwrap(), "")
            .await
            .unwrap();
        let pattern = format!("{}/*.leases", dir.to_str().unwrap());
        let matches = host.glob(&pattern).await;
        assert_eq!(matches.len(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
