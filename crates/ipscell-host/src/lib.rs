//! Host capability boundary for the ipscell agent.
//!
//! Every interaction with the outside world (processes, files, network)
//! goes through [`HostAdapter`]; components never touch the host directly.
//! [`fake::FakeHost`] is the recording test double.

pub mod fake;
pub mod local;

use async_trait::async_trait;
use ipscell_core::IpsCellError;

pub use local::LocalHost;

/// Line sink for streamed command output.
pub type LineSink<'a> = &'a mut (dyn FnMut(&str) + Send);

#[async_trait]
pub trait HostAdapter: Send + Sync {
    /// Runs `cmd` through a shell and returns its stdout. A non-zero exit
    /// becomes [`IpsCellError::CommandFailed`] carrying the command, exit
    /// code and captured output.
    async fn exec(&self, cmd: &str) -> Result<String, IpsCellError>;

    /// Like [`exec`](Self::exec), but delivers each stdout line to
    /// `on_line` as it arrives. Returns the accumulated output.
    async fn exec_stream(&self, cmd: &str, on_line: LineSink<'_>) -> Result<String, IpsCellError>;

    /// Reads a file, returning an empty string when it does not exist.
    async fn read_file(&self, path: &str) -> Result<String, IpsCellError>;

    async fn exists(&self, path: &str) -> bool;

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), IpsCellError>;

    async fn append_file(&self, path: &str, contents: &str) -> Result<(), IpsCellError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), IpsCellError>;

    async fn make_dir(&self, path: &str, mode: u32) -> Result<(), IpsCellError>;

    /// Shell-style glob expansion, returning matching paths in sorted order.
    async fn glob(&self, pattern: &str) -> Vec<String>;

    async fn url_get(&self, url: &str) -> Result<String, IpsCellError>;

    /// True when a TCP connection to `addr:port` succeeds.
    async fn connect_ok(&self, addr: &str, port: u16) -> bool;

    /// First IPv4 address of the configured host device.
    async fn host_address(&self) -> Result<String, IpsCellError>;
}
