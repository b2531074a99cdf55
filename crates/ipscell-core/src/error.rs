use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpsCellError {
    #[error("command '{cmd}' exited with status {code}: {out}")]
    CommandFailed { cmd: String, code: i32, out: String },

    #[error("invalid role name '{0}': role must not contain '.' or '-'")]
    InvalidRoleName(String),

    #[error("invalid owner name '{0}': owner must not contain '-'")]
    InvalidOwnerName(String),

    #[error("another task is already running for this sandbox")]
    WorkerBusy,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed sandbox record: {0}")]
    MalformedRecord(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl IpsCellError {
    /// Captured output of a failed host command, or the display form for
    /// everything else. Event handlers surface this as the response
    /// description.
    pub fn output(&self) -> String {
        match self {
            IpsCellError::CommandFailed { out, .. } => out.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let e = IpsCellError::CommandFailed {
            cmd: "lxc-start -d -n x".into(),
            code: 1,
            out: "no such container".into(),
        };
        assert_eq!(
            e.to_string(),
            "command 'lxc-start -d -n x' exited with status 1: no such container"
        );

        let e = IpsCellError::InvalidRoleName("a.b".into());
        assert_eq!(
            e.to_string(),
            "invalid role name 'a.b': role must not contain '.' or '-'"
        );

        let e = IpsCellError::InvalidOwnerName("x-y".into());
        assert_eq!(
            e.to_string(),
            "invalid owner name 'x-y': owner must not contain '-'"
        );

        let e = IpsCellError::WorkerBusy;
        assert_eq!(
            e.to_string(),
            "another task is already running for this sandbox"
        );
    }

    #[test]
    fn test_command_failure_output() {
        let e = IpsCellError::CommandFailed {
            cmd: "lxc-create".into(),
            code: 2,
            out: "template not found".into(),
        };
        assert_eq!(e.output(), "template not found");

        let e = IpsCellError::Config("missing key".into());
        assert_eq!(e.output(), "Config error: missing key");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let e: IpsCellError = io_err.into();
        assert!(e.to_string().contains("not found"));
    }
}
