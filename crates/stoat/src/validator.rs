use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use stoat_core::{Error, Result};

// External validator — score the model from a separate process
//
// Heavy validation (full test-set decoding, external scorers) can run
// outside the trainer process. The protocol is deliberately tiny:
//
//   1. The trainer binds a Unix-domain socket and spawns the command,
//      passing the socket path in $STOAT_VALIDATOR_SOCKET.
//   2. The validator process connects and writes one JSON
//      ValidationResult, then closes.
//   3. The trainer blocks on the first of: the result message, the
//      process exiting, or the timeout (default 30 minutes). The losers
//      are abandoned, not reaped — a wedged validator must not wedge
//      training.
//
// A failed validation is an I/O-class error: the trainer logs it and
// keeps training without a checkpoint decision for that cycle.

/// The message a validator process writes to the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Primary metric; higher is better.
    pub score: f64,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Spawns an external process and collects its [`ValidationResult`].
pub struct ExternalValidator {
    command: Vec<String>,
    socket_path: PathBuf,
    timeout: Duration,
}

impl ExternalValidator {
    pub fn new(command: Vec<String>, socket_path: impl Into<PathBuf>) -> Self {
        ExternalValidator {
            command,
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one validation round.
    #[cfg(unix)]
    pub fn run(&self) -> Result<ValidationResult> {
        use std::io::Read;
        use std::os::unix::net::UnixListener;

        if self.command.is_empty() {
            return Err(Error::msg("external validator has no command"));
        }

        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        listener.set_nonblocking(true)?;

        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .env("STOAT_VALIDATOR_SOCKET", &self.socket_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
                    let mut body = String::new();
                    stream.read_to_string(&mut body)?;
                    let result: ValidationResult = serde_json::from_str(body.trim())
                        .map_err(|e| Error::msg(format!("bad validation message: {e}")))?;
                    return Ok(result);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(status) = child.try_wait()? {
                return Err(Error::msg(format!(
                    "validator exited ({status}) without sending a result"
                )));
            }
            if Instant::now() >= deadline {
                // Abandon the process; do not block on it.
                return Err(Error::msg("validator timed out"));
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    #[cfg(not(unix))]
    pub fn run(&self) -> Result<ValidationResult> {
        Err(Error::msg(
            "external validator requires unix domain sockets",
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("stoat-validator-test-{name}-{}.sock", std::process::id()))
    }

    #[test]
    fn message_wins_over_running_child() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let path = socket_path("ok");
        // The child just sleeps; a thread plays the validator process and
        // delivers the result on the socket. First-of-three: the message
        // must win while the child is still running.
        let sender_path = path.clone();
        let sender = std::thread::spawn(move || {
            for _ in 0..100 {
                std::thread::sleep(Duration::from_millis(50));
                if let Ok(mut stream) = UnixStream::connect(&sender_path) {
                    let _ = stream.write_all(br#"{"score": 0.75}"#);
                    return;
                }
            }
        });
        let v = ExternalValidator::new(vec!["sleep".to_string(), "60".to_string()], &path)
            .with_timeout(Duration::from_secs(20));
        let result = v.run().unwrap();
        assert!((result.score - 0.75).abs() < 1e-9);
        sender.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn exit_without_message_is_an_error() {
        let path = socket_path("exit");
        let cmd = vec!["true".to_string()];
        let v = ExternalValidator::new(cmd, &path).with_timeout(Duration::from_secs(20));
        assert!(v.run().is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn timeout_wins_over_sleeping_child() {
        let path = socket_path("timeout");
        let cmd = vec!["sleep".to_string(), "600".to_string()];
        let v = ExternalValidator::new(cmd, &path).with_timeout(Duration::from_millis(300));
        let err = v.run().unwrap_err();
        assert!(err.to_string().contains("timed out"));
        let _ = std::fs::remove_file(&path);
    }
}
