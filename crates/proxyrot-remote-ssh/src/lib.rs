// # SSH Proxy Host
//
// Runs the proxy host's file and control commands through the system
// OpenSSH client, one `ssh` process per command.
//
// ## Authentication
//
// Key-based only. `BatchMode=yes` makes ssh fail instead of prompting, so a
// missing or rejected key surfaces as `RemoteUnavailable` rather than a hang.
//
// ## Exit Codes
//
// ssh itself exits with 255 on connection or authentication failure; any
// other status belongs to the remote command.
//
// ## File Contents
//
// File reads and writes pass stdout/stdin through as raw bytes. Fragments
// may carry non-UTF-8 comments that must survive a rewrite unchanged.

use proxyrot_core::BackendRegistry;
use proxyrot_core::config::{RemoteConfig, SshConfig};
use proxyrot_core::traits::{ProxyHost, ProxyHostFactory};
use proxyrot_core::{Error, Result};

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status ssh reserves for its own failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Output of one remote command
#[derive(Debug)]
struct CommandOutput {
    status: Option<i32>,
    stdout: Vec<u8>,
    stderr: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Proxy host reached over OpenSSH
pub struct SshProxyHost {
    ssh: SshConfig,
    remote: RemoteConfig,
    command_timeout: Duration,
    program: String,
}

impl SshProxyHost {
    pub fn new(ssh: SshConfig, remote: RemoteConfig) -> Self {
        let command_timeout = Duration::from_secs(ssh.command_timeout_secs);
        Self {
            ssh,
            remote,
            command_timeout,
            program: "ssh".to_string(),
        }
    }

    /// Arguments passed to `ssh` before the remote command
    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.ssh.connect_timeout_secs),
            "-p".to_string(),
            self.ssh.port.to_string(),
        ];
        if let Some(identity) = &self.ssh.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.ssh.user, self.ssh.host));
        args
    }

    /// Run one command on the remote host
    ///
    /// Only transport problems are errors here; the remote command's own
    /// exit status is returned to the caller.
    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        debug!(host = %self.ssh.host, command, "Running remote command");

        let mut child = Command::new(&self.program)
            .args(self.ssh_args())
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::remote(format!("Failed to start ssh: {}", e)))?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input)
                .await
                .map_err(|e| Error::remote(format!("Failed to send data to {}: {}", self.ssh.host, e)))?;
            // Dropping the pipe closes the remote command's stdin
            drop(pipe);
        }

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::remote(format!(
                    "Command on {} timed out after {:?}: {}",
                    self.ssh.host, self.command_timeout, command
                ))
            })?
            .map_err(|e| Error::remote(format!("ssh failed: {}", e)))?;

        let output = CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        match output.status {
            Some(SSH_TRANSPORT_FAILURE) => Err(Error::remote(format!(
                "ssh to {} failed: {}",
                self.ssh.host,
                output.stderr.trim()
            ))),
            None => Err(Error::remote(format!(
                "ssh to {} was terminated by a signal",
                self.ssh.host
            ))),
            Some(_) => Ok(output),
        }
    }

    /// Run a command that must succeed; its stdout is returned
    async fn run_checked(&self, command: &str, stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let output = self.run(command, stdin).await?;
        if !output.success() {
            return Err(Error::remote(format!(
                "`{}` on {} exited with {:?}: {}",
                command,
                self.ssh.host,
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ProxyHost for SshProxyHost {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.run_checked(&format!("cat {}", shell_quote(path)), None)
            .await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.run_checked(&format!("cat > {}", shell_quote(path)), Some(contents))
            .await?;
        Ok(())
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        self.run_checked(
            &format!("cp -p {} {}", shell_quote(from), shell_quote(to)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<()> {
        self.run_checked(
            &format!("mv -f {} {}", shell_quote(from), shell_quote(to)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.run_checked(&format!("rm -f {}", shell_quote(path)), None)
            .await?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let output = self
            .run(&format!("test -f {}", shell_quote(path)), None)
            .await?;
        match output.status {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            status => Err(Error::remote(format!(
                "test -f on {} exited with {:?}: {}",
                self.ssh.host,
                status,
                output.stderr.trim()
            ))),
        }
    }

    async fn validate_config(&self) -> Result<String> {
        // squid -k parse reports on stderr and may exit non-zero on rejection
        let output = self.run(&self.remote.validate_command, None).await?;
        if !output.success() {
            warn!(
                host = %self.ssh.host,
                status = ?output.status,
                "Validator exited with non-zero status"
            );
        }
        Ok(combine_output(&output))
    }

    async fn reconfigure(&self) -> Result<()> {
        self.run_checked(&self.remote.reconfigure_command, None)
            .await?;
        Ok(())
    }

    fn host_name(&self) -> &str {
        &self.ssh.host
    }
}

/// stdout and stderr joined, each trimmed of trailing newlines
fn combine_output(output: &CommandOutput) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim_end();
    let stderr = output.stderr.trim_end();
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, _) => stderr.to_string(),
        (false, true) => stdout.to_string(),
        (false, false) => format!("{}\n{}", stdout, stderr),
    }
}

/// Quote a word for a POSIX shell
fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@%=,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Factory for creating SSH proxy hosts
pub struct SshProxyHostFactory;

impl ProxyHostFactory for SshProxyHostFactory {
    fn create(&self, ssh: &SshConfig, remote: &RemoteConfig) -> Result<Box<dyn ProxyHost>> {
        if ssh.host.trim().is_empty() {
            return Err(Error::config("SSH host is required for the ssh remote"));
        }
        ssh.validate()?;
        remote.validate()?;
        Ok(Box::new(SshProxyHost::new(ssh.clone(), remote.clone())))
    }
}

/// Register the SSH remote with a registry
pub fn register(registry: &BackendRegistry) {
    registry.register_host("ssh", Box::new(SshProxyHostFactory));
}
