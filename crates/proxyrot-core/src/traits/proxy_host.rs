// # Proxy Host Trait
//
// Defines the remote-command channel to the host running the forward proxy.
//
// ## Implementations
//
// - OpenSSH client: `proxyrot-remote-ssh` crate
//
// ## Usage
//
// ```rust,ignore
// use proxyrot_core::ProxyHost;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let host = /* ProxyHost implementation */;
//
//     let fragment = host.read_file("/etc/squid/includes/user_ports_ana.conf").await?;
//     let output = host.validate_config().await?;
//
//     Ok(())
// }
// ```

use async_trait::async_trait;

/// Trait for proxy host implementations
///
/// Paths are paths on the remote host, not local paths.
///
/// # Trust Level: Untrusted
///
/// ## Allowed Capabilities
/// - ✅ Run single commands on the one remote host it was built for
/// - ✅ Return command output verbatim
/// - ✅ Move file contents as raw bytes (fragments are not guaranteed UTF-8)
///
/// ## Forbidden Capabilities
/// - ❌ Retry or back off (owned by the caller)
/// - ❌ Edit fragment contents (owned by `fragment`)
/// - ❌ Decide whether validation passed (owned by `Synchronizer`)
/// - ❌ Touch the local store
///
/// ## Errors
///
/// Connection refused, authentication failure and timeouts must surface as
/// [`crate::Error::RemoteUnavailable`]. A remote command that runs but fails
/// (for example `cp` on a missing file) is also reported that way.
#[async_trait]
pub trait ProxyHost: Send + Sync {
    /// Read a whole file, byte for byte
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, crate::Error>;

    /// Replace a file's contents with exactly `contents`
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), crate::Error>;

    /// Copy a file
    async fn copy_file(&self, from: &str, to: &str) -> Result<(), crate::Error>;

    /// Move a file over another
    async fn move_file(&self, from: &str, to: &str) -> Result<(), crate::Error>;

    /// Remove a file (missing files are not an error)
    async fn remove_file(&self, path: &str) -> Result<(), crate::Error>;

    /// Whether a regular file exists
    async fn file_exists(&self, path: &str) -> Result<bool, crate::Error>;

    /// Parse the full proxy configuration without activating it
    ///
    /// # Returns
    ///
    /// The validator's combined output. A rejected configuration is still
    /// `Ok`: interpreting the output is the caller's job.
    async fn validate_config(&self) -> Result<String, crate::Error>;

    /// Ask the running proxy to reload its configuration
    async fn reconfigure(&self) -> Result<(), crate::Error>;

    /// Remote host name (for logging)
    fn host_name(&self) -> &str;
}

/// Helper trait for constructing proxy hosts from configuration
pub trait ProxyHostFactory: Send + Sync {
    /// Create a ProxyHost instance from configuration
    fn create(
        &self,
        ssh: &crate::config::SshConfig,
        remote: &crate::config::RemoteConfig,
    ) -> Result<Box<dyn ProxyHost>, crate::Error>;
}
