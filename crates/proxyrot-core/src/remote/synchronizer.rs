// # Synchronizer
//
// Makes a port's binding effective on the remote proxy.
//
// ## Protocol
//
// 1. Copy the user's fragment to its backup path
// 2. Rewrite the port's outbound-address line in the fragment
// 3. Run the proxy's validator
// 4. Rejected: restore the backup, re-validate, check the restore, fail
// 5. Accepted: reconfigure the proxy, remove the backup
//
// All steps for one host run under a single session lock. Transport
// failures abort immediately; the backup may be left on the host.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::config::RemoteConfig;
use crate::fragment::{self, FragmentError};
use crate::model::User;
use crate::traits::ProxyHost;
use crate::{Error, Result};

/// Applies binding changes to one remote proxy host
pub struct Synchronizer {
    host: Arc<dyn ProxyHost>,
    remote: RemoteConfig,
    session: Mutex<()>,
}

impl Synchronizer {
    pub fn new(host: Box<dyn ProxyHost>, remote: RemoteConfig) -> Self {
        Self {
            host: Arc::from(host),
            remote,
            session: Mutex::new(()),
        }
    }

    pub fn remote_config(&self) -> &RemoteConfig {
        &self.remote
    }

    pub fn host_name(&self) -> &str {
        self.host.host_name()
    }

    /// Exclusive access to the remote host
    pub(crate) async fn session(&self) -> (MutexGuard<'_, ()>, &dyn ProxyHost) {
        (self.session.lock().await, self.host.as_ref())
    }

    /// Bind `port` to `address` in `user`'s fragment and reload the proxy
    ///
    /// # Errors
    ///
    /// - [`Error::RemoteConfigInvalid`]: the directive could not be located, or
    ///   the validator rejected the edit (the fragment has been restored)
    /// - [`Error::RemoteUnavailable`]: any remote-command failure
    pub async fn apply_binding(&self, port: u16, user: &User, address: IpAddr) -> Result<()> {
        let (_session, host) = self.session().await;

        let fragment_path = self.remote.fragment_path(&user.proxy_username);
        let backup_path = self.remote.backup_path(&fragment_path);

        tracing::debug!(
            host = host.host_name(),
            port,
            fragment = %fragment_path,
            "Backing up fragment"
        );
        host.copy_file(&fragment_path, &backup_path).await?;

        let original = host.read_file(&fragment_path).await?;
        let rewritten = match fragment::rewrite_outbound_address(
            &original,
            port,
            address,
            &user.proxy_username,
        ) {
            Ok(content) => content,
            Err(e) => {
                // Nothing was written yet
                host.remove_file(&backup_path).await?;
                return Err(directive_error(port, e));
            }
        };

        host.write_file(&fragment_path, &rewritten).await?;

        tracing::debug!(host = host.host_name(), port, "Validating proxy configuration");
        let output = host.validate_config().await?;

        if fragment::validation_rejected(&output) {
            host.move_file(&backup_path, &fragment_path).await?;
            let revalidation = host.validate_config().await?;
            let restored = host.read_file(&fragment_path).await?;

            tracing::error!(
                host = host.host_name(),
                port,
                user = %user.id,
                address = %address,
                validator_output = %output.trim(),
                revalidation_output = %revalidation.trim(),
                revalidation_ok = !fragment::validation_rejected(&revalidation),
                "Proxy rejected configuration, fragment restored from backup"
            );
            if restored != original {
                tracing::error!(
                    host = host.host_name(),
                    port,
                    fragment = %fragment_path,
                    "Restored fragment differs from its pre-edit content"
                );
            }

            return Err(Error::RemoteConfigInvalid {
                port,
                validator_output: output,
            });
        }

        if let Err(e) = host.reconfigure().await {
            // The store will not commit this binding; the fragment must not carry it
            if let Err(restore_err) = host.move_file(&backup_path, &fragment_path).await {
                tracing::error!(
                    host = host.host_name(),
                    port,
                    backup = %backup_path,
                    "Failed to restore fragment after reconfigure failure: {}",
                    restore_err
                );
            }
            return Err(e);
        }

        // The proxy already runs the new binding from here on
        if let Err(e) = host.remove_file(&backup_path).await {
            tracing::warn!(
                host = host.host_name(),
                backup = %backup_path,
                "Failed to remove fragment backup: {}",
                e
            );
        }

        tracing::debug!(host = host.host_name(), port, address = %address, "Binding applied");
        Ok(())
    }
}

fn directive_error(port: u16, err: FragmentError) -> Error {
    Error::RemoteConfigInvalid {
        port,
        validator_output: err.to_string(),
    }
}
