//! Outbound verification of a port's egress address
//!
//! Best effort: failures are logged and leave the previous observed IP in
//! place. Nothing here ever fails a rotation.

use std::net::IpAddr;
use std::time::Duration;

use crate::config::VerifierConfig;
use crate::model::User;
use crate::traits::{EgressProbe, PortStore, ProbeTarget, ProxyStore};

/// Probes a port's egress IP with retries and caches the result on the port
pub struct OutboundVerifier {
    probe: Box<dyn EgressProbe>,
    attempts: usize,
    retry_delay: Duration,
}

impl OutboundVerifier {
    pub fn new(probe: Box<dyn EgressProbe>, config: &VerifierConfig) -> Self {
        Self {
            probe,
            attempts: config.attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        }
    }

    /// Override the delay between attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Probe `port` as `user` and record the observed IP
    ///
    /// Returns the observed IP, or `None` when every attempt failed or the
    /// result could not be stored.
    pub async fn verify(
        &self,
        store: &dyn ProxyStore,
        host: &str,
        port: u16,
        user: &User,
    ) -> Option<IpAddr> {
        let target = ProbeTarget {
            host: host.to_string(),
            port,
            username: user.proxy_username.clone(),
            password: user.proxy_password.clone(),
        };

        for attempt in 1..=self.attempts {
            match self.probe.probe(&target).await {
                Ok(ip) => {
                    tracing::debug!(port, attempt, observed_ip = %ip, "Egress probe succeeded");
                    if let Err(e) = store.set_observed_ip(port, ip).await {
                        tracing::warn!(port, "Failed to record observed IP: {}", e);
                        return None;
                    }
                    return Some(ip);
                }
                Err(e) => {
                    tracing::warn!(
                        port,
                        attempt,
                        max_attempts = self.attempts,
                        probe = self.probe.probe_name(),
                        "Egress probe failed: {}",
                        e
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        tracing::warn!(port, "Egress verification gave up, observed IP left unchanged");
        None
    }
}
