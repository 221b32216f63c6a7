// # Egress Probe Trait
//
// One outbound request through a proxy port, answering "which IP does the
// outside world see?".
//
// ## Implementations
//
// - HTTP "what is my IP" endpoint: `proxyrot-probe-http` crate

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;

/// Where and as whom to connect for a probe
#[derive(Clone)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// ⚠️ NEVER log this value
    pub password: String,
}

impl fmt::Debug for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .finish()
    }
}

/// Trait for egress probe implementations
///
/// # Trust Level: Untrusted
///
/// Probes are single-shot: one request per call, no retries (owned by
/// `OutboundVerifier`), no caching, no store access. Every probe must be
/// bounded by a short timeout.
#[async_trait]
pub trait EgressProbe: Send + Sync {
    /// Issue one request through the target and return the observed egress IP
    async fn probe(&self, target: &ProbeTarget) -> Result<IpAddr, crate::Error>;

    /// Probe name (for logging)
    fn probe_name(&self) -> &'static str;
}

/// Helper trait for constructing probes from configuration
pub trait EgressProbeFactory: Send + Sync {
    /// Create an EgressProbe instance from configuration
    fn create(
        &self,
        config: &crate::config::VerifierConfig,
    ) -> Result<Box<dyn EgressProbe>, crate::Error>;
}
