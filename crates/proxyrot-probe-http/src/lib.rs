// # HTTP Egress Probe
//
// Asks a "what is my IP" endpoint (e.g. icanhazip.com) which address a
// request arrives from, sending the request through one proxy port with the
// port owner's credentials.
//
// ## Single-Shot
//
// One request per `probe` call. Retries and the delay that covers the
// proxy's reload latency belong to `OutboundVerifier`.

use proxyrot_core::BackendRegistry;
use proxyrot_core::config::VerifierConfig;
use proxyrot_core::traits::{EgressProbe, EgressProbeFactory, ProbeTarget};
use proxyrot_core::{Error, Result};

use std::net::IpAddr;
use std::time::Duration;

/// Probe that fetches the caller's IP as plain text through the proxy
pub struct HttpEgressProbe {
    url: String,
    timeout: Duration,
}

impl HttpEgressProbe {
    /// Create a new HTTP probe
    ///
    /// # Parameters
    ///
    /// - `url`: Endpoint returning the caller's IP (e.g., "https://ipv4.icanhazip.com")
    /// - `timeout`: Bound for the whole request, connect included
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    /// Client routed through the target port
    fn client_for(&self, target: &ProbeTarget) -> Result<reqwest::Client> {
        let proxy = reqwest::Proxy::all(format!("http://{}:{}", target.host, target.port))
            .map_err(|e| Error::invalid_input(format!("Invalid proxy address: {}", e)))?
            .basic_auth(&target.username, &target.password);

        reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))
    }
}

#[async_trait::async_trait]
impl EgressProbe for HttpEgressProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<IpAddr> {
        let client = self.client_for(target)?;

        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Other(format!("Probe request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "Probe HTTP error: {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Other(format!("Failed to read probe response: {}", e)))?;

        let body = body.trim();
        let ip: IpAddr = body
            .parse()
            .map_err(|_| Error::Other(format!("Probe returned invalid IP address: {}", body)))?;

        tracing::debug!(port = target.port, observed = %ip, "Probe answered");
        Ok(ip)
    }

    fn probe_name(&self) -> &'static str {
        "http"
    }
}

/// Factory for creating HTTP probes
pub struct HttpProbeFactory;

impl EgressProbeFactory for HttpProbeFactory {
    fn create(&self, config: &VerifierConfig) -> Result<Box<dyn EgressProbe>> {
        config.validate()?;
        Ok(Box::new(HttpEgressProbe::new(
            config.url.clone(),
            Duration::from_secs(config.timeout_secs),
        )))
    }
}

/// Register the HTTP probe with a registry
pub fn register(registry: &BackendRegistry) {
    registry.register_probe("http", Box::new(HttpProbeFactory));
}
