//! Readiness and liveness probing.
//!
//! Every managed service exposes `GET /readiness` and `GET /liveness` on its
//! status port. Any response in the 200–399 range counts as a success; a
//! connection failure counts as not-ready. Dependents poll readiness while
//! blocked in the Dependencies state.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;

/// Per-request probe timeout. Probes target localhost, so anything slower
/// than this is as good as down.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared HTTP client for all probes.
///
/// A single pooled client avoids file descriptor exhaustion when many
/// services poll each other's endpoints concurrently.
static SHARED_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("default reqwest client")
    })
}

/// A boolean health probe.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> bool;
}

/// HTTP probe against a fixed URL.
pub struct HttpProbe {
    url: String,
}

impl HttpProbe {
    pub fn new(url: String) -> Self {
        Self { url }
    }

    /// Probe for the readiness endpoint on a local status port.
    pub fn readiness(port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{port}/readiness"))
    }

    /// Probe for the liveness endpoint on a local status port.
    pub fn liveness(port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{port}/liveness"))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> bool {
        match shared_client().get(&self.url).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                (200..400).contains(&code)
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_port_is_not_ready() {
        let probe = HttpProbe::readiness(59_999);
        assert!(!probe.check().await);
    }

    #[test]
    fn probe_urls() {
        assert_eq!(
            HttpProbe::readiness(4001).url,
            "http://127.0.0.1:4001/readiness"
        );
        assert_eq!(
            HttpProbe::liveness(4001).url,
            "http://127.0.0.1:4001/liveness"
        );
    }
}
