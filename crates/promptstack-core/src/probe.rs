//! Reachability checks against a sandbox's public URL.

use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;

/// Whether a URL currently answers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Probe: Send + Sync {
    async fn is_reachable(&self, url: &str) -> bool;
}

/// Plain HTTP GET; any success or redirect status counts as reachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn is_reachable(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                trace!(url, status = status.as_u16(), "Probe response");
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                trace!(url, error = %e, "Probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_success_and_redirect_are_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(307).insert_header("location", "/login"))
            .mount(&server)
            .await;
        assert!(HttpProbe::default().is_reachable(&server.uri()).await);
    }

    #[tokio::test]
    async fn test_server_error_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        assert!(!HttpProbe::default().is_reachable(&server.uri()).await);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let probe = HttpProbe::new(Duration::from_millis(500));
        assert!(!probe.is_reachable("http://127.0.0.1:1").await);
    }
}
