//! Page checks after changes are applied.
//!
//! Loads a page of the running app and reports anything that looks broken:
//! error statuses, the dev server's compile and runtime error overlays, and
//! request failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Text the dev server renders when a page fails.
const ERROR_MARKERS: &[&str] = &[
    "Failed to compile",
    "Unhandled Runtime Error",
    "Application error: a client-side exception has occurred",
    "Module not found",
    "Internal Server Error",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCheckResult {
    pub errors: Vec<String>,
    pub console: Vec<String>,
}

impl PageCheckResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[async_trait]
pub trait PageChecker: Send + Sync {
    async fn check(&self, url: &str) -> PageCheckResult;
}

/// Checks pages with plain HTTP, one at a time.
pub struct HttpPageChecker {
    client: reqwest::Client,
    permit: Semaphore,
    wait: Duration,
}

impl HttpPageChecker {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            permit: Semaphore::new(1),
            wait: Duration::from_secs(5),
        }
    }

    /// How long a check waits for the previous one to finish.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

impl Default for HttpPageChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl PageChecker for HttpPageChecker {
    async fn check(&self, url: &str) -> PageCheckResult {
        let Ok(Ok(_permit)) = tokio::time::timeout(self.wait, self.permit.acquire()).await else {
            return PageCheckResult {
                errors: Vec::new(),
                console: vec!["Browser status not currently available. This is not an error.".to_string()],
            };
        };

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url, error = %e, "Page check request failed");
                return PageCheckResult {
                    errors: vec![format!("Error checking page: {e}")],
                    console: Vec::new(),
                };
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let mut result = PageCheckResult::default();
        if status.is_client_error() || status.is_server_error() {
            result.errors.push(format!("Page returned HTTP {}", status.as_u16()));
        }
        for marker in ERROR_MARKERS {
            if body.contains(marker) {
                result.errors.push(marker.to_string());
            }
        }
        result.console.push(format!("GET {url} -> {}", status.as_u16()));
        debug!(url, status = status.as_u16(), errors = result.errors.len(), "Page checked");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_clean_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/about"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>About</body></html>"))
            .mount(&server)
            .await;
        let result = HttpPageChecker::default()
            .check(&format!("{}/about", server.uri()))
            .await;
        assert!(result.is_clean());
        assert_eq!(result.console.len(), 1);
    }

    #[tokio::test]
    async fn test_compile_error_overlay() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("<h1>Failed to compile</h1>./src/app/page.js"))
            .mount(&server)
            .await;
        let result = HttpPageChecker::default().check(&server.uri()).await;
        assert_eq!(result.errors, vec!["Page returned HTTP 500", "Failed to compile"]);
    }

    #[tokio::test]
    async fn test_unreachable_page() {
        let result = HttpPageChecker::new(Duration::from_millis(500))
            .check("http://127.0.0.1:1/")
            .await;
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Error checking page"));
    }
}
