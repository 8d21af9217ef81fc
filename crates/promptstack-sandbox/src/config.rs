//! Docker backend configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Host used when building tunnel URLs for published ports.
    pub tunnel_host: String,
    /// Small image used to read and write volumes without a sandbox.
    pub helper_image: String,
    /// Pull images that are missing locally before creating containers.
    pub pull_images: bool,
    /// Docker network to attach sandboxes to.
    pub network: Option<String>,
    pub resources: ResourceLimits,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            tunnel_host: "localhost".to_string(),
            helper_image: "busybox:1.36".to_string(),
            pull_images: true,
            network: None,
            resources: ResourceLimits::default(),
        }
    }
}

/// Per-sandbox resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit, e.g. "512M" or "2G".
    pub memory: String,
    pub cpus: f32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "512M".to_string(),
            cpus: 1.0,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> Option<u64> {
        parse_size(&self.memory)
    }

    pub fn cpu_nano(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

/// "2G" / "512M" / "64K" / "100" to bytes.
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_uppercase();
    let (digits, multiplier) = match s.chars().last()? {
        'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        'M' => (&s[..s.len() - 1], 1024 * 1024),
        'K' => (&s[..s.len() - 1], 1024),
        _ => (s.as_str(), 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_size("100"), Some(100));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_bytes(), Some(512 * 1024 * 1024));
        assert_eq!(limits.cpu_nano(), 1_000_000_000);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: DockerConfig = serde_json::from_str(r#"{"tunnel_host":"10.0.0.5"}"#).unwrap();
        assert_eq!(config.tunnel_host, "10.0.0.5");
        assert_eq!(config.helper_image, "busybox:1.36");
    }
}
