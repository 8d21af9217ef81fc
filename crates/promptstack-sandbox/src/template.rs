//! Stack templates.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A named tech stack: base image plus the commands that prepare and run it.
///
/// Templates are immutable once loaded. Pooled sandboxes remember the
/// [`content_hash`](Self::content_hash) they were built from, so editing a
/// template's image or commands invalidates every warm sandbox built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTemplate {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Container image reference.
    pub image: String,
    /// Run once against a fresh volume while pooling.
    pub init_command: String,
    /// Main process of a project's sandbox.
    pub start_command: String,
    /// Stack guidance for the agent's system prompt.
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint_command: Option<String>,
}

impl StackTemplate {
    /// First 16 hex chars of SHA-256 over image, init and start commands.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.image, &self.init_command, &self.start_command] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(16);
        for byte in &digest[..8] {
            hex.push_str(&format!("{byte:02x}"));
        }
        hex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> StackTemplate {
        StackTemplate {
            id: "nextjs".into(),
            title: "Next.js".into(),
            description: "vanilla".into(),
            image: "node:20".into(),
            init_command: "cd /app && git init".into(),
            start_command: "npm run dev".into(),
            prompt: "You are building a Next.js app.".into(),
            lint_command: None,
        }
    }

    #[test]
    fn hash_is_stable_and_short() {
        let a = template().content_hash();
        assert_eq!(a.len(), 16);
        assert_eq!(a, template().content_hash());
    }

    #[test]
    fn hash_ignores_presentation_fields() {
        let mut t = template();
        t.title = "Renamed".into();
        t.prompt = "Different guidance".into();
        assert_eq!(t.content_hash(), template().content_hash());
    }

    #[test]
    fn hash_tracks_commands() {
        let mut t = template();
        t.init_command.push_str(" && npm ci");
        assert_ne!(t.content_hash(), template().content_hash());
    }
}
