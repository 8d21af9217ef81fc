//! Prefixed ULID identifiers.
//!
//! Every record promptstack persists is keyed by `prefix_ulid`, lowercased,
//! e.g. `prj_01hqxyz...` for a project. ULIDs sort by creation time, which
//! keeps chat messages in order when listed from storage.

use std::sync::{Mutex, OnceLock};
use ulid::{Generator, Ulid};

/// Known identifier prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdPrefix {
    Project,
    Chat,
    Message,
    Sandbox,
    Volume,
}

impl IdPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdPrefix::Project => "prj",
            IdPrefix::Chat => "cht",
            IdPrefix::Message => "msg",
            IdPrefix::Sandbox => "sbx",
            IdPrefix::Volume => "vol",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prj" => Some(IdPrefix::Project),
            "cht" => Some(IdPrefix::Chat),
            "msg" => Some(IdPrefix::Message),
            "sbx" => Some(IdPrefix::Sandbox),
            "vol" => Some(IdPrefix::Volume),
            _ => None,
        }
    }
}

/// Identifier generation and parsing.
pub struct Identifier;

impl Identifier {
    /// New identifier that sorts after every identifier generated before it.
    pub fn ascending(prefix: IdPrefix) -> String {
        static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
        let generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
        let ulid = match generator.lock() {
            Ok(mut g) => g.generate().unwrap_or_else(|_| Ulid::new()),
            Err(_) => Ulid::new(),
        };
        Self::with_ulid(prefix, ulid)
    }

    pub fn with_ulid(prefix: IdPrefix, ulid: Ulid) -> String {
        format!("{}_{}", prefix.as_str(), ulid.to_string().to_lowercase())
    }

    /// Split an identifier into prefix and ULID.
    pub fn parse(id: &str) -> Option<(IdPrefix, Ulid)> {
        let (prefix, rest) = id.split_once('_')?;
        let prefix = IdPrefix::parse(prefix)?;
        let ulid = Ulid::from_string(rest).ok()?;
        Some((prefix, ulid))
    }

    pub fn has_prefix(id: &str, prefix: IdPrefix) -> bool {
        id.strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.starts_with('_'))
    }

    pub fn project() -> String {
        Self::ascending(IdPrefix::Project)
    }

    pub fn chat() -> String {
        Self::ascending(IdPrefix::Chat)
    }

    pub fn message() -> String {
        Self::ascending(IdPrefix::Message)
    }

    pub fn sandbox() -> String {
        Self::ascending(IdPrefix::Sandbox)
    }

    pub fn volume() -> String {
        Self::ascending(IdPrefix::Volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_shape() {
        let id = Identifier::project();
        assert!(id.starts_with("prj_"));
        assert_eq!(id.len(), 30);
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn test_message_ids_sort_by_creation() {
        let first = Identifier::with_ulid(IdPrefix::Message, Ulid::from_parts(1_000, 7));
        let second = Identifier::with_ulid(IdPrefix::Message, Ulid::from_parts(2_000, 3));
        assert!(first < second);
    }

    #[test]
    fn test_ascending_is_monotonic_within_a_millisecond() {
        let ids: Vec<String> = (0..64).map(|_| Identifier::message()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_parse_roundtrip_prefix() {
        let id = Identifier::chat();
        let (prefix, _) = Identifier::parse(&id).unwrap();
        assert_eq!(prefix, IdPrefix::Chat);
    }

    #[test]
    fn test_parse_rejects_unknown_prefix() {
        assert!(Identifier::parse("ses_01hqxyzabcdefghjkmnpqrstvw").is_none());
        assert!(Identifier::parse("prj").is_none());
    }

    #[test]
    fn test_has_prefix() {
        let id = Identifier::sandbox();
        assert!(Identifier::has_prefix(&id, IdPrefix::Sandbox));
        assert!(!Identifier::has_prefix(&id, IdPrefix::Volume));
        assert!(!Identifier::has_prefix("sbxfoo", IdPrefix::Sandbox));
    }
}
