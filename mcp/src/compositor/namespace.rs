//! Routed identifiers: `<prefix>/<server>/<local>`.
//!
//! The server segment is always a validated mount name, so it never contains
//! `/`. The local segment is taken verbatim and may contain anything,
//! including further slashes or a full URI.

use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{McpError, McpResult};

static MOUNT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("mount name pattern compiles"));

pub const DEFAULT_PREFIX: &str = "mcp";

/// Reject mount names that could not round-trip through a routed identifier.
pub fn validate_mount_name(name: &str) -> McpResult<()> {
    if MOUNT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(McpError::InvalidMountName(name.to_string()))
    }
}

/// A routed identifier split into its owning server and the server-local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutedId {
    pub server: String,
    pub local: String,
}

impl RoutedId {
    pub fn new(server: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            local: local.into(),
        }
    }
}

/// Translates between server-local names and the aggregate namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `local` on `server` as seen by the agent.
    pub fn translate(&self, server: &str, local: &str) -> String {
        format!("{}/{}/{}", self.prefix, server, local)
    }

    /// Everything a mount owns starts with this string.
    pub fn mount_prefix(&self, server: &str) -> String {
        format!("{}/{}/", self.prefix, server)
    }

    /// Split a routed identifier. Returns `UnknownRoute` if it is not one.
    pub fn untranslate(&self, routed: &str) -> McpResult<RoutedId> {
        let rest = routed
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| McpError::UnknownRoute(routed.to_string()))?;
        match rest.split_once('/') {
            Some((server, local)) if !server.is_empty() && !local.is_empty() => {
                Ok(RoutedId::new(server, local))
            }
            _ => Err(McpError::UnknownRoute(routed.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_name_validation() {
        for ok in ["fs", "git2", "my_server", "a"] {
            assert!(validate_mount_name(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", "Fs", "2fs", "my-server", "a/b", "_x"] {
            assert!(
                matches!(validate_mount_name(bad), Err(McpError::InvalidMountName(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_translate_untranslate() {
        let ns = Namespace::default();
        let routed = ns.translate("fs", "read_file");
        assert_eq!(routed, "mcp/fs/read_file");
        assert_eq!(ns.untranslate(&routed).unwrap(), RoutedId::new("fs", "read_file"));
    }

    #[test]
    fn test_local_part_keeps_slashes() {
        let ns = Namespace::new("tools");
        let routed = ns.translate("files", "file:///etc/hosts");
        let back = ns.untranslate(&routed).unwrap();
        assert_eq!(back.server, "files");
        assert_eq!(back.local, "file:///etc/hosts");
    }

    #[test]
    fn test_rejects_foreign_identifiers() {
        let ns = Namespace::default();
        for bad in ["read_file", "mcp/fs", "mcp/fs/", "other/fs/x", "mcpx/fs/x", "mcp//x"] {
            assert!(
                matches!(ns.untranslate(bad), Err(McpError::UnknownRoute(_))),
                "{bad} should not route"
            );
        }
    }

    #[test]
    fn test_mount_prefix_matches_translated() {
        let ns = Namespace::default();
        assert!(ns.translate("fs", "x").starts_with(&ns.mount_prefix("fs")));
        assert!(!ns.translate("fsx", "x").starts_with(&ns.mount_prefix("fs")));
    }
}
