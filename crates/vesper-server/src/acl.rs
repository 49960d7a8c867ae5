//! Access-control boundary.
//!
//! The dispatcher feeds every resolved command through
//! [`AccessControl::authorize`] before execution: the connection
//! identity, the command name, its category set, and the keys the
//! command touches. User lookup, rule editing, and persistence live
//! behind this trait and outside this server.

use crate::dispatch::Category;

/// Identity of the connection issuing a command.
#[derive(Debug, Clone, Default)]
pub struct ConnInfo {
    /// Per-server connection id (0 for internal callers such as the
    /// replication apply path and AOF replay).
    pub id: u64,
    /// Authenticated user, when the deployment runs with users.
    pub user: Option<String>,
}

/// Denial returned by the access layer; the dispatcher surfaces it as a
/// permission error to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclDenied {
    pub reason: String,
}

/// Allow/deny decisions for commands.
pub trait AccessControl: Send + Sync {
    fn authorize(
        &self,
        conn: &ConnInfo,
        command: &str,
        categories: &[Category],
        keys: &[String],
    ) -> Result<(), AclDenied>;
}

/// Default policy: every command allowed for every connection.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn authorize(
        &self,
        _conn: &ConnInfo,
        _command: &str,
        _categories: &[Category],
        _keys: &[String],
    ) -> Result<(), AclDenied> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Denies writes to keys with a given prefix; used to exercise the
    /// dispatcher's deny path.
    pub struct DenyPrefix(pub &'static str);

    impl AccessControl for DenyPrefix {
        fn authorize(
            &self,
            _conn: &ConnInfo,
            command: &str,
            _categories: &[Category],
            keys: &[String],
        ) -> Result<(), AclDenied> {
            if keys.iter().any(|k| k.starts_with(self.0)) {
                return Err(AclDenied {
                    reason: format!("no access to '{}' keys via {command}", self.0),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn allow_all_allows() {
        let acl = AllowAll;
        assert!(acl
            .authorize(&ConnInfo::default(), "set", &[Category::Write], &["k".into()])
            .is_ok());
    }

    #[test]
    fn deny_prefix_denies() {
        let acl = DenyPrefix("secret:");
        let err = acl
            .authorize(
                &ConnInfo::default(),
                "get",
                &[Category::Read],
                &["secret:token".into()],
            )
            .unwrap_err();
        assert!(err.reason.contains("secret:"));
    }
}
