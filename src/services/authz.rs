use crate::config::AuthConfig;
use crate::models::{ClaimSet, OwnerFilter};

/// Operations subject to authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    Upload,
    Read,
    Delete,
    ListAll,
    ListForUser(&'a str),
}

/// Claim-based access rules
///
/// The scope gate runs first and independently of the role and ownership
/// rules.
#[derive(Debug, Clone)]
pub struct AuthorizationEngine {
    admin_role: String,
    required_scope: Option<String>,
}

impl AuthorizationEngine {
    pub fn new(admin_role: impl Into<String>, required_scope: Option<String>) -> Self {
        Self {
            admin_role: admin_role.into(),
            required_scope: required_scope.filter(|s| !s.is_empty()),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.admin_role.clone(), Some(config.scope.clone()))
    }

    pub fn is_admin(&self, claims: &ClaimSet) -> bool {
        claims.has_role(&self.admin_role)
    }

    fn scope_allows(&self, claims: &ClaimSet) -> bool {
        match &self.required_scope {
            Some(scope) => claims.has_scope(scope),
            None => true,
        }
    }

    /// Decide whether `claims` may perform `op` on a resource owned by `owner`
    pub fn authorize(&self, claims: &ClaimSet, op: Operation<'_>, owner: Option<&str>) -> bool {
        if !self.scope_allows(claims) {
            return false;
        }

        match op {
            Operation::Upload | Operation::ListAll => true,
            Operation::Read | Operation::Delete => {
                owner == Some(claims.subject.as_str()) || self.is_admin(claims)
            }
            Operation::ListForUser(target) => target == claims.subject || self.is_admin(claims),
        }
    }

    /// Records a caller may see in an unfiltered listing
    pub fn list_filter(&self, claims: &ClaimSet) -> OwnerFilter {
        if self.is_admin(claims) {
            OwnerFilter::All
        } else {
            OwnerFilter::Owner(claims.subject.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: &str, roles: &[&str], scopes: &[&str]) -> ClaimSet {
        ClaimSet {
            subject: sub.to_string(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_owner_and_admin_rules() {
        let engine = AuthorizationEngine::new("admin", None);
        let alice = claims("alice", &["user"], &[]);
        let bob = claims("bob", &["user"], &[]);
        let root = claims("root", &["admin"], &[]);

        for op in [Operation::Read, Operation::Delete] {
            assert!(engine.authorize(&alice, op, Some("alice")));
            assert!(!engine.authorize(&bob, op, Some("alice")));
            assert!(engine.authorize(&root, op, Some("alice")));
            assert!(!engine.authorize(&alice, op, None));
        }

        assert!(engine.authorize(&bob, Operation::Upload, None));
        assert!(engine.authorize(&bob, Operation::ListAll, None));
    }

    #[test]
    fn test_list_for_user() {
        let engine = AuthorizationEngine::new("mfs.admin", None);
        let alice = claims("alice", &["user"], &[]);
        let root = claims("root", &["mfs.admin"], &[]);

        assert!(engine.authorize(&alice, Operation::ListForUser("alice"), None));
        assert!(!engine.authorize(&alice, Operation::ListForUser("bob"), None));
        assert!(engine.authorize(&root, Operation::ListForUser("bob"), None));
    }

    #[test]
    fn test_list_filter() {
        let engine = AuthorizationEngine::new("admin", None);
        assert_eq!(
            engine.list_filter(&claims("alice", &["user"], &[])),
            OwnerFilter::Owner("alice".to_string())
        );
        assert_eq!(engine.list_filter(&claims("root", &["admin"], &[])), OwnerFilter::All);
    }

    #[test]
    fn test_scope_gate_precedes_ownership() {
        let engine = AuthorizationEngine::new("admin", Some("mfs".to_string()));
        let owner_without_scope = claims("alice", &["admin"], &["openid"]);
        let owner_with_scope = claims("alice", &[], &["openid", "mfs"]);

        for op in [
            Operation::Upload,
            Operation::Read,
            Operation::Delete,
            Operation::ListAll,
            Operation::ListForUser("alice"),
        ] {
            assert!(!engine.authorize(&owner_without_scope, op, Some("alice")));
            assert!(engine.authorize(&owner_with_scope, op, Some("alice")));
        }
    }

    #[test]
    fn test_empty_scope_disables_gate() {
        let engine = AuthorizationEngine::new("admin", Some(String::new()));
        assert!(engine.authorize(&claims("alice", &[], &[]), Operation::Upload, None));
    }
}
