//! Access-control capability interface.
//!
//! The decision algorithm itself lives outside this crate; the engine only
//! consumes the checked interface. Every operation asks before touching a
//! backend, and a denial short-circuits the operation.

use crate::entry::Dn;
use crate::errors::ResultCode;
use crate::mapping::EntryMapping;

/// The operation kinds a capability check distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Add,
    Modify,
    Delete,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Add => write!(f, "add"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Outcome of a capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny(ResultCode),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// The consumed ACL capability.
pub trait AccessControl: Send + Sync {
    fn check(
        &self,
        kind: AccessKind,
        principal: &Dn,
        target: &Dn,
        mapping: &EntryMapping,
    ) -> AccessDecision;
}

/// Permit-everything implementation, the default when no ACL collaborator
/// is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check(
        &self,
        _kind: AccessKind,
        _principal: &Dn,
        _target: &Dn,
        _mapping: &EntryMapping,
    ) -> AccessDecision {
        AccessDecision::Allow
    }
}

/// Deny writes under configured subtrees; reads stay open. Used by tests
/// and simple deployments.
#[derive(Debug, Clone, Default)]
pub struct ReadOnlySubtrees {
    subtrees: Vec<String>,
}

impl ReadOnlySubtrees {
    pub fn new(subtrees: Vec<String>) -> Self {
        Self { subtrees }
    }
}

impl AccessControl for ReadOnlySubtrees {
    fn check(
        &self,
        kind: AccessKind,
        _principal: &Dn,
        target: &Dn,
        _mapping: &EntryMapping,
    ) -> AccessDecision {
        if kind == AccessKind::Read {
            return AccessDecision::Allow;
        }
        let schema = crate::schema::Schema::new();
        let target = target.to_string();
        for subtree in &self.subtrees {
            if schema.is_suffix(&target, subtree) {
                return AccessDecision::Deny(ResultCode::InsufficientAccessRights);
            }
        }
        AccessDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Directory, EntryDefinition};

    fn mapping() -> EntryMapping {
        let mut dir = Directory::new();
        let id = dir
            .add_entry(None, EntryDefinition::new("dc=example").suffix("dc=com"))
            .unwrap();
        dir.get(id).unwrap().clone()
    }

    #[test]
    fn test_allow_all() {
        let acl = AllowAll;
        let dn = Dn::parse("cn=x,dc=example,dc=com").unwrap();
        let decision = acl.check(AccessKind::Delete, &Dn::root(), &dn, &mapping());
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_read_only_subtree_denies_writes() {
        let acl = ReadOnlySubtrees::new(vec!["dc=example,dc=com".into()]);
        let dn = Dn::parse("cn=x,dc=example,dc=com").unwrap();

        assert!(acl
            .check(AccessKind::Read, &Dn::root(), &dn, &mapping())
            .is_allowed());
        let denied = acl.check(AccessKind::Add, &Dn::root(), &dn, &mapping());
        assert_eq!(
            denied,
            AccessDecision::Deny(ResultCode::InsufficientAccessRights)
        );

        let outside = Dn::parse("cn=x,dc=other,dc=org").unwrap();
        assert!(acl
            .check(AccessKind::Add, &Dn::root(), &outside, &mapping())
            .is_allowed());
    }
}
