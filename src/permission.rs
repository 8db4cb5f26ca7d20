//! Permission model and vector-metadata projection.
//!
//! A [`Permission`] is an ordered capability granted to one user on one
//! knowledge entry. The reserved pseudo-user [`ANY_USER`] represents public
//! visibility: a lookup for a concrete user with no explicit grant falls
//! back to the `ANY` grant, else `None`.
//!
//! The projector half of this module bridges the relational permission map
//! to the vector store's metadata filter, which only supports matching on
//! a single string field. Every authorized username is wrapped in a fixed
//! delimiter (`|alice|bob|`) so that a query token (`|bob|`) can be matched
//! by substring containment. This module is pure data transformation with
//! no side effects.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::models::Identity;

/// Reserved pseudo-username representing public / anonymous-visible access.
pub const ANY_USER: &str = "ANY";

/// Delimiter wrapping each username in a permission token.
pub const TOKEN_DELIMITER: char = '|';

/// Ordered per-user capability on a knowledge entry.
///
/// `None` is never stored — absence of a grant is the only representation
/// of no access. It exists as a variant so that lookups and comparisons
/// have a total order: `None < Readonly < ReadWrite < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Permission {
    None,
    Readonly,
    ReadWrite,
    Owner,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::None => "none",
            Permission::Readonly => "readonly",
            Permission::ReadWrite => "readwrite",
            Permission::Owner => "owner",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Permission::None),
            "readonly" => Ok(Permission::Readonly),
            "readwrite" => Ok(Permission::ReadWrite),
            "owner" => Ok(Permission::Owner),
            other => Err(format!(
                "unknown permission '{}'. Must be readonly, readwrite, or owner",
                other
            )),
        }
    }
}

/// Resolve the effective permission of `identity` against a grant map.
///
/// An authenticated user gets their explicit grant if present, else the
/// `ANY` grant, else `None`. An anonymous identity gets the `ANY` grant,
/// else `None`.
pub fn effective_permission(
    grants: &BTreeMap<String, Permission>,
    identity: &Identity,
) -> Permission {
    let public = grants.get(ANY_USER).copied().unwrap_or(Permission::None);
    match identity.username() {
        Some(username) => grants.get(username).copied().unwrap_or(public),
        None => public,
    }
}

/// Project a permission map into the vector-store metadata token.
///
/// Every user with permission at or above `Readonly` (including the owner)
/// is emitted as `|username|`; absent users contribute nothing. The result
/// for `{alice: Readonly, bob: Owner}` is `|alice|bob|`. An entry with no
/// grants projects to the empty string, which matches no query token.
pub fn permissions_to_token(grants: &BTreeMap<String, Permission>) -> String {
    let mut token = String::new();
    for (username, permission) in grants {
        if *permission >= Permission::Readonly {
            if token.is_empty() {
                token.push(TOKEN_DELIMITER);
            }
            token.push_str(username);
            token.push(TOKEN_DELIMITER);
        }
    }
    token
}

/// Project a requesting identity into the matching query token.
///
/// Authenticated users map to `|username|`; anonymous callers map to the
/// reserved `|ANY|` token.
pub fn identity_to_query_token(identity: &Identity) -> String {
    let username = identity.username().unwrap_or(ANY_USER);
    format!("{}{}{}", TOKEN_DELIMITER, username, TOKEN_DELIMITER)
}

/// Whether a username may appear in a grant map.
///
/// The delimiter character is rejected because it would collide with the
/// token encoding; an embedded `|` could forge another user's query token.
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty() && !username.contains(TOKEN_DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grants(entries: &[(&str, Permission)]) -> BTreeMap<String, Permission> {
        entries
            .iter()
            .map(|(u, p)| (u.to_string(), *p))
            .collect()
    }

    #[test]
    fn test_permission_ordering() {
        assert!(Permission::None < Permission::Readonly);
        assert!(Permission::Readonly < Permission::ReadWrite);
        assert!(Permission::ReadWrite < Permission::Owner);
    }

    #[test]
    fn test_effective_permission_explicit_grant() {
        let g = grants(&[("alice", Permission::Owner), ("bob", Permission::Readonly)]);
        let alice = Identity::User("alice".to_string());
        assert_eq!(effective_permission(&g, &alice), Permission::Owner);
    }

    #[test]
    fn test_effective_permission_any_fallback() {
        let g = grants(&[("alice", Permission::Owner), (ANY_USER, Permission::Readonly)]);
        let carol = Identity::User("carol".to_string());
        assert_eq!(effective_permission(&g, &carol), Permission::Readonly);
        assert_eq!(
            effective_permission(&g, &Identity::Anonymous),
            Permission::Readonly
        );
    }

    #[test]
    fn test_effective_permission_default_none() {
        let g = grants(&[("alice", Permission::Owner)]);
        let carol = Identity::User("carol".to_string());
        assert_eq!(effective_permission(&g, &carol), Permission::None);
        assert_eq!(
            effective_permission(&g, &Identity::Anonymous),
            Permission::None
        );
    }

    #[test]
    fn test_explicit_grant_beats_any_fallback() {
        let g = grants(&[
            ("alice", Permission::ReadWrite),
            (ANY_USER, Permission::Readonly),
        ]);
        let alice = Identity::User("alice".to_string());
        assert_eq!(effective_permission(&g, &alice), Permission::ReadWrite);
    }

    #[test]
    fn test_token_includes_all_readable_users() {
        let g = grants(&[("alice", Permission::Readonly), ("bob", Permission::Owner)]);
        assert_eq!(permissions_to_token(&g), "|alice|bob|");
    }

    #[test]
    fn test_token_excludes_none() {
        // An explicit None grant never reaches storage, but the projector
        // must exclude it regardless.
        let g = grants(&[("alice", Permission::Readonly), ("bob", Permission::None)]);
        assert_eq!(permissions_to_token(&g), "|alice|");
    }

    #[test]
    fn test_token_empty_map() {
        assert_eq!(permissions_to_token(&BTreeMap::new()), "");
    }

    #[test]
    fn test_query_token() {
        let alice = Identity::User("alice".to_string());
        assert_eq!(identity_to_query_token(&alice), "|alice|");
        assert_eq!(identity_to_query_token(&Identity::Anonymous), "|ANY|");
    }

    #[test]
    fn test_query_token_matches_projected_token() {
        let g = grants(&[("alice", Permission::Readonly), ("bob", Permission::Owner)]);
        let token = permissions_to_token(&g);
        let bob = Identity::User("bob".to_string());
        assert!(token.contains(&identity_to_query_token(&bob)));
        let carol = Identity::User("carol".to_string());
        assert!(!token.contains(&identity_to_query_token(&carol)));
    }

    #[test]
    fn test_username_validation() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username(ANY_USER));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("al|ice"));
    }

    #[test]
    fn test_permission_parse_round_trip() {
        for p in [Permission::Readonly, Permission::ReadWrite, Permission::Owner] {
            assert_eq!(p.as_str().parse::<Permission>().unwrap(), p);
        }
        assert!("root".parse::<Permission>().is_err());
    }
}
