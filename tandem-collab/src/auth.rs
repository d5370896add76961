//! Seam to the external authentication collaborator.
//!
//! The hub only needs two answers: which user a credential belongs to, and
//! whether that user may view a project.

use std::collections::{HashMap, HashSet};

use crate::config::ConfigError;
use crate::protocol::{ProjectId, UserId, UserInfo};

pub trait Authenticator: Send + Sync {
    /// Resolve a credential to a user, or `None` if it is not valid.
    fn authenticate(&self, token: &str) -> Option<UserInfo>;

    /// Whether `user` may join the room of `project`.
    fn can_access(&self, user: &UserInfo, project: &str) -> bool;
}

/// Fixed token → user table.
///
/// Without any membership entries every authenticated user may join every
/// project; once a user has memberships, they are restricted to them.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserInfo>,
    memberships: HashMap<UserId, HashSet<ProjectId>>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, token: impl Into<String>, user: UserInfo) -> Self {
        self.tokens.insert(token.into(), user);
        self
    }

    pub fn with_membership(mut self, user: impl Into<UserId>, project: impl Into<ProjectId>) -> Self {
        self.memberships
            .entry(user.into())
            .or_default()
            .insert(project.into());
        self
    }

    /// Parse a `token:user_id:display name` entry.
    pub fn parse_entry(entry: &str) -> Result<(String, UserInfo), ConfigError> {
        let mut parts = entry.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(token), Some(id), Some(name))
                if !token.is_empty() && !id.is_empty() && !name.trim().is_empty() =>
            {
                Ok((token.to_string(), UserInfo::new(id, name.trim())))
            }
            _ => Err(ConfigError::UserEntry(entry.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Option<UserInfo> {
        self.tokens.get(token).cloned()
    }

    fn can_access(&self, user: &UserInfo, project: &str) -> bool {
        self.memberships
            .get(&user.id)
            .map_or(true, |projects| projects.contains(project))
    }
}
