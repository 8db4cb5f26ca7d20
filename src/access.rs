//! Per-request access control over the knowledge manager.
//!
//! [`AccessPolicy`] is explicit composition, not inheritance: it holds a
//! reference to the base [`KnowledgeManager`] and enforces the caller's
//! role and capability before delegating, so the authorization logic is
//! independently testable.
//!
//! Visibility rules: admins see everything; authenticated non-admins see
//! their own plus public (`ANY`-granted) entries; anonymous callers see
//! only public entries. When the caller has no visibility at all the
//! policy answers `KnowledgeNotFound` rather than `Forbidden`, so that
//! unauthorized callers cannot probe for existence.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::Config;
use crate::error::{KbError, Result};
use crate::manager::KnowledgeManager;
use crate::models::{Identity, Knowledge, Role, User};
use crate::permission::{
    effective_permission, identity_to_query_token, Permission, ANY_USER,
};
use crate::storage::BlobMetadata;
use crate::vector::VectorHit;

/// Resolves usernames to registered users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a username, failing with [`KbError::UserNotFound`] if the
    /// user is not registered.
    async fn resolve(&self, username: &str) -> Result<User>;
}

/// User directory backed by the `[users]` table of the config file.
pub struct ConfigUserDirectory {
    users: BTreeMap<String, Role>,
}

impl ConfigUserDirectory {
    pub fn from_config(config: &Config) -> Self {
        let users = config
            .users
            .iter()
            .map(|(username, u)| {
                let role = match u.role.as_str() {
                    "admin" => Role::Admin,
                    _ => Role::Standard,
                };
                (username.clone(), role)
            })
            .collect();
        Self { users }
    }
}

#[async_trait]
impl UserDirectory for ConfigUserDirectory {
    async fn resolve(&self, username: &str) -> Result<User> {
        match self.users.get(username) {
            Some(role) => Ok(User {
                username: username.to_string(),
                role: *role,
            }),
            None => Err(KbError::UserNotFound(username.to_string())),
        }
    }
}

/// Per-request decorator enforcing the caller's capabilities.
pub struct AccessPolicy {
    manager: Arc<KnowledgeManager>,
    directory: Arc<dyn UserDirectory>,
    caller: Identity,
    caller_user: Option<User>,
}

impl AccessPolicy {
    /// Bind a policy to the request's caller.
    ///
    /// A named caller that the directory does not know fails with
    /// `NotRegistered` up front; the anonymous identity is admitted and
    /// later restricted to public records and no mutations.
    pub async fn for_request(
        manager: Arc<KnowledgeManager>,
        directory: Arc<dyn UserDirectory>,
        caller: Identity,
    ) -> Result<Self> {
        let caller_user = match &caller {
            Identity::User(username) => Some(
                directory
                    .resolve(username)
                    .await
                    .map_err(|_| KbError::NotRegistered)?,
            ),
            Identity::Anonymous => None,
        };
        Ok(Self {
            manager,
            directory,
            caller,
            caller_user,
        })
    }

    fn is_admin(&self) -> bool {
        self.caller_user.as_ref().is_some_and(User::is_admin)
    }

    fn require_registered(&self) -> Result<&User> {
        self.caller_user.as_ref().ok_or(KbError::NotRegistered)
    }

    fn effective(&self, knowledge: &Knowledge) -> Permission {
        effective_permission(&knowledge.permissions, &self.caller)
    }

    /// Resolve `id` subject to visibility. No visibility at all maps to
    /// `KnowledgeNotFound`, never `Forbidden`.
    async fn visible(&self, id: &str) -> Result<Knowledge> {
        let knowledge = self
            .manager
            .get_knowledge(id)
            .await?
            .ok_or(KbError::KnowledgeNotFound)?;
        if self.is_admin() || self.effective(&knowledge) >= Permission::Readonly {
            Ok(knowledge)
        } else {
            debug!(id = %id, "entry invisible to caller");
            Err(KbError::KnowledgeNotFound)
        }
    }

    fn require_capability(
        &self,
        knowledge: &Knowledge,
        needed: Permission,
        action: &str,
    ) -> Result<()> {
        if self.is_admin() || self.effective(knowledge) >= needed {
            Ok(())
        } else {
            Err(KbError::Forbidden(format!(
                "{} requires {}",
                action,
                needed.as_str()
            )))
        }
    }

    /// Resolve a username argument before delegating, exempting the
    /// reserved `ANY` pseudo-user.
    async fn resolve_target(&self, username: &str) -> Result<()> {
        if username != ANY_USER {
            self.directory.resolve(username).await?;
        }
        Ok(())
    }

    // ---- reads ----

    /// Everything the caller may see.
    pub async fn get_all_knowledge(&self) -> Result<Vec<Knowledge>> {
        if self.is_admin() {
            self.manager.list_knowledge().await
        } else {
            self.manager.list_visible(self.caller.username()).await
        }
    }

    pub async fn get_knowledge(&self, id: &str) -> Result<Knowledge> {
        self.visible(id).await
    }

    pub async fn get_file(&self, id: &str) -> Result<(String, Vec<u8>, BlobMetadata)> {
        self.visible(id).await?;
        self.manager.get_file(id).await
    }

    /// Similarity search scoped to the caller's query token.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<VectorHit>> {
        let token = identity_to_query_token(&self.caller);
        self.manager.search(query, &token, limit).await
    }

    // ---- mutations ----

    /// Upload a new source document owned by the caller.
    pub async fn add_source(
        &self,
        file: &[u8],
        file_name: &str,
        content_type: &str,
    ) -> Result<String> {
        let owner = self.require_registered()?.username.clone();
        self.manager
            .add_source_for_owner(&owner, file, file_name, content_type)
            .await
    }

    pub async fn update_source(
        &self,
        id: &str,
        file: &[u8],
        file_name: &str,
        content_type: &str,
    ) -> Result<()> {
        self.require_registered()?;
        let knowledge = self.visible(id).await?;
        self.require_capability(&knowledge, Permission::ReadWrite, "updating the source")?;
        self.manager
            .update_source(id, file, file_name, content_type)
            .await
    }

    pub async fn delete_knowledge(&self, id: &str) -> Result<()> {
        self.require_registered()?;
        let knowledge = self.visible(id).await?;
        self.require_capability(&knowledge, Permission::Owner, "deleting knowledge")?;
        self.manager.delete_knowledge(id).await
    }

    pub async fn set_permission(
        &self,
        id: &str,
        username: &str,
        permission: Permission,
    ) -> Result<()> {
        self.require_registered()?;
        let knowledge = self.visible(id).await?;
        self.require_capability(&knowledge, Permission::Owner, "changing permissions")?;
        self.resolve_target(username).await?;
        self.manager.set_permission(id, username, permission).await
    }

    pub async fn remove_permission(&self, id: &str, username: &str) -> Result<()> {
        self.require_registered()?;
        let knowledge = self.visible(id).await?;
        self.require_capability(&knowledge, Permission::Owner, "changing permissions")?;
        self.resolve_target(username).await?;
        self.manager.remove_permission(id, username).await
    }

    pub async fn add_tag(&self, id: &str, tag: &str) -> Result<()> {
        self.require_registered()?;
        let knowledge = self.visible(id).await?;
        self.require_capability(&knowledge, Permission::ReadWrite, "tagging")?;
        self.manager.add_tag(id, tag).await
    }

    pub async fn remove_tag(&self, id: &str, tag: &str) -> Result<()> {
        self.require_registered()?;
        let knowledge = self.visible(id).await?;
        self.require_capability(&knowledge, Permission::ReadWrite, "tagging")?;
        self.manager.remove_tag(id, tag).await
    }

    pub async fn set_label(&self, id: &str, label: Option<&str>) -> Result<()> {
        self.require_registered()?;
        let knowledge = self.visible(id).await?;
        self.require_capability(&knowledge, Permission::ReadWrite, "relabeling")?;
        self.manager.set_label(id, label).await
    }

    pub async fn retry_failed_ingestion(&self, id: &str) -> Result<()> {
        self.require_registered()?;
        let knowledge = self.visible(id).await?;
        self.require_capability(&knowledge, Permission::ReadWrite, "retrying ingestion")?;
        self.manager.retry_failed_ingestion(id).await
    }
}
