//! Shared resource layer
//!
//! The cloud resources a tenant is carved out of: object storage, the
//! knowledge base, event rules, the identity pool and API keys. Every
//! `ensure_*` call is create-if-not-exists and reports whether it created the
//! resource; every `delete_*` call reports a missing resource as
//! [`ResourceError::NotFound`] so callers can treat it as already done.

mod in_memory;

pub use in_memory::{InMemoryResourceLayer, ResourceOp};

use crate::context::StackOutputs;
use crate::error::ResourceError;
use crate::types::TenantId;
use std::fmt;

/// Result of a create-if-not-exists call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned<T> {
    /// Created by this call
    Created(T),
    /// Already present; returned as found
    Existing(T),
}

impl<T> Provisioned<T> {
    /// Check if this call created the resource
    #[inline]
    #[must_use]
    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// The resource, however it was obtained
    #[must_use]
    pub fn into_inner(self) -> T {
        match self {
            Self::Created(v) | Self::Existing(v) => v,
        }
    }
}

/// Role attribute written on identity pool users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserRole {
    TenantAdmin,
    TenantUser,
}

impl UserRole {
    /// Attribute value
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TenantAdmin => "TenantAdmin",
            Self::TenantUser => "TenantUser",
        }
    }
}

/// Administrator account to create for a tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminUserSpec {
    /// Sign-in name; the email address
    pub username: String,
    pub email: String,
    pub tenant_id: TenantId,
    pub role: UserRole,
}

impl AdminUserSpec {
    /// Tenant administrator signing in with `email`
    #[must_use]
    pub fn tenant_admin(tenant_id: &TenantId, email: &str) -> Self {
        Self {
            username: email.to_string(),
            email: email.to_string(),
            tenant_id: tenant_id.clone(),
            role: UserRole::TenantAdmin,
        }
    }
}

/// Issued API key
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub id: String,
    pub value: String,
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Cloud resources reachable by lifecycle jobs
#[async_trait::async_trait]
pub trait SharedResourceLayer: Send + Sync {
    /// Outputs published by the layer's deployment
    async fn stack_outputs(&self) -> Result<StackOutputs, ResourceError>;

    // object storage

    /// Create the zero-length marker object for `prefix`
    async fn ensure_storage_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Provisioned<()>, ResourceError>;

    /// Store an object
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>)
        -> Result<(), ResourceError>;

    /// Keys of every object under `prefix`
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ResourceError>;

    /// Delete objects; returns how many existed
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<usize, ResourceError>;

    // knowledge base

    /// Create the tenant's vector knowledge base; returns its id
    async fn ensure_knowledge_base(&self, name: &str)
        -> Result<Provisioned<String>, ResourceError>;

    /// Attach a storage data source restricted to `inclusion_prefix`; returns its id
    async fn ensure_data_source(
        &self,
        knowledge_base_id: &str,
        name: &str,
        bucket: &str,
        inclusion_prefix: &str,
    ) -> Result<Provisioned<String>, ResourceError>;

    /// Delete a data source by name
    async fn delete_data_source(&self, knowledge_base: &str, name: &str)
        -> Result<(), ResourceError>;

    /// Delete a knowledge base by name
    async fn delete_knowledge_base(&self, name: &str) -> Result<(), ResourceError>;

    /// Start an ingestion run; returns the run id
    async fn trigger_ingestion(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
    ) -> Result<String, ResourceError>;

    // event rules

    /// Route object-created events under `prefix` to `target_arn`
    async fn ensure_ingestion_rule(
        &self,
        name: &str,
        bucket: &str,
        prefix: &str,
        target_arn: &str,
    ) -> Result<Provisioned<()>, ResourceError>;

    /// Delete an ingestion rule and its targets
    async fn delete_ingestion_rule(&self, name: &str) -> Result<(), ResourceError>;

    // identity pool

    /// Create a user group
    async fn ensure_user_group(&self, pool_id: &str, group: &str)
        -> Result<Provisioned<()>, ResourceError>;

    /// Delete a user group
    async fn delete_user_group(&self, pool_id: &str, group: &str) -> Result<(), ResourceError>;

    /// Create the user, or update its attributes if it exists; returns the username.
    ///
    /// A user tagged with another tenant is left untouched and reported as
    /// [`ResourceError::AlreadyExists`].
    async fn ensure_admin_user(
        &self,
        pool_id: &str,
        user: &AdminUserSpec,
    ) -> Result<Provisioned<String>, ResourceError>;

    /// Add a user to a group; adding an existing member is a no-op
    async fn add_user_to_group(
        &self,
        pool_id: &str,
        username: &str,
        group: &str,
    ) -> Result<(), ResourceError>;

    /// Usernames whose tenant attribute is `tenant_id`
    async fn list_tenant_users(
        &self,
        pool_id: &str,
        tenant_id: &TenantId,
    ) -> Result<Vec<String>, ResourceError>;

    /// Delete a user
    async fn delete_user(&self, pool_id: &str, username: &str) -> Result<(), ResourceError>;

    // api keys

    /// Create an enabled API key named `name`
    async fn ensure_api_key(&self, name: &str) -> Result<Provisioned<ApiKey>, ResourceError>;

    /// Add a key to a usage plan; adding it twice is a no-op
    async fn attach_usage_plan(&self, plan_id: &str, key_id: &str) -> Result<(), ResourceError>;

    /// Delete an API key by name
    async fn delete_api_key(&self, name: &str) -> Result<(), ResourceError>;
}

/// Map "not found" to success for delete steps
pub(crate) fn absent_ok<T: Default>(result: Result<T, ResourceError>) -> Result<T, ResourceError> {
    match result {
        Err(e) if e.is_not_found() => {
            tracing::debug!(error = %e, "resource already absent");
            Ok(T::default())
        }
        other => other,
    }
}
