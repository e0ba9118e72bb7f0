//! In-memory shared resource layer
//!
//! Models the cloud semantics jobs depend on: idempotent creates, not-found on
//! delete, resources addressed by name. Faults can be injected per operation
//! to exercise retry and failure handling.

use super::{AdminUserSpec, ApiKey, Provisioned, SharedResourceLayer, UserRole};
use crate::context::StackOutputs;
use crate::error::ResourceError;
use crate::types::TenantId;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Operations of [`SharedResourceLayer`], used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceOp {
    StackOutputs,
    EnsureStoragePrefix,
    PutObject,
    ListObjects,
    DeleteObjects,
    EnsureKnowledgeBase,
    EnsureDataSource,
    DeleteDataSource,
    DeleteKnowledgeBase,
    TriggerIngestion,
    EnsureIngestionRule,
    DeleteIngestionRule,
    EnsureUserGroup,
    DeleteUserGroup,
    EnsureAdminUser,
    AddUserToGroup,
    ListTenantUsers,
    DeleteUser,
    EnsureApiKey,
    AttachUsagePlan,
    DeleteApiKey,
}

#[derive(Debug)]
struct Fault {
    error: ResourceError,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct KnowledgeBase {
    id: String,
    data_sources: BTreeMap<String, DataSource>,
}

#[derive(Debug, Clone)]
struct DataSource {
    id: String,
    bucket: String,
    inclusion_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IngestionRule {
    bucket: String,
    prefix: String,
    target_arn: String,
}

#[derive(Debug, Clone)]
struct PoolUser {
    email: String,
    tenant_id: TenantId,
    role: UserRole,
}

#[derive(Debug, Default)]
struct State {
    outputs: StackOutputs,
    buckets: BTreeSet<String>,
    // (bucket, key) -> body
    objects: BTreeMap<(String, String), Vec<u8>>,
    knowledge_bases: BTreeMap<String, KnowledgeBase>,
    ingestion_runs: Vec<(String, String)>,
    rules: BTreeMap<String, IngestionRule>,
    pools: BTreeSet<String>,
    // (pool, group) -> members
    groups: BTreeMap<(String, String), BTreeSet<String>>,
    // (pool, username)
    users: BTreeMap<(String, String), PoolUser>,
    api_keys: BTreeMap<String, ApiKey>,
    usage_plans: BTreeMap<String, BTreeSet<String>>,
    faults: HashMap<ResourceOp, Fault>,
    calls: HashMap<ResourceOp, u32>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:06}", self.next_id)
    }

    fn require_bucket(&self, bucket: &str) -> Result<(), ResourceError> {
        if self.buckets.contains(bucket) {
            Ok(())
        } else {
            Err(not_found("bucket", bucket))
        }
    }

    fn require_pool(&self, pool_id: &str) -> Result<(), ResourceError> {
        if self.pools.contains(pool_id) {
            Ok(())
        } else {
            Err(not_found("user pool", pool_id))
        }
    }

    fn knowledge_base_by_id(&mut self, id: &str) -> Result<&mut KnowledgeBase, ResourceError> {
        self.knowledge_bases
            .values_mut()
            .find(|kb| kb.id == id)
            .ok_or_else(|| not_found("knowledge base", id))
    }
}

fn not_found(kind: &'static str, name: &str) -> ResourceError {
    ResourceError::NotFound {
        kind,
        name: name.to_string(),
    }
}

/// Shared resource layer held in process memory
#[derive(Debug, Default)]
pub struct InMemoryResourceLayer {
    state: Mutex<State>,
    latency: Duration,
}

impl InMemoryResourceLayer {
    /// Layer publishing `outputs`; the bucket and user pool they name exist
    #[must_use]
    pub fn new(outputs: StackOutputs) -> Self {
        use crate::context::output_keys;

        let mut state = State::default();
        if let Some(bucket) = outputs.get(output_keys::DATA_BUCKET) {
            state.buckets.insert(bucket.to_string());
        }
        if let Some(pool) = outputs.get(output_keys::USER_POOL) {
            state.pools.insert(pool.to_string());
        }
        state.outputs = outputs;
        Self {
            state: Mutex::new(state),
            latency: Duration::ZERO,
        }
    }

    /// Delay every call by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `times` calls of `op` with `error`
    pub fn inject_fault(&self, op: ResourceOp, error: ResourceError, times: u32) {
        self.state.lock().faults.insert(
            op,
            Fault {
                error,
                remaining: times,
            },
        );
    }

    /// Fail every call of `op` until cleared
    pub fn fail_always(&self, op: ResourceOp, error: ResourceError) {
        self.inject_fault(op, error, u32::MAX);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Number of calls made to `op`, including failed ones
    #[must_use]
    pub fn calls(&self, op: ResourceOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Object keys under `prefix` in `bucket`
    #[must_use]
    pub fn object_keys(&self, bucket: &str, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Check if a knowledge base named `name` exists
    #[must_use]
    pub fn has_knowledge_base(&self, name: &str) -> bool {
        self.state.lock().knowledge_bases.contains_key(name)
    }

    /// Inclusion prefix of a data source, if it exists
    #[must_use]
    pub fn data_source_prefix(&self, knowledge_base: &str, name: &str) -> Option<String> {
        let state = self.state.lock();
        let ds = state.knowledge_bases.get(knowledge_base)?.data_sources.get(name)?;
        Some(format!("{}/{}", ds.bucket, ds.inclusion_prefix))
    }

    /// Check if an ingestion rule named `name` exists
    #[must_use]
    pub fn has_ingestion_rule(&self, name: &str) -> bool {
        self.state.lock().rules.contains_key(name)
    }

    /// Event pattern and target of a rule, as (`bucket/prefix`, target)
    #[must_use]
    pub fn ingestion_rule(&self, name: &str) -> Option<(String, String)> {
        self.state
            .lock()
            .rules
            .get(name)
            .map(|r| (format!("{}/{}", r.bucket, r.prefix), r.target_arn.clone()))
    }

    /// Ingestion runs started, as (knowledge base id, data source id)
    #[must_use]
    pub fn ingestion_runs(&self) -> Vec<(String, String)> {
        self.state.lock().ingestion_runs.clone()
    }

    /// Members of a group, `None` if the group does not exist
    #[must_use]
    pub fn group_members(&self, pool_id: &str, group: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .groups
            .get(&(pool_id.to_string(), group.to_string()))
            .map(|m| m.iter().cloned().collect())
    }

    /// Number of users in the pool
    #[must_use]
    pub fn user_count(&self, pool_id: &str) -> usize {
        self.state
            .lock()
            .users
            .keys()
            .filter(|(p, _)| p == pool_id)
            .count()
    }

    /// Email and role attributes of a user
    #[must_use]
    pub fn user_attributes(&self, pool_id: &str, username: &str) -> Option<(String, UserRole)> {
        self.state
            .lock()
            .users
            .get(&(pool_id.to_string(), username.to_string()))
            .map(|u| (u.email.clone(), u.role))
    }

    /// Number of API keys
    #[must_use]
    pub fn api_key_count(&self) -> usize {
        self.state.lock().api_keys.len()
    }

    /// Key ids attached to a usage plan
    #[must_use]
    pub fn usage_plan_keys(&self, plan_id: &str) -> Vec<String> {
        self.state
            .lock()
            .usage_plans
            .get(plan_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn enter(&self, op: ResourceOp) -> Result<(), ResourceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(fault) = state.faults.get_mut(&op) {
            if fault.remaining > 0 {
                if fault.remaining != u32::MAX {
                    fault.remaining -= 1;
                }
                tracing::debug!(?op, error = %fault.error, "injected fault");
                return Err(fault.error.clone());
            }
        }
        Ok(())
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[async_trait::async_trait]
impl SharedResourceLayer for InMemoryResourceLayer {
    async fn stack_outputs(&self) -> Result<StackOutputs, ResourceError> {
        self.enter(ResourceOp::StackOutputs).await?;
        Ok(self.state.lock().outputs.clone())
    }

    async fn ensure_storage_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Provisioned<()>, ResourceError> {
        self.enter(ResourceOp::EnsureStoragePrefix).await?;
        let mut state = self.state.lock();
        state.require_bucket(bucket)?;
        let key = (bucket.to_string(), prefix.to_string());
        if state.objects.contains_key(&key) {
            return Ok(Provisioned::Existing(()));
        }
        state.objects.insert(key, Vec::new());
        Ok(Provisioned::Created(()))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), ResourceError> {
        self.enter(ResourceOp::PutObject).await?;
        let mut state = self.state.lock();
        state.require_bucket(bucket)?;
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ResourceError> {
        self.enter(ResourceOp::ListObjects).await?;
        self.state.lock().require_bucket(bucket)?;
        Ok(self.object_keys(bucket, prefix))
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<usize, ResourceError> {
        self.enter(ResourceOp::DeleteObjects).await?;
        let mut state = self.state.lock();
        state.require_bucket(bucket)?;
        let deleted = keys
            .iter()
            .filter(|key| {
                state
                    .objects
                    .remove(&(bucket.to_string(), (*key).clone()))
                    .is_some()
            })
            .count();
        Ok(deleted)
    }

    async fn ensure_knowledge_base(
        &self,
        name: &str,
    ) -> Result<Provisioned<String>, ResourceError> {
        self.enter(ResourceOp::EnsureKnowledgeBase).await?;
        let mut state = self.state.lock();
        if let Some(kb) = state.knowledge_bases.get(name) {
            return Ok(Provisioned::Existing(kb.id.clone()));
        }
        let id = state.next_id("kb");
        state.knowledge_bases.insert(
            name.to_string(),
            KnowledgeBase {
                id: id.clone(),
                data_sources: BTreeMap::new(),
            },
        );
        Ok(Provisioned::Created(id))
    }

    async fn ensure_data_source(
        &self,
        knowledge_base_id: &str,
        name: &str,
        bucket: &str,
        inclusion_prefix: &str,
    ) -> Result<Provisioned<String>, ResourceError> {
        self.enter(ResourceOp::EnsureDataSource).await?;
        let mut state = self.state.lock();
        state.require_bucket(bucket)?;
        let id = state.next_id("ds");
        let kb = state.knowledge_base_by_id(knowledge_base_id)?;
        if let Some(existing) = kb.data_sources.get(name) {
            return Ok(Provisioned::Existing(existing.id.clone()));
        }
        kb.data_sources.insert(
            name.to_string(),
            DataSource {
                id: id.clone(),
                bucket: bucket.to_string(),
                inclusion_prefix: inclusion_prefix.to_string(),
            },
        );
        Ok(Provisioned::Created(id))
    }

    async fn delete_data_source(
        &self,
        knowledge_base: &str,
        name: &str,
    ) -> Result<(), ResourceError> {
        self.enter(ResourceOp::DeleteDataSource).await?;
        let mut state = self.state.lock();
        let kb = state
            .knowledge_bases
            .get_mut(knowledge_base)
            .ok_or_else(|| not_found("knowledge base", knowledge_base))?;
        kb.data_sources
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("data source", name))
    }

    async fn delete_knowledge_base(&self, name: &str) -> Result<(), ResourceError> {
        self.enter(ResourceOp::DeleteKnowledgeBase).await?;
        let mut state = self.state.lock();
        match state.knowledge_bases.get(name) {
            None => Err(not_found("knowledge base", name)),
            Some(kb) if !kb.data_sources.is_empty() => Err(ResourceError::Validation(format!(
                "knowledge base '{name}' still has {} data source(s)",
                kb.data_sources.len()
            ))),
            Some(_) => {
                state.knowledge_bases.remove(name);
                Ok(())
            }
        }
    }

    async fn trigger_ingestion(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
    ) -> Result<String, ResourceError> {
        self.enter(ResourceOp::TriggerIngestion).await?;
        let mut state = self.state.lock();
        let kb = state.knowledge_base_by_id(knowledge_base_id)?;
        if !kb.data_sources.values().any(|ds| ds.id == data_source_id) {
            return Err(not_found("data source", data_source_id));
        }
        state
            .ingestion_runs
            .push((knowledge_base_id.to_string(), data_source_id.to_string()));
        Ok(state.next_id("ingest"))
    }

    async fn ensure_ingestion_rule(
        &self,
        name: &str,
        bucket: &str,
        prefix: &str,
        target_arn: &str,
    ) -> Result<Provisioned<()>, ResourceError> {
        self.enter(ResourceOp::EnsureIngestionRule).await?;
        let rule = IngestionRule {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            target_arn: target_arn.to_string(),
        };
        // put-rule semantics: an existing rule is overwritten in place
        let previous = self.state.lock().rules.insert(name.to_string(), rule);
        Ok(match previous {
            Some(_) => Provisioned::Existing(()),
            None => Provisioned::Created(()),
        })
    }

    async fn delete_ingestion_rule(&self, name: &str) -> Result<(), ResourceError> {
        self.enter(ResourceOp::DeleteIngestionRule).await?;
        self.state
            .lock()
            .rules
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("ingestion rule", name))
    }

    async fn ensure_user_group(
        &self,
        pool_id: &str,
        group: &str,
    ) -> Result<Provisioned<()>, ResourceError> {
        self.enter(ResourceOp::EnsureUserGroup).await?;
        let mut state = self.state.lock();
        state.require_pool(pool_id)?;
        let key = (pool_id.to_string(), group.to_string());
        if state.groups.contains_key(&key) {
            return Ok(Provisioned::Existing(()));
        }
        state.groups.insert(key, BTreeSet::new());
        Ok(Provisioned::Created(()))
    }

    async fn delete_user_group(&self, pool_id: &str, group: &str) -> Result<(), ResourceError> {
        self.enter(ResourceOp::DeleteUserGroup).await?;
        let mut state = self.state.lock();
        state.require_pool(pool_id)?;
        state
            .groups
            .remove(&(pool_id.to_string(), group.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("group", group))
    }

    async fn ensure_admin_user(
        &self,
        pool_id: &str,
        user: &AdminUserSpec,
    ) -> Result<Provisioned<String>, ResourceError> {
        self.enter(ResourceOp::EnsureAdminUser).await?;
        let mut state = self.state.lock();
        state.require_pool(pool_id)?;
        let key = (pool_id.to_string(), user.username.clone());
        if let Some(existing) = state.users.get(&key) {
            if existing.tenant_id != user.tenant_id {
                return Err(ResourceError::AlreadyExists {
                    kind: "user",
                    name: user.username.clone(),
                });
            }
        }
        let attributes = PoolUser {
            email: user.email.clone(),
            tenant_id: user.tenant_id.clone(),
            role: user.role,
        };
        let existed = state.users.insert(key, attributes).is_some();
        Ok(if existed {
            Provisioned::Existing(user.username.clone())
        } else {
            Provisioned::Created(user.username.clone())
        })
    }

    async fn add_user_to_group(
        &self,
        pool_id: &str,
        username: &str,
        group: &str,
    ) -> Result<(), ResourceError> {
        self.enter(ResourceOp::AddUserToGroup).await?;
        let mut state = self.state.lock();
        state.require_pool(pool_id)?;
        if !state
            .users
            .contains_key(&(pool_id.to_string(), username.to_string()))
        {
            return Err(not_found("user", username));
        }
        state
            .groups
            .get_mut(&(pool_id.to_string(), group.to_string()))
            .ok_or_else(|| not_found("group", group))?
            .insert(username.to_string());
        Ok(())
    }

    async fn list_tenant_users(
        &self,
        pool_id: &str,
        tenant_id: &TenantId,
    ) -> Result<Vec<String>, ResourceError> {
        self.enter(ResourceOp::ListTenantUsers).await?;
        let state = self.state.lock();
        state.require_pool(pool_id)?;
        Ok(state
            .users
            .iter()
            .filter(|((pool, _), u)| pool == pool_id && &u.tenant_id == tenant_id)
            .map(|((_, name), _)| name.clone())
            .collect())
    }

    async fn delete_user(&self, pool_id: &str, username: &str) -> Result<(), ResourceError> {
        self.enter(ResourceOp::DeleteUser).await?;
        let mut state = self.state.lock();
        state.require_pool(pool_id)?;
        state
            .users
            .remove(&(pool_id.to_string(), username.to_string()))
            .ok_or_else(|| not_found("user", username))?;
        for members in state.groups.values_mut() {
            members.remove(username);
        }
        Ok(())
    }

    async fn ensure_api_key(&self, name: &str) -> Result<Provisioned<ApiKey>, ResourceError> {
        self.enter(ResourceOp::EnsureApiKey).await?;
        let mut state = self.state.lock();
        if let Some(key) = state.api_keys.get(name) {
            return Ok(Provisioned::Existing(key.clone()));
        }
        let key = ApiKey {
            id: state.next_id("key"),
            value: random_hex(20),
        };
        state.api_keys.insert(name.to_string(), key.clone());
        Ok(Provisioned::Created(key))
    }

    async fn attach_usage_plan(&self, plan_id: &str, key_id: &str) -> Result<(), ResourceError> {
        self.enter(ResourceOp::AttachUsagePlan).await?;
        let mut state = self.state.lock();
        if !state.api_keys.values().any(|k| k.id == key_id) {
            return Err(not_found("api key", key_id));
        }
        state
            .usage_plans
            .entry(plan_id.to_string())
            .or_default()
            .insert(key_id.to_string());
        Ok(())
    }

    async fn delete_api_key(&self, name: &str) -> Result<(), ResourceError> {
        self.enter(ResourceOp::DeleteApiKey).await?;
        let mut state = self.state.lock();
        let key = state
            .api_keys
            .remove(name)
            .ok_or_else(|| not_found("api key", name))?;
        for keys in state.usage_plans.values_mut() {
            keys.remove(&key.id);
        }
        Ok(())
    }
}
