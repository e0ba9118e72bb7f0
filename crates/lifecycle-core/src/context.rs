//! Job context sourced from the shared resource layer's published outputs
//!
//! Jobs never read ambient environment. Each run loads a [`JobContext`] once
//! from the layer's [`StackOutputs`] and passes it to every step.

use crate::error::ConfigError;
use crate::types::{TenantEndpoints, TenantId, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Output key names published by the shared resource layer
pub mod output_keys {
    pub const DATA_BUCKET: &str = "DataBucketName";
    pub const USER_POOL: &str = "UserPoolId";
    pub const USER_POOL_CLIENT: &str = "UserPoolClientId";
    pub const API_URL: &str = "ApiGatewayUrl";
    pub const INGESTION_FUNCTION: &str = "IngestionFunctionArn";
    /// Prefix of the per-tier usage plan keys, e.g. `UsagePlanIds.basic`
    pub const USAGE_PLAN_PREFIX: &str = "UsagePlanIds.";
}

/// Flat key/value outputs of the shared resource layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackOutputs(BTreeMap<String, String>);

impl StackOutputs {
    /// Create empty outputs
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With an output value
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set an output value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up an output
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Look up an output that must be present and non-empty
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        match self.get(key) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            Some(_) => Err(ConfigError::InvalidOutput {
                key: key.to_string(),
                reason: "value is empty".to_string(),
            }),
            None => Err(ConfigError::MissingOutput(key.to_string())),
        }
    }

    /// Iterate outputs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for StackOutputs {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Identifiers of the shared resources every job step addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub data_bucket: String,
    pub user_pool_id: String,
    pub user_pool_client_id: String,
    pub api_url: String,
    pub ingestion_function_arn: String,
    usage_plans: BTreeMap<Tier, String>,
}

impl JobContext {
    /// Build from published outputs; every key is required except usage plans
    pub fn from_outputs(outputs: &StackOutputs) -> Result<Self, ConfigError> {
        let api_url = outputs.require(output_keys::API_URL)?;
        if !(api_url.starts_with("https://") || api_url.starts_with("http://")) {
            return Err(ConfigError::InvalidOutput {
                key: output_keys::API_URL.to_string(),
                reason: format!("'{api_url}' is not an http(s) URL"),
            });
        }

        let usage_plans = Tier::ALL
            .iter()
            .filter_map(|tier| {
                let key = format!("{}{}", output_keys::USAGE_PLAN_PREFIX, tier.as_str());
                outputs
                    .get(&key)
                    .filter(|id| !id.is_empty())
                    .map(|id| (*tier, id.to_string()))
            })
            .collect();

        Ok(Self {
            data_bucket: outputs.require(output_keys::DATA_BUCKET)?.to_string(),
            user_pool_id: outputs.require(output_keys::USER_POOL)?.to_string(),
            user_pool_client_id: outputs.require(output_keys::USER_POOL_CLIENT)?.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            ingestion_function_arn: outputs
                .require(output_keys::INGESTION_FUNCTION)?
                .to_string(),
            usage_plans,
        })
    }

    /// Usage plan for a tier, if the layer published one
    #[must_use]
    pub fn usage_plan(&self, tier: Tier) -> Option<&str> {
        self.usage_plans.get(&tier).map(String::as_str)
    }

    /// Endpoints handed to the tenant in its configuration
    #[must_use]
    pub fn endpoints(&self) -> TenantEndpoints {
        TenantEndpoints {
            api_url: self.api_url.clone(),
            upload_url: format!("{}/upload", self.api_url),
            query_url: format!("{}/query", self.api_url),
        }
    }
}

/// Names of the per-tenant resources, derived from the tenant id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantResourceNames {
    pub storage_prefix: String,
    pub knowledge_base: String,
    pub data_source: String,
    pub ingestion_rule: String,
    pub user_group: String,
    pub api_key: String,
}

impl TenantResourceNames {
    /// Derive names for `tenant_id`
    #[must_use]
    pub fn for_tenant(tenant_id: &TenantId) -> Self {
        let id = tenant_id.as_str();
        Self {
            storage_prefix: tenant_id.storage_prefix(),
            knowledge_base: id.to_string(),
            data_source: format!("{id}-documents"),
            ingestion_rule: format!("{id}-ingestion"),
            user_group: id.to_string(),
            api_key: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> StackOutputs {
        StackOutputs::new()
            .with(output_keys::DATA_BUCKET, "tenant-data")
            .with(output_keys::USER_POOL, "pool-1")
            .with(output_keys::USER_POOL_CLIENT, "client-1")
            .with(output_keys::API_URL, "https://api.example.com/prod/")
            .with(output_keys::INGESTION_FUNCTION, "arn:ingest")
            .with("UsagePlanIds.basic", "plan-basic")
    }

    #[test]
    fn context_from_outputs() {
        let ctx = JobContext::from_outputs(&outputs()).unwrap();

        assert_eq!(ctx.data_bucket, "tenant-data");
        assert_eq!(ctx.api_url, "https://api.example.com/prod");
        assert_eq!(ctx.usage_plan(Tier::Basic), Some("plan-basic"));
        assert_eq!(ctx.usage_plan(Tier::Premium), None);
        assert_eq!(
            ctx.endpoints().query_url,
            "https://api.example.com/prod/query"
        );
    }

    #[test]
    fn missing_output_is_reported() {
        let mut outputs = outputs();
        outputs.0.remove(output_keys::USER_POOL);

        let err = JobContext::from_outputs(&outputs).unwrap_err();
        assert_eq!(err, ConfigError::MissingOutput("UserPoolId".to_string()));
    }

    #[test]
    fn non_url_api_output_is_rejected() {
        let outputs = outputs().with(output_keys::API_URL, "ftp://nope");
        assert!(matches!(
            JobContext::from_outputs(&outputs),
            Err(ConfigError::InvalidOutput { .. })
        ));
    }

    #[test]
    fn resource_names_follow_tenant_id() {
        let names = TenantResourceNames::for_tenant(&TenantId::new("acme"));
        assert_eq!(names.storage_prefix, "acme/");
        assert_eq!(names.data_source, "acme-documents");
        assert_eq!(names.api_key, "acme");
    }
}
