//! Core types for tenant lifecycle orchestration
//!
//! Defines the fundamental types shared by jobs and the control plane:
//! - Tenant and registration identifiers
//! - Tiers and lifecycle status
//! - Registration records and requests
//! - The derived tenant configuration

use crate::error::{PreconditionFailure, StateMachineError};
use crate::events::EventName;
use crate::state_machine::{self, JobState};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

static TENANT_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").expect("tenant id pattern compiles")
});

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern compiles"));

/// Check that an administrator email looks like an address
pub(crate) fn validate_email(email: &str) -> Result<(), PreconditionFailure> {
    if email.trim().is_empty() {
        return Err(PreconditionFailure::EmptyField("adminEmail"));
    }
    if !EMAIL_PATTERN.is_match(email) {
        return Err(PreconditionFailure::InvalidEmail(email.to_string()));
    }
    Ok(())
}

/// Tenant identifier
///
/// Used as the namespacing key for every tenant-scoped resource (storage
/// prefix, user group, API key name, vector index). Construction never fails
/// so that an empty id can travel to the job and be reported there.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wrap a raw tenant id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the id is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate the id can name tenant resources
    pub fn validate(&self) -> Result<(), PreconditionFailure> {
        if self.0.trim().is_empty() {
            return Err(PreconditionFailure::EmptyTenantId);
        }
        if !TENANT_ID_PATTERN.is_match(&self.0) {
            return Err(PreconditionFailure::InvalidTenantId(self.0.clone()));
        }
        Ok(())
    }

    /// Object key prefix owned by this tenant
    #[inline]
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        format!("{}/", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Registration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationId(pub Uuid);

impl RegistrationId {
    /// Generate new registration ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RegistrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RegistrationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Subscription tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Entry plan
    #[default]
    Basic,
    /// Mid plan
    Standard,
    /// Top plan
    Premium,
}

impl Tier {
    /// All tiers
    pub const ALL: [Tier; 3] = [Tier::Basic, Tier::Standard, Tier::Premium];

    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Standard => "standard",
            Tier::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = PreconditionFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Tier::Basic),
            "standard" => Ok(Tier::Standard),
            "premium" => Ok(Tier::Premium),
            _ => Err(PreconditionFailure::UnknownTier(s.to_string())),
        }
    }
}

/// Tenant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TenantStatus {
    /// Recorded, onboarding request not yet published
    Pending,
    /// Provisioning job requested or running
    Provisioning,
    /// Provisioned, configuration available
    Complete,
    /// Last job ended in failure
    Failed,
    /// Deprovisioning requested or running
    Deprovisioning,
    /// Tenant resources released
    Deleted,
}

impl TenantStatus {
    /// Check if a job for the tenant is expected to be in flight
    #[inline]
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Provisioning | Self::Deprovisioning)
    }

    /// Check if the registration accepts a new onboarding request
    #[inline]
    #[must_use]
    pub fn accepts_onboarding(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Validated transition
    pub fn transition(self, to: TenantStatus) -> Result<TenantStatus, StateMachineError> {
        state_machine::validate_transition(self, to)?;
        Ok(to)
    }
}

impl JobState for TenantStatus {
    fn allowed_transitions(self) -> &'static [Self] {
        use TenantStatus::*;
        match self {
            Pending => &[Provisioning, Failed],
            Provisioning => &[Complete, Failed],
            Complete => &[Pending, Deprovisioning],
            Failed => &[Pending, Deprovisioning],
            Deprovisioning => &[Deleted, Failed],
            Deleted => &[],
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Endpoints a tenant uses to reach the application plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEndpoints {
    /// Base API URL
    pub api_url: String,
    /// Document upload endpoint
    pub upload_url: String,
    /// Query endpoint
    pub query_url: String,
}

/// Configuration derived by a successful provisioning job
///
/// Produced once and read-only; re-provisioning replaces it wholesale.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    pub api_key: String,
    pub knowledge_base_id: String,
    pub data_source_id: String,
    pub identity_client_id: String,
    pub storage_prefix: String,
    pub endpoints: TenantEndpoints,
    pub generated_at: DateTime<Utc>,
}

impl fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConfig")
            .field("api_key", &"<redacted>")
            .field("knowledge_base_id", &self.knowledge_base_id)
            .field("data_source_id", &self.data_source_id)
            .field("identity_client_id", &self.identity_client_id)
            .field("storage_prefix", &self.storage_prefix)
            .field("endpoints", &self.endpoints)
            .field("generated_at", &self.generated_at)
            .finish()
    }
}

/// Summary of a failed job, kept on the registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    pub kind: crate::error::FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
}

/// Tenant registration request (management API body)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    /// Tenant name, used as the tenant id
    pub tenant_name: String,
    /// Administrator email
    pub email: String,
    /// Requested tier
    pub tier: Tier,
    /// Company name, defaults to the tenant name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

impl RegistrationRequest {
    /// Create new request
    #[must_use]
    pub fn new(tenant_name: impl Into<String>, email: impl Into<String>, tier: Tier) -> Self {
        Self {
            tenant_name: tenant_name.into(),
            email: email.into(),
            tier,
            company_name: None,
        }
    }

    /// With company name
    #[must_use]
    pub fn with_company_name(mut self, company_name: impl Into<String>) -> Self {
        self.company_name = Some(company_name.into());
        self
    }

    /// Tenant id derived from the tenant name
    #[inline]
    #[must_use]
    pub fn tenant_id(&self) -> TenantId {
        TenantId::new(self.tenant_name.trim())
    }

    /// Company name or the tenant name when absent
    #[must_use]
    pub fn company(&self) -> String {
        self.company_name
            .clone()
            .unwrap_or_else(|| self.tenant_name.clone())
    }
}

/// Partial update of registration metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

impl RegistrationPatch {
    /// Check if the patch changes nothing
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.tier.is_none() && self.company_name.is_none()
    }
}

/// Tenant registration record owned by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRegistration {
    pub id: RegistrationId,
    pub tenant_id: TenantId,
    pub company_name: String,
    pub admin_email: String,
    pub tier: Tier,
    pub status: TenantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TenantConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    /// Lifecycle event recorded but not yet published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpublished: Option<EventName>,
    /// Optimistic concurrency counter, bumped by every store write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantRegistration {
    /// New `Pending` registration with an unpublished onboarding request
    #[must_use]
    pub fn new(request: &RegistrationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: RegistrationId::new(),
            tenant_id: request.tenant_id(),
            company_name: request.company(),
            admin_email: request.email.clone(),
            tier: request.tier,
            status: TenantStatus::Pending,
            config: None,
            failure: None,
            unpublished: Some(EventName::OnboardingRequest),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Configuration, only while the registration is `Complete`
    #[inline]
    #[must_use]
    pub fn active_config(&self) -> Option<&TenantConfig> {
        match self.status {
            TenantStatus::Complete => self.config.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_validation() {
        assert!(TenantId::new("acme").validate().is_ok());
        assert!(TenantId::new("acme-corp-42").validate().is_ok());
        assert_eq!(
            TenantId::new("").validate(),
            Err(PreconditionFailure::EmptyTenantId)
        );
        assert!(TenantId::new("Acme").validate().is_err());
        assert!(TenantId::new("-acme").validate().is_err());
        assert!(TenantId::new("acme/../x").validate().is_err());
        assert!(TenantId::new("a".repeat(64)).validate().is_err());
    }

    #[test]
    fn tenant_storage_prefix() {
        assert_eq!(TenantId::new("acme").storage_prefix(), "acme/");
    }

    #[test]
    fn tier_parsing() {
        assert_eq!("basic".parse::<Tier>().unwrap(), Tier::Basic);
        assert_eq!("Premium".parse::<Tier>().unwrap(), Tier::Premium);
        assert!(matches!(
            "gold".parse::<Tier>(),
            Err(PreconditionFailure::UnknownTier(_))
        ));
    }

    #[test]
    fn status_transitions() {
        assert_eq!(
            TenantStatus::Pending.transition(TenantStatus::Provisioning),
            Ok(TenantStatus::Provisioning)
        );
        assert!(TenantStatus::Failed
            .transition(TenantStatus::Complete)
            .is_err());
        assert!(TenantStatus::Deleted.is_terminal());
        assert!(TenantStatus::Provisioning.is_in_flight());
        assert!(TenantStatus::Complete.accepts_onboarding());
    }

    #[test]
    fn registration_request_defaults() {
        let req = RegistrationRequest::new(" acme ", "admin@acme.com", Tier::Basic);
        assert_eq!(req.tenant_id().as_str(), "acme");
        assert_eq!(req.company(), " acme ");

        let req = req.with_company_name("Acme Corp");
        assert_eq!(req.company(), "Acme Corp");
    }

    #[test]
    fn registration_request_deserializes_api_body() {
        let req: RegistrationRequest = serde_json::from_str(
            r#"{"tenantName":"acme","email":"admin@acme.com","tier":"basic"}"#,
        )
        .unwrap();
        assert_eq!(req.tier, Tier::Basic);
        assert!(req.company_name.is_none());
    }

    #[test]
    fn new_registration_is_pending_with_outbox() {
        let req = RegistrationRequest::new("acme", "admin@acme.com", Tier::Standard);
        let reg = TenantRegistration::new(&req);
        assert_eq!(reg.status, TenantStatus::Pending);
        assert_eq!(reg.unpublished, Some(EventName::OnboardingRequest));
        assert!(reg.active_config().is_none());
    }

    #[test]
    fn email_validation() {
        assert!(validate_email("admin@acme.com").is_ok());
        assert_eq!(
            validate_email(""),
            Err(PreconditionFailure::EmptyField("adminEmail"))
        );
        assert!(validate_email("not-an-email").is_err());
    }
}
