//! Lifecycle event contract
//!
//! Events are a sum type with typed fields per kind. On the bus they travel as
//! an [`EventEnvelope`]: enumerated name, correlation id (the tenant id) and a
//! flat string payload that always carries `tenantId` and `registrationId`.

use crate::error::{EventError, FailureKind};
use crate::types::{FailureSummary, RegistrationId, TenantConfig, TenantEndpoints, TenantId, Tier};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Payload keys
pub mod keys {
    pub const TENANT_ID: &str = "tenantId";
    pub const REGISTRATION_ID: &str = "registrationId";
    pub const TIER: &str = "tier";
    pub const COMPANY_NAME: &str = "companyName";
    pub const ADMIN_EMAIL: &str = "adminEmail";
    pub const API_KEY: &str = "apiKey";
    pub const KNOWLEDGE_BASE_ID: &str = "knowledgeBaseId";
    pub const DATA_SOURCE_ID: &str = "dataSourceId";
    pub const IDENTITY_CLIENT_ID: &str = "identityClientId";
    pub const STORAGE_PREFIX: &str = "storagePrefix";
    pub const API_URL: &str = "apiUrl";
    pub const UPLOAD_URL: &str = "uploadUrl";
    pub const QUERY_URL: &str = "queryUrl";
    pub const GENERATED_AT: &str = "generatedAt";
    pub const DEGRADED_STEPS: &str = "degradedSteps";
    pub const ERROR_KIND: &str = "errorKind";
    pub const ERROR_MESSAGE: &str = "errorMessage";
    pub const FAILED_STEP: &str = "failedStep";
    pub const OBJECTS_DELETED: &str = "objectsDeleted";
}

/// Enumerated lifecycle event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventName {
    OnboardingRequest,
    ProvisionSuccess,
    ProvisionFailure,
    DeprovisionRequest,
    DeprovisionSuccess,
    DeprovisionFailure,
}

impl EventName {
    /// All event names
    pub const ALL: [EventName; 6] = [
        EventName::OnboardingRequest,
        EventName::ProvisionSuccess,
        EventName::ProvisionFailure,
        EventName::DeprovisionRequest,
        EventName::DeprovisionSuccess,
        EventName::DeprovisionFailure,
    ];

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::OnboardingRequest => "ONBOARDING_REQUEST",
            EventName::ProvisionSuccess => "PROVISION_SUCCESS",
            EventName::ProvisionFailure => "PROVISION_FAILURE",
            EventName::DeprovisionRequest => "DEPROVISION_REQUEST",
            EventName::DeprovisionSuccess => "DEPROVISION_SUCCESS",
            EventName::DeprovisionFailure => "DEPROVISION_FAILURE",
        }
    }

    /// Requests start jobs; everything else reports an outcome
    #[inline]
    #[must_use]
    pub fn is_request(&self) -> bool {
        matches!(self, EventName::OnboardingRequest | EventName::DeprovisionRequest)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventName(s.to_string()))
    }
}

/// Request to provision a tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingRequest {
    pub registration_id: RegistrationId,
    pub tenant_id: TenantId,
    pub tier: Tier,
    pub company_name: String,
    pub admin_email: String,
}

/// Successful provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSuccess {
    pub registration_id: RegistrationId,
    pub tenant_id: TenantId,
    pub config: TenantConfig,
    /// Optional steps that failed under the best-effort policy
    pub degraded_steps: Vec<String>,
}

/// Request to release a tenant's resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeprovisionRequest {
    pub registration_id: RegistrationId,
    pub tenant_id: TenantId,
}

/// Successful deprovisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeprovisionSuccess {
    pub registration_id: RegistrationId,
    pub tenant_id: TenantId,
    pub objects_deleted: usize,
}

/// Failed provisioning or deprovisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub registration_id: RegistrationId,
    pub tenant_id: TenantId,
    pub summary: FailureSummary,
}

/// Typed lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    OnboardingRequest(OnboardingRequest),
    ProvisionSuccess(ProvisionSuccess),
    ProvisionFailure(JobFailure),
    DeprovisionRequest(DeprovisionRequest),
    DeprovisionSuccess(DeprovisionSuccess),
    DeprovisionFailure(JobFailure),
}

impl LifecycleEvent {
    /// Event name
    #[must_use]
    pub fn name(&self) -> EventName {
        match self {
            Self::OnboardingRequest(_) => EventName::OnboardingRequest,
            Self::ProvisionSuccess(_) => EventName::ProvisionSuccess,
            Self::ProvisionFailure(_) => EventName::ProvisionFailure,
            Self::DeprovisionRequest(_) => EventName::DeprovisionRequest,
            Self::DeprovisionSuccess(_) => EventName::DeprovisionSuccess,
            Self::DeprovisionFailure(_) => EventName::DeprovisionFailure,
        }
    }

    /// Correlation id
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Self::OnboardingRequest(e) => &e.tenant_id,
            Self::ProvisionSuccess(e) => &e.tenant_id,
            Self::DeprovisionRequest(e) => &e.tenant_id,
            Self::DeprovisionSuccess(e) => &e.tenant_id,
            Self::ProvisionFailure(e) | Self::DeprovisionFailure(e) => &e.tenant_id,
        }
    }

    /// Registration the event belongs to
    #[must_use]
    pub fn registration_id(&self) -> RegistrationId {
        match self {
            Self::OnboardingRequest(e) => e.registration_id,
            Self::ProvisionSuccess(e) => e.registration_id,
            Self::DeprovisionRequest(e) => e.registration_id,
            Self::DeprovisionSuccess(e) => e.registration_id,
            Self::ProvisionFailure(e) | Self::DeprovisionFailure(e) => e.registration_id,
        }
    }

    /// Publish-boundary validation
    ///
    /// Success events must identify a real tenant and carry non-empty
    /// credentials. Requests and failures may carry an empty tenant id so a
    /// precondition failure can still be reported.
    pub fn validate(&self) -> Result<(), EventError> {
        let event = self.name().to_string();
        let require = |field: &'static str, value: &str| {
            if value.trim().is_empty() {
                Err(EventError::EmptyField {
                    event: event.clone(),
                    field,
                })
            } else {
                Ok(())
            }
        };

        match self {
            Self::ProvisionSuccess(e) => {
                require(keys::TENANT_ID, e.tenant_id.as_str())?;
                require(keys::API_KEY, &e.config.api_key)?;
                require(keys::KNOWLEDGE_BASE_ID, &e.config.knowledge_base_id)?;
                require(keys::IDENTITY_CLIENT_ID, &e.config.identity_client_id)?;
            }
            Self::DeprovisionSuccess(e) => require(keys::TENANT_ID, e.tenant_id.as_str())?,
            Self::ProvisionFailure(e) | Self::DeprovisionFailure(e) => {
                require(keys::ERROR_MESSAGE, &e.summary.message)?;
            }
            Self::OnboardingRequest(_) | Self::DeprovisionRequest(_) => {}
        }
        Ok(())
    }

    /// Flatten into the wire payload
    #[must_use]
    pub fn to_payload(&self) -> IndexMap<String, String> {
        let mut payload = IndexMap::new();
        let mut put = |key: &str, value: String| {
            payload.insert(key.to_string(), value);
        };
        put(keys::TENANT_ID, self.tenant_id().to_string());
        put(keys::REGISTRATION_ID, self.registration_id().to_string());

        match self {
            Self::OnboardingRequest(e) => {
                put(keys::TIER, e.tier.to_string());
                put(keys::COMPANY_NAME, e.company_name.clone());
                put(keys::ADMIN_EMAIL, e.admin_email.clone());
            }
            Self::ProvisionSuccess(e) => {
                let c = &e.config;
                put(keys::API_KEY, c.api_key.clone());
                put(keys::KNOWLEDGE_BASE_ID, c.knowledge_base_id.clone());
                put(keys::DATA_SOURCE_ID, c.data_source_id.clone());
                put(keys::IDENTITY_CLIENT_ID, c.identity_client_id.clone());
                put(keys::STORAGE_PREFIX, c.storage_prefix.clone());
                put(keys::API_URL, c.endpoints.api_url.clone());
                put(keys::UPLOAD_URL, c.endpoints.upload_url.clone());
                put(keys::QUERY_URL, c.endpoints.query_url.clone());
                put(keys::GENERATED_AT, c.generated_at.to_rfc3339());
                if !e.degraded_steps.is_empty() {
                    put(keys::DEGRADED_STEPS, e.degraded_steps.join(","));
                }
            }
            Self::ProvisionFailure(e) | Self::DeprovisionFailure(e) => {
                put(keys::ERROR_KIND, e.summary.kind.to_string());
                put(keys::ERROR_MESSAGE, e.summary.message.clone());
                if let Some(step) = &e.summary.failed_step {
                    put(keys::FAILED_STEP, step.clone());
                }
            }
            Self::DeprovisionSuccess(e) => {
                put(keys::OBJECTS_DELETED, e.objects_deleted.to_string());
            }
            Self::DeprovisionRequest(_) => {}
        }
        payload
    }
}

/// Wire form of a published event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Ulid,
    pub name: EventName,
    pub correlation_id: String,
    pub published_at: DateTime<Utc>,
    pub payload: IndexMap<String, String>,
}

impl EventEnvelope {
    /// Stamp a typed event for publication
    #[must_use]
    pub fn seal(event: &LifecycleEvent) -> Self {
        Self {
            event_id: Ulid::new(),
            name: event.name(),
            correlation_id: event.tenant_id().to_string(),
            published_at: Utc::now(),
            payload: event.to_payload(),
        }
    }

    /// Decode back into the typed event
    pub fn decode(&self) -> Result<LifecycleEvent, EventError> {
        LifecycleEvent::try_from(self)
    }
}

struct PayloadReader<'a> {
    name: EventName,
    payload: &'a IndexMap<String, String>,
}

impl<'a> PayloadReader<'a> {
    fn get(&self, field: &'static str) -> Result<&'a str, EventError> {
        self.payload
            .get(field)
            .map(String::as_str)
            .ok_or_else(|| EventError::MissingField {
                event: self.name.to_string(),
                field,
            })
    }

    fn optional(&self, field: &'static str) -> Option<&'a str> {
        self.payload.get(field).map(String::as_str)
    }

    fn parse<T: FromStr>(&self, field: &'static str) -> Result<T, EventError>
    where
        T::Err: fmt::Display,
    {
        self.get(field)?
            .parse()
            .map_err(|e: T::Err| EventError::InvalidField {
                field,
                reason: e.to_string(),
            })
    }

    fn string(&self, field: &'static str) -> Result<String, EventError> {
        self.get(field).map(str::to_string)
    }

    fn failure(&self, registration_id: RegistrationId, tenant_id: TenantId) -> Result<JobFailure, EventError> {
        Ok(JobFailure {
            registration_id,
            tenant_id,
            summary: FailureSummary {
                kind: self.parse::<FailureKind>(keys::ERROR_KIND)?,
                message: self.string(keys::ERROR_MESSAGE)?,
                failed_step: self.optional(keys::FAILED_STEP).map(str::to_string),
            },
        })
    }
}

impl TryFrom<&EventEnvelope> for LifecycleEvent {
    type Error = EventError;

    fn try_from(envelope: &EventEnvelope) -> Result<Self, Self::Error> {
        let reader = PayloadReader {
            name: envelope.name,
            payload: &envelope.payload,
        };

        let tenant_id = reader.get(keys::TENANT_ID)?;
        if tenant_id != envelope.correlation_id {
            return Err(EventError::CorrelationMismatch {
                correlation_id: envelope.correlation_id.clone(),
                tenant_id: tenant_id.to_string(),
            });
        }
        let tenant_id = TenantId::new(tenant_id);
        let registration_id: RegistrationId = reader.parse(keys::REGISTRATION_ID)?;

        let event = match envelope.name {
            EventName::OnboardingRequest => Self::OnboardingRequest(OnboardingRequest {
                registration_id,
                tenant_id,
                tier: reader.parse(keys::TIER)?,
                company_name: reader.string(keys::COMPANY_NAME)?,
                admin_email: reader.string(keys::ADMIN_EMAIL)?,
            }),
            EventName::ProvisionSuccess => {
                let generated_at = DateTime::parse_from_rfc3339(reader.get(keys::GENERATED_AT)?)
                    .map_err(|e| EventError::InvalidField {
                        field: keys::GENERATED_AT,
                        reason: e.to_string(),
                    })?
                    .with_timezone(&Utc);
                Self::ProvisionSuccess(ProvisionSuccess {
                    registration_id,
                    tenant_id,
                    config: TenantConfig {
                        api_key: reader.string(keys::API_KEY)?,
                        knowledge_base_id: reader.string(keys::KNOWLEDGE_BASE_ID)?,
                        data_source_id: reader.string(keys::DATA_SOURCE_ID)?,
                        identity_client_id: reader.string(keys::IDENTITY_CLIENT_ID)?,
                        storage_prefix: reader.string(keys::STORAGE_PREFIX)?,
                        endpoints: TenantEndpoints {
                            api_url: reader.string(keys::API_URL)?,
                            upload_url: reader.string(keys::UPLOAD_URL)?,
                            query_url: reader.string(keys::QUERY_URL)?,
                        },
                        generated_at,
                    },
                    degraded_steps: reader
                        .optional(keys::DEGRADED_STEPS)
                        .map(|s| s.split(',').map(str::to_string).collect())
                        .unwrap_or_default(),
                })
            }
            EventName::ProvisionFailure => {
                Self::ProvisionFailure(reader.failure(registration_id, tenant_id)?)
            }
            EventName::DeprovisionRequest => Self::DeprovisionRequest(DeprovisionRequest {
                registration_id,
                tenant_id,
            }),
            EventName::DeprovisionSuccess => Self::DeprovisionSuccess(DeprovisionSuccess {
                registration_id,
                tenant_id,
                objects_deleted: reader.parse(keys::OBJECTS_DELETED)?,
            }),
            EventName::DeprovisionFailure => {
                Self::DeprovisionFailure(reader.failure(registration_id, tenant_id)?)
            }
        };
        event.validate()?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn onboarding(tenant: &str) -> LifecycleEvent {
        LifecycleEvent::OnboardingRequest(OnboardingRequest {
            registration_id: RegistrationId::new(),
            tenant_id: TenantId::new(tenant),
            tier: Tier::Basic,
            company_name: "Acme".to_string(),
            admin_email: "admin@acme.com".to_string(),
        })
    }

    fn success(api_key: &str) -> LifecycleEvent {
        LifecycleEvent::ProvisionSuccess(ProvisionSuccess {
            registration_id: RegistrationId::new(),
            tenant_id: TenantId::new("acme"),
            config: TenantConfig {
                api_key: api_key.to_string(),
                knowledge_base_id: "KB01".to_string(),
                data_source_id: "DS01".to_string(),
                identity_client_id: "client-1".to_string(),
                storage_prefix: "acme/".to_string(),
                endpoints: TenantEndpoints {
                    api_url: "https://api.example.com/prod".to_string(),
                    upload_url: "https://api.example.com/prod/upload".to_string(),
                    query_url: "https://api.example.com/prod/query".to_string(),
                },
                generated_at: Utc::now(),
            },
            degraded_steps: vec!["usage_plan".to_string()],
        })
    }

    #[test]
    fn event_names_parse_from_wire() {
        for name in EventName::ALL {
            assert_eq!(name.as_str().parse::<EventName>().unwrap(), name);
        }
        assert!(matches!(
            "TENANT_CREATED".parse::<EventName>(),
            Err(EventError::UnknownEventName(_))
        ));
    }

    #[test]
    fn envelope_carries_correlation_id_in_payload() {
        let envelope = EventEnvelope::seal(&onboarding("acme"));

        assert_eq!(envelope.correlation_id, "acme");
        assert_eq!(envelope.payload[keys::TENANT_ID], "acme");
        assert!(envelope.payload.contains_key(keys::REGISTRATION_ID));
    }

    #[test]
    fn envelope_decodes_to_same_event() {
        let event = success("k-123");
        let envelope = EventEnvelope::seal(&event);
        let decoded = envelope.decode().unwrap();

        // timestamps survive rfc3339 at nanosecond precision
        assert_eq!(decoded, event);
    }

    #[test]
    fn decode_rejects_correlation_mismatch() {
        let mut envelope = EventEnvelope::seal(&onboarding("acme"));
        envelope.correlation_id = "globex".to_string();

        assert!(matches!(
            envelope.decode(),
            Err(EventError::CorrelationMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_missing_field() {
        let mut envelope = EventEnvelope::seal(&onboarding("acme"));
        envelope.payload.shift_remove(keys::ADMIN_EMAIL);

        assert!(matches!(
            envelope.decode(),
            Err(EventError::MissingField { field: "adminEmail", .. })
        ));
    }

    #[test]
    fn success_requires_api_key() {
        assert!(success("k-1").validate().is_ok());
        assert!(matches!(
            success("").validate(),
            Err(EventError::EmptyField { field: "apiKey", .. })
        ));
    }

    #[test]
    fn request_with_empty_tenant_is_structurally_valid() {
        let event = onboarding("");
        assert!(event.validate().is_ok());
        assert_eq!(EventEnvelope::seal(&event).payload[keys::TENANT_ID], "");
    }

    #[test]
    fn envelope_json_uses_wire_names() {
        let envelope = EventEnvelope::seal(&onboarding("acme"));
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["name"], "ONBOARDING_REQUEST");
        assert_eq!(json["correlationId"], "acme");
        assert_eq!(json["payload"]["tier"], "basic");
    }
}
