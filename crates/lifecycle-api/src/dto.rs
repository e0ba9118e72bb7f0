//! Request and response bodies

use chrono::{DateTime, Utc};
use lifecycle_core::{
    FailureSummary, RegistrationId, RegistrationRequest, TenantConfig, TenantId,
    TenantRegistration, TenantStatus, Tier,
};
use serde::{Deserialize, Serialize};

/// `POST /tenant-registrations` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRegistrationBody {
    pub tenant_name: String,
    pub email: String,
    pub tier: Tier,
    #[serde(default)]
    pub company_name: Option<String>,
}

impl From<CreateRegistrationBody> for RegistrationRequest {
    fn from(body: CreateRegistrationBody) -> Self {
        let request = RegistrationRequest::new(body.tenant_name, body.email, body.tier);
        match body.company_name {
            Some(company) => request.with_company_name(company),
            None => request,
        }
    }
}

/// `201` body of a created registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRegistration {
    pub registration_id: RegistrationId,
    pub tenant_id: TenantId,
    pub status: TenantStatus,
}

impl From<&TenantRegistration> for CreatedRegistration {
    fn from(r: &TenantRegistration) -> Self {
        Self {
            registration_id: r.id,
            tenant_id: r.tenant_id.clone(),
            status: r.status,
        }
    }
}

/// Registration as returned by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationView {
    pub registration_id: RegistrationId,
    pub tenant_id: TenantId,
    pub company_name: String,
    pub email: String,
    pub tier: Tier,
    pub status: TenantStatus,
    /// Present only while the registration is complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_config: Option<TenantConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TenantRegistration> for RegistrationView {
    fn from(r: &TenantRegistration) -> Self {
        Self {
            registration_id: r.id,
            tenant_id: r.tenant_id.clone(),
            company_name: r.company_name.clone(),
            email: r.admin_email.clone(),
            tier: r.tier,
            status: r.status,
            tenant_config: r.active_config().cloned(),
            failure: r.failure.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// `GET /tenant-registrations` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationList {
    pub registrations: Vec<RegistrationView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_body_uses_camel_case() {
        let body: CreateRegistrationBody = serde_json::from_str(
            r#"{"tenantName":"acme","email":"admin@acme.com","tier":"basic","companyName":"Acme"}"#,
        )
        .unwrap();

        let request = RegistrationRequest::from(body);
        assert_eq!(request.tenant_id(), TenantId::new("acme"));
        assert_eq!(request.company(), "Acme");
        assert_eq!(request.tier, Tier::Basic);
    }

    #[test]
    fn unknown_tier_is_rejected() {
        let parsed = serde_json::from_str::<CreateRegistrationBody>(
            r#"{"tenantName":"acme","email":"admin@acme.com","tier":"gold"}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn view_hides_config_unless_complete() {
        let request = RegistrationRequest::new("acme", "admin@acme.com", Tier::Basic);
        let registration = TenantRegistration::new(&request);

        let json = serde_json::to_value(RegistrationView::from(&registration)).unwrap();
        assert!(json.get("tenantConfig").is_none());
        assert_eq!(json["status"], "Pending");
        assert_eq!(json["email"], "admin@acme.com");
    }
}
