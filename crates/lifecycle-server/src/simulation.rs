//! In-process acceptance run
//!
//! Each scenario gets a fresh system over the simulated resource layer and
//! drives it through the control plane exactly as the management API would.

use crate::config::ServerConfig;
use lifecycle_core::{
    ControlPlane, EventName, FailureKind, InMemoryResourceLayer, LifecycleSystem,
    RegistrationId, RegistrationRequest, ResourceError, ResourceOp, SystemBuilder, TenantId,
    TenantRegistration, TenantStatus, Tier,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of one scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    /// Final registration status, when one was reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TenantStatus>,
    /// Checks that did not hold
    pub problems: Vec<String>,
}

/// Report of a simulation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub scenarios: Vec<ScenarioOutcome>,
}

impl SimulationReport {
    /// Check if every scenario passed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.scenarios.iter().all(|s| s.passed)
    }

    /// Generate text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::from("=== Tenant Lifecycle Simulation ===\n\n");
        for scenario in &self.scenarios {
            let verdict = if scenario.passed { "PASS" } else { "FAIL" };
            let status = scenario
                .status
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            report.push_str(&format!("[{verdict}] {} (status: {status})\n", scenario.name));
            for problem in &scenario.problems {
                report.push_str(&format!("    - {problem}\n"));
            }
        }
        let verdict = if self.passed() { "PASSED" } else { "FAILED" };
        report.push_str(&format!("\n=== Result: {verdict} ===\n"));
        report
    }
}

/// Run every scenario against fresh in-memory systems
pub async fn run_simulation(config: &ServerConfig) -> SimulationReport {
    let mut report = SimulationReport::default();
    report.scenarios.push(onboarding_completes(config).await);
    report.scenarios.push(empty_tenant_fails(config).await);
    report
        .scenarios
        .push(never_provisioned_tenant_deprovisions(config).await);
    report
}

struct Sim {
    layer: Arc<InMemoryResourceLayer>,
    system: LifecycleSystem,
}

impl Sim {
    fn start(config: &ServerConfig) -> Self {
        let layer = Arc::new(InMemoryResourceLayer::new(config.stack_outputs()));
        let mut system = SystemBuilder::new(layer.clone())
            .with_settings(config.job_settings())
            .with_job_budget(config.job_budget())
            .build();
        system.start();
        Self { layer, system }
    }

    fn control_plane(&self) -> &ControlPlane {
        &self.system.control_plane
    }

    fn event_names(&self, tenant: &str) -> Vec<EventName> {
        self.system.bus.names_for(&TenantId::new(tenant))
    }
}

/// Poll until the registration leaves the in-flight statuses
async fn settle(
    control_plane: &ControlPlane,
    id: RegistrationId,
) -> Result<TenantRegistration, String> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let current = control_plane.get(id).await.map_err(|e| e.to_string())?;
        if !current.status.is_in_flight() {
            return Ok(current);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("registration stuck in {}", current.status));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn expect(problems: &mut Vec<String>, holds: bool, what: impl Into<String>) {
    if !holds {
        problems.push(what.into());
    }
}

fn outcome(
    name: &str,
    registration: Option<&TenantRegistration>,
    problems: Vec<String>,
) -> ScenarioOutcome {
    ScenarioOutcome {
        name: name.to_string(),
        passed: problems.is_empty(),
        status: registration.map(|r| r.status),
        problems,
    }
}

async fn onboarding_completes(config: &ServerConfig) -> ScenarioOutcome {
    const NAME: &str = "onboarding completes with credentials";
    let sim = Sim::start(config);
    let mut problems = Vec::new();

    let request = RegistrationRequest::new("acme", "admin@acme.com", Tier::Basic);
    let settled = match sim.control_plane().register(request).await {
        Ok(registration) => settle(sim.control_plane(), registration.id).await,
        Err(e) => Err(e.to_string()),
    };

    let registration = match settled {
        Ok(registration) => registration,
        Err(problem) => {
            sim.system.shutdown().await;
            return outcome(NAME, None, vec![problem]);
        }
    };

    expect(
        &mut problems,
        registration.status == TenantStatus::Complete,
        format!("expected Complete, got {}", registration.status),
    );
    match registration.active_config() {
        Some(config) => {
            expect(&mut problems, !config.api_key.is_empty(), "api key is empty");
            expect(
                &mut problems,
                !config.knowledge_base_id.is_empty(),
                "knowledge base id is empty",
            );
        }
        None => problems.push("no tenant configuration recorded".to_string()),
    }
    expect(
        &mut problems,
        sim.event_names("acme") == [EventName::OnboardingRequest, EventName::ProvisionSuccess],
        "expected ONBOARDING_REQUEST then PROVISION_SUCCESS",
    );
    expect(
        &mut problems,
        sim.system.bus.verify_journal().is_ok(),
        "event journal failed verification",
    );

    sim.system.shutdown().await;
    outcome(NAME, Some(&registration), problems)
}

async fn empty_tenant_fails(config: &ServerConfig) -> ScenarioOutcome {
    const NAME: &str = "empty tenant id fails with a precondition failure";
    let sim = Sim::start(config);
    let mut problems = Vec::new();

    let request = RegistrationRequest::new("", "admin@acme.com", Tier::Basic);
    let settled = match sim.control_plane().register(request).await {
        Ok(registration) => settle(sim.control_plane(), registration.id).await,
        Err(e) => Err(e.to_string()),
    };

    let registration = match settled {
        Ok(registration) => registration,
        Err(problem) => {
            sim.system.shutdown().await;
            return outcome(NAME, None, vec![problem]);
        }
    };

    expect(
        &mut problems,
        registration.status == TenantStatus::Failed,
        format!("expected Failed, got {}", registration.status),
    );
    let kind = registration.failure.as_ref().map(|f| f.kind);
    expect(
        &mut problems,
        kind == Some(FailureKind::PreconditionFailure),
        format!("expected PreconditionFailure, got {kind:?}"),
    );
    expect(
        &mut problems,
        sim.layer.calls(ResourceOp::EnsureStoragePrefix) == 0,
        "resources were touched for an empty tenant id",
    );

    sim.system.shutdown().await;
    outcome(NAME, Some(&registration), problems)
}

async fn never_provisioned_tenant_deprovisions(config: &ServerConfig) -> ScenarioOutcome {
    const NAME: &str = "deprovisioning a never-provisioned tenant succeeds";
    let sim = Sim::start(config);
    let mut problems = Vec::new();

    // the very first provisioning step is rejected, so nothing is ever created
    sim.layer.fail_always(
        ResourceOp::EnsureStoragePrefix,
        ResourceError::Validation("storage prefix rejected".to_string()),
    );

    let request = RegistrationRequest::new("globex", "admin@globex.com", Tier::Standard);
    let settled = async {
        let registration = sim
            .control_plane()
            .register(request)
            .await
            .map_err(|e| e.to_string())?;
        let failed = settle(sim.control_plane(), registration.id).await?;
        if failed.status != TenantStatus::Failed {
            return Err(format!("provisioning ended in {}", failed.status));
        }
        sim.control_plane()
            .deprovision(registration.id)
            .await
            .map_err(|e| e.to_string())?;
        settle(sim.control_plane(), registration.id).await
    }
    .await;

    let registration = match settled {
        Ok(registration) => registration,
        Err(problem) => {
            sim.system.shutdown().await;
            return outcome(NAME, None, vec![problem]);
        }
    };

    expect(
        &mut problems,
        registration.status == TenantStatus::Deleted,
        format!("expected Deleted, got {}", registration.status),
    );
    expect(
        &mut problems,
        sim.event_names("globex").last() == Some(&EventName::DeprovisionSuccess),
        "last event is not DEPROVISION_SUCCESS",
    );

    sim.system.shutdown().await;
    outcome(NAME, Some(&registration), problems)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_passes_only_when_every_scenario_does() {
        let mut report = SimulationReport {
            scenarios: vec![ScenarioOutcome {
                name: "a".to_string(),
                passed: true,
                status: Some(TenantStatus::Complete),
                problems: Vec::new(),
            }],
        };
        assert!(report.passed());
        assert!(report.generate_text().contains("[PASS] a (status: Complete)"));

        report.scenarios.push(ScenarioOutcome {
            name: "b".to_string(),
            passed: false,
            status: None,
            problems: vec!["stuck".to_string()],
        });
        assert!(!report.passed());
        let text = report.generate_text();
        assert!(text.contains("[FAIL] b (status: -)"));
        assert!(text.contains("    - stuck"));
        assert!(text.ends_with("=== Result: FAILED ===\n"));
    }
}
