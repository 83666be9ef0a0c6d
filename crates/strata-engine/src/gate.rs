use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use strata_core::config::{OrganizationSpec, RoleSpec};
use strata_core::event::{EngineEvent, EventBus, Severity};
use strata_core::types::RunId;

pub const SOURCE: &str = "moise.gate";

const WILDCARD: &str = "*";

/// One step presented to the gate.
#[derive(Debug, Clone)]
pub struct GateRequest<'a> {
    pub run_id: &'a RunId,
    pub agent_id: Option<&'a str>,
    pub team_id: Option<&'a str>,
    pub step_id: &'a str,
    pub strategy: &'a str,
    pub tool: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: String,
}

impl GateDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Organizational permission check run before every executable step.
///
/// Rules, in order:
/// 1. no team, or no organization describing the team: allowed
/// 2. agent missing from the team: denied
/// 3. any of the agent's roles prohibits the strategy or tool: denied
/// 4. some role permits both the strategy and the tool: allowed
/// 5. otherwise denied
pub struct MoiseGate {
    organization: Option<OrganizationSpec>,
    event_bus: Arc<EventBus>,
}

impl MoiseGate {
    pub fn new(organization: Option<OrganizationSpec>, event_bus: Arc<EventBus>) -> Self {
        Self {
            organization,
            event_bus,
        }
    }

    pub fn validate_execution(&self, request: &GateRequest<'_>) -> GateDecision {
        let decision = self.decide(request);
        if decision.allowed {
            debug!(step = request.step_id, reason = %decision.reason, "Gate allowed step");
        } else {
            warn!(
                run_id = %request.run_id,
                step = request.step_id,
                reason = %decision.reason,
                "Gate denied step"
            );
            self.event_bus.publish(
                EngineEvent::safety(
                    "moise.denied",
                    SOURCE,
                    Severity::Medium,
                    decision.reason.clone(),
                    json!({
                        "runId": request.run_id,
                        "stepId": request.step_id,
                        "agentId": request.agent_id,
                        "teamId": request.team_id,
                        "strategy": request.strategy,
                        "tool": request.tool,
                    }),
                )
                .with_correlation(request.run_id.as_str()),
            );
        }
        decision
    }

    fn decide(&self, request: &GateRequest<'_>) -> GateDecision {
        let Some(team_id) = request.team_id else {
            return GateDecision::allow("no team");
        };
        let Some(team) = self
            .organization
            .as_ref()
            .and_then(|org| org.teams.get(team_id))
        else {
            return GateDecision::allow(format!("no organization for team {}", team_id));
        };
        let roles = self.organization.as_ref().map(|org| &org.roles);

        let Some(agent) = request.agent_id else {
            return GateDecision::deny(format!("no agent identity for team {}", team_id));
        };
        let Some(role_names) = team.members.get(agent) else {
            return GateDecision::deny(format!(
                "agent {} is not a member of team {}",
                agent, team_id
            ));
        };

        let assigned: Vec<(&String, &RoleSpec)> = role_names
            .iter()
            .filter_map(|name| roles.and_then(|r| r.get(name)).map(|spec| (name, spec)))
            .collect();

        for (name, role) in &assigned {
            if listed(&role.prohibited_strategies, request.strategy) {
                return GateDecision::deny(format!(
                    "role {} prohibits strategy {}",
                    name, request.strategy
                ));
            }
            if let Some(tool) = request.tool {
                if listed(&role.prohibited_tools, tool) {
                    return GateDecision::deny(format!("role {} prohibits tool {}", name, tool));
                }
            }
        }

        for (name, role) in &assigned {
            let strategy_ok = listed(&role.strategies, request.strategy);
            let tool_ok = request.tool.map_or(true, |tool| listed(&role.tools, tool));
            if strategy_ok && tool_ok {
                return GateDecision::allow(format!("permitted by role {}", name));
            }
        }

        GateDecision::deny(format!(
            "no role of agent {} permits strategy {}{}",
            agent,
            request.strategy,
            request
                .tool
                .map(|t| format!(" with tool {}", t))
                .unwrap_or_default()
        ))
    }
}

fn listed(entries: &[String], name: &str) -> bool {
    entries.iter().any(|e| e == WILDCARD || e == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strata_core::config::TeamSpec;
    use strata_core::event::EventCategory;

    fn organization() -> OrganizationSpec {
        let mut roles = HashMap::new();
        roles.insert(
            "analyst".to_string(),
            RoleSpec {
                strategies: vec!["reasoning".into(), "deterministic".into()],
                tools: vec!["json_query".into()],
                prohibited_strategies: vec![],
                prohibited_tools: vec![],
            },
        );
        roles.insert(
            "intern".to_string(),
            RoleSpec {
                strategies: vec!["*".into()],
                tools: vec!["*".into()],
                prohibited_strategies: vec![],
                prohibited_tools: vec!["math".into()],
            },
        );
        let mut teams = HashMap::new();
        teams.insert(
            "research".to_string(),
            TeamSpec {
                members: HashMap::from([
                    ("ada".to_string(), vec!["analyst".to_string()]),
                    ("bo".to_string(), vec!["intern".to_string()]),
                ]),
            },
        );
        OrganizationSpec { roles, teams }
    }

    fn request<'a>(
        run_id: &'a RunId,
        agent: Option<&'a str>,
        team: Option<&'a str>,
        strategy: &'a str,
        tool: Option<&'a str>,
    ) -> GateRequest<'a> {
        GateRequest {
            run_id,
            agent_id: agent,
            team_id: team,
            step_id: "s1",
            strategy,
            tool,
        }
    }

    #[test]
    fn no_team_or_unknown_team_is_allowed() {
        let gate = MoiseGate::new(Some(organization()), Arc::new(EventBus::default()));
        let run = RunId::from("r1");
        assert!(gate.validate_execution(&request(&run, Some("ada"), None, "conversational", None)).allowed);
        assert!(gate.validate_execution(&request(&run, Some("ada"), Some("ops"), "conversational", None)).allowed);

        let open = MoiseGate::new(None, Arc::new(EventBus::default()));
        assert!(open.validate_execution(&request(&run, None, Some("research"), "reasoning", None)).allowed);
    }

    #[test]
    fn membership_and_permissions() {
        let gate = MoiseGate::new(Some(organization()), Arc::new(EventBus::default()));
        let run = RunId::from("r1");

        let stranger = gate.validate_execution(&request(&run, Some("eve"), Some("research"), "reasoning", None));
        assert!(!stranger.allowed);
        assert!(stranger.reason.contains("not a member"));

        let permitted = gate.validate_execution(&request(
            &run,
            Some("ada"),
            Some("research"),
            "deterministic",
            Some("json_query"),
        ));
        assert!(permitted.allowed);
        assert_eq!(permitted.reason, "permitted by role analyst");

        let wrong_tool = gate.validate_execution(&request(
            &run,
            Some("ada"),
            Some("research"),
            "deterministic",
            Some("template"),
        ));
        assert!(!wrong_tool.allowed);

        let wrong_strategy =
            gate.validate_execution(&request(&run, Some("ada"), Some("research"), "conversational", None));
        assert!(!wrong_strategy.allowed);
    }

    #[test]
    fn prohibition_beats_wildcard_permission() {
        let gate = MoiseGate::new(Some(organization()), Arc::new(EventBus::default()));
        let run = RunId::from("r1");
        let denied = gate.validate_execution(&request(
            &run,
            Some("bo"),
            Some("research"),
            "deterministic",
            Some("math"),
        ));
        assert!(!denied.allowed);
        assert_eq!(denied.reason, "role intern prohibits tool math");

        assert!(gate
            .validate_execution(&request(&run, Some("bo"), Some("research"), "deterministic", Some("template")))
            .allowed);
    }

    #[test]
    fn denial_publishes_safety_event() {
        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe("moise.*");
        let gate = MoiseGate::new(Some(organization()), bus.clone());
        let run = RunId::from("r9");
        gate.validate_execution(&request(&run, Some("eve"), Some("research"), "reasoning", None));

        let event = sub.try_recv().expect("denial event");
        assert_eq!(event.event_type, "moise.denied");
        assert_eq!(event.source, SOURCE);
        assert_eq!(event.category, EventCategory::Safety);
        assert_eq!(event.correlation_id.as_deref(), Some("r9"));
        assert!(sub.try_recv().is_none());
    }
}
