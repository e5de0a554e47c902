//! 委派路由：在已注册的智能体中为子任务挑选目标
//!
//! 顺序：显式 agent_id → 能力集合完全相等的第一个 → 能力重叠最多的（同分取先注册者）。
//! 未声明能力时，用任务文本的内容词参与重叠打分。

use std::collections::BTreeSet;

use crate::core::AgentError;
use crate::retrieval::tokenizer::content_tokens;
use crate::supervisor::{AgentDescriptor, DelegationRequest};

#[derive(Debug, Default, Clone)]
pub struct CapabilityRouter {
    agents: Vec<AgentDescriptor>,
}

impl CapabilityRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_agents(agents: Vec<AgentDescriptor>) -> Result<Self, AgentError> {
        let mut router = Self::new();
        for agent in agents {
            router.register(agent)?;
        }
        Ok(router)
    }

    pub fn register(&mut self, agent: AgentDescriptor) -> Result<(), AgentError> {
        if agent.id.trim().is_empty() {
            return Err(AgentError::Config("agent id must not be empty".to_string()));
        }
        if self.get(&agent.id).is_some() {
            return Err(AgentError::Config(format!("agent `{}` registered twice", agent.id)));
        }
        tracing::debug!(agent_id = %agent.id, capabilities = ?agent.capabilities, "agent registered");
        self.agents.push(agent);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// 任一智能体把该动作列为需审批
    pub fn any_requires_approval(&self, action: &str) -> bool {
        self.agents.iter().any(|a| a.requires_approval(action))
    }

    pub fn route(&self, request: &DelegationRequest) -> Option<&AgentDescriptor> {
        if let Some(id) = &request.agent_id {
            return self.get(id);
        }

        let declared: BTreeSet<String> = request
            .capabilities
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        if !declared.is_empty() {
            if let Some(exact) = self.agents.iter().find(|a| a.capability_set() == declared) {
                return Some(exact);
            }
        }

        let wanted: BTreeSet<String> = if declared.is_empty() {
            content_tokens(&request.task).into_iter().collect()
        } else {
            declared
        };
        let mut best: Option<(&AgentDescriptor, usize)> = None;
        for agent in &self.agents {
            let mut score = agent.capability_set().intersection(&wanted).count();
            if let Some(action) = &request.action {
                if !agent.tools.is_empty() && agent.can_use(action) {
                    score += 1;
                }
            }
            if score > 0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((agent, score));
            }
        }
        best.map(|(a, _)| a)
    }

    /// 供系统提示展示的智能体列表
    pub fn describe(&self) -> String {
        self.agents
            .iter()
            .map(|a| {
                format!(
                    "- {}: {} (capabilities: {})",
                    a.id,
                    a.description,
                    a.capabilities.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> CapabilityRouter {
        CapabilityRouter::from_agents(vec![
            AgentDescriptor::new("generalist", "anything travel").with_capabilities(["travel", "flights", "hotels"]),
            AgentDescriptor::new("flights", "flight search").with_capabilities(["flights"]),
            AgentDescriptor::new("hotels", "hotel search").with_capabilities(["hotels", "travel"]),
            AgentDescriptor::new("reservations", "restaurant bookings")
                .with_capabilities(["bookings"])
                .with_tools(["create_booking", "cancel_booking"])
                .with_approval(["cancel_booking"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_exact_match_wins_over_overlap() {
        let r = router();
        let req = DelegationRequest::new("find a flight").with_capabilities(["Flights"]);
        assert_eq!(r.route(&req).unwrap().id, "flights");
    }

    #[test]
    fn test_highest_overlap_then_registration_order() {
        let r = router();
        // generalist 与 hotels 都重叠 2 个，先注册者胜出
        let req = DelegationRequest::new("x").with_capabilities(["hotels", "travel", "spa"]);
        assert_eq!(r.route(&req).unwrap().id, "generalist");

        let req = DelegationRequest::new("x").with_capabilities(["hotels", "spa"]);
        assert_eq!(r.route(&req).unwrap().id, "generalist");

        let req = DelegationRequest::new("x").with_capabilities(["cooking"]);
        assert!(r.route(&req).is_none());
    }

    #[test]
    fn test_explicit_id_and_task_tokens() {
        let r = router();
        let req = DelegationRequest {
            agent_id: Some("hotels".to_string()),
            ..DelegationRequest::new("anything")
        };
        assert_eq!(r.route(&req).unwrap().id, "hotels");

        let req = DelegationRequest::new("cancel booking ABC123").with_action("cancel_booking");
        assert_eq!(r.route(&req).unwrap().id, "reservations");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut r = router();
        assert!(r.register(AgentDescriptor::new("flights", "again")).is_err());
        assert!(r.register(AgentDescriptor::new(" ", "blank")).is_err());
        assert!(r.any_requires_approval("cancel_booking"));
        assert!(r.describe().contains("- reservations: restaurant bookings"));
    }
}
