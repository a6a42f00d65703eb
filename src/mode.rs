//! The agent's mode state machine: interactive / planning / executing,
//! with pause and plan-approval sub-states. Transitions are explicit and
//! validated; history is retained for debugging and session restore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AgentError;
use crate::intent::Intent;
use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Interactive,
    Planning,
    Executing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: AgentMode,
    pub to: AgentMode,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Serialized form of the machine, embedded in persisted agent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeState {
    pub mode: AgentMode,
    pub paused: bool,
    pub pending_plan: Option<Plan>,
    pub active_plan: Option<Plan>,
    pub history: Vec<ModeTransition>,
}

#[derive(Debug)]
pub struct ModeManager {
    mode: AgentMode,
    paused: bool,
    pending_plan: Option<Plan>,
    active_plan: Option<Plan>,
    history: Vec<ModeTransition>,
}

impl Default for ModeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeManager {
    pub fn new() -> Self {
        Self {
            mode: AgentMode::Interactive,
            paused: false,
            pending_plan: None,
            active_plan: None,
            history: Vec::new(),
        }
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True while a plan awaits user approval.
    pub fn awaiting_approval(&self) -> bool {
        self.pending_plan.is_some()
    }

    pub fn pending_plan(&self) -> Option<&Plan> {
        self.pending_plan.as_ref()
    }

    pub fn active_plan(&self) -> Option<&Plan> {
        self.active_plan.as_ref()
    }

    pub fn active_plan_mut(&mut self) -> Option<&mut Plan> {
        self.active_plan.as_mut()
    }

    pub fn history(&self) -> &[ModeTransition] {
        &self.history
    }

    fn transition(&mut self, to: AgentMode, reason: &str) {
        if self.mode == to {
            return;
        }
        info!(from = ?self.mode, ?to, reason, "mode transition");
        self.history.push(ModeTransition {
            from: self.mode,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.mode = to;
    }

    pub fn enter_planning(&mut self, reason: &str) {
        self.transition(AgentMode::Planning, reason);
    }

    /// Stage a plan for approval. Only meaningful in planning mode.
    pub fn set_pending_plan(&mut self, plan: Plan) -> Result<(), AgentError> {
        if self.mode != AgentMode::Planning {
            return Err(AgentError::Invariant(
                "pending plan outside planning mode".into(),
            ));
        }
        self.pending_plan = Some(plan);
        Ok(())
    }

    /// Promote the pending plan to active. Does not change mode; call
    /// `enter_executing` to start running it.
    pub fn approve_plan(&mut self) -> Result<&Plan, AgentError> {
        let plan = self
            .pending_plan
            .take()
            .ok_or_else(|| AgentError::Invariant("no pending plan to approve".into()))?;
        Ok(&*self.active_plan.insert(plan))
    }

    /// Drop the pending plan and fall back to interactive.
    pub fn reject_plan(&mut self) -> Option<Plan> {
        let rejected = self.pending_plan.take();
        if rejected.is_some() {
            self.transition(AgentMode::Interactive, "plan rejected");
        }
        rejected
    }

    pub fn enter_executing(&mut self) -> Result<(), AgentError> {
        if self.active_plan.is_none() {
            return Err(AgentError::Invariant("executing with no active plan".into()));
        }
        self.paused = false;
        self.transition(AgentMode::Executing, "plan approved");
        Ok(())
    }

    /// Flag checked at task boundaries while executing.
    pub fn pause_execution(&mut self) {
        if self.mode == AgentMode::Executing {
            self.paused = true;
            info!("execution paused");
        }
    }

    pub fn resume_execution(&mut self) {
        if self.paused {
            self.paused = false;
            info!("execution resumed");
        }
    }

    pub fn return_to_interactive(&mut self, reason: &str) {
        self.paused = false;
        self.active_plan = None;
        self.pending_plan = None;
        self.transition(AgentMode::Interactive, reason);
    }

    pub fn to_state(&self) -> ModeState {
        ModeState {
            mode: self.mode,
            paused: self.paused,
            pending_plan: self.pending_plan.clone(),
            active_plan: self.active_plan.clone(),
            history: self.history.clone(),
        }
    }

    pub fn from_state(state: ModeState) -> Self {
        Self {
            mode: state.mode,
            paused: state.paused,
            pending_plan: state.pending_plan,
            active_plan: state.active_plan,
            history: state.history,
        }
    }
}

/// Suggest the next mode for a classified intent. Ties default to staying
/// put — the caller owns the actual transition.
pub fn recommend_mode(intent: Intent, current: AgentMode, awaiting_approval: bool) -> AgentMode {
    match intent {
        Intent::Complex if current == AgentMode::Interactive => AgentMode::Planning,
        Intent::Approval if awaiting_approval => AgentMode::Executing,
        Intent::Rejection if awaiting_approval => AgentMode::Interactive,
        Intent::Interrupt if current == AgentMode::Executing => AgentMode::Executing, // paused, not left
        Intent::Interrupt => AgentMode::Interactive,
        Intent::PlanModify if awaiting_approval || current == AgentMode::Planning => {
            AgentMode::Planning
        }
        Intent::Simple if current == AgentMode::Interactive => AgentMode::Interactive,
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Task;

    fn plan() -> Plan {
        Plan::new("goal", vec![Task::new("t1", "a", "b")])
    }

    #[test]
    fn full_lifecycle() {
        let mut m = ModeManager::new();
        assert_eq!(m.mode(), AgentMode::Interactive);

        m.enter_planning("complex request");
        m.set_pending_plan(plan()).unwrap();
        assert!(m.awaiting_approval());

        m.approve_plan().unwrap();
        assert!(!m.awaiting_approval());
        m.enter_executing().unwrap();
        assert_eq!(m.mode(), AgentMode::Executing);

        m.return_to_interactive("plan settled");
        assert_eq!(m.mode(), AgentMode::Interactive);
        assert!(m.active_plan().is_none());
        assert_eq!(m.history().len(), 3);
    }

    #[test]
    fn pending_plan_requires_planning_mode() {
        let mut m = ModeManager::new();
        assert!(m.set_pending_plan(plan()).is_err());
    }

    #[test]
    fn approve_without_pending_is_invariant_error() {
        let mut m = ModeManager::new();
        assert!(matches!(
            m.approve_plan().unwrap_err(),
            AgentError::Invariant(_)
        ));
    }

    #[test]
    fn executing_requires_active_plan() {
        let mut m = ModeManager::new();
        assert!(m.enter_executing().is_err());
    }

    #[test]
    fn reject_returns_to_interactive() {
        let mut m = ModeManager::new();
        m.enter_planning("complex");
        m.set_pending_plan(plan()).unwrap();
        let rejected = m.reject_plan();
        assert!(rejected.is_some());
        assert_eq!(m.mode(), AgentMode::Interactive);
    }

    #[test]
    fn pause_only_applies_while_executing() {
        let mut m = ModeManager::new();
        m.pause_execution();
        assert!(!m.is_paused());

        m.enter_planning("p");
        m.set_pending_plan(plan()).unwrap();
        m.approve_plan().unwrap();
        m.enter_executing().unwrap();
        m.pause_execution();
        assert!(m.is_paused());
        m.resume_execution();
        assert!(!m.is_paused());
    }

    #[test]
    fn state_roundtrip() {
        let mut m = ModeManager::new();
        m.enter_planning("complex");
        m.set_pending_plan(plan()).unwrap();

        let state = m.to_state();
        let restored = ModeManager::from_state(state);
        assert_eq!(restored.mode(), AgentMode::Planning);
        assert!(restored.awaiting_approval());
        assert_eq!(restored.history().len(), 1);
    }

    #[test]
    fn recommendations() {
        use Intent::*;
        assert_eq!(
            recommend_mode(Complex, AgentMode::Interactive, false),
            AgentMode::Planning
        );
        assert_eq!(
            recommend_mode(Approval, AgentMode::Planning, true),
            AgentMode::Executing
        );
        assert_eq!(
            recommend_mode(Rejection, AgentMode::Planning, true),
            AgentMode::Interactive
        );
        // No pending plan: approval is just a chatty answer, stay put.
        assert_eq!(
            recommend_mode(Approval, AgentMode::Interactive, false),
            AgentMode::Interactive
        );
        assert_eq!(
            recommend_mode(StatusQuery, AgentMode::Executing, false),
            AgentMode::Executing
        );
    }
}
