// Reasoning behavior seam
//
// Design Decision: Decisions come from a trait object per delegate
//
// Rationale: How a delegate decides (an LLM, a rule table, a recorded script)
// is outside the runtime. The orchestrator only needs one call per step that
// returns exactly one of respond / invoke / handoff. Keeping it a trait lets
// tests drive runs with scripted or mocked decisions and replay recorded
// event logs deterministically.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::capability::CapabilityInfo;
use crate::error::{MasterpieceError, Result};
use crate::events::{Event, EventKind};

/// What the active delegate wants to do next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Answer the user; completes the run
    Respond { text: String },

    /// Call one of the delegate's bound capabilities
    Invoke { capability: String, args: Value },

    /// Pass the turn to one of the delegate's children
    Handoff { child: String },
}

impl Decision {
    pub fn respond(text: impl Into<String>) -> Self {
        Decision::Respond { text: text.into() }
    }

    pub fn invoke(capability: impl Into<String>, args: Value) -> Self {
        Decision::Invoke {
            capability: capability.into(),
            args,
        }
    }

    pub fn handoff(child: impl Into<String>) -> Self {
        Decision::Handoff { child: child.into() }
    }
}

/// Everything a delegate gets to see when deciding
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub delegate: String,
    pub instruction: String,
    pub capabilities: Vec<CapabilityInfo>,
    pub children: Vec<String>,
    /// Session log so far, oldest first
    pub conversation: Vec<Event>,
}

impl DecisionRequest {
    /// Text of the most recent user message
    pub fn last_user_message(&self) -> Option<&str> {
        self.conversation.iter().rev().find_map(|e| match &e.kind {
            EventKind::UserMessage { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reasoning: Send + Sync {
    /// Decide the next step
    ///
    /// # Errors
    /// Any error fails the run with a reasoning `run_error`.
    async fn decide(&self, request: DecisionRequest) -> Result<Decision>;
}

/// Replays a fixed queue of decisions, one per call
pub struct ScriptedReasoning {
    name: String,
    decisions: Mutex<VecDeque<Decision>>,
}

impl ScriptedReasoning {
    pub fn new(name: impl Into<String>, decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            name: name.into(),
            decisions: Mutex::new(decisions.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.decisions.lock().map(|d| d.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Reasoning for ScriptedReasoning {
    async fn decide(&self, request: DecisionRequest) -> Result<Decision> {
        let next = self
            .decisions
            .lock()
            .map_err(|_| MasterpieceError::Reasoning("script lock poisoned".into()))?
            .pop_front();
        next.ok_or_else(|| {
            MasterpieceError::Reasoning(format!(
                "script '{}' exhausted at delegate '{}'",
                self.name, request.delegate
            ))
        })
    }
}

/// Per-delegate decision queues
///
/// Built by hand for tests, or recovered from a recorded session log with
/// `from_events` so a run can be replayed against the same tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    decisions: HashMap<String, Vec<Decision>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, delegate: impl Into<String>, decision: Decision) -> Self {
        self.decisions.entry(delegate.into()).or_default().push(decision);
        self
    }

    /// Rebuild the decisions that produced `events`
    ///
    /// Invocations and responses name their delegate; handoffs name their
    /// source. Results, user messages and run errors carry no decision.
    pub fn from_events(events: &[Event]) -> Self {
        let mut script = Script::new();
        for event in events {
            let (delegate, decision) = match &event.kind {
                EventKind::CapabilityInvocation {
                    delegate,
                    capability,
                    args,
                } => (delegate, Decision::invoke(capability.clone(), args.clone())),
                EventKind::DelegateHandoff { from, to } => (from, Decision::handoff(to.clone())),
                EventKind::DelegateResponse { delegate, text } => {
                    (delegate, Decision::respond(text.clone()))
                }
                _ => continue,
            };
            script = script.push(delegate.clone(), decision);
        }
        script
    }

    pub fn decisions_for(&self, delegate: &str) -> &[Decision] {
        self.decisions.get(delegate).map(Vec::as_slice).unwrap_or_default()
    }

    /// One `ScriptedReasoning` per delegate that has decisions
    pub fn into_reasoners(self) -> HashMap<String, Arc<dyn Reasoning>> {
        self.decisions
            .into_iter()
            .map(|(delegate, decisions)| {
                let reasoner: Arc<dyn Reasoning> =
                    Arc::new(ScriptedReasoning::new(delegate.clone(), decisions));
                (delegate, reasoner)
            })
            .collect()
    }
}
