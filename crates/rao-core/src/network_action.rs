//! Discrete remedial actions and their combinations.

use crate::error::{RaoError, RaoResult};
use crate::network::Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Switching direction of a topological action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Open,
    Close,
}

/// One atomic network mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementaryAction {
    Topological {
        element_id: String,
        action: ActionType,
    },
    PstSetpoint {
        element_id: String,
        tap: i32,
    },
    InjectionSetpoint {
        element_id: String,
        setpoint: f64,
    },
}

impl ElementaryAction {
    pub fn element_id(&self) -> &str {
        match self {
            ElementaryAction::Topological { element_id, .. }
            | ElementaryAction::PstSetpoint { element_id, .. }
            | ElementaryAction::InjectionSetpoint { element_id, .. } => element_id,
        }
    }

    fn apply(&self, network: &mut Network) -> RaoResult<()> {
        match self {
            ElementaryAction::Topological { element_id, action } => {
                network.set_connected(element_id, *action == ActionType::Close)
            }
            ElementaryAction::PstSetpoint { element_id, tap } => network.set_pst_tap(element_id, *tap),
            ElementaryAction::InjectionSetpoint {
                element_id,
                setpoint,
            } => network.set_injection_setpoint(element_id, *setpoint),
        }
    }

    fn is_applied(&self, network: &Network) -> RaoResult<bool> {
        Ok(match self {
            ElementaryAction::Topological { element_id, action } => {
                network.is_connected(element_id)? == (*action == ActionType::Close)
            }
            ElementaryAction::PstSetpoint { element_id, tap } => network.pst_tap(element_id)? == *tap,
            ElementaryAction::InjectionSetpoint {
                element_id,
                setpoint,
            } => (network.injection_setpoint(element_id)? - setpoint).abs() < 1e-6,
        })
    }
}

/// A named set of elementary actions owned by one operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAction {
    pub id: String,
    pub name: String,
    pub operator: Option<String>,
    pub elementary_actions: Vec<ElementaryAction>,
}

impl NetworkAction {
    pub fn new(id: impl Into<String>, operator: Option<&str>, elementary_actions: Vec<ElementaryAction>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            operator: operator.map(str::to_string),
            elementary_actions,
        }
    }

    /// Applies every elementary action. Applying twice leaves the network unchanged.
    pub fn apply(&self, network: &mut Network) -> RaoResult<()> {
        if self.elementary_actions.is_empty() {
            return Err(RaoError::Validation(format!(
                "network action '{}' has no elementary action",
                self.id
            )));
        }
        for action in &self.elementary_actions {
            action.apply(network).map_err(|e| {
                RaoError::Network(format!("cannot apply network action '{}': {}", self.id, e))
            })?;
        }
        Ok(())
    }

    /// True when applying the action would change the network.
    pub fn has_impact_on(&self, network: &Network) -> RaoResult<bool> {
        for action in &self.elementary_actions {
            if !action.is_applied(network)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn network_elements(&self) -> impl Iterator<Item = &str> {
        self.elementary_actions.iter().map(ElementaryAction::element_id)
    }
}

/// A set of network actions searched as one unit.
///
/// Actions are kept sorted by id, so two combinations made of the same actions
/// compare equal whatever order they were given in.
#[derive(Debug, Clone)]
pub struct NetworkActionCombination {
    actions: Vec<Arc<NetworkAction>>,
    detected_during_rao: bool,
}

impl NetworkActionCombination {
    pub fn new(actions: Vec<Arc<NetworkAction>>, detected_during_rao: bool) -> Self {
        let mut actions = actions;
        actions.sort_by(|a, b| a.id.cmp(&b.id));
        actions.dedup_by(|a, b| a.id == b.id);
        Self {
            actions,
            detected_during_rao,
        }
    }

    pub fn single(action: Arc<NetworkAction>) -> Self {
        Self::new(vec![action], false)
    }

    pub fn network_actions(&self) -> &[Arc<NetworkAction>] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn is_detected_during_rao(&self) -> bool {
        self.detected_during_rao
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.actions.iter().any(|a| a.id == action_id)
    }

    pub fn concatenated_id(&self) -> String {
        self.actions
            .iter()
            .map(|a| a.id.as_str())
            .collect::<Vec<_>>()
            .join(" + ")
    }

    pub fn operators(&self) -> BTreeSet<String> {
        self.actions
            .iter()
            .filter_map(|a| a.operator.clone())
            .collect()
    }

    /// Number of network actions per operator.
    pub fn count_per_operator(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for action in &self.actions {
            if let Some(operator) = &action.operator {
                *counts.entry(operator.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Number of elementary actions per operator.
    pub fn elementary_actions_per_operator(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for action in &self.actions {
            if let Some(operator) = &action.operator {
                *counts.entry(operator.clone()).or_insert(0) += action.elementary_actions.len();
            }
        }
        counts
    }
}

impl PartialEq for NetworkActionCombination {
    fn eq(&self, other: &Self) -> bool {
        self.actions.len() == other.actions.len()
            && self.actions.iter().zip(&other.actions).all(|(a, b)| a.id == b.id)
    }
}

impl Eq for NetworkActionCombination {}

impl std::hash::Hash for NetworkActionCombination {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for action in &self.actions {
            action.id.hash(state);
        }
    }
}

impl fmt::Display for NetworkActionCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.concatenated_id())
    }
}
