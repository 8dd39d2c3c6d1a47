//! Instants and states.
//!
//! A [`State`] says *when* a CNEC is monitored or a remedial action is
//! available: an [`Instant`] plus, for anything after the outage, the
//! contingency it follows. States order by instant first so that a preventive
//! state always sorts before the curative states of any contingency.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Kind of an instant. Named instants share one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstantKind {
    Preventive,
    Outage,
    Auto,
    Curative,
}

/// A named instant with its position in the instant sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instant {
    pub id: String,
    pub kind: InstantKind,
    pub order: u32,
}

impl Instant {
    pub fn new(id: impl Into<String>, kind: InstantKind, order: u32) -> Self {
        Self {
            id: id.into(),
            kind,
            order,
        }
    }

    pub fn preventive() -> Self {
        Self::new("preventive", InstantKind::Preventive, 0)
    }

    pub fn outage() -> Self {
        Self::new("outage", InstantKind::Outage, 1)
    }

    pub fn auto() -> Self {
        Self::new("auto", InstantKind::Auto, 2)
    }

    pub fn curative() -> Self {
        Self::new("curative", InstantKind::Curative, 3)
    }

    pub fn is_preventive(&self) -> bool {
        self.kind == InstantKind::Preventive
    }

    pub fn is_curative(&self) -> bool {
        self.kind == InstantKind::Curative
    }

    pub fn comes_before(&self, other: &Instant) -> bool {
        self.order < other.order
    }
}

/// An (instant, contingency) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct State {
    pub instant: Instant,
    pub contingency: Option<String>,
}

impl State {
    pub fn preventive() -> Self {
        Self {
            instant: Instant::preventive(),
            contingency: None,
        }
    }

    pub fn after_contingency(instant: Instant, contingency: impl Into<String>) -> Self {
        Self {
            instant,
            contingency: Some(contingency.into()),
        }
    }

    /// Stable identifier, used in linear problem keys and logs.
    pub fn id(&self) -> String {
        match &self.contingency {
            Some(contingency) => format!("{} - {}", contingency, self.instant.id),
            None => self.instant.id.clone(),
        }
    }

    pub fn is_preventive(&self) -> bool {
        self.instant.is_preventive()
    }

    /// Whether setpoints chosen at `self` still hold at `later`: same or
    /// earlier instant, on the preventive trunk or the same contingency.
    pub fn reaches(&self, later: &State) -> bool {
        self.instant.order <= later.instant.order
            && (self.contingency.is_none() || self.contingency == later.contingency)
    }
}

impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instant
            .order
            .cmp(&other.instant.order)
            .then_with(|| self.contingency.cmp(&other.contingency))
            .then_with(|| self.instant.id.cmp(&other.instant.id))
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_order_by_instant_then_contingency() {
        let preventive = State::preventive();
        let curative_b = State::after_contingency(Instant::curative(), "co-b");
        let curative_a = State::after_contingency(Instant::curative(), "co-a");
        let outage = State::after_contingency(Instant::outage(), "co-z");

        let mut states = vec![curative_b.clone(), outage.clone(), preventive.clone(), curative_a.clone()];
        states.sort();
        assert_eq!(states, vec![preventive, outage, curative_a, curative_b]);
    }

    #[test]
    fn test_state_id() {
        assert_eq!(State::preventive().id(), "preventive");
        let state = State::after_contingency(Instant::curative(), "co1");
        assert_eq!(state.id(), "co1 - curative");
        assert!(!state.is_preventive());
    }

    #[test]
    fn test_setpoints_reach_own_contingency_only() {
        let preventive = State::preventive();
        let outage_1 = State::after_contingency(Instant::outage(), "co-1");
        let curative_1 = State::after_contingency(Instant::curative(), "co-1");
        let curative_2 = State::after_contingency(Instant::curative(), "co-2");

        assert!(preventive.reaches(&curative_2));
        assert!(outage_1.reaches(&curative_1));
        assert!(curative_1.reaches(&curative_1));
        assert!(!curative_1.reaches(&curative_2));
        assert!(!curative_1.reaches(&preventive));
    }

    #[test]
    fn test_user_defined_instant_shares_kind() {
        let curative_2 = Instant::new("curative-2", InstantKind::Curative, 4);
        assert!(curative_2.is_curative());
        assert!(Instant::curative().comes_before(&curative_2));
    }
}
