//! Mutable grid model that remedial actions act upon.
//!
//! The network is an undirected multigraph: buses are nodes, branches (lines,
//! transformers, phase shifters, switches, HVDC links) are edges. Injections
//! hang off buses. Network actions flip branch connection status or set fixed
//! taps/setpoints; range actions read and write the continuous setpoint of
//! their element.
//!
//! ```text
//!   BUS_A ──── line ──── BUS_B ──── pst (tap 0) ──── BUS_C
//!     │                                                │
//!     └──────────────── switch (closed) ───────────────┘
//! ```
//!
//! Leaves work on private clones of the base network, so every mutation here
//! is local to one candidate.

use crate::error::{RaoError, RaoResult};
use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A bus (electrical node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: String,
    pub nominal_kv: f64,
}

/// Element-specific branch data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Line,
    Transformer,
    /// Phase-shifting transformer at a given tap position
    PhaseShifter { tap: i32 },
    Switch,
    /// HVDC link with an active power setpoint in MW
    Hvdc { setpoint_mw: f64 },
}

/// A network branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub kind: BranchKind,
    pub connected: bool,
}

/// A controllable injection (generator or load) with an active power setpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub id: String,
    pub bus: NodeIndex,
    pub setpoint_mw: f64,
}

/// Grid snapshot.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub graph: UnGraph<Bus, Branch>,
    bus_index: HashMap<String, NodeIndex>,
    branch_index: HashMap<String, EdgeIndex>,
    injections: BTreeMap<String, Injection>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bus(&mut self, id: impl Into<String>, nominal_kv: f64) -> NodeIndex {
        let id = id.into();
        if let Some(existing) = self.bus_index.get(&id) {
            return *existing;
        }
        let index = self.graph.add_node(Bus {
            id: id.clone(),
            nominal_kv,
        });
        self.bus_index.insert(id, index);
        index
    }

    pub fn add_branch(
        &mut self,
        id: impl Into<String>,
        from_bus: &str,
        to_bus: &str,
        kind: BranchKind,
    ) -> RaoResult<EdgeIndex> {
        let id = id.into();
        if self.branch_index.contains_key(&id) {
            return Err(RaoError::Network(format!("branch '{}' already exists", id)));
        }
        let from = self.bus_index_of(from_bus)?;
        let to = self.bus_index_of(to_bus)?;
        let edge = self.graph.add_edge(
            from,
            to,
            Branch {
                id: id.clone(),
                kind,
                connected: true,
            },
        );
        self.branch_index.insert(id, edge);
        Ok(edge)
    }

    pub fn add_injection(
        &mut self,
        id: impl Into<String>,
        bus: &str,
        setpoint_mw: f64,
    ) -> RaoResult<()> {
        let id = id.into();
        let bus = self.bus_index_of(bus)?;
        self.injections.insert(
            id.clone(),
            Injection {
                id,
                bus,
                setpoint_mw,
            },
        );
        Ok(())
    }

    pub fn bus_index_of(&self, id: &str) -> RaoResult<NodeIndex> {
        self.bus_index
            .get(id)
            .copied()
            .ok_or_else(|| RaoError::Network(format!("unknown bus '{}'", id)))
    }

    pub fn branch(&self, id: &str) -> RaoResult<&Branch> {
        let edge = self.edge_of(id)?;
        self.graph
            .edge_weight(edge)
            .ok_or_else(|| RaoError::Network(format!("unknown branch '{}'", id)))
    }

    fn branch_mut(&mut self, id: &str) -> RaoResult<&mut Branch> {
        let edge = self.edge_of(id)?;
        self.graph
            .edge_weight_mut(edge)
            .ok_or_else(|| RaoError::Network(format!("unknown branch '{}'", id)))
    }

    fn edge_of(&self, id: &str) -> RaoResult<EdgeIndex> {
        self.branch_index
            .get(id)
            .copied()
            .ok_or_else(|| RaoError::Network(format!("unknown branch '{}'", id)))
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.graph.edge_weights()
    }

    pub fn contains_element(&self, id: &str) -> bool {
        self.branch_index.contains_key(id)
            || self.injections.contains_key(id)
            || self.bus_index.contains_key(id)
    }

    pub fn is_connected(&self, branch_id: &str) -> RaoResult<bool> {
        Ok(self.branch(branch_id)?.connected)
    }

    pub fn set_connected(&mut self, branch_id: &str, connected: bool) -> RaoResult<()> {
        self.branch_mut(branch_id)?.connected = connected;
        Ok(())
    }

    pub fn pst_tap(&self, branch_id: &str) -> RaoResult<i32> {
        match self.branch(branch_id)?.kind {
            BranchKind::PhaseShifter { tap } => Ok(tap),
            _ => Err(RaoError::Network(format!(
                "branch '{}' is not a phase shifter",
                branch_id
            ))),
        }
    }

    pub fn set_pst_tap(&mut self, branch_id: &str, new_tap: i32) -> RaoResult<()> {
        match &mut self.branch_mut(branch_id)?.kind {
            BranchKind::PhaseShifter { tap } => {
                *tap = new_tap;
                Ok(())
            }
            _ => Err(RaoError::Network(format!(
                "branch '{}' is not a phase shifter",
                branch_id
            ))),
        }
    }

    pub fn hvdc_setpoint(&self, branch_id: &str) -> RaoResult<f64> {
        match self.branch(branch_id)?.kind {
            BranchKind::Hvdc { setpoint_mw } => Ok(setpoint_mw),
            _ => Err(RaoError::Network(format!(
                "branch '{}' is not an HVDC line",
                branch_id
            ))),
        }
    }

    pub fn set_hvdc_setpoint(&mut self, branch_id: &str, setpoint: f64) -> RaoResult<()> {
        match &mut self.branch_mut(branch_id)?.kind {
            BranchKind::Hvdc { setpoint_mw } => {
                *setpoint_mw = setpoint;
                Ok(())
            }
            _ => Err(RaoError::Network(format!(
                "branch '{}' is not an HVDC line",
                branch_id
            ))),
        }
    }

    pub fn injection_setpoint(&self, injection_id: &str) -> RaoResult<f64> {
        self.injections
            .get(injection_id)
            .map(|injection| injection.setpoint_mw)
            .ok_or_else(|| RaoError::Network(format!("unknown injection '{}'", injection_id)))
    }

    pub fn set_injection_setpoint(&mut self, injection_id: &str, setpoint: f64) -> RaoResult<()> {
        let injection = self
            .injections
            .get_mut(injection_id)
            .ok_or_else(|| RaoError::Network(format!("unknown injection '{}'", injection_id)))?;
        injection.setpoint_mw = setpoint;
        Ok(())
    }

    /// Buses an element touches: both ends of a branch, the bus of an
    /// injection, or the bus itself. `None` if the element is unknown.
    pub fn element_buses(&self, element_id: &str) -> Option<Vec<NodeIndex>> {
        if let Some(edge) = self.branch_index.get(element_id) {
            return self
                .graph
                .edge_endpoints(*edge)
                .map(|(from, to)| vec![from, to]);
        }
        if let Some(injection) = self.injections.get(element_id) {
            return Some(vec![injection.bus]);
        }
        self.bus_index.get(element_id).map(|bus| vec![*bus])
    }

    pub fn nominal_kv(&self, bus: NodeIndex) -> Option<f64> {
        self.graph.node_weight(bus).map(|b| b.nominal_kv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_network() -> Network {
        let mut network = Network::new();
        network.add_bus("A", 400.0);
        network.add_bus("B", 400.0);
        network.add_bus("C", 225.0);
        network
            .add_branch("line-ab", "A", "B", BranchKind::Line)
            .unwrap();
        network
            .add_branch("pst-bc", "B", "C", BranchKind::PhaseShifter { tap: 0 })
            .unwrap();
        network
            .add_branch("hvdc-ac", "A", "C", BranchKind::Hvdc { setpoint_mw: 100.0 })
            .unwrap();
        network.add_injection("gen-a", "A", 250.0).unwrap();
        network
    }

    #[test]
    fn test_topology_mutation() {
        let mut network = create_test_network();
        assert!(network.is_connected("line-ab").unwrap());
        network.set_connected("line-ab", false).unwrap();
        assert!(!network.is_connected("line-ab").unwrap());
    }

    #[test]
    fn test_setpoint_accessors() {
        let mut network = create_test_network();
        network.set_pst_tap("pst-bc", -3).unwrap();
        assert_eq!(network.pst_tap("pst-bc").unwrap(), -3);
        network.set_hvdc_setpoint("hvdc-ac", -50.0).unwrap();
        assert_eq!(network.hvdc_setpoint("hvdc-ac").unwrap(), -50.0);
        network.set_injection_setpoint("gen-a", 10.0).unwrap();
        assert_eq!(network.injection_setpoint("gen-a").unwrap(), 10.0);
    }

    #[test]
    fn test_wrong_element_kind_is_an_error() {
        let mut network = create_test_network();
        assert!(matches!(network.pst_tap("line-ab"), Err(RaoError::Network(_))));
        assert!(network.set_hvdc_setpoint("pst-bc", 1.0).is_err());
        assert!(network.is_connected("missing").is_err());
    }

    #[test]
    fn test_duplicate_branch_rejected() {
        let mut network = create_test_network();
        assert!(network
            .add_branch("line-ab", "A", "C", BranchKind::Line)
            .is_err());
    }

    #[test]
    fn test_element_buses() {
        let network = create_test_network();
        assert_eq!(network.element_buses("pst-bc").map(|b| b.len()), Some(2));
        assert_eq!(network.element_buses("gen-a").map(|b| b.len()), Some(1));
        assert!(network.element_buses("nope").is_none());
    }

    #[test]
    fn test_clones_are_independent() {
        let base = create_test_network();
        let mut copy = base.clone();
        copy.set_pst_tap("pst-bc", 5).unwrap();
        assert_eq!(base.pst_tap("pst-bc").unwrap(), 0);
    }
}
