//! Sensitivity computation seam.
//!
//! The optimiser never computes physics itself: it asks a
//! [`SensitivityComputer`] for CNEC flows and their sensitivities to range
//! action setpoints on a given network. Real deployments plug a load-flow
//! engine in; [`LinearSensitivityComputer`] is a first-order model that is
//! enough for screening studies and tests.
//!
//! ## First-order model
//!
//! ```text
//! flow[c] ≈ base[c]
//!         + Σ_r sens[c,r] · (setpoint[r] − initial_setpoint[r])
//!         + Σ_e shift[c,e]   for every element e whose connection status
//!                            differs from the initial network
//! ```
//!
//! The topology term plays the role of an outage distribution factor: it is
//! the flow change on `c` when `e` is switched from its initial status.

use crate::result::{FlowResult, PhysicsResult, RangeActionActivation, SensitivityResult};
use rao_core::{Network, OptimizationPerimeter, RaoError, RaoResult};
use std::collections::BTreeMap;

/// Black-box physics provider.
pub trait SensitivityComputer: Send + Sync {
    /// Flows on every CNEC of the perimeter and their sensitivities to every
    /// range action, for `network` with range actions at `setpoints`.
    fn compute(
        &self,
        network: &Network,
        perimeter: &OptimizationPerimeter,
        setpoints: &RangeActionActivation,
    ) -> RaoResult<PhysicsResult>;
}

/// Linear flow model built from base flows and constant sensitivities.
#[derive(Debug, Clone, Default)]
pub struct LinearSensitivityComputer {
    base_flows: BTreeMap<String, f64>,
    sensitivities: BTreeMap<(String, String), f64>,
    topology_shifts: BTreeMap<(String, String), f64>,
    initial_connection: BTreeMap<String, bool>,
    commercial_flows: BTreeMap<String, f64>,
    ptdf_sums: BTreeMap<String, f64>,
}

impl LinearSensitivityComputer {
    /// Records the connection status of every branch of `initial_network`
    /// as the reference topology.
    pub fn new(initial_network: &Network) -> Self {
        let initial_connection = initial_network
            .branches()
            .map(|branch| (branch.id.clone(), branch.connected))
            .collect();
        Self {
            initial_connection,
            ..Self::default()
        }
    }

    pub fn with_base_flow(mut self, cnec_id: impl Into<String>, flow_mw: f64) -> Self {
        self.base_flows.insert(cnec_id.into(), flow_mw);
        self
    }

    /// MW per degree for PSTs, MW per MW for HVDC lines and injections.
    pub fn with_sensitivity(mut self, cnec_id: impl Into<String>, range_action_id: impl Into<String>, value: f64) -> Self {
        self.sensitivities.insert((cnec_id.into(), range_action_id.into()), value);
        self
    }

    /// Flow change on `cnec_id` when `element_id` leaves its initial
    /// connection status.
    pub fn with_topology_shift(mut self, cnec_id: impl Into<String>, element_id: impl Into<String>, delta_mw: f64) -> Self {
        self.topology_shifts.insert((cnec_id.into(), element_id.into()), delta_mw);
        self
    }

    pub fn with_commercial_flow(mut self, cnec_id: impl Into<String>, flow_mw: f64) -> Self {
        self.commercial_flows.insert(cnec_id.into(), flow_mw);
        self
    }

    pub fn with_ptdf_sum(mut self, cnec_id: impl Into<String>, ptdf_sum: f64) -> Self {
        self.ptdf_sums.insert(cnec_id.into(), ptdf_sum);
        self
    }

    fn switched_elements(&self, network: &Network) -> RaoResult<Vec<&str>> {
        let mut switched = Vec::new();
        for (element, initially_connected) in &self.initial_connection {
            if network.is_connected(element)? != *initially_connected {
                switched.push(element.as_str());
            }
        }
        Ok(switched)
    }
}

impl SensitivityComputer for LinearSensitivityComputer {
    fn compute(
        &self,
        network: &Network,
        perimeter: &OptimizationPerimeter,
        setpoints: &RangeActionActivation,
    ) -> RaoResult<PhysicsResult> {
        let switched = self.switched_elements(network)?;
        let range_actions = perimeter.range_actions();
        let mut flow = FlowResult::new();
        let mut sensitivity = SensitivityResult::new();

        for cnec in perimeter.flow_cnecs() {
            let base = self.base_flows.get(&cnec.id).copied().ok_or_else(|| {
                RaoError::Sensitivity(format!("no base flow for CNEC '{}'", cnec.id))
            })?;
            let mut value = base;
            for range_action in &range_actions {
                let key = (cnec.id.clone(), range_action.id.clone());
                let Some(sens) = self.sensitivities.get(&key).copied() else {
                    continue;
                };
                let setpoint = setpoints.setpoint(&range_action.id, &cnec.state)?;
                value += sens * (setpoint - range_action.initial_setpoint());
                sensitivity.insert(cnec.id.clone(), range_action.id.clone(), sens);
            }
            for element in &switched {
                if let Some(shift) = self.topology_shifts.get(&(cnec.id.clone(), element.to_string())) {
                    value += shift;
                }
            }
            if !value.is_finite() {
                return Err(RaoError::Sensitivity(format!("non-finite flow on CNEC '{}'", cnec.id)));
            }
            flow.insert_flow(cnec.id.clone(), value);
            if let Some(commercial) = self.commercial_flows.get(&cnec.id) {
                flow.insert_commercial_flow(cnec.id.clone(), *commercial);
            }
            if let Some(ptdf) = self.ptdf_sums.get(&cnec.id) {
                flow.insert_ptdf_zonal_sum(cnec.id.clone(), *ptdf);
            }
        }

        tracing::debug!(
            "linear sensitivity computation: {} CNEC(s), {} switched element(s)",
            perimeter.flow_cnecs().len(),
            switched.len()
        );
        Ok(PhysicsResult { flow, sensitivity })
    }
}
