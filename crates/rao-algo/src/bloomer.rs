//! Next-depth candidates of the search tree.
//!
//! Blooming seeds candidates from the predefined combinations and the
//! individual network actions, then runs them through these filters in
//! order:
//!
//! 1. already activated actions
//! 2. implied-tested singletons
//! 3. maximum number of remedial actions
//! 4. maximum number of remedial actions per operator
//! 5. maximum number of operators
//! 6. distance to the most limiting elements (optional)
//! 7. maximum number of elementary actions per operator
//!
//! Filters 3 to 5 and 7 may keep a candidate on the condition that the range
//! actions of the parent leaf are reset first; that is the boolean paired with
//! every returned combination.

use crate::leaf::Leaf;
use crate::parameters::{RaUsageLimits, RaoParameters};
use crate::result::RangeActionActivation;
use rao_core::{graph, Network, NetworkAction, NetworkActionCombination, OptimizationPerimeter, RaoResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A candidate and whether the parent's range actions must be reset to
/// apply it.
pub type Candidate = (NetworkActionCombination, bool);

pub struct SearchTreeBloomer<'a> {
    network: &'a Network,
    perimeter: &'a OptimizationPerimeter,
    limits: RaUsageLimits,
    filter_far_elements: bool,
    max_hops: usize,
    predefined: Vec<NetworkActionCombination>,
    pre_perimeter_setpoints: &'a RangeActionActivation,
}

/// What the parent leaf already uses at the main state.
struct ParentUsage {
    network_actions: Vec<Arc<NetworkAction>>,
    range_action_operators: Vec<Option<String>>,
    pst_taps_moved: BTreeMap<String, usize>,
}

impl ParentUsage {
    fn network_actions_of(&self, operator: &str) -> usize {
        self.network_actions
            .iter()
            .filter(|action| action.operator.as_deref() == Some(operator))
            .count()
    }

    fn range_actions_of(&self, operator: &str) -> usize {
        self.range_action_operators
            .iter()
            .filter(|owner| owner.as_deref() == Some(operator))
            .count()
    }

    fn network_action_operators(&self) -> BTreeSet<String> {
        self.network_actions
            .iter()
            .filter_map(|action| action.operator.clone())
            .collect()
    }
}

impl<'a> SearchTreeBloomer<'a> {
    /// Usage limits are the ones of the main state's instant.
    pub fn new(
        network: &'a Network,
        perimeter: &'a OptimizationPerimeter,
        parameters: &RaoParameters,
        predefined: Vec<NetworkActionCombination>,
        pre_perimeter_setpoints: &'a RangeActionActivation,
    ) -> Self {
        let limits = parameters
            .ra_usage_limits(&perimeter.main_state().instant.id)
            .cloned()
            .unwrap_or_default();
        let mut distinct: Vec<NetworkActionCombination> = Vec::with_capacity(predefined.len());
        for combination in predefined {
            if !distinct.contains(&combination) {
                distinct.push(combination);
            }
        }
        Self {
            network,
            perimeter,
            limits,
            filter_far_elements: parameters.topology.skip_actions_far_from_most_limiting_element,
            max_hops: parameters.topology.max_number_of_boundaries_for_skipping_actions,
            predefined: distinct,
            pre_perimeter_setpoints,
        }
    }

    pub fn predefined_combinations(&self) -> &[NetworkActionCombination] {
        &self.predefined
    }

    pub fn is_predefined(&self, combination: &NetworkActionCombination) -> bool {
        self.predefined.contains(combination)
    }

    /// Candidates for the children of `leaf`, in seed order.
    pub fn bloom(&self, leaf: &Leaf, available: &[Arc<NetworkAction>]) -> RaoResult<Vec<Candidate>> {
        let usage = self.parent_usage(leaf)?;
        let mut candidates = self.seed(available);
        let seeded = candidates.len();

        self.remove_already_activated(&mut candidates, &usage);
        self.remove_implied_tested(&mut candidates, &usage);
        self.remove_exceeding_max_ra(&mut candidates, &usage);
        self.remove_exceeding_max_ra_per_tso(&mut candidates, &usage);
        self.remove_exceeding_max_tso(&mut candidates, &usage);
        self.remove_far_from_most_limiting_element(&mut candidates, leaf)?;
        self.remove_exceeding_elementary_actions(&mut candidates, &usage);

        tracing::debug!("bloom from {}: {} of {} candidate(s) kept", leaf, candidates.len(), seeded);
        Ok(candidates)
    }

    fn parent_usage(&self, leaf: &Leaf) -> RaoResult<ParentUsage> {
        let main_state = self.perimeter.main_state();
        let mut range_action_operators = Vec::new();
        let mut pst_taps_moved = BTreeMap::new();
        for id in leaf.activated_range_actions(main_state)? {
            let Some(range_action) = self.perimeter.range_action(&id) else {
                continue;
            };
            range_action_operators.push(range_action.operator.clone());
            if let (true, Some(operator)) = (range_action.is_pst(), &range_action.operator) {
                let moved = leaf.tap(&id, main_state)? - self.pre_perimeter_setpoints.tap(&range_action, main_state)?;
                *pst_taps_moved.entry(operator.clone()).or_insert(0) += moved.unsigned_abs() as usize;
            }
        }
        Ok(ParentUsage {
            network_actions: leaf.network_actions().to_vec(),
            range_action_operators,
            pst_taps_moved,
        })
    }

    /// Predefined combinations whose actions are all available, then every
    /// available action that is not already a predefined singleton.
    fn seed(&self, available: &[Arc<NetworkAction>]) -> Vec<Candidate> {
        let is_available = |id: &str| available.iter().any(|action| action.id == id);
        let mut candidates: Vec<Candidate> = self
            .predefined
            .iter()
            .filter(|combination| combination.network_actions().iter().all(|action| is_available(&action.id)))
            .map(|combination| (combination.clone(), false))
            .collect();
        for action in available {
            let predefined_singleton = candidates
                .iter()
                .any(|(combination, _)| combination.len() == 1 && combination.contains(&action.id));
            if !predefined_singleton {
                candidates.push((NetworkActionCombination::single(Arc::clone(action)), false));
            }
        }
        candidates
    }

    fn remove_already_activated(&self, candidates: &mut Vec<Candidate>, usage: &ParentUsage) {
        let before = candidates.len();
        candidates.retain(|(combination, _)| {
            !usage
                .network_actions
                .iter()
                .any(|activated| combination.contains(&activated.id))
        });
        log_removed("already activated", before, candidates.len());
    }

    /// When every action of a predefined combination but one is activated,
    /// the remaining one has been tried together with them already.
    fn remove_implied_tested(&self, candidates: &mut Vec<Candidate>, usage: &ParentUsage) {
        let activated: BTreeSet<&str> = usage.network_actions.iter().map(|action| action.id.as_str()).collect();
        let mut implied: BTreeSet<&str> = BTreeSet::new();
        for combination in self
            .predefined
            .iter()
            .filter(|c| !c.is_detected_during_rao() && c.len() > 1)
        {
            let not_activated: Vec<&str> = combination
                .network_actions()
                .iter()
                .map(|action| action.id.as_str())
                .filter(|id| !activated.contains(id))
                .collect();
            if let [single] = not_activated.as_slice() {
                implied.insert(*single);
            }
        }
        let before = candidates.len();
        candidates.retain(|(combination, _)| {
            combination.len() != 1 || !implied.iter().any(|id| combination.contains(id))
        });
        log_removed("implied tested", before, candidates.len());
    }

    fn remove_exceeding_max_ra(&self, candidates: &mut Vec<Candidate>, usage: &ParentUsage) {
        let Some(max_ra) = self.limits.max_ra else {
            return;
        };
        let applied = usage.network_actions.len();
        let activated_range_actions = usage.range_action_operators.len();
        let before = candidates.len();
        candidates.retain_mut(|(combination, remove_range_actions)| {
            if combination.len() + applied > max_ra {
                return false;
            }
            *remove_range_actions |= applied + activated_range_actions + combination.len() > max_ra;
            true
        });
        log_removed("max number of remedial actions", before, candidates.len());
    }

    /// Network action budget per operator: the smaller of its remedial action
    /// and topological action limits, minus the actions already applied.
    fn max_network_actions_per_tso(&self, usage: &ParentUsage) -> BTreeMap<String, i64> {
        let operators: BTreeSet<&String> = self
            .limits
            .max_ra_per_tso
            .keys()
            .chain(self.limits.max_topo_per_tso.keys())
            .collect();
        operators
            .into_iter()
            .map(|operator| {
                let applied = usage.network_actions_of(operator) as i64;
                let by_ra = limit_of(&self.limits.max_ra_per_tso, operator) - applied;
                let by_topo = limit_of(&self.limits.max_topo_per_tso, operator) - applied;
                (operator.clone(), by_ra.min(by_topo))
            })
            .collect()
    }

    fn remove_exceeding_max_ra_per_tso(&self, candidates: &mut Vec<Candidate>, usage: &ParentUsage) {
        if self.limits.max_ra_per_tso.is_empty() && self.limits.max_topo_per_tso.is_empty() {
            return;
        }
        let budgets = self.max_network_actions_per_tso(usage);
        let before = candidates.len();
        candidates.retain_mut(|(combination, remove_range_actions)| {
            for (operator, count) in combination.count_per_operator() {
                let count = count as i64;
                if count > budgets.get(&operator).copied().unwrap_or(i64::MAX) {
                    return false;
                }
                let used = (usage.network_actions_of(&operator) + usage.range_actions_of(&operator)) as i64;
                if used + count > limit_of(&self.limits.max_ra_per_tso, &operator) {
                    *remove_range_actions = true;
                }
            }
            true
        });
        log_removed("max number of remedial actions per operator", before, candidates.len());
    }

    fn remove_exceeding_max_tso(&self, candidates: &mut Vec<Candidate>, usage: &ParentUsage) {
        let Some(max_tso) = self.limits.max_tso else {
            return;
        };
        let with_network_actions = usage.network_action_operators();
        let mut with_range_actions = with_network_actions.clone();
        with_range_actions.extend(usage.range_action_operators.iter().flatten().cloned());
        let exceeds = |combination: &NetworkActionCombination, already: &BTreeSet<String>| {
            let mut operators = combination.operators();
            operators.extend(already.iter().cloned());
            operators.len() > max_tso
        };
        let before = candidates.len();
        candidates.retain_mut(|(combination, remove_range_actions)| {
            if exceeds(combination, &with_network_actions) {
                return false;
            }
            *remove_range_actions |= exceeds(combination, &with_range_actions);
            true
        });
        log_removed("max number of operators", before, candidates.len());
    }

    /// Keeps combinations with at least one action within the hop limit of
    /// the functional most limiting CNEC or of a CNEC with a virtual cost.
    /// Elements with no known location never filter anything out.
    fn remove_far_from_most_limiting_element(&self, candidates: &mut Vec<Candidate>, leaf: &Leaf) -> RaoResult<()> {
        if !self.filter_far_elements {
            return Ok(());
        }
        let mut cnec_ids = leaf.most_limiting_elements(1)?;
        for name in leaf.virtual_costs()?.keys() {
            cnec_ids.extend(leaf.costly_elements(name, usize::MAX)?);
        }
        let mut unknown_location = false;
        let elements: Vec<&str> = cnec_ids
            .iter()
            .filter_map(|id| match self.perimeter.flow_cnec(id) {
                Some(cnec) => Some(cnec.network_element_id.as_str()),
                None => {
                    unknown_location = true;
                    None
                }
            })
            .collect();
        let (targets, unknown_element) = graph::buses_of(self.network, elements);
        if unknown_location || unknown_element || targets.is_empty() {
            return Ok(());
        }

        let before = candidates.len();
        candidates.retain(|(combination, _)| {
            combination.network_actions().iter().any(|action| {
                let (sources, unknown) = graph::buses_of(self.network, action.network_elements());
                if unknown {
                    return true;
                }
                let sources: Vec<_> = sources.into_iter().collect();
                graph::within_hops(self.network, &sources, &targets, self.max_hops)
            })
        });
        log_removed("far from the most limiting element", before, candidates.len());
        Ok(())
    }

    fn remove_exceeding_elementary_actions(&self, candidates: &mut Vec<Candidate>, usage: &ParentUsage) {
        let limits = &self.limits.max_elementary_actions_per_tso;
        if limits.is_empty() {
            return;
        }
        let before = candidates.len();
        candidates.retain_mut(|(combination, remove_range_actions)| {
            let per_operator = combination.elementary_actions_per_operator();
            if per_operator
                .iter()
                .any(|(operator, count)| *count as i64 > limit_of(limits, operator))
            {
                return false;
            }
            *remove_range_actions |= per_operator.iter().any(|(operator, count)| {
                let moved = usage.pst_taps_moved.get(operator).copied().unwrap_or(0);
                (count + moved) as i64 > limit_of(limits, operator)
            });
            true
        });
        log_removed("max number of elementary actions per operator", before, candidates.len());
    }
}

fn limit_of(limits: &BTreeMap<String, usize>, operator: &str) -> i64 {
    limits
        .get(operator)
        .map(|limit| i64::try_from(*limit).unwrap_or(i64::MAX))
        .unwrap_or(i64::MAX)
}

fn log_removed(filter: &str, before: usize, after: usize) {
    if before > after {
        tracing::debug!("{} combination(s) filtered out: {}", before - after, filter);
    }
}
