//! Blooming from a leaf that already carries network actions

use rao_algo::test_utils;
use rao_algo::{Leaf, LeafStatus, NetworkLease, RaoParameters, SearchTreeBloomer};
use rao_core::{NetworkAction, NetworkActionCombination, OptimizationPerimeter, State};
use std::sync::Arc;

struct Scenario {
    fixture: test_utils::SearchTreeFixture,
    a: Arc<NetworkAction>,
    b: Arc<NetworkAction>,
    c: Arc<NetworkAction>,
}

fn scenario() -> Scenario {
    Scenario {
        fixture: test_utils::search_tree_fixture(950.0),
        a: test_utils::topological_action("a", "coupler", "FR"),
        b: test_utils::topological_action("b", "line", "FR"),
        c: test_utils::topological_action("c", "pst", "BE"),
    }
}

/// Child of the root with `actions` applied, evaluated.
fn leaf_with(fixture: &test_utils::SearchTreeFixture, actions: &[Arc<NetworkAction>]) -> Leaf {
    let input = &fixture.input;
    let mut leaf = Leaf::child(
        Arc::clone(&input.perimeter),
        &[],
        NetworkActionCombination::new(actions.to_vec(), false),
        NetworkLease::detached(input.network.clone()),
        input.pre_perimeter.setpoints.clone(),
    );
    leaf.evaluate(&input.objective, input.sensitivity_computer.as_ref()).unwrap();
    assert_eq!(leaf.status(), LeafStatus::Evaluated);
    leaf
}

fn ids(candidates: &[(NetworkActionCombination, bool)]) -> Vec<String> {
    candidates.iter().map(|(combination, _)| combination.concatenated_id()).collect()
}

fn bloom(
    scenario: &Scenario,
    leaf: &Leaf,
    predefined: Vec<NetworkActionCombination>,
) -> Vec<(NetworkActionCombination, bool)> {
    let input = &scenario.fixture.input;
    let perimeter: &OptimizationPerimeter = &input.perimeter;
    let parameters = RaoParameters::default();
    let bloomer = SearchTreeBloomer::new(
        &input.network,
        perimeter,
        &parameters,
        predefined,
        &input.pre_perimeter.setpoints,
    );
    let available = [Arc::clone(&scenario.a), Arc::clone(&scenario.b), Arc::clone(&scenario.c)];
    bloomer.bloom(leaf, &available).unwrap()
}

#[test]
fn implied_tested_singleton_is_not_proposed() {
    let scenario = scenario();
    let leaf = leaf_with(&scenario.fixture, &[Arc::clone(&scenario.a)]);
    let predefined = vec![NetworkActionCombination::new(
        vec![Arc::clone(&scenario.a), Arc::clone(&scenario.b)],
        false,
    )];

    let candidates = bloom(&scenario, &leaf, predefined);

    // a + b holds the activated a, b alone was implicitly tried with it
    assert_eq!(ids(&candidates), vec!["c"]);
    assert!(candidates.iter().all(|(_, remove)| !remove));
}

#[test]
fn detected_combination_does_not_imply_anything() {
    let scenario = scenario();
    let leaf = leaf_with(&scenario.fixture, &[Arc::clone(&scenario.a)]);
    let detected = vec![NetworkActionCombination::new(
        vec![Arc::clone(&scenario.a), Arc::clone(&scenario.b)],
        true,
    )];

    let candidates = bloom(&scenario, &leaf, detected);

    assert_eq!(ids(&candidates), vec!["b", "c"]);
}

#[test]
fn bloom_is_deterministic() {
    let scenario = scenario();
    let root = test_utils::root_leaf(&scenario.fixture);
    let predefined = || {
        vec![NetworkActionCombination::new(
            vec![Arc::clone(&scenario.b), Arc::clone(&scenario.c)],
            false,
        )]
    };

    let first = ids(&bloom(&scenario, &root, predefined()));
    for _ in 0..5 {
        assert_eq!(ids(&bloom(&scenario, &root, predefined())), first);
    }
    assert_eq!(first, vec!["b + c", "a", "b", "c"]);
    assert!(root.activated_range_actions(&State::preventive()).unwrap().is_empty());
}
