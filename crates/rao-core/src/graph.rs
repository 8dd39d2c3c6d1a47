//! Topological queries on the network graph.

use crate::network::Network;
use petgraph::graph::NodeIndex;
use std::collections::{HashSet, VecDeque};

/// Whether any of `sources` is at most `max_hops` branches away from any of
/// `targets`. Breadth-first over every branch, open or not.
pub fn within_hops(
    network: &Network,
    sources: &[NodeIndex],
    targets: &HashSet<NodeIndex>,
    max_hops: usize,
) -> bool {
    if targets.is_empty() || sources.is_empty() {
        return false;
    }
    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut queue: VecDeque<(NodeIndex, usize)> = VecDeque::new();
    for source in sources {
        if visited.insert(*source) {
            queue.push_back((*source, 0));
        }
    }

    while let Some((node, depth)) = queue.pop_front() {
        if targets.contains(&node) {
            return true;
        }
        if depth == max_hops {
            continue;
        }
        for neighbor in network.graph.neighbors(node) {
            if visited.insert(neighbor) {
                queue.push_back((neighbor, depth + 1));
            }
        }
    }
    false
}

/// Union of the buses touched by a set of elements. Unknown elements are
/// reported through the second value.
pub fn buses_of<'a, I>(network: &Network, element_ids: I) -> (HashSet<NodeIndex>, bool)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut buses = HashSet::new();
    let mut has_unknown = false;
    for element in element_ids {
        match network.element_buses(element) {
            Some(found) => buses.extend(found),
            None => has_unknown = true,
        }
    }
    (buses, has_unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::BranchKind;

    /// A chain A - B - C - D - E.
    fn create_chain() -> Network {
        let mut network = Network::new();
        for bus in ["A", "B", "C", "D", "E"] {
            network.add_bus(bus, 400.0);
        }
        for (id, from, to) in [("ab", "A", "B"), ("bc", "B", "C"), ("cd", "C", "D"), ("de", "D", "E")] {
            network.add_branch(id, from, to, BranchKind::Line).unwrap();
        }
        network
    }

    #[test]
    fn test_within_hops_on_chain() {
        let network = create_chain();
        let a = network.bus_index_of("A").unwrap();
        let targets: HashSet<_> = [network.bus_index_of("D").unwrap()].into_iter().collect();
        assert!(!within_hops(&network, &[a], &targets, 2));
        assert!(within_hops(&network, &[a], &targets, 3));
    }

    #[test]
    fn test_zero_hops_means_same_bus() {
        let network = create_chain();
        let b = network.bus_index_of("B").unwrap();
        let targets: HashSet<_> = [b].into_iter().collect();
        assert!(within_hops(&network, &[b], &targets, 0));
    }

    #[test]
    fn test_open_branches_still_count() {
        let mut network = create_chain();
        network.set_connected("bc", false).unwrap();
        let a = network.bus_index_of("A").unwrap();
        let targets: HashSet<_> = [network.bus_index_of("C").unwrap()].into_iter().collect();
        assert!(within_hops(&network, &[a], &targets, 2));
    }

    #[test]
    fn test_buses_of_reports_unknown_elements() {
        let network = create_chain();
        let (buses, unknown) = buses_of(&network, ["ab", "cd"]);
        assert_eq!(buses.len(), 4);
        assert!(!unknown);
        let (_, unknown) = buses_of(&network, ["ab", "ghost"]);
        assert!(unknown);
    }
}
