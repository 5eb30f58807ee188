//! The network: switches built from the input documents, the undirected
//! switch graph, the port-level neighbor map, and the canonical link-state
//! vector.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::graph::{NodeIndex, UnGraph};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ip::{IpError, IpRange};
use crate::rule::{Diagnostics, RuleError};
use crate::spec::{IpMapSpec, RulesSpec, TopologySpec};
use crate::switch::Switch;

/// The canonical name of the undirected link between two switches: the
/// lexicographically lesser endpoint first.
pub fn link_name(a: &str, b: &str) -> String {
    if a < b {
        format!("{a}-{b}")
    } else {
        format!("{b}-{a}")
    }
}

/// Up/down bits for every link in the network, keyed by canonical link name.
/// Each evaluation owns its own copy, so evaluations can run in parallel.
#[derive(Debug, Clone)]
pub struct LinkState {
    up: FxHashMap<String, bool>,
}

impl LinkState {
    pub(crate) fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            up: names.into_iter().map(|name| (name, true)).collect(),
        }
    }

    /// A link that does not exist is down.
    pub fn is_up(&self, link: &str) -> bool {
        self.up.get(link).copied().unwrap_or(false)
    }

    /// Sets every link up except the named failures. Failure names that do
    /// not correspond to a link have no effect.
    pub fn reset(&mut self, failed: &[String]) {
        let failed: FxHashSet<&str> = failed.iter().map(String::as_str).collect();
        for (name, up) in self.up.iter_mut() {
            *up = !failed.contains(name.as_str());
        }
    }

    pub fn nr_links(&self) -> usize {
        self.up.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.up.keys().map(String::as_str)
    }
}

/// The far end of a link as seen from one switch's local port.
#[derive(Debug, Clone, derive_new::new)]
pub struct Peer {
    /// The neighbor switch's name.
    pub switch: String,
    /// The neighbor's local port for the same link.
    pub port: u32,
}

/// A network of switches. Immutable once built; evaluations carry their own
/// link-state copies.
#[derive(Debug, Clone)]
pub struct Network {
    switches: FxHashMap<String, Switch>,
    graph: UnGraph<String, String>,
    id2idx: FxHashMap<String, NodeIndex>,
    neighbor_map: FxHashMap<String, FxHashMap<u32, Peer>>,
    link_state: LinkState,
}

impl Network {
    /// Builds the network from the three input documents. Unknown rule,
    /// match, and action attributes are accumulated in the returned
    /// [`Diagnostics`]; deciding whether they abort the run is the caller's
    /// job (see [`Spec::validate`](crate::spec::Spec::validate)).
    pub fn new(
        topo: &TopologySpec,
        rules: &RulesSpec,
        ip_map: &IpMapSpec,
    ) -> Result<(Self, Diagnostics), NetworkError> {
        let mut diag = Diagnostics::default();

        // Position in the neighbor list determines the port, starting at 1.
        let mut port_maps: BTreeMap<&str, BTreeMap<u32, String>> = BTreeMap::new();
        for (name, nbr_list) in &topo.one_hop_neighbor_nodes {
            let ports = nbr_list
                .iter()
                .enumerate()
                .map(|(i, nbr)| (i as u32 + 1, nbr.clone()))
                .collect();
            port_maps.insert(name.as_str(), ports);
        }

        let mut switches = FxHashMap::default();
        for (name, rule_sets) in &rules.nodes {
            let cidr_strings =
                ip_map
                    .get(name)
                    .ok_or_else(|| NetworkError::MissingIpMapping {
                        switch: name.clone(),
                    })?;
            let cidr = cidr_strings
                .iter()
                .map(|s| IpRange::parse(s))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| NetworkError::BadIpMapping {
                    switch: name.clone(),
                    source,
                })?;
            let (code, rule_list) = match rule_sets.iter().next() {
                Some(entry) if rule_sets.len() == 1 => entry,
                _ => {
                    return Err(NetworkError::RuleSetCode {
                        switch: name.clone(),
                        found: rule_sets.len(),
                    })
                }
            };
            let nbrs = port_maps.get(name.as_str()).cloned().unwrap_or_default();
            let switch = Switch::new(name.clone(), nbrs, code.clone(), rule_list, cidr, &mut diag)
                .map_err(|source| NetworkError::Rule {
                    switch: name.clone(),
                    source,
                })?;
            switches.insert(name.clone(), switch);
        }

        // The graph covers every named endpoint, rules or not, so the
        // canonical link set matches what the switches can see.
        let mut graph = UnGraph::new_undirected();
        let mut id2idx: FxHashMap<String, NodeIndex> = FxHashMap::default();
        for name in rules.nodes.keys() {
            let switch = &switches[name];
            let a = *id2idx
                .entry(name.clone())
                .or_insert_with(|| graph.add_node(name.clone()));
            for nbr in switch.nbrs().values() {
                if nbr == name {
                    log::warn!("switch {name} lists itself as a neighbor; ignored");
                    continue;
                }
                let b = *id2idx
                    .entry(nbr.clone())
                    .or_insert_with(|| graph.add_node(nbr.clone()));
                if graph.find_edge(a, b).is_none() {
                    graph.add_edge(a, b, link_name(name, nbr));
                }
            }
        }

        let mut neighbor_map: FxHashMap<String, FxHashMap<u32, Peer>> = FxHashMap::default();
        for (name, switch) in &switches {
            let entry = neighbor_map.entry(name.clone()).or_default();
            for (&port, nbr_name) in switch.nbrs() {
                let Some(nbr) = switches.get(nbr_name) else {
                    log::debug!(
                        "switch {name} port {port} leads to {nbr_name}, which carries no rules; \
                         treated as off-network"
                    );
                    continue;
                };
                match nbr
                    .nbrs()
                    .iter()
                    .find(|(_, peer)| peer.as_str() == name.as_str())
                {
                    Some((&peer_port, _)) => {
                        entry.insert(port, Peer::new(nbr_name.clone(), peer_port));
                    }
                    None => log::warn!(
                        "asymmetric neighbor lists: {name} lists {nbr_name} but not the reverse; \
                         edge treated as off-network"
                    ),
                }
            }
        }

        let link_state = LinkState::new(graph.edge_weights().cloned());

        Ok((
            Self {
                switches,
                graph,
                id2idx,
                neighbor_map,
                link_state,
            },
            diag,
        ))
    }

    /// Looks up the far end of the link out of `switch`'s local `port`.
    /// `None` means the port exits the network.
    pub fn peer_of(&self, switch: &str, port: u32) -> Option<&Peer> {
        self.neighbor_map.get(switch)?.get(&port)
    }

    pub fn contains_switch(&self, name: &str) -> bool {
        self.switches.contains_key(name)
    }

    /// Switch names in sorted order, for deterministic iteration.
    pub fn switch_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.switches.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// A fresh all-up link-state vector for this network.
    pub fn link_state(&self) -> LinkState {
        self.link_state.clone()
    }

    /// Canonical link names in sorted order.
    pub fn link_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.link_state.names().map(str::to_string).collect();
        names.sort_unstable();
        names
    }

    /// The canonical names of every link incident on a switch.
    pub fn incident_links(&self, switch: &str) -> BTreeSet<String> {
        let Some(&idx) = self.id2idx.get(switch) else {
            return BTreeSet::new();
        };
        self.graph.edges(idx).map(|e| e.weight().clone()).collect()
    }

    /// All switches within `hops` steps of `start`, inclusive of `start`.
    pub fn neighbors_within(&self, start: &str, hops: usize) -> BTreeSet<String> {
        let mut reached = BTreeSet::from([start.to_string()]);
        let Some(&start_idx) = self.id2idx.get(start) else {
            return reached;
        };
        let mut distances: FxHashMap<NodeIndex, usize> = [(start_idx, 0)].into_iter().collect();
        let mut queue = VecDeque::from([start_idx]);
        while let Some(n) = queue.pop_front() {
            let cur_distance = *distances.get(&n).unwrap();
            if cur_distance == hops {
                continue;
            }
            for succ in self.graph.neighbors(n) {
                if !distances.contains_key(&succ) {
                    distances.insert(succ, cur_distance + 1);
                    reached.insert(self.graph[succ].clone());
                    queue.push_back(succ);
                }
            }
        }
        reached
    }

    delegate::delegate! {
        to self.switches {
            /// Returns the switch with the given name, if any.
            #[call(get)]
            pub fn switch(&self, name: &str) -> Option<&Switch>;

            /// Returns an iterator over all switches.
            #[call(values)]
            pub fn switches(&self) -> impl Iterator<Item = &Switch>;

            /// Returns the number of switches carrying rules.
            #[call(len)]
            pub fn nr_switches(&self) -> usize;
        }

        to self.link_state {
            /// Returns the number of links in the network.
            pub fn nr_links(&self) -> usize;
        }
    }
}

/// An error type listing the reasons a network cannot be built.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A switch in the rules input has no entry in the IP mapping.
    #[error("switch {switch} has no IP mapping")]
    MissingIpMapping {
        /// The switch's name.
        switch: String,
    },

    /// A switch's IP mapping contains an unparseable block.
    #[error("IP mapping for switch {switch} is malformed")]
    BadIpMapping {
        /// The switch's name.
        switch: String,
        #[source]
        source: IpError,
    },

    /// A switch's rules entry must carry exactly one code key.
    #[error("switch {switch} must have exactly one rule-set code (found {found})")]
    RuleSetCode {
        /// The switch's name.
        switch: String,
        /// How many codes were found.
        found: usize,
    },

    /// A rule on a switch could not be parsed.
    #[error("invalid rule on switch {switch}")]
    Rule {
        /// The switch's name.
        switch: String,
        #[source]
        source: RuleError,
    },
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_json::json;

    use super::*;
    use crate::testing;

    #[test]
    fn ports_are_assigned_in_listed_order() -> anyhow::Result<()> {
        let net = testing::linear_config();
        let n2 = net.switch("n2").context("missing n2")?;
        assert_eq!(n2.nbrs().get(&1).map(String::as_str), Some("n1"));
        assert_eq!(n2.nbrs().get(&2).map(String::as_str), Some("n3"));
        Ok(())
    }

    #[test]
    fn neighbor_map_crosses_the_link() -> anyhow::Result<()> {
        let net = testing::linear_config();
        let peer = net.peer_of("n1", 1).context("n1 port 1 unmapped")?;
        assert_eq!(peer.switch, "n2");
        assert_eq!(peer.port, 1);
        let peer = net.peer_of("n3", 1).context("n3 port 1 unmapped")?;
        assert_eq!(peer.switch, "n2");
        assert_eq!(peer.port, 2);
        Ok(())
    }

    #[test]
    fn triangle_links_are_canonical_and_unique() {
        let net = testing::triangle_config();
        assert_eq!(net.nr_links(), 3);
        insta::assert_yaml_snapshot!(net.link_names(), @r###"
        ---
        - a-b
        - a-c
        - b-c
        "###);
    }

    #[test]
    fn asymmetric_edge_is_off_network_but_still_a_link() {
        // n2 does not list n1 back
        let net = testing::network_from_json(
            json!({"one_hop_neighbor_nodes": {"n1": ["n2"], "n2": []}}),
            json!({"nodes": {"n1": {"1": []}, "n2": {"2": []}}}),
            json!({"n1": ["10.0.1.0/24"], "n2": ["10.0.2.0/24"]}),
        );
        assert!(net.peer_of("n1", 1).is_none());
        assert_eq!(net.link_names(), vec!["n1-n2".to_string()]);
    }

    #[test]
    fn link_state_resets_cover_every_link() {
        let net = testing::triangle_config();
        let mut links = net.link_state();
        assert!(links.is_up("a-b"));
        links.reset(&["a-b".to_string(), "no-such-link".to_string()]);
        assert!(!links.is_up("a-b"));
        assert!(links.is_up("a-c"));
        assert!(links.is_up("b-c"));
        links.reset(&[]);
        assert!(links.is_up("a-b"));
    }

    #[test]
    fn unknown_link_is_down() {
        let net = testing::triangle_config();
        assert!(!net.link_state().is_up("x-y"));
    }

    #[test]
    fn neighborhood_bfs_is_inclusive() {
        let net = testing::linear_config();
        let hop0: Vec<_> = net.neighbors_within("n1", 0).into_iter().collect();
        assert_eq!(hop0, ["n1"]);
        let hop1: Vec<_> = net.neighbors_within("n1", 1).into_iter().collect();
        assert_eq!(hop1, ["n1", "n2"]);
        let hop2: Vec<_> = net.neighbors_within("n1", 2).into_iter().collect();
        assert_eq!(hop2, ["n1", "n2", "n3"]);
    }

    #[test]
    fn incident_links_name_every_edge_at_a_switch() {
        let net = testing::triangle_config();
        let links: Vec<_> = net.incident_links("a").into_iter().collect();
        assert_eq!(links, ["a-b", "a-c"]);
    }

    #[test]
    fn missing_ip_mapping_fails() {
        let topo = serde_json::from_value(json!({"one_hop_neighbor_nodes": {"n1": []}})).unwrap();
        let rules = serde_json::from_value(json!({"nodes": {"n1": {"1": []}}})).unwrap();
        let ips: IpMapSpec = serde_json::from_value(json!({})).unwrap();
        let res = Network::new(&topo, &rules, &ips);
        assert!(matches!(res, Err(NetworkError::MissingIpMapping { .. })));
    }

    #[test]
    fn two_rule_set_codes_fail() {
        let topo = serde_json::from_value(json!({"one_hop_neighbor_nodes": {"n1": []}})).unwrap();
        let rules =
            serde_json::from_value(json!({"nodes": {"n1": {"1": [], "2": []}}})).unwrap();
        let ips: IpMapSpec = serde_json::from_value(json!({"n1": ["10.0.0.0/24"]})).unwrap();
        let res = Network::new(&topo, &rules, &ips);
        assert!(matches!(res, Err(NetworkError::RuleSetCode { found: 2, .. })));
    }
}
