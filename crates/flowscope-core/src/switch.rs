//! A switch owns a port-to-neighbor map, an ordered rule table, and the
//! CIDR blocks it serves. Routing and path discovery both run here; the
//! link-state vector is threaded in explicitly so concurrent evaluations
//! never alias each other's failures.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::flow::{Flow, PortValue};
use crate::ip::IpRange;
use crate::network::{link_name, LinkState, Network};
use crate::rule::{Diagnostics, Rule, RuleError};

#[derive(Debug, Clone)]
pub struct Switch {
    name: String,
    /// Local port number to neighbor switch name, ports starting at 1.
    nbrs: BTreeMap<u32, String>,
    /// Rule tables indexed by `table_id`. Only table 0 is routed.
    tables: Vec<Vec<Rule>>,
    cidr: Vec<IpRange>,
    /// Opaque per-switch label from the rules input.
    code: String,
}

impl Switch {
    pub(crate) fn new(
        name: String,
        nbrs: BTreeMap<u32, String>,
        code: String,
        rules: &[Value],
        cidr: Vec<IpRange>,
        diag: &mut Diagnostics,
    ) -> Result<Self, RuleError> {
        let mut tables: Vec<Vec<Rule>> = Vec::new();
        for raw in rules {
            let rule = Rule::from_value(raw, diag)?;
            while tables.len() <= rule.table_id {
                tables.push(Vec::new());
            }
            let table_id = rule.table_id;
            tables[table_id].push(rule);
        }
        Ok(Self {
            name,
            nbrs,
            tables,
            cidr,
            code,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn nbrs(&self) -> &BTreeMap<u32, String> {
        &self.nbrs
    }

    pub(crate) fn table0(&self) -> &[Rule] {
        self.tables.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// True iff the flow's destination address lies inside one of this
    /// switch's CIDR blocks.
    pub fn at_destination(&self, flow: &Flow) -> bool {
        let Some(nw_dst) = flow.nw_dst.as_deref() else {
            return false;
        };
        let Ok(flow_range) = IpRange::parse(nw_dst) else {
            return false;
        };
        self.cidr.iter().any(|block| block.contains(&flow_range))
    }

    /// True iff `port` leads to a neighbor and the link to it is up. Rules
    /// sometimes name ports that do not exist; those are simply dead.
    pub fn check_link_state(&self, links: &LinkState, port: u32) -> bool {
        let Some(nbr) = self.nbrs.get(&port) else {
            return false;
        };
        links.is_up(&link_name(&self.name, nbr))
    }

    /// Routes a flow entering on `in_port`. The first rule in table 0 whose
    /// match-and-action produces output wins; remaining rules are not
    /// consulted. One `(flow, port)` pair per output port, with a deep copy
    /// of the flow for every port after the first.
    pub fn route(&self, in_port: PortValue, mut flow: Flow, links: &LinkState) -> Vec<(Flow, u32)> {
        flow.in_port = in_port;

        let mut ports = None;
        for rule in self.table0() {
            if let Some(out) = rule.match_and_action(&mut flow, self, links) {
                ports = Some(out);
                break;
            }
        }

        let Some(ports) = ports else {
            return Vec::new();
        };
        let Some((&first, rest)) = ports.split_first() else {
            return Vec::new();
        };
        let mut branches: Vec<(Flow, u32)> = rest.iter().map(|&port| (flow.clone(), port)).collect();
        branches.insert(0, (flow, first));
        branches
    }

    /// Exhaustive path search used by flow discovery. The flow collects the
    /// switches it traverses; a branch that would revisit a switch, or that
    /// exits through a port with no mapped peer, is abandoned.
    pub fn discover_flows(
        &self,
        mut flow: Flow,
        in_port: PortValue,
        net: &Network,
        links: &LinkState,
    ) -> Vec<Flow> {
        flow.visit(&self.name);

        if self.at_destination(&flow) {
            flow.ndst = Some(self.name.clone());
            return vec![flow];
        }

        let mut discoveries = Vec::new();
        for (next_flow, out_port) in self.route(in_port, flow, links) {
            let Some(peer) = net.peer_of(&self.name, out_port) else {
                // port exits the network
                continue;
            };
            if next_flow.has_visited(&peer.switch) {
                continue;
            }
            let Some(nbr) = net.switch(&peer.switch) else {
                continue;
            };
            discoveries.extend(nbr.discover_flows(
                next_flow,
                PortValue::Port(peer.port),
                net,
                links,
            ));
        }
        discoveries
    }
}
