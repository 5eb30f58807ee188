//! Exhaustive flow discovery: every switch launches a synthetic flow for
//! every distinct header template mined from its rules, and every path that
//! reaches a destination becomes a named catalog entry.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::flow::{Flow, FlowCatalog, FlowRecord, PortValue};
use crate::network::Network;
use crate::rule::{MatchField, MatchLiteral, MatchPredicate};
use crate::switch::Switch;

/// A `(in_port, ip_dscp, nw_dst)` triple mined from a switch's rule table.
/// One synthetic flow is launched per template.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeaderTemplate {
    pub in_port: PortValue,
    pub ip_dscp: i64,
    pub nw_dst: String,
}

/// Collects the distinct header templates across a switch's table 0. Only
/// rules carrying both `ip_dscp` and `nw_dst` contribute; `in_port`
/// defaults to the wildcard when absent.
pub fn mine_templates(switch: &Switch) -> Vec<HeaderTemplate> {
    let mut templates = BTreeSet::new();
    for rule in switch.table0() {
        let mut ip_dscp = None;
        let mut nw_dst = None;
        let mut in_port = PortValue::Any;
        for (field, predicate) in &rule.matches {
            match (field, predicate) {
                (MatchField::IpDscp, MatchPredicate::Equal(MatchLiteral::Int(v))) => {
                    ip_dscp = Some(*v);
                }
                (MatchField::NwDst, MatchPredicate::Contains { cidr, .. }) => {
                    nw_dst = Some(cidr.clone());
                }
                (MatchField::InPort, MatchPredicate::Equal(MatchLiteral::Int(p))) => {
                    if *p >= 0 {
                        in_port = PortValue::Port(*p as u32);
                    }
                }
                _ => {}
            }
        }
        if let (Some(ip_dscp), Some(nw_dst)) = (ip_dscp, nw_dst) {
            templates.insert(HeaderTemplate {
                in_port,
                ip_dscp,
                nw_dst,
            });
        }
    }
    templates.into_iter().collect()
}

/// Launches discovery from every switch and returns the catalog of flows
/// whose paths span at least `minimum_hops` switches. Names follow
/// `<nsrc>-<ndst>-<counter>` with the counter starting at 0 per base.
pub fn find_viable_flows(net: &Network, minimum_hops: usize) -> FlowCatalog {
    let links = net.link_state();
    let mut catalog = FlowCatalog::new();
    let mut counters: FxHashMap<String, usize> = FxHashMap::default();

    for name in net.switch_names() {
        let Some(switch) = net.switch(name) else {
            continue;
        };
        for template in mine_templates(switch) {
            let flow = Flow::synthetic(name, template.in_port, template.ip_dscp, &template.nw_dst);
            for found in switch.discover_flows(flow, template.in_port, net, &links) {
                if found.visited().len() < minimum_hops {
                    continue;
                }
                let Some(record) = FlowRecord::from_flow(&found) else {
                    continue;
                };
                let base = format!("{}-{}", record.nsrc, record.ndst);
                let counter = counters.entry(base.clone()).or_insert(0);
                catalog.insert(format!("{base}-{counter}"), record);
                *counter += 1;
            }
        }
    }

    log::info!(
        "discovered {} viable flows across {} switches",
        catalog.len(),
        net.nr_switches()
    );
    catalog
}
