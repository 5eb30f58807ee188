//! Single-failure-set evaluations: fail a set of links, then replay each
//! named flow from its catalog record and classify it as routed or failed.

use std::collections::BTreeSet;

use crate::flow::{Flow, FlowCatalog, PortValue};
use crate::ip::is_ip_format;
use crate::network::{LinkState, Network};

/// Fails exactly the named links, routes each flow, and returns the sorted
/// names of the flows that no longer reach a destination.
///
/// The path exploration is a stack. Popping a branch that has arrived marks
/// the flow routed and stops; popping a branch that cannot route stops too,
/// leaving any unexplored siblings on the stack unconsulted. A drained stack
/// counts as a failure.
pub fn run_single_evaluation(
    flows: &[String],
    failed_links: &[String],
    net: &Network,
    catalog: &FlowCatalog,
    links: &mut LinkState,
) -> Result<Vec<String>, EvalError> {
    links.reset(failed_links);

    let mut routed: BTreeSet<&str> = BTreeSet::new();
    for flow_name in flows {
        let record = catalog
            .get(flow_name)
            .ok_or_else(|| EvalError::UnknownFlow(flow_name.clone()))?;

        let flow = Flow::from_record(record);
        let mut to_route = vec![(record.nsrc.clone(), record.ingress_port, flow)];
        let mut arrived = false;

        while let Some((switch_name, port, branch)) = to_route.pop() {
            let Some(switch) = net.switch(&switch_name) else {
                return Err(EvalError::UnknownSwitch {
                    flow: flow_name.clone(),
                    switch: switch_name,
                });
            };

            if switch.at_destination(&branch) {
                arrived = true;
                break;
            }

            let next_hops = switch.route(port, branch, links);
            if next_hops.is_empty() {
                break;
            }
            for (next_flow, out_port) in next_hops {
                // ports without a mapped peer route off the network
                if let Some(peer) = net.peer_of(&switch_name, out_port) {
                    to_route.push((peer.switch.clone(), PortValue::Port(peer.port), next_flow));
                }
            }
        }

        if arrived {
            routed.insert(flow_name.as_str());
        }
    }

    let all: BTreeSet<&str> = flows.iter().map(String::as_str).collect();
    Ok(all
        .difference(&routed)
        .map(|name| name.to_string())
        .collect())
}

/// Pre-flight checks for a set of flows: endpoints must be switches the
/// topology knows, `nw_dst` must look like an IP, and every flow must route
/// with no failures present. Flows failing the baseline are returned (and
/// logged), not fatal.
pub fn validate_flows(
    flow_names: &[String],
    net: &Network,
    catalog: &FlowCatalog,
    links: &mut LinkState,
) -> Result<Vec<String>, EvalError> {
    for flow_name in flow_names {
        let record = catalog
            .get(flow_name)
            .ok_or_else(|| EvalError::UnknownFlow(flow_name.clone()))?;
        for endpoint in [&record.nsrc, &record.ndst] {
            if !net.contains_switch(endpoint) {
                return Err(EvalError::UnknownSwitch {
                    flow: flow_name.clone(),
                    switch: endpoint.clone(),
                });
            }
        }
        if let Some(nw_dst) = record.nw_dst.as_deref() {
            if !is_ip_format(nw_dst) {
                return Err(EvalError::BadDestinationIp {
                    flow: flow_name.clone(),
                    value: nw_dst.to_string(),
                });
            }
        }
    }

    let failed_to_route = run_single_evaluation(flow_names, &[], net, catalog, links)?;
    if !failed_to_route.is_empty() {
        log::warn!("the following flows do not route at all: {failed_to_route:?}");
    }
    Ok(failed_to_route)
}

/// The error type for evaluation runs.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// An evaluation names a flow the catalog does not contain.
    #[error("flow {0} is not present in the flow catalog")]
    UnknownFlow(String),

    /// A flow references a switch the topology does not contain.
    #[error("flow {flow} references switch {switch}, which is not in the topology")]
    UnknownSwitch {
        /// The flow's name.
        flow: String,
        /// The unknown switch.
        switch: String,
    },

    /// A flow's destination address is not in IP format.
    #[error("flow {flow} has nw_dst `{value}`, which is not in IP format")]
    BadDestinationIp {
        /// The flow's name.
        flow: String,
        /// The offending value.
        value: String,
    },
}
