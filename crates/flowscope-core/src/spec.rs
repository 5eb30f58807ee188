//! Input documents. A [`Spec`] bundles the three documents that describe a
//! network (topology, rules, and the switch-to-CIDR mapping) and turns
//! them into a validated [`Network`].

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::network::{Network, NetworkError};
use crate::rule::Diagnostics;

/// The topology document: each switch's neighbors in port order.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologySpec {
    /// Switch name to ordered neighbor list; list position determines the
    /// 1-based port number.
    pub one_hop_neighbor_nodes: BTreeMap<String, Vec<String>>,
}

/// The rules document: per switch, a single opaque code mapped to that
/// switch's rule list.
#[derive(Debug, Clone, Deserialize)]
pub struct RulesSpec {
    pub nodes: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
}

/// The IP mapping document: switch name to the CIDR blocks it serves.
pub type IpMapSpec = BTreeMap<String, Vec<String>>;

/// The three input documents, bundled.
#[derive(Debug, typed_builder::TypedBuilder)]
pub struct Spec {
    pub topology: TopologySpec,
    pub rules: RulesSpec,
    pub ip_map: IpMapSpec,
}

impl Spec {
    /// Builds and validates the network. Refuses inputs containing rule,
    /// match, or action attributes the engine does not understand, so
    /// semantics are never silently ignored.
    pub fn validate(self) -> Result<Network, SpecError> {
        let (network, diag) = Network::new(&self.topology, &self.rules, &self.ip_map)?;
        if !diag.is_empty() {
            return Err(SpecError::UnknownAttributes(diag));
        }
        Ok(network)
    }
}

/// Specification error.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    /// The network cannot be built from the documents.
    #[error("invalid network description")]
    Network(#[from] NetworkError),

    /// The rules document uses attributes the engine does not understand.
    #[error("unknown attributes in rules input; report to developer\n{0}")]
    UnknownAttributes(Diagnostics),
}
