//! Utilities for writing tests.

use serde_json::{json, Value};

use crate::network::Network;
use crate::spec::Spec;

/// Builds a network straight from JSON document values, panicking on any
/// validation problem.
pub(crate) fn network_from_json(topo: Value, rules: Value, ips: Value) -> Network {
    Spec::builder()
        .topology(serde_json::from_value(topo).expect("bad topology fixture"))
        .rules(serde_json::from_value(rules).expect("bad rules fixture"))
        .ip_map(serde_json::from_value(ips).expect("bad IP map fixture"))
        .build()
        .validate()
        .expect("fixture failed validation")
}

/// A linear chain `n1 - n2 - n3`. `n3` serves `10.0.0.0/24`; `n1` and `n2`
/// forward anything destined there along the chain, decrementing the TTL at
/// every hop.
pub(crate) fn linear_config() -> Network {
    network_from_json(
        json!({"one_hop_neighbor_nodes": {
            "n1": ["n2"],
            "n2": ["n1", "n3"],
            "n3": ["n2"],
        }}),
        json!({"nodes": {
            "n1": {"101": [
                {"table_id": 0,
                 "match": {"ip_dscp": 0, "nw_dst": "10.0.0.0/24"},
                 "actions": ["DEC_NW_TTL", "OUTPUT:1"]},
            ]},
            "n2": {"102": [
                {"table_id": 0,
                 "match": {"ip_dscp": 0, "nw_dst": "10.0.0.0/24"},
                 "actions": ["DEC_NW_TTL", "OUTPUT:2"]},
            ]},
            "n3": {"103": []},
        }}),
        json!({
            "n1": ["10.0.1.0/24"],
            "n2": ["10.0.2.0/24"],
            "n3": ["10.0.0.0/24"],
        }),
    )
}

/// A fully meshed triangle `a, b, c`. `c` serves `10.0.0.0/24`; `a` carries
/// two rules toward it (via `b`, then via `c` directly) so the second rule
/// provides redundancy when the `a-b` link fails.
pub(crate) fn triangle_config() -> Network {
    network_from_json(
        json!({"one_hop_neighbor_nodes": {
            "a": ["b", "c"],
            "b": ["a", "c"],
            "c": ["a", "b"],
        }}),
        json!({"nodes": {
            "a": {"201": [
                {"table_id": 0,
                 "match": {"ip_dscp": 0, "nw_dst": "10.0.0.0/24"},
                 "actions": ["DEC_NW_TTL", "OUTPUT:1"]},
                {"table_id": 0,
                 "match": {"ip_dscp": 0, "nw_dst": "10.0.0.0/24"},
                 "actions": ["DEC_NW_TTL", "OUTPUT:2"]},
            ]},
            "b": {"202": [
                {"table_id": 0,
                 "match": {"ip_dscp": 0, "nw_dst": "10.0.0.0/24"},
                 "actions": ["DEC_NW_TTL", "OUTPUT:2"]},
            ]},
            "c": {"203": []},
        }}),
        json!({
            "a": ["10.0.1.0/24"],
            "b": ["10.0.2.0/24"],
            "c": ["10.0.0.0/24"],
        }),
    )
}
