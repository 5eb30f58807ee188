//! Flow headers. A [`Flow`] is the packet-header profile pushed through the
//! switch graph; a [`FlowRecord`] is the persisted catalog form, stripped to
//! the attributes later evaluations need.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::rule::MatchField;

identifier!(FlowId, u64);

static NEXT_FID: AtomicU64 = AtomicU64::new(1);

fn next_fid() -> FlowId {
    FlowId::new(NEXT_FID.fetch_add(1, Ordering::Relaxed))
}

/// A switch-local port in a flow header or rule match. `Any` is the `*`
/// wildcard used when the ingress port is unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortValue {
    /// Matches any port.
    Any,
    /// A concrete 1-based port number.
    Port(u32),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Any => write!(f, "*"),
            PortValue::Port(p) => write!(f, "{p}"),
        }
    }
}

impl Serialize for PortValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PortValue::Port(p) => serializer.serialize_u32(*p),
            PortValue::Any => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for PortValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u32),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(p) => Ok(PortValue::Port(p)),
            Raw::Str(s) if s == "*" => Ok(PortValue::Any),
            Raw::Str(s) => s
                .parse::<u32>()
                .map(PortValue::Port)
                .map_err(|_| serde::de::Error::custom(format!("invalid port value `{s}`"))),
        }
    }
}

/// A flow-header attribute value as seen by rule matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    /// An integer-valued attribute.
    Int(i64),
    /// A string-valued attribute (IP addresses stay strings).
    Str(&'a str),
    /// The `*` wildcard.
    Wildcard,
}

/// A packet-header profile routed through the network. Mutable state
/// (`in_port`, `nw_ttl`, fields rewritten by `SET_FIELD`) lives here; the
/// immutable topology does not.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Monotonically unique id, assigned at construction. Clones produced by
    /// multicast branching keep their parent's id.
    pub fid: FlowId,
    /// Source switch name.
    pub nsrc: String,
    /// Destination switch name; unset until discovery reaches a destination.
    pub ndst: Option<String>,
    /// The port the flow entered the network on.
    pub ingress_port: PortValue,
    /// The port the flow arrived on at the current switch.
    pub in_port: PortValue,
    pub dl_type: i64,
    pub ip_dscp: i64,
    /// Destination IP or CIDR, as a string so `SET_FIELD` rewrites survive.
    pub nw_dst: Option<String>,
    pub nw_proto: Option<i64>,
    pub nw_src: Option<String>,
    /// Time-to-live. Saturates at zero; a zero TTL produces no routing output.
    pub nw_ttl: u32,
    visited: Vec<String>,
    seen: FxHashSet<String>,
}

/// Initial TTL given to every flow when it is launched or re-launched.
pub const INITIAL_TTL: u32 = 24;

impl Flow {
    /// Builds the synthetic flow used by discovery: no destination yet,
    /// `dl_type` 2048, a fresh TTL, and the mined header fields.
    pub fn synthetic(nsrc: &str, in_port: PortValue, ip_dscp: i64, nw_dst: &str) -> Self {
        Self {
            fid: next_fid(),
            nsrc: nsrc.to_string(),
            ndst: None,
            ingress_port: in_port,
            in_port,
            dl_type: 2048,
            ip_dscp,
            nw_dst: Some(nw_dst.to_string()),
            nw_proto: None,
            nw_src: None,
            nw_ttl: INITIAL_TTL,
            visited: Vec::new(),
            seen: FxHashSet::default(),
        }
    }

    /// Re-animates a catalog record for an evaluation run. The TTL is reset
    /// and the visited trail starts empty.
    pub fn from_record(record: &FlowRecord) -> Self {
        Self {
            fid: next_fid(),
            nsrc: record.nsrc.clone(),
            ndst: Some(record.ndst.clone()),
            ingress_port: record.ingress_port,
            in_port: record.ingress_port,
            dl_type: record.dl_type,
            ip_dscp: record.ip_dscp,
            nw_dst: record.nw_dst.clone(),
            nw_proto: record.nw_proto,
            nw_src: record.nw_src.clone(),
            nw_ttl: INITIAL_TTL,
            visited: Vec::new(),
            seen: FxHashSet::default(),
        }
    }

    /// Appends a switch to the visited trail.
    pub fn visit(&mut self, switch: &str) {
        self.visited.push(switch.to_string());
        self.seen.insert(switch.to_string());
    }

    /// O(1) membership test backing cycle rejection.
    pub fn has_visited(&self, switch: &str) -> bool {
        self.seen.contains(switch)
    }

    /// The ordered list of switches traversed so far.
    pub fn visited(&self) -> &[String] {
        &self.visited
    }

    /// Looks up a match attribute on this header. `None` means the header
    /// does not carry the attribute at all, which never matches.
    pub fn field(&self, field: MatchField) -> Option<FieldValue<'_>> {
        match field {
            MatchField::DlType => Some(FieldValue::Int(self.dl_type)),
            MatchField::IpDscp => Some(FieldValue::Int(self.ip_dscp)),
            MatchField::InPort => Some(match self.in_port {
                PortValue::Port(p) => FieldValue::Int(i64::from(p)),
                PortValue::Any => FieldValue::Wildcard,
            }),
            MatchField::NwDst => self.nw_dst.as_deref().map(FieldValue::Str),
            MatchField::NwProto => self.nw_proto.map(FieldValue::Int),
            MatchField::NwSrc => self.nw_src.as_deref().map(FieldValue::Str),
            MatchField::NwTtl => Some(FieldValue::Int(i64::from(self.nw_ttl))),
        }
    }

    /// Applies a `SET_FIELD` rewrite. Targets that do not name a header
    /// attribute, or values that do not parse, are dropped.
    pub fn set_field(&mut self, field: &str, value: &str) {
        match field {
            "nw_dst" => self.nw_dst = Some(value.to_string()),
            "nw_src" => self.nw_src = Some(value.to_string()),
            "nw_proto" => match value.parse() {
                Ok(v) => self.nw_proto = Some(v),
                Err(_) => log::debug!("SET_FIELD nw_proto:{value} does not parse; ignored"),
            },
            "ip_dscp" => match value.parse() {
                Ok(v) => self.ip_dscp = v,
                Err(_) => log::debug!("SET_FIELD ip_dscp:{value} does not parse; ignored"),
            },
            "dl_type" => match value.parse() {
                Ok(v) => self.dl_type = v,
                Err(_) => log::debug!("SET_FIELD dl_type:{value} does not parse; ignored"),
            },
            "nw_ttl" => match value.parse() {
                Ok(v) => self.nw_ttl = v,
                Err(_) => log::debug!("SET_FIELD nw_ttl:{value} does not parse; ignored"),
            },
            "in_port" => {
                self.in_port = if value == "*" {
                    PortValue::Any
                } else {
                    match value.parse() {
                        Ok(p) => PortValue::Port(p),
                        Err(_) => {
                            log::debug!("SET_FIELD in_port:{value} does not parse; ignored");
                            return;
                        }
                    }
                }
            }
            other => log::debug!("SET_FIELD targets unknown field `{other}`; ignored"),
        }
    }
}

/// The persisted form of a discovered flow: exactly the attribute set that
/// later evaluations consume, nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub nsrc: String,
    pub ndst: String,
    pub ingress_port: PortValue,
    pub dl_type: i64,
    pub ip_dscp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nw_dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nw_proto: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nw_src: Option<String>,
    pub visited: Vec<String>,
}

impl FlowRecord {
    /// Converts a discovered flow into its catalog form. Returns `None` if
    /// the flow never reached a destination.
    pub fn from_flow(flow: &Flow) -> Option<Self> {
        let ndst = flow.ndst.clone()?;
        Some(Self {
            nsrc: flow.nsrc.clone(),
            ndst,
            ingress_port: flow.ingress_port,
            dl_type: flow.dl_type,
            ip_dscp: flow.ip_dscp,
            nw_dst: flow.nw_dst.clone(),
            nw_proto: flow.nw_proto,
            nw_src: flow.nw_src.clone(),
            visited: flow.visited().to_vec(),
        })
    }
}

/// The flow catalog, keyed by `<nsrc>-<ndst>-<counter>` names.
pub type FlowCatalog = BTreeMap<String, FlowRecord>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fids_are_unique() {
        let a = Flow::synthetic("n1", PortValue::Any, 0, "10.0.0.0/24");
        let b = Flow::synthetic("n1", PortValue::Any, 0, "10.0.0.0/24");
        assert_ne!(a.fid, b.fid);
    }

    #[test]
    fn clones_share_the_visited_trail() {
        let mut flow = Flow::synthetic("n1", PortValue::Any, 0, "10.0.0.0/24");
        flow.visit("n1");
        flow.visit("n2");
        let clone = flow.clone();
        assert_eq!(clone.visited(), ["n1", "n2"]);
        assert!(clone.has_visited("n2"));
        assert!(!clone.has_visited("n3"));
    }

    #[test]
    fn port_value_round_trips_through_json() -> anyhow::Result<()> {
        let any: PortValue = serde_json::from_str("\"*\"")?;
        assert_eq!(any, PortValue::Any);
        let port: PortValue = serde_json::from_str("3")?;
        assert_eq!(port, PortValue::Port(3));
        let quoted: PortValue = serde_json::from_str("\"3\"")?;
        assert_eq!(quoted, PortValue::Port(3));
        assert_eq!(serde_json::to_string(&PortValue::Any)?, "\"*\"");
        assert_eq!(serde_json::to_string(&PortValue::Port(3))?, "3");
        Ok(())
    }

    #[test]
    fn set_field_rewrites_known_targets_only() {
        let mut flow = Flow::synthetic("n1", PortValue::Any, 0, "10.0.0.0/24");
        flow.set_field("nw_dst", "10.9.9.9");
        flow.set_field("nw_proto", "6");
        flow.set_field("bogus", "anything");
        assert_eq!(flow.nw_dst.as_deref(), Some("10.9.9.9"));
        assert_eq!(flow.nw_proto, Some(6));
    }

    #[test]
    fn record_requires_a_destination() {
        let flow = Flow::synthetic("n1", PortValue::Any, 0, "10.0.0.0/24");
        assert!(FlowRecord::from_flow(&flow).is_none());
    }
}
