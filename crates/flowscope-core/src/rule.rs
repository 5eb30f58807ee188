//! Forwarding rules. A [`Rule`] pairs a match predicate with an ordered
//! action list, both parsed from the raw rules document. Attributes the
//! parser does not recognize are collected into a [`Diagnostics`] record so
//! a run can refuse inputs it does not fully understand.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

use crate::flow::{FieldValue, Flow};
use crate::ip::{IpError, IpRange};
use crate::network::LinkState;
use crate::switch::Switch;

/// Every rule attribute the parser understands. Anything else is reported.
const RULE_ATTRIBUTES: &[&str] = &[
    "actions",
    "idle_timeout",
    "packet_count",
    "hard_timeout",
    "byte_count",
    "duration_sec",
    "duration_nsec",
    "priority",
    "length",
    "flags",
    "table_id",
    "match",
    "cookie",
];

const REQUIRED_RULE_ATTRIBUTES: &[&str] = &["actions", "table_id", "match"];

/// A match attribute name recognized by the rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchField {
    DlType,
    IpDscp,
    InPort,
    NwDst,
    NwProto,
    NwSrc,
    NwTtl,
}

impl MatchField {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "dl_type" => Self::DlType,
            "ip_dscp" => Self::IpDscp,
            "in_port" => Self::InPort,
            "nw_dst" => Self::NwDst,
            "nw_proto" => Self::NwProto,
            "nw_src" => Self::NwSrc,
            "nw_ttl" => Self::NwTtl,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DlType => "dl_type",
            Self::IpDscp => "ip_dscp",
            Self::InPort => "in_port",
            Self::NwDst => "nw_dst",
            Self::NwProto => "nw_proto",
            Self::NwSrc => "nw_src",
            Self::NwTtl => "nw_ttl",
        }
    }
}

/// A literal on the rule side of a match. Numeric strings in the input are
/// coerced to integers; `*` is the wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchLiteral {
    Int(i64),
    Str(String),
    Wildcard,
}

/// The comparator attached to one match attribute.
#[derive(Debug, Clone)]
pub enum MatchPredicate {
    /// Equality, where a wildcard on either side matches.
    Equal(MatchLiteral),
    /// CIDR containment: the rule's block must contain the flow's address.
    Contains { cidr: String, range: IpRange },
}

impl MatchPredicate {
    pub(crate) fn matches(&self, value: &FieldValue<'_>) -> bool {
        match self {
            MatchPredicate::Equal(lit) => match (lit, value) {
                (MatchLiteral::Wildcard, _) | (_, FieldValue::Wildcard) => true,
                (MatchLiteral::Int(a), FieldValue::Int(b)) => a == b,
                (MatchLiteral::Str(a), FieldValue::Str(b)) => a == b,
                _ => false,
            },
            MatchPredicate::Contains { range, .. } => match value {
                FieldValue::Str(ip) => IpRange::parse(ip)
                    .map(|flow_range| range.contains(&flow_range))
                    .unwrap_or(false),
                _ => false,
            },
        }
    }
}

/// An action applied when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Emit the flow on a local port, subject to that port's link being up.
    Output(u32),
    /// Decrement the flow's TTL.
    DecNwTtl,
    /// Rewrite a header field.
    SetField { field: String, value: String },
}

/// Attribute names seen during parsing that the engine does not understand,
/// split by where they appeared. A non-empty record aborts the run.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    pub rules: BTreeSet<String>,
    pub matches: BTreeSet<String>,
    pub actions: BTreeSet<String>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.matches.is_empty() && self.actions.is_empty()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut render = |label: &str, set: &BTreeSet<String>| -> fmt::Result {
            if !set.is_empty() {
                let names = set.iter().cloned().collect::<Vec<_>>().join(", ");
                writeln!(f, "unknown {label}: {names}")?;
            }
            Ok(())
        };
        render("rule attributes", &self.rules)?;
        render("match attributes", &self.matches)?;
        render("action verbs", &self.actions)
    }
}

/// A single forwarding rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub table_id: usize,
    pub(crate) matches: Vec<(MatchField, MatchPredicate)>,
    pub(crate) actions: Vec<Action>,
}

impl Rule {
    /// Parses a rule from its raw document form. Unknown attribute names go
    /// into `diag`; structural problems are errors.
    pub fn from_value(value: &Value, diag: &mut Diagnostics) -> Result<Self, RuleError> {
        let obj = value.as_object().ok_or(RuleError::NotAnObject)?;
        for &required in REQUIRED_RULE_ATTRIBUTES {
            if !obj.contains_key(required) {
                return Err(RuleError::MissingAttribute(required));
            }
        }
        for key in obj.keys() {
            if !RULE_ATTRIBUTES.contains(&key.as_str()) {
                diag.rules.insert(key.clone());
            }
        }

        let table_id = obj["table_id"].as_u64().ok_or(RuleError::BadTableId)? as usize;

        let match_obj = obj["match"].as_object().ok_or(RuleError::MalformedMatch)?;
        let mut matches = Vec::with_capacity(match_obj.len());
        for (key, raw) in match_obj {
            let Some(field) = MatchField::from_name(key) else {
                diag.matches.insert(key.clone());
                continue;
            };
            let predicate = match field {
                MatchField::NwDst => {
                    let cidr = raw.as_str().ok_or_else(|| RuleError::BadMatchValue {
                        field: field.name(),
                        value: raw.to_string(),
                    })?;
                    let range = IpRange::parse(cidr).map_err(|source| RuleError::BadMatchIp {
                        field: field.name(),
                        source,
                    })?;
                    MatchPredicate::Contains {
                        cidr: cidr.to_string(),
                        range,
                    }
                }
                _ => MatchPredicate::Equal(match_literal(field, raw)?),
            };
            matches.push((field, predicate));
        }

        let action_list = obj["actions"].as_array().ok_or(RuleError::MalformedActions)?;
        let mut actions = Vec::with_capacity(action_list.len());
        for raw in action_list {
            let text = raw.as_str().ok_or(RuleError::MalformedActions)?;
            let (verb, arg) = match text.split_once(':') {
                Some((verb, arg)) => (verb.trim(), Some(arg.trim())),
                None => (text.trim(), None),
            };
            match verb {
                "OUTPUT" => {
                    let port = arg
                        .and_then(|a| a.parse::<u32>().ok())
                        .ok_or_else(|| RuleError::BadAction(text.to_string()))?;
                    actions.push(Action::Output(port));
                }
                "DEC_NW_TTL" => actions.push(Action::DecNwTtl),
                "SET_FIELD" => {
                    let arg = arg.ok_or_else(|| RuleError::BadAction(text.to_string()))?;
                    let cleaned = arg.replace(['{', '}'], "");
                    let (field, value) = cleaned
                        .split_once(':')
                        .ok_or_else(|| RuleError::BadAction(text.to_string()))?;
                    actions.push(Action::SetField {
                        field: field.trim().to_string(),
                        value: value.trim().to_string(),
                    });
                }
                other => {
                    diag.actions.insert(other.to_string());
                }
            }
        }

        Ok(Self {
            table_id,
            matches,
            actions,
        })
    }

    /// Tests the flow against the match predicate and, on a full match,
    /// applies the actions in order. Returns the ports to emit on, or `None`
    /// if the rule does not match or produces no live output.
    ///
    /// Only the first `OUTPUT` action is ever consulted; a fallback route
    /// needs its own rule. An empty match list matches every flow.
    pub(crate) fn match_and_action(
        &self,
        flow: &mut Flow,
        switch: &Switch,
        links: &LinkState,
    ) -> Option<Vec<u32>> {
        for (field, predicate) in &self.matches {
            let Some(value) = flow.field(*field) else {
                return None;
            };
            if !predicate.matches(&value) {
                return None;
            }
        }

        let mut to_route = Vec::new();
        let mut saw_output = false;
        for action in &self.actions {
            match action {
                Action::Output(port) => {
                    if !saw_output {
                        saw_output = true;
                        if switch.check_link_state(links, *port) {
                            to_route.push(*port);
                        }
                    }
                }
                Action::DecNwTtl => flow.nw_ttl = flow.nw_ttl.saturating_sub(1),
                Action::SetField { field, value } => flow.set_field(field, value),
            }
        }

        (!to_route.is_empty() && flow.nw_ttl > 0).then_some(to_route)
    }
}

fn match_literal(field: MatchField, raw: &Value) -> Result<MatchLiteral, RuleError> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .map(MatchLiteral::Int)
            .ok_or_else(|| RuleError::BadMatchValue {
                field: field.name(),
                value: raw.to_string(),
            }),
        Value::String(s) if s == "*" => Ok(MatchLiteral::Wildcard),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s
            .parse::<i64>()
            .map(MatchLiteral::Int)
            .map_err(|_| RuleError::BadMatchValue {
                field: field.name(),
                value: raw.to_string(),
            }),
        Value::String(s) => Ok(MatchLiteral::Str(s.clone())),
        _ => Err(RuleError::BadMatchValue {
            field: field.name(),
            value: raw.to_string(),
        }),
    }
}

/// The error type for rule parsing.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The rule is not a JSON object.
    #[error("rule is not an object")]
    NotAnObject,

    /// A required attribute is missing.
    #[error("rule attribute `{0}` required but missing")]
    MissingAttribute(&'static str),

    /// `table_id` is not a non-negative integer.
    #[error("rule `table_id` must be a non-negative integer")]
    BadTableId,

    /// `match` is not an object.
    #[error("rule `match` must be an object")]
    MalformedMatch,

    /// `actions` is not an array of strings.
    #[error("rule `actions` must be an array of strings")]
    MalformedActions,

    /// A match value cannot be interpreted for its attribute.
    #[error("match value for `{field}` is not usable: {value}")]
    BadMatchValue {
        field: &'static str,
        value: String,
    },

    /// A `nw_dst` match value is not an address or CIDR block.
    #[error("match `{field}` is not an IPv4 address or CIDR block")]
    BadMatchIp {
        field: &'static str,
        #[source]
        source: IpError,
    },

    /// An action string cannot be parsed.
    #[error("malformed action `{0}`")]
    BadAction(String),
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::flow::PortValue;

    fn test_switch() -> Switch {
        let nbrs = BTreeMap::from([(1, "b".to_string()), (2, "c".to_string())]);
        let mut diag = Diagnostics::default();
        Switch::new("a".to_string(), nbrs, "7".to_string(), &[], Vec::new(), &mut diag).unwrap()
    }

    fn all_up() -> LinkState {
        LinkState::new(["a-b".to_string(), "a-c".to_string()])
    }

    fn rule(value: Value) -> Rule {
        let mut diag = Diagnostics::default();
        let rule = Rule::from_value(&value, &mut diag).unwrap();
        assert!(diag.is_empty(), "unexpected diagnostics: {diag}");
        rule
    }

    fn flow() -> Flow {
        Flow::synthetic("x", PortValue::Any, 0, "10.0.0.5")
    }

    #[test]
    fn missing_required_attribute_is_fatal() {
        let mut diag = Diagnostics::default();
        let res = Rule::from_value(&json!({"table_id": 0, "match": {}}), &mut diag);
        assert!(matches!(res, Err(RuleError::MissingAttribute("actions"))));
    }

    #[test]
    fn unknown_attributes_are_collected() {
        let mut diag = Diagnostics::default();
        let value = json!({
            "table_id": 0,
            "match": {"in_port": 1, "mystery_match": 9},
            "actions": ["OUTPUT:1", "FROB:2"],
            "mystery_rule": true,
        });
        Rule::from_value(&value, &mut diag).unwrap();
        assert!(diag.rules.contains("mystery_rule"));
        assert!(diag.matches.contains("mystery_match"));
        assert!(diag.actions.contains("FROB"));
        assert!(!diag.is_empty());
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let rule = rule(json!({
            "table_id": 0,
            "match": {"in_port": "3", "ip_dscp": "46"},
            "actions": ["OUTPUT:1"],
        }));
        let lits = rule
            .matches
            .iter()
            .map(|(f, p)| (f.name(), p.clone()))
            .collect::<Vec<_>>();
        for (name, pred) in lits {
            match (name, pred) {
                ("in_port", MatchPredicate::Equal(MatchLiteral::Int(3))) => {}
                ("ip_dscp", MatchPredicate::Equal(MatchLiteral::Int(46))) => {}
                other => panic!("unexpected literal {other:?}"),
            }
        }
    }

    #[test]
    fn empty_match_matches_every_flow() {
        let rule = rule(json!({"table_id": 0, "match": {}, "actions": ["OUTPUT:1"]}));
        let switch = test_switch();
        let mut f = flow();
        assert_eq!(
            rule.match_and_action(&mut f, &switch, &all_up()),
            Some(vec![1])
        );
    }

    #[test]
    fn wildcard_in_port_matches_any_port() {
        let rule = rule(json!({"table_id": 0, "match": {"in_port": "*"}, "actions": ["OUTPUT:1"]}));
        let switch = test_switch();
        let mut f = flow();
        f.in_port = PortValue::Port(7);
        assert!(rule.match_and_action(&mut f, &switch, &all_up()).is_some());
    }

    #[test]
    fn concrete_in_port_matches_only_that_port() {
        let rule = rule(json!({"table_id": 0, "match": {"in_port": 2}, "actions": ["OUTPUT:1"]}));
        let switch = test_switch();

        let mut f = flow();
        f.in_port = PortValue::Port(2);
        assert!(rule.match_and_action(&mut f, &switch, &all_up()).is_some());

        let mut f = flow();
        f.in_port = PortValue::Port(3);
        assert!(rule.match_and_action(&mut f, &switch, &all_up()).is_none());
    }

    #[test]
    fn nw_dst_uses_cidr_containment() {
        let rule = rule(json!({
            "table_id": 0,
            "match": {"nw_dst": "10.0.0.0/24"},
            "actions": ["OUTPUT:1"],
        }));
        let switch = test_switch();

        let mut inside = flow();
        assert!(rule
            .match_and_action(&mut inside, &switch, &all_up())
            .is_some());

        let mut outside = Flow::synthetic("x", PortValue::Any, 0, "10.0.1.5");
        assert!(rule
            .match_and_action(&mut outside, &switch, &all_up())
            .is_none());
    }

    #[test]
    fn only_the_first_output_is_consulted() {
        // The fallback port is never selected from the same rule, even when
        // the first port's link is down.
        let rule = rule(json!({
            "table_id": 0,
            "match": {},
            "actions": ["OUTPUT:1", "OUTPUT:2"],
        }));
        let switch = test_switch();

        let mut links = all_up();
        let mut f = flow();
        assert_eq!(
            rule.match_and_action(&mut f, &switch, &links),
            Some(vec![1])
        );

        links.reset(&["a-b".to_string()]);
        let mut f = flow();
        assert_eq!(rule.match_and_action(&mut f, &switch, &links), None);
    }

    #[test]
    fn output_through_unknown_port_is_dead() {
        let rule = rule(json!({"table_id": 0, "match": {}, "actions": ["OUTPUT:9"]}));
        let switch = test_switch();
        let mut f = flow();
        assert_eq!(rule.match_and_action(&mut f, &switch, &all_up()), None);
    }

    #[test]
    fn ttl_expiry_suppresses_output() {
        let rule = rule(json!({
            "table_id": 0,
            "match": {},
            "actions": ["DEC_NW_TTL", "OUTPUT:1"],
        }));
        let switch = test_switch();
        let mut f = flow();
        f.nw_ttl = 1;
        assert_eq!(rule.match_and_action(&mut f, &switch, &all_up()), None);
        assert_eq!(f.nw_ttl, 0);
        // and the TTL never goes negative
        assert_eq!(rule.match_and_action(&mut f, &switch, &all_up()), None);
        assert_eq!(f.nw_ttl, 0);
    }

    #[test]
    fn set_field_strips_braces_and_rewrites() {
        let rule = rule(json!({
            "table_id": 0,
            "match": {},
            "actions": ["SET_FIELD:{nw_src:10.1.1.1}", "OUTPUT:1"],
        }));
        let switch = test_switch();
        let mut f = flow();
        rule.match_and_action(&mut f, &switch, &all_up());
        assert_eq!(f.nw_src.as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn match_on_absent_attribute_fails() {
        let rule = rule(json!({"table_id": 0, "match": {"nw_proto": 6}, "actions": ["OUTPUT:1"]}));
        let switch = test_switch();
        let mut f = flow();
        assert!(rule.match_and_action(&mut f, &switch, &all_up()).is_none());
    }
}
