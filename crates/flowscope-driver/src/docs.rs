//! The JSON documents the driver reads and writes. Output documents are
//! replicas of their inputs with results grafted on, so unknown fields are
//! carried through flattened maps instead of being dropped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use flowscope_core::{MetricOutcome, MetricParams};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// The session descriptor written by flow discovery and consulted by every
/// evaluation entry point. Paths are as given, not canonicalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_string: Option<String>,
    pub topo_file: PathBuf,
    pub rules_file: PathBuf,
    pub ip_file: PathBuf,
    pub flows_file: PathBuf,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// An evaluation document: a session block, optional metric parameters, and
/// the evaluations themselves keyed by id (an arbitrary label for plain
/// evaluations, a flow name for the per-flow metrics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<MetricParams>,
    pub evaluations: BTreeMap<String, EvalEntry>,
}

/// One evaluation: the flows to test and the links (or switches) to fail.
/// `failed` and `result` are filled in by the driver on output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalEntry {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flows: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub switches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MetricResult>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A metric result as it appears in output documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricResult {
    pub probability: f64,
    #[serde(
        rename = "upper bound",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub upper_bound: Option<usize>,
}

impl From<MetricOutcome> for MetricResult {
    fn from(outcome: MetricOutcome) -> Self {
        Self {
            probability: outcome.probability,
            upper_bound: outcome.upper_bound,
        }
    }
}

/// The input document for the neighborhood metric: the subject switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborhoodDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<MetricParams>,
    pub evaluations: NeighborhoodSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborhoodSelection {
    pub switches: Vec<String>,
}

/// The neighborhood metric's output document, keyed by subject switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborhoodReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<MetricParams>,
    pub evaluations: BTreeMap<String, NeighborhoodEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborhoodEntry {
    pub flows: Vec<String>,
    pub links: Vec<String>,
    pub result: MetricResult,
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let text = fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text + "\n").map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })
}
