//! The critical-flow failure metric: for a chosen flow and a set of
//! failure-candidate links, enumerate failure subsets by size, weight the
//! conditional failure probability of each size by a Poisson count
//! distribution over the time window, and stop once the unexplored tail is
//! within tolerance of the estimate.

use itertools::Itertools;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::evaluate::{run_single_evaluation, EvalError};
use crate::flow::FlowCatalog;
use crate::network::{link_name, Network};

/// Parameters for the failure metric: independent exponential link failures
/// at `failure_rate` over a window of `time`, with an early-termination
/// `tolerance`, plus the BFS radius for the neighborhood variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, typed_builder::TypedBuilder)]
pub struct MetricParams {
    #[serde(deserialize_with = "de_f64")]
    pub failure_rate: f64,
    #[serde(deserialize_with = "de_f64")]
    pub time: f64,
    #[serde(deserialize_with = "de_f64")]
    pub tolerance: f64,
    #[serde(
        default,
        deserialize_with = "de_opt_usize",
        skip_serializing_if = "Option::is_none"
    )]
    #[builder(default)]
    pub hops: Option<usize>,
}

// Parameter documents sometimes quote their numbers; accept both forms.
fn de_f64<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(v) => Ok(v),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_usize<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<usize>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(usize),
        Str(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Num(v)) => Ok(Some(v)),
        Some(Raw::Str(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// The metric's result: an accumulated failure probability and, when the
/// tolerance cut the enumeration short, the subset size it stopped at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricOutcome {
    pub probability: f64,
    pub upper_bound: Option<usize>,
}

/// Runs the Poisson-weighted subset enumeration. `subsets_by_size[i]` holds
/// the i+1-sized failure sets to evaluate; subsets within one size run in
/// parallel, each against its own link-state copy.
pub fn calculate_metric(
    subsets_by_size: &[Vec<Vec<String>>],
    flows: &[String],
    params: &MetricParams,
    net: &Network,
    catalog: &FlowCatalog,
) -> Result<MetricOutcome, EvalError> {
    if flows.is_empty() {
        return Ok(MetricOutcome {
            probability: 0.0,
            upper_bound: None,
        });
    }

    let n = subsets_by_size.len();
    let rate = params.failure_rate * params.time;
    let mut p_total = 0.0;
    let mut p_window = 0.0;
    let mut p_x = (-rate).exp();

    for (idx, subsets) in subsets_by_size.iter().enumerate() {
        let size = idx + 1;
        // Poisson probability of exactly `size` failures in the window
        p_x *= rate / size as f64;

        let shares = subsets
            .par_iter()
            .map(|failure_set| -> Result<f64, EvalError> {
                let mut links = net.link_state();
                let failed = run_single_evaluation(flows, failure_set, net, catalog, &mut links)?;
                Ok(failed.len() as f64 / flows.len() as f64)
            })
            .collect::<Result<Vec<f64>, EvalError>>()?;
        let p_m = shares.iter().sum::<f64>() / n_choose_k(n, size);

        p_window += p_x;
        if (1.0 - p_window) < params.tolerance * (p_total + p_m * p_x) {
            // the unexplored tail is within tolerance of the estimate
            return Ok(MetricOutcome {
                probability: p_total,
                upper_bound: Some(size),
            });
        }
        p_total += p_m * p_x;
    }

    Ok(MetricOutcome {
        probability: p_total,
        upper_bound: None,
    })
}

/// Enumerates, for every size `1..=candidates.len()`, each subset of the
/// candidate links that contains at least one visited link, exactly once.
/// Visited links are pulled out of the pool one at a time, so a subset is
/// generated under its first visited member only.
pub fn link_subsets(candidates: &[String], visited: &[String]) -> Vec<Vec<Vec<String>>> {
    let mut by_size = Vec::with_capacity(candidates.len());
    for size in 1..=candidates.len() {
        let mut subsets = Vec::new();
        let mut pool: Vec<&String> = candidates.iter().collect();
        for v in visited {
            pool.retain(|c| *c != v);
            for combo in pool.iter().combinations(size - 1) {
                let mut subset: Vec<String> = combo.into_iter().map(|c| (**c).clone()).collect();
                subset.push(v.clone());
                subsets.push(subset);
            }
        }
        by_size.push(subsets);
    }
    by_size
}

/// The switch-failure variant of [`link_subsets`]: subsets are enumerated
/// over candidate switches and each is converted to the union of its
/// members' incident links before evaluation.
pub fn switch_subsets(
    candidates: &[String],
    visited: &[String],
    net: &Network,
) -> Vec<Vec<Vec<String>>> {
    link_subsets(candidates, visited)
        .into_iter()
        .map(|subsets| {
            subsets
                .into_iter()
                .map(|switches| switches_to_links(&switches, net))
                .collect()
        })
        .collect()
}

/// Every subset of every size, with no visited-link constraint. Used by the
/// neighborhood variant, where all catalog flows are under test.
pub fn all_subsets(candidates: &[String]) -> Vec<Vec<Vec<String>>> {
    (1..=candidates.len())
        .map(|size| {
            candidates
                .iter()
                .combinations(size)
                .map(|combo| combo.into_iter().cloned().collect())
                .collect()
        })
        .collect()
}

/// The candidate links a flow's path actually traverses, in path order.
pub fn visited_links(path: &[String], candidates: &[String]) -> Vec<String> {
    let candidate_set: FxHashSet<&str> = candidates.iter().map(String::as_str).collect();
    let mut seen = FxHashSet::default();
    let mut out = Vec::new();
    for pair in path.windows(2) {
        let name = link_name(&pair[0], &pair[1]);
        if candidate_set.contains(name.as_str()) && seen.insert(name.clone()) {
            out.push(name);
        }
    }
    out
}

/// The candidate switches a flow's path traverses, in path order.
pub fn visited_switches(path: &[String], candidates: &[String]) -> Vec<String> {
    let candidate_set: FxHashSet<&str> = candidates.iter().map(String::as_str).collect();
    path.iter()
        .filter(|switch| candidate_set.contains(switch.as_str()))
        .cloned()
        .collect()
}

/// The union of canonical links incident on the given switches, sorted.
pub fn switches_to_links(switches: &[String], net: &Network) -> Vec<String> {
    let mut links = std::collections::BTreeSet::new();
    for switch in switches {
        links.extend(net.incident_links(switch));
    }
    links.into_iter().collect()
}

fn n_choose_k(n: usize, k: usize) -> f64 {
    debug_assert!(k <= n);
    let k = k.min(n - k);
    let mut acc = 1.0;
    for i in 0..k {
        acc = acc * (n - i) as f64 / (i + 1) as f64;
    }
    acc
}
