#![warn(unreachable_pub, missing_debug_implementations)]

//! The flowscope driver: loads the JSON input documents, runs the core's
//! discovery, evaluation, and metric routines, and writes the output
//! documents. Each entry point is a job struct so callers can build one up
//! and run it.

pub mod docs;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use flowscope_core::{
    discovery, metric, run_single_evaluation, validate_flows, EvalError, FlowCatalog, IpMapSpec,
    MetricOutcome, Network, RulesSpec, Spec, SpecError, TopologySpec,
};

use crate::docs::{
    read_json, write_json, EvalDoc, MetricResult, NeighborhoodDoc, NeighborhoodEntry,
    NeighborhoodReport, SessionDoc,
};

/// The error type for driver operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A document could not be read.
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A document could not be parsed or serialized.
    #[error("failed to parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A document could not be written.
    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The network description failed validation.
    #[error("invalid network description")]
    Spec(#[from] SpecError),

    /// An evaluation failed.
    #[error("evaluation error")]
    Eval(#[from] EvalError),

    /// The evaluation document carries no session block to locate inputs.
    #[error("evaluation document has no session block")]
    MissingSession,

    /// A metric run needs a parameters block.
    #[error("metric parameters missing from evaluation document")]
    MissingParameters,

    /// The neighborhood metric needs a `hops` parameter.
    #[error("neighborhood metric requires a `hops` parameter")]
    MissingHops,

    /// A named switch does not exist in the topology.
    #[error("switch {0} is not in the topology")]
    UnknownSwitch(String),
}

/// Optional explicit input paths. The session block is authoritative; an
/// override that disagrees with it is logged and the session path used.
#[derive(Debug, Clone, Default)]
pub struct InputOverrides {
    pub topo_file: Option<PathBuf>,
    pub rules_file: Option<PathBuf>,
    pub ip_file: Option<PathBuf>,
    pub flows_file: Option<PathBuf>,
}

fn resolve(label: &str, session_path: &Path, explicit: Option<&PathBuf>) -> PathBuf {
    if let Some(explicit) = explicit {
        if explicit.as_path() != session_path {
            log::warn!(
                "{label} file {} varies from the session block; using {}",
                explicit.display(),
                session_path.display()
            );
        }
    }
    session_path.to_path_buf()
}

/// A network plus the flow catalog it was discovered from.
#[derive(Debug)]
struct LoadedSession {
    network: Network,
    catalog: FlowCatalog,
}

fn load_session(session: &SessionDoc, overrides: &InputOverrides) -> Result<LoadedSession, Error> {
    let topo_file = resolve("topology", &session.topo_file, overrides.topo_file.as_ref());
    let rules_file = resolve("rules", &session.rules_file, overrides.rules_file.as_ref());
    let ip_file = resolve("IP mapping", &session.ip_file, overrides.ip_file.as_ref());
    let flows_file = resolve("flows", &session.flows_file, overrides.flows_file.as_ref());

    let topology: TopologySpec = read_json(&topo_file)?;
    let rules: RulesSpec = read_json(&rules_file)?;
    let ip_map: IpMapSpec = read_json(&ip_file)?;
    let catalog: FlowCatalog = read_json(&flows_file)?;

    let network = Spec::builder()
        .topology(topology)
        .rules(rules)
        .ip_map(ip_map)
        .build()
        .validate()?;

    Ok(LoadedSession { network, catalog })
}

/// Discovers all viable flows and writes the session descriptor and the
/// flow catalog.
#[derive(Debug, typed_builder::TypedBuilder)]
pub struct FindFlowsJob {
    pub topo_file: PathBuf,
    pub rules_file: PathBuf,
    pub ip_file: PathBuf,
    pub session_file: PathBuf,
    pub flows_file: PathBuf,
    #[builder(default)]
    pub minimum_hops: usize,
    #[builder(default)]
    pub command_string: Option<String>,
}

impl FindFlowsJob {
    pub fn run(&self) -> Result<FlowCatalog, Error> {
        let topology: TopologySpec = read_json(&self.topo_file)?;
        let rules: RulesSpec = read_json(&self.rules_file)?;
        let ip_map: IpMapSpec = read_json(&self.ip_file)?;

        let network = Spec::builder()
            .topology(topology)
            .rules(rules)
            .ip_map(ip_map)
            .build()
            .validate()?;

        let catalog = discovery::find_viable_flows(&network, self.minimum_hops);

        let session = SessionDoc {
            command_string: self.command_string.clone(),
            topo_file: self.topo_file.clone(),
            rules_file: self.rules_file.clone(),
            ip_file: self.ip_file.clone(),
            flows_file: self.flows_file.clone(),
            extra: Default::default(),
        };
        write_json(&self.session_file, &session)?;
        write_json(&self.flows_file, &catalog)?;
        Ok(catalog)
    }
}

/// Runs every evaluation in a document and writes back a replica with each
/// entry's `failed` list filled in.
#[derive(Debug, typed_builder::TypedBuilder)]
pub struct EvaluateJob {
    pub evals_file: PathBuf,
    pub output_file: PathBuf,
    #[builder(default)]
    pub overrides: InputOverrides,
}

impl EvaluateJob {
    pub fn run(&self) -> Result<EvalDoc, Error> {
        let mut doc: EvalDoc = read_json(&self.evals_file)?;
        let session = doc.session.as_ref().ok_or(Error::MissingSession)?;
        let LoadedSession { network, catalog } = load_session(session, &self.overrides)?;

        let to_test: BTreeSet<String> = doc
            .evaluations
            .values()
            .flat_map(|entry| entry.flows.iter().cloned())
            .collect();
        let to_test: Vec<String> = to_test.into_iter().collect();

        let mut links = network.link_state();
        validate_flows(&to_test, &network, &catalog, &mut links)?;

        for entry in doc.evaluations.values_mut() {
            let failed =
                run_single_evaluation(&entry.flows, &entry.links, &network, &catalog, &mut links)?;
            entry.failed = Some(failed);
        }

        write_json(&self.output_file, &doc)?;
        Ok(doc)
    }
}

/// Which failure candidates a per-flow metric document names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Candidates are links; the flow's path gives the visited links.
    Links,
    /// Candidates are switches, converted to their incident links.
    Switches,
}

/// Runs the critical-flow metric for every flow in a document, against
/// either link or switch failure candidates.
#[derive(Debug, typed_builder::TypedBuilder)]
pub struct CriticalFlowJob {
    pub evals_file: PathBuf,
    pub output_file: PathBuf,
    pub kind: MetricKind,
    #[builder(default)]
    pub overrides: InputOverrides,
}

impl CriticalFlowJob {
    pub fn run(&self) -> Result<EvalDoc, Error> {
        let mut doc: EvalDoc = read_json(&self.evals_file)?;
        let session = doc.session.as_ref().ok_or(Error::MissingSession)?;
        let params = doc.parameters.ok_or(Error::MissingParameters)?;
        let LoadedSession { network, catalog } = load_session(session, &self.overrides)?;

        // each evaluation is keyed by the flow it concerns
        let flow_names: Vec<String> = doc.evaluations.keys().cloned().collect();
        let mut links = network.link_state();
        validate_flows(&flow_names, &network, &catalog, &mut links)?;

        for (flow_name, entry) in doc.evaluations.iter_mut() {
            let record = catalog
                .get(flow_name)
                .ok_or_else(|| EvalError::UnknownFlow(flow_name.clone()))?;

            let (visited, subsets) = match self.kind {
                MetricKind::Links => {
                    let visited = metric::visited_links(&record.visited, &entry.links);
                    let subsets = metric::link_subsets(&entry.links, &visited);
                    (visited, subsets)
                }
                MetricKind::Switches => {
                    let visited = metric::visited_switches(&record.visited, &entry.switches);
                    let subsets = metric::switch_subsets(&entry.switches, &visited, &network);
                    (visited, subsets)
                }
            };

            // a flow that never touches the candidates cannot fail
            let outcome = if visited.is_empty() {
                MetricOutcome {
                    probability: 0.0,
                    upper_bound: None,
                }
            } else {
                metric::calculate_metric(
                    &subsets,
                    std::slice::from_ref(flow_name),
                    &params,
                    &network,
                    &catalog,
                )?
            };
            entry.result = Some(MetricResult::from(outcome));
        }

        write_json(&self.output_file, &doc)?;
        Ok(doc)
    }
}

/// Runs the neighborhood metric: for every subject switch, fail subsets of
/// the links within `hops` of it and average the failure probability over
/// every flow in the catalog.
#[derive(Debug, typed_builder::TypedBuilder)]
pub struct NeighborhoodJob {
    pub evals_file: PathBuf,
    pub output_file: PathBuf,
    #[builder(default)]
    pub overrides: InputOverrides,
}

impl NeighborhoodJob {
    pub fn run(&self) -> Result<NeighborhoodReport, Error> {
        let doc: NeighborhoodDoc = read_json(&self.evals_file)?;
        let session = doc.session.as_ref().ok_or(Error::MissingSession)?;
        let params = doc.parameters.ok_or(Error::MissingParameters)?;
        let hops = params.hops.ok_or(Error::MissingHops)?;
        let LoadedSession { network, catalog } = load_session(session, &self.overrides)?;

        let flows: Vec<String> = catalog.keys().cloned().collect();
        let mut links = network.link_state();
        validate_flows(&flows, &network, &catalog, &mut links)?;

        let mut evaluations = std::collections::BTreeMap::new();
        for switch in &doc.evaluations.switches {
            if !network.contains_switch(switch) {
                return Err(Error::UnknownSwitch(switch.clone()));
            }
            let reached: Vec<String> = network.neighbors_within(switch, hops).into_iter().collect();
            let affected = metric::switches_to_links(&reached, &network);
            let outcome = metric::calculate_metric(
                &metric::all_subsets(&affected),
                &flows,
                &params,
                &network,
                &catalog,
            )?;
            evaluations.insert(
                switch.clone(),
                NeighborhoodEntry {
                    flows: flows.clone(),
                    links: affected,
                    result: MetricResult::from(outcome),
                },
            );
        }

        let report = NeighborhoodReport {
            session: doc.session,
            parameters: doc.parameters,
            evaluations,
        };
        write_json(&self.output_file, &report)?;
        Ok(report)
    }
}

/// Loads a session's catalog and topology for display: the flow names and
/// the canonical link table.
pub fn list_session(session_file: &Path) -> Result<(Vec<String>, Vec<String>), Error> {
    let session: SessionDoc = read_json(session_file)?;
    let loaded = load_session(&session, &InputOverrides::default())?;
    let flows = loaded.catalog.keys().cloned().collect();
    let links = loaded.network.link_names();
    Ok((flows, links))
}
