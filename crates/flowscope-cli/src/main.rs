use std::path::PathBuf;

use clap::{Parser, Subcommand};

use flowscope_driver::{
    list_session, CriticalFlowJob, EvaluateJob, FindFlowsJob, InputOverrides, MetricKind,
    NeighborhoodJob,
};

#[derive(Parser, Debug)]
#[command(
    name = "flowscope",
    about = "SDN flow reachability and failure-resilience analysis",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover all viable flows and write the session and flow catalog
    FindFlows {
        /// File containing the topology
        #[arg(short = 't', long)]
        topology: PathBuf,
        /// File containing the switch rules
        #[arg(short = 'r', long)]
        rules: PathBuf,
        /// File containing the switch-to-CIDR mapping
        #[arg(long)]
        ips: PathBuf,
        /// Session description output
        #[arg(short = 's', long)]
        session: PathBuf,
        /// Flow catalog output
        #[arg(short = 'f', long)]
        flows: PathBuf,
        /// Minimum number of switches a path must span to be reported
        #[arg(long, default_value_t = 0)]
        minimum_hops: usize,
    },
    /// Fail link sets and report which flows no longer route
    Evaluate {
        /// Evaluation description input
        #[arg(short, long)]
        evals: PathBuf,
        /// Evaluation results output
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Per-flow failure probability over candidate links
    CriticalLinks {
        #[arg(short, long)]
        evals: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Per-flow failure probability over candidate switches
    CriticalSwitches {
        #[arg(short, long)]
        evals: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Average per-flow failure probability within a switch neighborhood
    CriticalNeighborhood {
        #[arg(short, long)]
        evals: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Print the discovered flow names and the link table for a session
    List {
        /// Session description input
        #[arg(short, long)]
        session: PathBuf,
    },
}

/// Explicit input paths, cross-checked against the session block.
#[derive(clap::Args, Debug, Default)]
struct OverrideArgs {
    #[arg(long)]
    topology: Option<PathBuf>,
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long)]
    ips: Option<PathBuf>,
    #[arg(long)]
    flows: Option<PathBuf>,
}

impl From<OverrideArgs> for InputOverrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            topo_file: args.topology,
            rules_file: args.rules,
            ip_file: args.ips,
            flows_file: args.flows,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.command {
        Command::FindFlows {
            topology,
            rules,
            ips,
            session,
            flows,
            minimum_hops,
        } => {
            let command_string = std::env::args().collect::<Vec<_>>().join(" ");
            let catalog = FindFlowsJob::builder()
                .topo_file(topology)
                .rules_file(rules)
                .ip_file(ips)
                .session_file(session)
                .flows_file(flows)
                .minimum_hops(minimum_hops)
                .command_string(Some(command_string))
                .build()
                .run()?;
            println!("{} viable flows discovered", catalog.len());
        }
        Command::Evaluate {
            evals,
            output,
            overrides,
        } => {
            let doc = EvaluateJob::builder()
                .evals_file(evals)
                .output_file(output)
                .overrides(overrides.into())
                .build()
                .run()?;
            for (id, entry) in &doc.evaluations {
                let failed = entry.failed.as_deref().unwrap_or(&[]);
                println!("evaluation {id}: {} flows failed", failed.len());
            }
        }
        Command::CriticalLinks {
            evals,
            output,
            overrides,
        } => {
            let doc = CriticalFlowJob::builder()
                .evals_file(evals)
                .output_file(output)
                .kind(MetricKind::Links)
                .overrides(overrides.into())
                .build()
                .run()?;
            print_metric_results(&doc);
        }
        Command::CriticalSwitches {
            evals,
            output,
            overrides,
        } => {
            let doc = CriticalFlowJob::builder()
                .evals_file(evals)
                .output_file(output)
                .kind(MetricKind::Switches)
                .overrides(overrides.into())
                .build()
                .run()?;
            print_metric_results(&doc);
        }
        Command::CriticalNeighborhood {
            evals,
            output,
            overrides,
        } => {
            let report = NeighborhoodJob::builder()
                .evals_file(evals)
                .output_file(output)
                .overrides(overrides.into())
                .build()
                .run()?;
            for (switch, entry) in &report.evaluations {
                println!(
                    "switch {switch}: failure probability {:.6}",
                    entry.result.probability
                );
            }
        }
        Command::List { session } => {
            let (flows, links) = list_session(&session)?;
            println!("flow names");
            for flow in &flows {
                println!("\t{flow}");
            }
            println!("link names");
            for link in &links {
                println!("\t{link}");
            }
        }
    }
    Ok(())
}

fn print_metric_results(doc: &flowscope_driver::docs::EvalDoc) {
    for (flow, entry) in &doc.evaluations {
        if let Some(result) = &entry.result {
            match result.upper_bound {
                Some(bound) => println!(
                    "flow {flow}: failure probability {:.6} (enumeration stopped at size {bound})",
                    result.probability
                ),
                None => println!("flow {flow}: failure probability {:.6}", result.probability),
            }
        }
    }
}
