use clap::Parser;
use collsim_rs::cc::gather::verify::{expected_result, synthetic_contribution, verify_plan};
use collsim_rs::cc::gather::{
    Action, CopyMode, GatherConfig, GatherGeometry, GatherWorld, LinkTransport, PublicMemoryRegistry,
    compile_all, start_btree_gather,
};
use collsim_rs::error::{GatherError, Result};
use collsim_rs::sim::{CommSpec, LinkSpec, PayloadMode, ScenarioSpec, SimTime, Simulator};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::info;

const DEFAULT_LATENCY_US: u64 = 1;
const DEFAULT_LINK_GBPS: u64 = 100;

#[derive(Debug, Parser)]
#[command(
    name = "gather-sim",
    about = "Simulate a binary-tree gather on a latency/bandwidth link model"
)]
struct Args {
    /// Path to a scenario JSON file
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Communicator size (overrides the scenario)
    #[arg(long)]
    nproc: Option<usize>,

    /// Root rank (overrides the scenario)
    #[arg(long)]
    root: Option<usize>,

    /// Elements contributed per rank
    #[arg(long)]
    nelems: Option<usize>,

    /// Bytes per element
    #[arg(long)]
    elem_size: Option<usize>,

    /// Link latency in microseconds
    #[arg(long)]
    latency_us: Option<u64>,

    /// Link bandwidth in Gbit/s
    #[arg(long)]
    link_gbps: Option<u64>,

    /// Model timing only; no rank registers memory
    #[arg(long)]
    timing_only: bool,

    /// Cap on registered public memory across all ranks
    #[arg(long)]
    public_memory_bytes: Option<u64>,

    /// Print every rank's compiled actions as JSON lines and exit
    #[arg(long)]
    dump_dag: bool,

    /// Verify pairing and replay the plan before simulating
    #[arg(long)]
    check: bool,
}

#[derive(Serialize)]
struct DagLine<'a> {
    rank: usize,
    actions: Vec<&'a Action>,
}

fn load_scenario(args: &Args) -> Result<ScenarioSpec> {
    let mut spec = match &args.scenario {
        Some(path) => {
            let raw = fs::read_to_string(path).map_err(|e| {
                GatherError::InvalidConfig(format!("read {}: {e}", path.display()))
            })?;
            serde_json::from_str::<ScenarioSpec>(&raw).map_err(|e| {
                GatherError::InvalidConfig(format!("parse {}: {e}", path.display()))
            })?
        }
        None => {
            let nproc = args.nproc.ok_or_else(|| {
                GatherError::InvalidConfig("either --scenario or --nproc is required".to_string())
            })?;
            ScenarioSpec {
                schema_version: 1,
                meta: None,
                comm: CommSpec {
                    nproc,
                    root: 0,
                    nelems: 1,
                    elem_size: 8,
                },
                link: None,
                payload: None,
                public_memory_bytes: None,
            }
        }
    };

    if let Some(nproc) = args.nproc {
        spec.comm.nproc = nproc;
    }
    if let Some(root) = args.root {
        spec.comm.root = root;
    }
    if let Some(nelems) = args.nelems {
        spec.comm.nelems = nelems;
    }
    if let Some(elem_size) = args.elem_size {
        spec.comm.elem_size = elem_size;
    }
    if args.timing_only {
        spec.payload = Some(PayloadMode::TimingOnly);
    }
    if args.public_memory_bytes.is_some() {
        spec.public_memory_bytes = args.public_memory_bytes;
    }
    Ok(spec)
}

fn dump_dag(geometry: &GatherGeometry) -> Result<()> {
    for dag in compile_all(geometry)? {
        let line = DagLine {
            rank: dag.rank(),
            actions: dag.actions().collect(),
        };
        let json = serde_json::to_string(&line)
            .map_err(|e| GatherError::Internal(format!("serialize dag: {e}")))?;
        println!("{json}");
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let spec = load_scenario(&args)?;
    let geometry = spec.comm.geometry();
    geometry.validate()?;

    if args.dump_dag {
        return dump_dag(&geometry);
    }
    if args.check {
        verify_plan(&geometry)?;
        info!(nproc = geometry.nproc, root = geometry.root, "plan verified");
    }

    let link = spec.link.unwrap_or(LinkSpec {
        latency_us: None,
        gbps: None,
    });
    let transport = LinkTransport::new(
        SimTime::from_micros(
            args.latency_us
                .or(link.latency_us)
                .unwrap_or(DEFAULT_LATENCY_US),
        ),
        args.link_gbps.or(link.gbps).unwrap_or(DEFAULT_LINK_GBPS),
    );

    let payload = spec.payload.unwrap_or_default();
    let inputs: Vec<Option<Vec<u8>>> = (0..geometry.nproc)
        .map(|rank| match payload {
            PayloadMode::Synthetic => Some(synthetic_contribution(rank, &geometry)),
            PayloadMode::TimingOnly => None,
        })
        .collect();
    let expected = match payload {
        PayloadMode::Synthetic => Some(expected_result(
            &inputs.iter().flatten().cloned().collect::<Vec<_>>(),
        )),
        PayloadMode::TimingOnly => None,
    };

    let mut world = GatherWorld {
        memory: match spec.public_memory_bytes {
            Some(cap) => PublicMemoryRegistry::with_capacity_bytes(cap),
            None => PublicMemoryRegistry::default(),
        },
    };
    let mut sim = Simulator::default();
    let handle = start_btree_gather(
        &mut sim,
        GatherConfig {
            geometry,
            inputs,
            copy_mode: CopyMode::InPlace,
            start_flow_id: 1,
            transport: Box::new(transport),
        },
    );
    sim.run(&mut world);

    let result = handle.result()?;
    let stats = handle.stats();
    for (rank, done_at) in stats.rank_done_at.iter().enumerate() {
        if let Some(t) = done_at {
            println!("rank_done rank={rank} at_ns={}", t.as_nanos());
        }
    }
    let verified = match (&expected, &result) {
        (Some(expected), Some(result)) => {
            if expected != result {
                return Err(GatherError::Internal(
                    "root buffer does not match the concatenated contributions".to_string(),
                ));
            }
            "true"
        }
        _ => "skipped",
    };
    println!(
        "gather_done at_ns={} transfers={} bytes={} shuffles={} verified={verified}",
        stats.done_at.unwrap_or(SimTime::ZERO).as_nanos(),
        stats.transfers,
        stats.bytes_sent,
        stats.shuffles,
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
