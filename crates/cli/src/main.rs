use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use polres_calc::{CalcGraph, LoggingRuleScanner};
use polres_core::{Labels, SyncStatus};
use polres_store::{spawn_engine, EngineConfig, EngineEvent, ResolvedEndpoint, ResolvedSnapshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod replay;

#[derive(Parser, Debug)]
#[command(name = "polresctl", version, about = "Policy resolution engine CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a JSON-lines event file and print each endpoint's resolved policies
    Replay {
        file: PathBuf,
        /// Tag endpoints matching this selector with a computed annotation (repeatable)
        #[arg(long = "computed-selector")]
        computed_selectors: Vec<String>,
        /// Mark the datastore in sync after the last event
        #[arg(long = "in-sync")]
        in_sync: bool,
    },
    /// Evaluate a selector against a label set
    Match {
        selector: String,
        /// Labels as key=value (repeatable)
        #[arg(short = 'l', long = "label")]
        labels: Vec<String>,
    },
}

/// Counters and gauges the engine records, with the help text served to scrapers.
const COUNTERS: &[(&str, &str)] = &[
    ("engine_events_total", "Events received by the engine loop"),
    ("resolver_flushes_total", "Resolver flushes that ran after in-sync"),
    ("resolver_endpoint_updates_total", "Resolved endpoint views emitted by the resolver"),
    ("calc_rejected_updates_total", "Resource updates rejected before reaching the calculators"),
];
const GAUGES: &[(&str, &str)] = &[
    ("resolver_dirty_endpoints", "Endpoints awaiting the next flush"),
    ("arc_active_policies", "Policies matching at least one endpoint"),
    ("arc_active_profiles", "Profiles referenced by at least one endpoint"),
    ("engine_snapshot_epoch", "Epoch of the last published snapshot"),
];

/// Filter from `POLRES_LOG`; anything unparsable falls back to `info`.
fn log_filter(raw: Option<&str>) -> EnvFilter {
    raw.and_then(|r| EnvFilter::try_new(r).ok()).unwrap_or_else(|| EnvFilter::new("info"))
}

fn init_tracing() {
    let filter = log_filter(std::env::var("POLRES_LOG").ok().as_deref());
    // stdout carries the resolved view
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Serves engine metrics when `POLRES_METRICS_ADDR` is set. Returns the listen address.
fn init_metrics(raw: Option<&str>) -> Option<SocketAddr> {
    let raw = raw?;
    let addr: SocketAddr = match raw.parse() {
        Ok(a) => a,
        Err(e) => {
            warn!(addr = %raw, error = %e, "ignoring POLRES_METRICS_ADDR; expected host:port");
            return None;
        }
    };
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        warn!(%addr, error = %e, "resolver metrics disabled");
        return None;
    }
    for &(name, help) in COUNTERS {
        metrics::describe_counter!(name, help);
    }
    for &(name, help) in GAUGES {
        metrics::describe_gauge!(name, help);
    }
    info!(%addr, counters = COUNTERS.len(), gauges = GAUGES.len(), "serving resolver metrics");
    Some(addr)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics(std::env::var("POLRES_METRICS_ADDR").ok().as_deref());
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay { file, computed_selectors, in_sync } => {
            let reader = BufReader::new(File::open(&file).with_context(|| format!("opening {}", file.display()))?);
            let events = replay::parse_events(reader).with_context(|| format!("reading {}", file.display()))?;
            info!(file = %file.display(), events = events.len(), "replay invoked");

            let (tx, mut engine) = spawn_engine(EngineConfig::from_env(), CalcGraph::with_rule_scanner(LoggingRuleScanner));
            for (i, sel) in computed_selectors.into_iter().enumerate() {
                let ev = replay::annotate(sel.clone(), &format!("polres/computed-selector.{i}"), &sel);
                tx.send(ev).await.context("engine loop stopped early")?;
            }
            for ev in events {
                tx.send(ev).await.context("engine loop stopped early")?;
            }
            if in_sync {
                tx.send(EngineEvent::Status(SyncStatus::InSync)).await.context("engine loop stopped early")?;
            }
            drop(tx);
            engine.wait_stopped().await;
            let snap = engine.current();
            info!(epoch = snap.epoch, endpoints = snap.len(), "replay finished");
            print_snapshot(&snap, cli.output)?;
        }
        Commands::Match { selector, labels } => {
            let labels = parse_labels(&labels)?;
            let sel = polres_selector::Selector::parse(&selector).with_context(|| format!("parsing selector {selector:?}"))?;
            let matched = sel.matches(&labels);
            match cli.output {
                Output::Human => println!("{} => {}", sel.canonical(), matched),
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "selector": sel.canonical(), "matches": matched }))?
                ),
            }
        }
    }
    Ok(())
}

fn parse_labels(raw: &[String]) -> Result<Labels> {
    raw.iter()
        .map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .with_context(|| format!("label {kv:?} is not key=value"))
        })
        .collect()
}

fn print_snapshot(snap: &ResolvedSnapshot, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            if snap.is_empty() {
                println!("no resolved endpoints (was the datastore marked in sync?)");
            }
            for ep in snap.endpoints.values() {
                print_endpoint(ep);
            }
        }
        Output::Json => {
            let items: Vec<&ResolvedEndpoint> = snap.endpoints.values().collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    Ok(())
}

fn print_endpoint(ep: &ResolvedEndpoint) {
    println!("{}  {}", ep.key, ep.name);
    if ep.tiers.is_empty() {
        println!("  (no policies)");
    }
    for tier in &ep.tiers {
        let order = tier.order.map(|o| o.to_string()).unwrap_or_else(|| "-".into());
        let flag = if tier.valid { "" } else { " [invalid]" };
        let names: Vec<String> = tier.policies.iter().map(|p| p.to_string()).collect();
        println!("  tier {} (order {}){}: {}", tier.name, order, flag, names.join(", "));
    }
    for (k, v) in &ep.annotations {
        println!("  {k}={v}");
    }
    if let Some(peer) = &ep.peer {
        println!("  bgp peer v4={:?} v6={:?}", peer.v4_address, peer.v6_address);
    }
}
