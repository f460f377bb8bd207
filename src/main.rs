use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use proxyspeed::config::BenchConfig;
use proxyspeed::node::filter::{override_group, NodeFilter};
use proxyspeed::node::loader::load_nodes;
use proxyspeed::node::NodeConfig;
use proxyspeed::orchestrator::export::{load_report, ConsoleExporter, JsonExporter};
use proxyspeed::orchestrator::sort::report_view;
use proxyspeed::orchestrator::{Exporter, FilterSpec, SortSpec};
use proxyspeed::strategy::TestMode;
use proxyspeed::BenchOptions;

#[derive(Parser)]
#[command(
    name = "proxyspeed",
    about = "Latency and throughput benchmarks for proxy nodes",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Debug logging and client output on the terminal
    #[arg(long, global = true)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test every selected node and report the results
    Run(RunArgs),

    /// Load and filter a node list without testing it
    Nodes {
        #[command(flatten)]
        select: NodeSelection,
    },

    /// Re-sort and re-export a previous result file
    Import {
        /// Result file written by `run`
        path: PathBuf,

        /// Sort method: speed, rspeed, ping or rping
        #[arg(long)]
        sort: Option<SortSpec>,

        /// Hide nodes that did not pass
        #[arg(long)]
        only_success: bool,

        /// Write the re-sorted report here
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct NodeSelection {
    /// Node list (JSON array, or TOML with [[nodes]])
    #[arg(long, short = 'n')]
    nodes: PathBuf,

    /// Keep nodes whose group or remarks contain any of these
    #[arg(long = "filter", short = 'f', num_args = 1..)]
    keywords: Vec<String>,

    /// Keep nodes whose group contains any of these
    #[arg(long = "group", num_args = 1..)]
    group_keywords: Vec<String>,

    /// Keep nodes whose remarks contain any of these
    #[arg(long = "remark", num_args = 1..)]
    remark_keywords: Vec<String>,

    /// Drop nodes whose group or remarks contain any of these
    #[arg(long = "exclude", num_args = 1..)]
    exclude_keywords: Vec<String>,

    /// Drop nodes whose group contains any of these
    #[arg(long = "exclude-group", num_args = 1..)]
    exclude_group_keywords: Vec<String>,

    /// Drop nodes whose remarks contain any of these
    #[arg(long = "exclude-remark", num_args = 1..)]
    exclude_remark_keywords: Vec<String>,

    /// Replace every node's group name
    #[arg(long)]
    group_override: Option<String>,
}

impl NodeSelection {
    fn load(&self) -> Result<Vec<NodeConfig>> {
        let filter = NodeFilter {
            keywords: self.keywords.clone(),
            group_keywords: self.group_keywords.clone(),
            remark_keywords: self.remark_keywords.clone(),
            exclude_keywords: self.exclude_keywords.clone(),
            exclude_group_keywords: self.exclude_group_keywords.clone(),
            exclude_remark_keywords: self.exclude_remark_keywords.clone(),
        };
        let mut nodes = load_nodes(&self.nodes)?;
        if let Some(group) = &self.group_override {
            override_group(&mut nodes, group);
        }
        Ok(filter.apply(nodes))
    }
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    select: NodeSelection,

    /// Test mode: tcp-ping, throughput, wps or combined
    #[arg(long, short = 'm', default_value = "combined")]
    mode: TestMode,

    /// Sort method: speed, rspeed, ping or rping
    #[arg(long, short = 's')]
    sort: Option<SortSpec>,

    /// Nodes tested at once (overrides the config file)
    #[arg(long, short = 'j')]
    concurrency: Option<usize>,

    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    yes: bool,

    /// Result file (default: results/<timestamp>.json)
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Cancel the run after this many seconds
    #[arg(long)]
    run_timeout: Option<u64>,

    /// Only report nodes that passed
    #[arg(long)]
    only_success: bool,

    /// Start even if client executables are missing
    #[arg(long)]
    skip_requirements_check: bool,
}

fn init_tracing(cfg: &BenchConfig, debug: bool, json: bool) {
    let level = if debug { "debug" } else { cfg.logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    // stdout carries the tables
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr);
    if json || cfg.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_nodes(nodes: &[NodeConfig]) {
    println!("{:<16} | {:<28} | {:<7} | {:<32} | Id", "Group", "Remarks", "Proto", "Server");
    println!("{:-<16}-|-{:-<28}-|-{:-<7}-|-{:-<32}-|-{:-<12}", "", "", "", "", "");
    for node in nodes {
        println!(
            "{:<16} | {:<28} | {:<7} | {:<32} | {}",
            node.group,
            node.label(),
            node.protocol.to_string(),
            format!("{}:{}", node.server, node.server_port),
            node.id()
        );
    }
    println!("\n{} nodes", nodes.len());
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Cancel `token` on Ctrl-C or once `limit` has passed.
fn spawn_cancel_watch(token: CancellationToken, limit: Option<Duration>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let expiry = async {
            match limit {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("interrupted, cancelling run"),
            _ = expiry => warn!(limit = ?limit, "run timeout reached, cancelling run"),
        }
        token.cancel();
    })
}

async fn run(mut cfg: BenchConfig, args: RunArgs) -> Result<()> {
    if let Some(n) = args.concurrency {
        cfg.run.concurrency = n;
    }
    if cfg.run.concurrency == 0 {
        bail!("concurrency must be at least 1");
    }

    let nodes = args.select.load()?;
    if nodes.is_empty() {
        bail!("no nodes left after filtering {}", args.select.nodes.display());
    }

    if args.skip_requirements_check {
        warn!("Client requirements check skipped");
    } else {
        let missing = proxyspeed::missing_clients(&cfg, &nodes);
        for (kind, binary) in &missing {
            error!(client = %kind, binary = %binary.display(), "client executable not found");
        }
        if !missing.is_empty() {
            bail!(
                "{} client executable(s) not found; install them, set their paths under [clients] or pass --skip-requirements-check",
                missing.len()
            );
        }
    }

    if !args.yes {
        print_nodes(&nodes);
        if !confirm(&format!("Test {} nodes with mode {}?", nodes.len(), args.mode))? {
            info!("Run aborted by user");
            return Ok(());
        }
    }

    let json = match args.output {
        Some(path) => JsonExporter::new(path),
        None => JsonExporter::timestamped("results"),
    };
    let json_path = json.path().to_path_buf();
    let mut exporters: Vec<Box<dyn Exporter>> = vec![Box::new(ConsoleExporter::stdout()), Box::new(json)];

    let cancel = CancellationToken::new();
    let watch = spawn_cancel_watch(cancel.clone(), args.run_timeout.map(Duration::from_secs));

    let options = BenchOptions {
        mode: Some(args.mode),
        sort: args.sort.unwrap_or_default(),
        filter: FilterSpec {
            only_success: args.only_success,
            ..Default::default()
        },
    };
    let result = proxyspeed::run_bench(&cfg, nodes, options, &mut exporters, cancel).await;
    watch.abort();

    let outcome = result?;
    if outcome.cancelled {
        warn!(tested = outcome.store.len(), "run was cancelled; unfinished nodes are marked TIMEOUT");
    }
    println!("Results saved to {}", json_path.display());
    Ok(())
}

fn import(path: &Path, sort: Option<SortSpec>, only_success: bool, output: Option<PathBuf>) -> Result<()> {
    let entries = load_report(path)?;
    info!(path = %path.display(), entries = entries.len(), "Imported results");

    let filter = FilterSpec {
        only_success,
        ..Default::default()
    };
    let view = report_view(&entries, sort.unwrap_or_default(), &filter);
    ConsoleExporter::stdout().export(&view)?;
    if let Some(out) = output {
        JsonExporter::new(&out)
            .export(&view)
            .with_context(|| format!("Failed to re-export to {}", out.display()))?;
        println!("Results saved to {}", out.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = BenchConfig::resolve(cli.config.as_deref())?;
    if cli.debug {
        cfg.clients.debug_output = true;
    }
    init_tracing(&cfg, cli.debug, cli.json_logs);

    match cli.command {
        Commands::Run(args) => {
            tracing::info!(mode = %args.mode, nodes = %args.select.nodes.display(), "Starting run");
            run(cfg, args).await?;
        }
        Commands::Nodes { select } => {
            let nodes = select.load()?;
            print_nodes(&nodes);
        }
        Commands::Import {
            path,
            sort,
            only_success,
            output,
        } => {
            import(&path, sort, only_success, output)?;
        }
    }

    Ok(())
}
