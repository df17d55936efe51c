// relaymesh-cli: demo frontend for the cross-site relay
//
// Runs a whole multi-site deployment inside one process over the
// in-process transport, so the relay paths can be watched end to end.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use relaymesh_core::bundler::{BatchingBundler, Bundler, BundlerOptions};
use relaymesh_core::relay::{BridgeConfig, SiteConfig};
use relaymesh_core::{
    Addr, LocalNetwork, Message, RelayDelegate, RelayEngine, RelayOptions, SiteAddr,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "relaymesh")]
#[command(about = "Cross-site message relay demo", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a three-site relay demo in one process
    Demo {
        /// Members per site
        #[arg(short, long, default_value = "2")]
        members: usize,
    },
    /// Validate a JSON relay configuration
    CheckConfig { path: String },
    /// Show bundler coalescing on a burst of messages
    Bundle {
        /// Number of messages in the burst
        #[arg(short, long, default_value = "100")]
        count: usize,
        /// Byte budget
        #[arg(short, long, default_value = "64000")]
        max_size: usize,
    },
}

struct PrintingDelegate {
    name: String,
}

impl RelayDelegate for PrintingDelegate {
    fn deliver(&self, msg: Message) {
        if msg.payload.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&msg.payload);
        let from = msg.src.map(|a| a.to_string()).unwrap_or_else(|| "?".to_string());
        println!("  [{}] received \"{}\" from {}", self.name, text, from);
    }

    fn site_unreachable(&self, site: &str) {
        println!("  [{}] site {} unreachable", self.name, site);
    }
}

fn site_options(site: &str, all: &[(&str, Vec<String>)]) -> RelayOptions {
    let mut opts = RelayOptions::new(site)
        .cluster(format!("{site}-cluster"))
        .async_relay_creation(false);
    for (name, bridges) in all {
        let cfg = SiteConfig {
            bridges: bridges.iter().map(|c| BridgeConfig { cluster: c.clone() }).collect(),
        };
        opts = opts.add_site(*name, cfg);
    }
    opts
}

fn run_demo(members: usize) -> Result<()> {
    let net = LocalNetwork::new();
    let topology: Vec<(&str, Vec<String>)> = vec![
        ("LON", vec!["bridge-lon-sfo".into()]),
        ("SFO", vec!["bridge-lon-sfo".into(), "bridge-sfo-tok".into()]),
        ("TOK", vec!["bridge-sfo-tok".into()]),
    ];

    let mut engines: Vec<(String, RelayEngine)> = Vec::new();
    for (site, _) in &topology {
        for i in 0..members.max(1) {
            let name = format!("{site}-{i}");
            let mut opts = site_options(site, &topology);
            // LON and TOK share no bridge; their masters forward through
            // SFO.
            if *site == "LON" {
                opts = opts.add_forward("TOK", "SFO");
            } else if *site == "TOK" {
                opts = opts.add_forward("LON", "SFO");
            }
            let engine = RelayEngine::new(opts, Arc::new(net.clone()))
                .context("building engine")?;
            engine.set_delegate(Some(Arc::new(PrintingDelegate { name: name.clone() })));
            engine.start().context("starting engine")?;
            engines.push((name, engine));
        }
    }

    println!("== deployment ==");
    for (name, engine) in &engines {
        println!(
            "  {name}: node {} {}",
            engine.local_addr(),
            if engine.is_site_master() { "(site master)" } else { "" }
        );
    }

    let (_, lon_master) = engines
        .iter()
        .find(|(n, _)| n.as_str() == "LON-0")
        .context("no LON master")?;
    let (_, tok_member) = engines
        .iter()
        .rev()
        .find(|(n, _)| n.starts_with("TOK"))
        .context("no TOK member")?;

    println!("\n== unicast LON -> TOK (forwarded through SFO's site master) ==");
    let dest = SiteAddr::member(tok_member.local_addr(), "TOK");
    match lon_master.send(Message::to(dest).with_payload(b"hello TOK".to_vec())) {
        Ok(()) => {}
        Err(e) => println!("  send failed: {e}"),
    }

    println!("\n== multicast from LON ==");
    lon_master
        .send(Message::multicast().with_payload(b"hello everyone".to_vec()))
        .context("multicast")?;

    println!("\n== routing table of LON's master ==");
    print!("{}", lon_master.print_routes());

    println!("\n== topology ==");
    lon_master.refresh_topology("SFO", true);
    lon_master.refresh_topology("TOK", true);
    print!("{}", lon_master.print_topology(true));

    println!("\n== counters at LON's master ==");
    println!("  relayed:                 {}", lon_master.num_relayed());
    println!("  forwarded to masters:    {}", lon_master.num_forwarded_to_site_master());
    println!("  forwarded to local mbrs: {}", lon_master.num_forwarded_to_local_mbr());

    for (_, engine) in &engines {
        engine.stop();
    }
    Ok(())
}

fn run_check_config(path: &str) -> Result<()> {
    let mut opts = RelayOptions::from_json_file(path).context("loading configuration")?;
    opts.validate().context("validating configuration")?;
    println!("site:             {}", opts.site);
    println!("cluster:          {}", opts.cluster);
    println!("max site masters: {}", opts.max_site_masters);
    println!("sites:            {}", opts.site_names().join(", "));
    let bridges = opts
        .local_site_config()
        .map(|cfg| cfg.bridges.iter().map(|b| b.cluster.clone()).collect::<Vec<_>>())
        .unwrap_or_default();
    println!("local bridges:    {}", bridges.join(", "));
    println!("ok");
    Ok(())
}

fn run_bundle(count: usize, max_size: usize) -> Result<()> {
    use relaymesh_core::transport::MessageBatch;
    use relaymesh_core::{NodeId, Transport, TransportError};

    struct CountingTransport {
        addr: Addr,
        sends: Mutex<usize>,
        bytes: Mutex<usize>,
    }

    impl Transport for CountingTransport {
        fn address(&self) -> Addr {
            self.addr.clone()
        }
        fn cluster_name(&self) -> String {
            "demo".to_string()
        }
        fn do_send(&self, buf: &[u8], _dest: Option<&Addr>) -> Result<(), TransportError> {
            *self.sends.lock() += 1;
            *self.bytes.lock() += buf.len();
            Ok(())
        }
        fn loopback(&self, _batch: MessageBatch) {}
        fn stats_enabled(&self) -> bool {
            true
        }
    }

    let transport = Arc::new(CountingTransport {
        addr: Addr::Node(NodeId::random()),
        sends: Mutex::new(0),
        bytes: Mutex::new(0),
    });
    let bundler = BatchingBundler::new(
        transport.clone(),
        BundlerOptions { max_size, ..BundlerOptions::default() },
    );

    let dest = NodeId::random();
    for i in 0..count {
        bundler.send(Message::to(dest).with_payload(format!("message {i}").into_bytes()));
    }
    bundler.flush();

    println!("messages:      {count}");
    println!("wire sends:    {}", transport.sends.lock());
    println!("wire bytes:    {}", transport.bytes.lock());
    if let Some(avg) = bundler.core().avg_send_time().avg() {
        println!("avg flush:     {avg} ns");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo { members } => run_demo(members),
        Commands::CheckConfig { path } => run_check_config(&path),
        Commands::Bundle { count, max_size } => run_bundle(count, max_size),
    }
}
