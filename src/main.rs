//! banip - host intrusion-mitigation daemon.
//!
//! Watches log output or raw packets for IP addresses that match
//! configured rules, cross-checks them against DNS blocklists, and
//! steers matching traffic into an nftables drop set.

mod bus;
mod cli;
mod db;
mod error;
mod fail2ban;
mod filter;
mod journal;
mod list;
mod nft;
mod queue;
mod rbl;
mod rlog;
mod rule;
mod server;

use clap::Parser;
use cli::Cli;
use db::decisions::Decisions;
use rbl::RblClient;
use rule::Rule;
use server::Server;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

fn load_rules(toml_dir: &Path) -> Vec<Rule> {
    let pattern = format!("{}/*.toml", toml_dir.display());
    let mut rules = Vec::new();
    let entries = match glob::glob(&pattern) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, dir = %toml_dir.display(), "invalid toml glob pattern");
            return rules;
        }
    };
    for entry in entries.flatten() {
        match Rule::load(&entry) {
            Ok(rule) => rules.push(rule),
            Err(e) => warn!(path = %entry.display(), error = %e, "failed to load rule file"),
        }
    }
    rules
}

async fn open_decisions(home: &Path, sqlite_name: &str) -> anyhow::Result<Arc<Decisions>> {
    let (decisions, _rlog) = open_store(home, sqlite_name).await?;
    Ok(decisions)
}

async fn open_store(
    home: &Path,
    sqlite_name: &str,
) -> anyhow::Result<(Arc<Decisions>, Arc<db::rlog::RlogStore>)> {
    let db_dir = home.join("db");
    tokio::fs::create_dir_all(&db_dir).await?;
    let pool = db::connect(&db_dir.join(sqlite_name)).await?;
    Ok((
        Arc::new(Decisions::new(pool.clone())),
        Arc::new(db::rlog::RlogStore::new(pool)),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if cli.runtime_version {
        println!("banip {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let home = home_dir();
    let toml_dir = cli.toml_dir.clone().unwrap_or_else(|| home.join("toml"));
    let rbl = Arc::new(RblClient::new(cli.rbl_zone_list()));

    // One-shot operator operations: construct just enough state, act, exit.
    if let Some(addr) = &cli.rbl_probe {
        let ip: std::net::Ipv4Addr = addr.parse()?;
        let (_tx, mut rx) = broadcast::channel(1);
        let zones = rbl.lookup(ip, false, &mut rx).await;
        if zones.is_empty() {
            println!("{addr}: not listed");
        } else {
            println!("{addr}: listed in {}", zones.join(", "));
        }
        return Ok(());
    }

    if let Some(addr) = &cli.whitelist {
        let decisions = open_decisions(&home, &cli.sqlite).await?;
        let server = Server::new(decisions, rbl, None);
        server.whitelist(addr).await?;
        println!("whitelisted {addr}");
        return Ok(());
    }

    if let Some(addr) = &cli.blacklist {
        let decisions = open_decisions(&home, &cli.sqlite).await?;
        let server = Server::new(decisions, rbl, None);
        server.blacklist(addr, "operator").await?;
        println!("blacklisted {addr}");
        return Ok(());
    }

    if let Some(addr) = &cli.remove {
        let decisions = open_decisions(&home, &cli.sqlite).await?;
        let server = Server::new(decisions, rbl, None);
        server.remove(addr).await?;
        println!("removed {addr}");
        return Ok(());
    }

    if let Some(addr) = &cli.query {
        let decisions = open_decisions(&home, &cli.sqlite).await?;
        let server = Server::new(decisions, rbl, None);
        match server.query(addr).await? {
            Some(rec) => println!("{rec:?}"),
            None => println!("{addr}: not found"),
        }
        return Ok(());
    }

    if let Some(source) = &cli.load_fail2ban {
        let decisions = open_decisions(&home, &cli.sqlite).await?;
        let migrated = fail2ban::load_fail2ban(source, &decisions).await?;
        println!("migrated {migrated} bans");
        return Ok(());
    }

    if cli.test_nft {
        nft::NftTable::new("netdev", "filter", "banip", &cli.device).await?;
        println!("nft table/set/chain/rule created successfully");
        return Ok(());
    }

    if let Some(path) = &cli.test {
        let rule = Rule::load(path)?;
        return run_offline_eval_journal(&cli, rule).await;
    } else if let Some(path) = &cli.testdata {
        let rule = Rule::load(path)?;
        return run_offline_eval_testdata(&cli, rule).await;
    }

    let (decisions, rlog_store) = open_store(&home, &cli.sqlite).await?;

    // NFT-SET enforcement is owned by log-driven mode only (§5); the packet
    // path enforces entirely from the QUEUE callback and never touches it.
    let nft = if cli.packet_mode {
        None
    } else {
        match nft::NftTable::new("netdev", "filter", "banip", &cli.device).await {
            Ok(table) => Some(Arc::new(table)),
            Err(e) => {
                warn!(error = %e, device = %cli.device, "failed to program nftables set, continuing without kernel-set enforcement");
                None
            }
        }
    };

    let mut server = Server::new(decisions, rbl, nft);
    if cli.rlog {
        server = server.with_rlog(rlog_store);
    }
    server.recover(cli.ban_duration_chrono()).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
    let bus = bus::Bus::spawn(false, shutdown_rx);

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
            let _ = shutdown_tx.send(());
        });
    }

    if cli.syn_mode {
        warn!("--syn is not implemented by this build; ignoring");
    }

    let rules = load_rules(&toml_dir);
    server
        .run(
            bus,
            rules,
            cli.since.clone(),
            cli.packet_mode,
            cli.queue,
            cli.ban_duration_chrono(),
            cli.stats_interval,
            cli.no_log,
            shutdown_tx.clone(),
        )
        .await;

    let mut done = shutdown_tx.subscribe();
    let _ = done.recv().await;
    info!("banip shut down");
    Ok(())
}

/// `-test <path>`: load a single rule file and evaluate it against a
/// bounded, non-following journalctl replay filtered to its own tags.
async fn run_offline_eval_journal(cli: &Cli, rule: Rule) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let bus = bus::Bus::spawn(false, shutdown_rx);
    let tags = rule.tags.clone();
    let print = !cli.no_log;

    let eval_bus = bus.clone();
    let handle = tokio::spawn(async move { filter::run_offline(&rule, &eval_bus, print, print).await });
    tokio::task::yield_now().await;

    journal::spawn(bus, tags, cli.since.clone(), true, shutdown_tx.subscribe());

    let stats = handle.await?;
    info!(?stats, "offline evaluation complete");
    Ok(())
}

/// `-testdata <path>`: load a single rule file and evaluate it against its
/// own canned `testdata` messages, with no external process or file.
async fn run_offline_eval_testdata(cli: &Cli, rule: Rule) -> anyhow::Result<()> {
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let bus = bus::Bus::spawn(false, shutdown_rx);
    let print = !cli.no_log;
    let messages = rule.testdata.clone();

    let eval_bus = bus.clone();
    let handle = tokio::spawn(async move { filter::run_offline(&rule, &eval_bus, print, print).await });
    tokio::task::yield_now().await;

    for message in messages {
        bus.publish(bus::TOPIC_TEST, bus::Payload::JournalMessage(message));
    }
    bus.publish(bus::TOPIC_TEST, bus::Payload::TestTerminator);

    let stats = handle.await?;
    info!(?stats, "offline evaluation complete");
    Ok(())
}
