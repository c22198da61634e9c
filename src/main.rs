use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fast_trace::batch::{BatchError, BatchReport, BatchRunner};
use fast_trace::catalog::TargetCatalog;
use fast_trace::cli::Args;
use fast_trace::config::{AddressFamily, ProbeMethod, RunConfig, TargetSource};
use fast_trace::engine::CommandEngine;
use fast_trace::lookup::{DnsLookup, MaxMindConnector};
use fast_trace::prefs::Prefs;
use fast_trace::targets::{LoadedTargets, load_target_file, resolve_catalog};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    init_tracing(args.verbose);

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Saved defaults fill whatever the command line left unset
    Prefs::load().apply_to(&mut args);

    let catalog = match args.catalog {
        Some(ref path) => TargetCatalog::from_path(path)
            .with_context(|| format!("Failed to load catalog: {}", path.display()))?,
        None => TargetCatalog::builtin().context("Built-in catalog is invalid")?,
    };

    if args.list {
        print_catalog(&catalog)?;
        return Ok(());
    }

    let config = RunConfig::from(&args);
    let dns = Arc::new(DnsLookup::new());

    let loaded = load(&config, &catalog, &dns).await?;
    if let Some(ref e) = loaded.read_error {
        eprintln!("Warning: target file read stopped early: {}", e);
    }
    if loaded.is_empty() {
        anyhow::bail!("No valid targets to trace");
    }

    if config.method == ProbeMethod::Icmp {
        println!("Using ICMP probes; pass -T for TCP SYN probes to port 80 if ICMP is filtered.");
    }

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let engine = Arc::new(CommandEngine::new(config.engine.clone(), dns));
    let geo = Arc::new(MaxMindConnector::new(config.geoip_db.clone()));
    let runner = BatchRunner::new(config, engine, geo);

    let mut report = match runner.run(&loaded.targets, cancel).await {
        Ok(report) => report,
        Err(BatchError::NoTargets) => anyhow::bail!("No valid targets to trace"),
        Err(e) => return Err(e.into()),
    };
    report.skipped = loaded.skipped;

    print_report(&report, args.json)?;

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Log to stderr: warn by default, -v info, -vv debug; RUST_LOG wins
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Materialize the batch's targets before anything is probed
async fn load(config: &RunConfig, catalog: &TargetCatalog, dns: &DnsLookup) -> Result<LoadedTargets> {
    match config.source {
        TargetSource::File(ref path) => Ok(load_target_file(path, dns).await?),
        TargetSource::Catalog(ref selection) => {
            let entries = catalog
                .select(selection)
                .context("Failed to select catalog endpoints")?;
            Ok(resolve_catalog(&entries, config.family, dns).await)
        }
    }
}

fn print_catalog(catalog: &TargetCatalog) -> Result<()> {
    let mut out = std::io::stdout().lock();
    for location in catalog.locations() {
        let marker = if location.name == catalog.reference() { " (fast)" } else { "" };
        writeln!(out, "{}{}", location.name, marker)?;
        for endpoint in &location.endpoints {
            writeln!(
                out,
                "  {:<10} {:<24} {}  {}",
                endpoint.carrier.label(),
                endpoint.isp,
                endpoint.host(AddressFamily::V4),
                endpoint.host(AddressFamily::V6)
            )?;
        }
    }
    Ok(())
}

fn print_report(report: &BatchReport, json: bool) -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out)?;
    if json {
        serde_json::to_writer_pretty(&mut out, report)?;
        writeln!(out)?;
    } else {
        report.write_summary(&mut out)?;
    }
    Ok(())
}
