//! fdrlog CLI

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use fdrlog::config::Config;
use fdrlog::logger::{Loggerd, PluginRegistry};
use fdrlog::reader::{self, DataSource};
use fdrlog::storage::LogHeader;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn usage() -> ! {
    eprintln!("fdrlog v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fdrlog <command> <path>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  record <config.toml>   Run the logging daemon");
    eprintln!("  info <file>            Print the header of a log");
    eprintln!("  dump <file>            Print the sources of a log");
    process::exit(1);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        usage();
    }
    let path = PathBuf::from(&args[2]);

    let result = match args[1].as_str() {
        "record" => record(&path).await,
        "info" => show_info(&path),
        "dump" => dump(&path),
        command => {
            eprintln!("Unknown command: {command}");
            usage();
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn record(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;

    let mut loggerd = Loggerd::new(config)?;
    loggerd.load_plugins(&PluginRegistry::builtin());

    let handle = loggerd.handle();
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = usr1.recv() => handle.request_flush(),
                _ = usr2.recv() => handle.request_rotate(),
                _ = int.recv() => {
                    info!("Received SIGINT, shutting down");
                    handle.request_stop();
                }
                _ = term.recv() => {
                    info!("Received SIGTERM, shutting down");
                    handle.request_stop();
                }
            }
        }
    });

    loggerd.run().await;
    info!("Shutdown complete");
    Ok(())
}

fn show_info(path: &Path) -> anyhow::Result<()> {
    let header = LogHeader::open(path).with_context(|| format!("reading {}", path.display()))?;
    println!("{header}");
    Ok(())
}

fn dump(path: &Path) -> anyhow::Result<()> {
    let model = reader::load_file(path).with_context(|| format!("parsing {}", path.display()))?;

    println!("File: {}", path.display());
    if let Some(event) = model.reference_time() {
        println!("Reference time: {event}");
    }
    for source in model.data_sources() {
        match source {
            DataSource::Internal(s) => {
                println!("[internal] {} ({} fields)", source.name(), s.fields().len());
            }
            DataSource::Event(s) => {
                println!("[event] {} ({} events)", source.name(), s.events().len());
            }
            DataSource::Telemetry(s) => {
                let columns: Vec<&str> = s.data_set_descs().iter().map(|d| d.name.as_str()).collect();
                println!(
                    "[telemetry] {} ({} samples, {} rejected): {}",
                    source.name(),
                    s.sample_count(),
                    s.rejected_count(),
                    columns.join(", ")
                );
            }
            DataSource::Raw(s) => {
                println!("[raw] {} ({} entries)", source.name(), s.entries().len());
            }
        }
    }
    Ok(())
}
