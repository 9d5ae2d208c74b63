/*!
cfgvault CLI - capture device configurations and inspect the artifact store.

Collection reads devices from a JSON inventory; the `ingest` command runs the
write-only FTP listener that relay-capable devices upload to.
*/

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cfgvault_core::device::PlaintextCipher;
use cfgvault_core::ingest::ftp::FtpServerConfig;
use cfgvault_core::storage::{ArtifactFilter, ArtifactSummary};
use cfgvault_core::{
    init_observability, ArtifactStore, BackupCollector, CollectionResult, CollectorConfig,
    Connectors, DeviceDirectory, DeviceId, FtpIngestionServer, IngestionCoordinator,
    IngestionProbe, JsonInventory, ListenerHandle, LocalArtifactStore, RelayConsumer,
    RelayMailbox, StoreError, TcpProbe, TracingAuditSink, Vendor,
};
use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "cfgvault")]
#[command(about = "Read-only network configuration backup collector")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// JSON configuration file; CFGVAULT_* variables override it
    #[arg(short, long, global = true, env = "CFGVAULT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture one device from the inventory
    Collect {
        /// Device inventory (JSON)
        #[arg(short, long)]
        inventory: PathBuf,
        /// Device identifier
        device_id: String,
        /// Recorded as the initiator of the collection
        #[arg(long, default_value = "cli")]
        triggered_by: String,
    },
    /// Capture every active device in the inventory
    CollectAll {
        #[arg(short, long)]
        inventory: PathBuf,
        #[arg(long, default_value = "cli")]
        triggered_by: String,
        /// Print the full summary as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List stored artifacts, newest first
    List {
        #[arg(long)]
        vendor: Option<Vendor>,
        #[arg(long)]
        device: Option<String>,
    },
    /// Show the metadata of a stored artifact
    Show {
        /// Artifact path relative to the storage root
        path: String,
    },
    /// Recompute an artifact's checksum and compare it with the stored record
    Verify { path: String },
    /// Store totals
    Stats,
    /// Print the compiled vendor table
    Vendors,
    /// Run the FTP ingestion listener until interrupted
    Ingest {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,
        /// Device inventory used to validate uploads
        #[arg(short, long)]
        inventory: PathBuf,
    },
}

#[derive(Tabled)]
struct ArtifactRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Vendor")]
    vendor: String,
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Captured")]
    captured: String,
    #[tabled(rename = "Size")]
    size: String,
}

impl From<ArtifactSummary> for ArtifactRow {
    fn from(summary: ArtifactSummary) -> Self {
        Self {
            path: summary.path,
            vendor: summary.metadata.vendor.to_string(),
            device: summary.metadata.device_id.to_string(),
            captured: summary
                .metadata
                .timestamp
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            size: format_size(summary.metadata.file_size_bytes),
        }
    }
}

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Retries")]
    retries: u32,
    #[tabled(rename = "Artifact / Error")]
    detail: String,
}

impl From<&CollectionResult> for ResultRow {
    fn from(result: &CollectionResult) -> Self {
        let detail = match (&result.artifact, &result.error) {
            (Some(artifact), _) => artifact.path.clone(),
            (None, Some(error)) => error.to_string(),
            (None, None) => String::new(),
        };
        Self {
            device: result.device_id.to_string(),
            status: if result.success { "ok" } else { "failed" }.to_string(),
            retries: result.retries_used,
            detail,
        }
    }
}

#[derive(Tabled)]
struct VendorRow {
    #[tabled(rename = "Vendor")]
    vendor: String,
    #[tabled(rename = "Transports")]
    transports: String,
    #[tabled(rename = "Command")]
    command: String,
    #[tabled(rename = "Capture")]
    capture: String,
    #[tabled(rename = "Extension")]
    extension: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_observability(cli.json_logs, cli.verbose)?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Collect {
            inventory,
            device_id,
            triggered_by,
        } => collect_one(&config, &inventory, &device_id, &triggered_by).await?,
        Commands::CollectAll {
            inventory,
            triggered_by,
            json,
        } => collect_all(&config, &inventory, &triggered_by, json).await?,
        Commands::List { vendor, device } => list_artifacts(&config, vendor, device)?,
        Commands::Show { path } => show_artifact(&config, &path)?,
        Commands::Verify { path } => verify_artifact(&config, &path)?,
        Commands::Stats => show_stats(&config)?,
        Commands::Vendors => list_vendors(),
        Commands::Ingest { bind, inventory } => run_ingest(&config, bind, &inventory).await?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CollectorConfig, anyhow::Error> {
    let config = match path {
        Some(path) => CollectorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CollectorConfig::from_env()?,
    };
    Ok(config)
}

fn open_store(config: &CollectorConfig) -> Result<LocalArtifactStore, anyhow::Error> {
    LocalArtifactStore::open(&config.storage_root)
        .with_context(|| format!("opening store at {}", config.storage_root.display()))
}

/// FTP listener run inside a collect command so coordinator-mode relay
/// captures have somewhere to upload to
struct EmbeddedListener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl EmbeddedListener {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Embedded FTP listener failed: {}", e),
            Err(e) => warn!("Embedded FTP listener task panicked: {}", e),
        }
    }
}

async fn build_collector(
    config: &CollectorConfig,
    directory: Arc<dyn DeviceDirectory>,
) -> Result<(BackupCollector, Option<EmbeddedListener>), anyhow::Error> {
    let relay = &config.relay;
    let mailbox = RelayMailbox::new();

    let (probe, listener) = match relay.consumer {
        RelayConsumer::AdapterPoll => {
            // An external `cfgvault ingest` process owns the listener.
            let probe: Arc<dyn IngestionProbe> = Arc::new(TcpProbe::local(relay.ftp_port));
            (probe, None)
        }
        RelayConsumer::Coordinator => {
            let coordinator = Arc::new(IngestionCoordinator::new(
                relay.ingestion_root.clone(),
                relay.consumer,
                Arc::new(open_store(config)?),
                directory,
                mailbox.clone(),
                Arc::new(TracingAuditSink),
            ));
            let server = Arc::new(FtpIngestionServer::new(
                FtpServerConfig::from_relay(relay, IpAddr::from([0, 0, 0, 0])),
                coordinator,
            ));
            let handle = server.handle();
            let tcp = server.bind().await.context("binding FTP ingestion listener")?;

            let (stop, stopped) = oneshot::channel::<()>();
            let task = tokio::spawn(server.serve(tcp, async {
                let _ = stopped.await;
            }));
            for _ in 0..100 {
                if handle.running() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let probe: Arc<dyn IngestionProbe> = Arc::new(handle);
            (probe, Some(EmbeddedListener { stop, task }))
        }
    };

    let collector = BackupCollector::from_config(
        config,
        Connectors::native(),
        probe,
        mailbox,
        Arc::new(TracingAuditSink),
    )?;
    Ok((collector, listener))
}

fn load_inventory(path: &Path) -> Result<Arc<JsonInventory>, anyhow::Error> {
    let inventory = JsonInventory::load(path, &PlaintextCipher)
        .with_context(|| format!("loading inventory {}", path.display()))?;
    Ok(Arc::new(inventory))
}

async fn collect_one(
    config: &CollectorConfig,
    inventory: &Path,
    device_id: &str,
    triggered_by: &str,
) -> Result<(), anyhow::Error> {
    let inventory = load_inventory(inventory)?;
    let id = DeviceId::new(device_id)?;
    let device = inventory
        .get(&id)
        .ok_or_else(|| anyhow::anyhow!("device {id} is not in the inventory"))?;

    let (collector, listener) = build_collector(config, inventory).await?;
    let result = collector.collect(&device, triggered_by).await;
    if let Some(listener) = listener {
        listener.shutdown().await;
    }
    println!("{}", Table::new([ResultRow::from(&result)]));

    if !result.success {
        return Err(anyhow::anyhow!("collection failed for {id}"));
    }
    Ok(())
}

async fn collect_all(
    config: &CollectorConfig,
    inventory: &Path,
    triggered_by: &str,
    json: bool,
) -> Result<(), anyhow::Error> {
    let inventory = load_inventory(inventory)?;
    let (collector, listener) = build_collector(config, inventory.clone()).await?;

    let summary = collector.collect_all(&*inventory, triggered_by).await;
    if let Some(listener) = listener {
        listener.shutdown().await;
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    if summary.total == 0 {
        println!("No active devices in inventory");
        return Ok(());
    }

    let rows: Vec<ResultRow> = summary.results.iter().map(ResultRow::from).collect();
    println!("{}", Table::new(rows));
    println!(
        "{} of {} devices captured, {} failed",
        summary.succeeded, summary.total, summary.failed
    );
    Ok(())
}

fn list_artifacts(
    config: &CollectorConfig,
    vendor: Option<Vendor>,
    device: Option<String>,
) -> Result<(), anyhow::Error> {
    let store = open_store(config)?;
    let filter = ArtifactFilter {
        vendor,
        device_id: device.map(DeviceId::new).transpose()?,
    };

    let artifacts = store.list(&filter)?;
    if artifacts.is_empty() {
        println!("No artifacts found");
        return Ok(());
    }

    let rows: Vec<ArtifactRow> = artifacts.into_iter().map(ArtifactRow::from).collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn show_artifact(config: &CollectorConfig, path: &str) -> Result<(), anyhow::Error> {
    let store = open_store(config)?;
    let metadata = store.read_metadata(path)?;

    println!("Artifact Details:");
    println!("  Path: {path}");
    println!("  Vendor: {}", metadata.vendor);
    println!("  Device: {}", metadata.device_id);
    println!("  Address: {}", metadata.device_ip);
    println!("  Transport: {}", metadata.connection_type);
    println!("  Command: {}", metadata.backup_command);
    println!(
        "  Captured: {}",
        metadata.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Duration: {:.2}s", metadata.execution_time_seconds);
    println!("  Size: {}", format_size(metadata.file_size_bytes));
    println!("  SHA-256: {}", metadata.checksum_sha256);
    println!("  Format Version: {}", metadata.format_version);
    Ok(())
}

fn verify_artifact(config: &CollectorConfig, path: &str) -> Result<(), anyhow::Error> {
    let store = open_store(config)?;
    info!("Verifying artifact: {}", path);

    match store.check(path) {
        Ok(()) => {
            println!("✓ Artifact is intact");
            Ok(())
        }
        Err(StoreError::IntegrityCheckFailed { expected, actual }) => {
            error!("✗ Integrity check failed:");
            error!("  Expected hash: {}", expected);
            error!("  Actual hash: {}", actual);
            Err(anyhow::anyhow!("integrity check failed"))
        }
        Err(e) => {
            error!("✗ Failed to verify artifact: {}", e);
            Err(e.into())
        }
    }
}

fn show_stats(config: &CollectorConfig) -> Result<(), anyhow::Error> {
    let stats = open_store(config)?.stats()?;

    println!("Artifacts: {}", stats.total_artifacts);
    println!("Total size: {}", format_size(stats.total_bytes));
    for (vendor, count) in &stats.artifacts_by_vendor {
        println!("  {vendor}: {count}");
    }
    Ok(())
}

fn list_vendors() {
    let rows: Vec<VendorRow> = Vendor::all()
        .map(|vendor| {
            let profile = vendor.profile();
            VendorRow {
                vendor: vendor.to_string(),
                transports: profile
                    .transports
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                command: profile.command.to_string(),
                capture: if vendor.is_relay() { "ftp relay" } else { "inline" }.to_string(),
                extension: profile.extension.to_string(),
            }
        })
        .collect();
    println!("{}", Table::new(rows));
}

async fn run_ingest(
    config: &CollectorConfig,
    bind: IpAddr,
    inventory: &Path,
) -> Result<(), anyhow::Error> {
    let relay = &config.relay;
    if relay.consumer == RelayConsumer::AdapterPoll {
        warn!("Relay consumer is adapter-poll; uploads stay in the inbox for the collector");
    }

    let directory: Arc<dyn DeviceDirectory> = load_inventory(inventory)?;
    let coordinator = Arc::new(IngestionCoordinator::new(
        relay.ingestion_root.clone(),
        relay.consumer,
        Arc::new(open_store(config)?),
        directory,
        RelayMailbox::new(),
        Arc::new(TracingAuditSink),
    ));

    let server = Arc::new(FtpIngestionServer::new(
        FtpServerConfig::from_relay(relay, bind),
        coordinator,
    ));
    let handle: ListenerHandle = server.handle();

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .context("FTP ingestion listener failed")?;

    info!(running = handle.running(), "Ingestion listener stopped");
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_cli_parses_collect() {
        let cli = Cli::try_parse_from([
            "cfgvault",
            "collect",
            "--inventory",
            "devices.json",
            "R1",
        ])
        .unwrap();
        match cli.command {
            Commands::Collect {
                device_id,
                triggered_by,
                ..
            } => {
                assert_eq!(device_id, "R1");
                assert_eq!(triggered_by, "cli");
            }
            _ => panic!("expected collect"),
        }
    }

    #[test]
    fn test_cli_parses_vendor_filter() {
        let cli = Cli::try_parse_from(["cfgvault", "list", "--vendor", "zte"]).unwrap();
        match cli.command {
            Commands::List { vendor, .. } => assert_eq!(vendor, Some(Vendor::Zte)),
            _ => panic!("expected list"),
        }
    }
}
