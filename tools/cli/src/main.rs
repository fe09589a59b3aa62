//! LexiSync CLI - Command line interface for the sync engine.
//!
//! This tool records learning changes into a local store, inspects the
//! pending queue and drives sync cycles against a remote endpoint.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lexisync_common::{
    ChangeOperation, Domain, DomainPayload, ExperienceData, ProgressData, UserStatsData,
    VocabularyData, VocabularyEntry,
};
use lexisync_storage::{
    create_default_registry, HttpRemote, HttpRemoteConfig, KeyValueStore, MemoryRemote,
    MemoryStore, RemoteEndpoint, StaticCredentials,
};
use lexisync_sync::{
    ActivityAssessment, ActivityLevel, Conflict, ConflictResolver, NetworkType,
    SharedConnectivity, StrategyConfig, StrategySelector, SyncConfig, SyncContext, SyncEngine,
    SyncEvent,
};

type Engine = SyncEngine<dyn KeyValueStore, dyn RemoteEndpoint>;

#[derive(Parser)]
#[command(name = "lexisync")]
#[command(about = "LexiSync - Offline-first sync for learning data")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the local store (default: platform data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON file with `sync` and `remote` settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bearer token for the remote.
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a local change.
    Record {
        /// Domain name, e.g. "vocabulary" or "experience".
        #[arg(short, long)]
        domain: String,

        /// "create", "update", or "delete".
        #[arg(short, long, default_value = "update")]
        operation: String,

        /// Domain data as JSON.
        #[arg(short, long)]
        payload: String,
    },

    /// Show sync status and statistics.
    Status,

    /// Run one sync cycle against the remote.
    Sync,

    /// List queued changes.
    Pending {
        /// Only show quarantined changes.
        #[arg(long)]
        blocked: bool,
    },

    /// Show the strategy chosen for a device context.
    Strategy {
        #[arg(short, long, value_enum, default_value = "wifi")]
        network: NetworkArg,

        /// Battery charge, 0-100.
        #[arg(short, long, default_value_t = 100)]
        battery: u8,

        #[arg(long)]
        charging: bool,

        #[arg(short, long, value_enum, default_value = "medium")]
        activity: ActivityArg,

        /// Local hour, 0-23.
        #[arg(long, default_value_t = 12)]
        hour: u8,
    },

    /// Resolve a conflict between two values of a domain.
    Resolve {
        #[arg(short, long)]
        domain: String,

        /// Local domain data as JSON.
        #[arg(short, long)]
        local: String,

        /// Server domain data as JSON.
        #[arg(short, long)]
        server: String,
    },

    /// Drop a quarantined change, or release it for another attempt.
    ClearBlocked {
        /// Change id.
        #[arg(short, long)]
        id: String,

        /// Return the change to the queue instead of dropping it.
        #[arg(long)]
        release: bool,
    },

    /// Run an in-memory walkthrough: offline edits, reconnect, conflicts.
    Demo,
}

#[derive(Clone, Copy, ValueEnum)]
enum NetworkArg {
    Wifi,
    Cellular,
    Offline,
}

impl From<NetworkArg> for NetworkType {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Wifi => NetworkType::Wifi,
            NetworkArg::Cellular => NetworkType::Cellular,
            NetworkArg::Offline => NetworkType::Offline,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ActivityArg {
    Inactive,
    Low,
    Medium,
    High,
}

impl From<ActivityArg> for ActivityLevel {
    fn from(arg: ActivityArg) -> Self {
        match arg {
            ActivityArg::Inactive => ActivityLevel::Inactive,
            ActivityArg::Low => ActivityLevel::Low,
            ActivityArg::Medium => ActivityLevel::Medium,
            ActivityArg::High => ActivityLevel::High,
        }
    }
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CliConfig {
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    remote: HttpRemoteConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Settings {
        data_dir: cli.data_dir,
        config: cli.config,
        token: cli.token,
    };

    match cli.command {
        Commands::Record {
            domain,
            operation,
            payload,
        } => cmd_record(&settings, &domain, &operation, &payload).await,

        Commands::Status => cmd_status(&settings).await,

        Commands::Sync => cmd_sync(&settings).await,

        Commands::Pending { blocked } => cmd_pending(&settings, blocked).await,

        Commands::Strategy {
            network,
            battery,
            charging,
            activity,
            hour,
        } => cmd_strategy(&settings, network, battery, charging, activity, hour).await,

        Commands::Resolve {
            domain,
            local,
            server,
        } => cmd_resolve(&domain, &local, &server),

        Commands::ClearBlocked { id, release } => cmd_clear_blocked(&settings, &id, release).await,

        Commands::Demo => cmd_demo().await,
    }
}

/// Global options shared by the engine-backed commands.
struct Settings {
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    token: Option<String>,
}

impl Settings {
    async fn load_config(&self) -> Result<CliConfig> {
        match &self.config {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                let config: CliConfig =
                    serde_json::from_str(&raw).context("Invalid config file")?;
                config
                    .sync
                    .validate()
                    .with_context(|| format!("Invalid sync settings in {}", path.display()))?;
                Ok(config)
            }
            None => Ok(CliConfig::default()),
        }
    }

    fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("lexisync"))
                .context("No data directory on this platform, pass --data-dir"),
        }
    }
}

/// Open the engine over the local file store and the configured remote.
async fn open_engine(settings: &Settings) -> Result<Engine> {
    let config = settings.load_config().await?;
    let data_dir = settings.data_dir()?;

    let registry = create_default_registry();
    let store = registry
        .resolve(
            "local",
            serde_json::json!({ "root": data_dir.to_string_lossy() }),
        )
        .context("Failed to open local store")?;

    let credentials = Arc::new(StaticCredentials::new(
        settings.token.clone(),
        Some(config.sync.namespace.clone()),
    ));
    let remote: Arc<dyn RemoteEndpoint> = Arc::new(
        HttpRemote::new(config.remote, credentials).context("Failed to configure remote")?,
    );

    // The CLI is only run by hand; assume the network is up and let the
    // remote report otherwise.
    let connectivity = Arc::new(SharedConnectivity::new(NetworkType::Wifi));

    SyncEngine::open(store, remote, connectivity, config.sync)
        .await
        .context("Failed to open sync engine")
}

fn parse_payload(domain: &Domain, json: &str) -> Result<DomainPayload> {
    let value: serde_json::Value = serde_json::from_str(json).context("Payload is not JSON")?;
    DomainPayload::from_value(domain, value)
        .with_context(|| format!("Payload does not match domain '{}'", domain))
}

/// Record a change.
async fn cmd_record(settings: &Settings, domain: &str, operation: &str, payload: &str) -> Result<()> {
    let domain = Domain::parse(domain);
    let operation = ChangeOperation::parse(operation).context("Invalid operation")?;
    let payload = parse_payload(&domain, payload)?;

    let engine = open_engine(settings).await?;
    let change_id = engine
        .record_change(domain.clone(), operation, payload)
        .await
        .context("Failed to record change")?;

    println!("Recorded {} on {}: {}", operation, domain, change_id);
    println!("  Pending: {}", engine.get_sync_status().queue_length);

    Ok(())
}

/// Show status.
async fn cmd_status(settings: &Settings) -> Result<()> {
    let engine = open_engine(settings).await?;
    let status = engine.get_sync_status();
    let metadata = engine.metadata().await;

    println!("Sync Status:");
    println!("  Status: {:?}", status.status);
    println!("  Pending: {}", status.queue_length);
    println!("  Blocked: {}", status.blocked);
    match status.last_sync {
        Some(at) => println!("  Last sync: {}", at),
        None => println!("  Last sync: never"),
    }
    println!("  Retry count: {}", status.retry_count);
    if let Some(err) = &status.last_error {
        println!("  Last error: {}", err);
    }

    println!("  Versions:");
    for (domain, version) in &metadata.data_versions {
        println!(
            "    {}: local {} / server {}",
            domain,
            version,
            metadata.server_version(domain)
        );
    }

    let stats = &metadata.stats;
    println!("  Statistics:");
    println!(
        "    Cycles: {} ({} ok, {} failed)",
        stats.total_syncs, stats.successful_syncs, stats.failed_syncs
    );
    println!("    Changes delivered: {}", stats.changes_delivered);
    println!("    Conflicts resolved: {}", stats.conflicts_resolved);

    Ok(())
}

/// Run one sync cycle.
async fn cmd_sync(settings: &Settings) -> Result<()> {
    let engine = open_engine(settings).await?;
    info!(pending = engine.get_sync_status().queue_length, "Syncing");

    let result = engine.sync_now().await.context("Sync failed")?;

    if let Some(reason) = result.skipped {
        println!("Nothing done: {:?}", reason);
        return Ok(());
    }
    println!("Sync finished in {:?}", result.duration);
    println!("  Delivered: {}", result.changes_synced);
    println!("  Failed: {}", result.changes_failed);
    println!("  Conflicts: {}", result.conflicts_found);
    println!("  Blocked: {}", result.changes_blocked);
    println!("  Remaining: {}", result.remaining);

    Ok(())
}

/// List queued changes.
async fn cmd_pending(settings: &Settings, blocked_only: bool) -> Result<()> {
    let engine = open_engine(settings).await?;
    let changes = if blocked_only {
        engine.blocked_changes().await
    } else {
        engine.pending_changes().await
    };

    if changes.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for change in changes {
        let state = match (&change.blocked, change.attempts) {
            (Some(reason), _) => format!("blocked: {}", reason),
            (None, 0) => "ready".to_string(),
            (None, attempts) => format!("{} failed attempts", attempts),
        };
        println!(
            "  {} {} {} v{} ({})",
            change.id, change.domain, change.operation, change.local_version, state
        );
    }

    Ok(())
}

/// Show the strategy for a context.
async fn cmd_strategy(
    settings: &Settings,
    network: NetworkArg,
    battery: u8,
    charging: bool,
    activity: ActivityArg,
    hour: u8,
) -> Result<()> {
    if battery > 100 || hour > 23 {
        anyhow::bail!("Battery must be 0-100 and hour 0-23");
    }
    let config: StrategyConfig = settings.load_config().await?.sync.strategy;
    let selector = StrategySelector::new(config);

    let context = SyncContext {
        network: network.into(),
        battery_level: battery,
        is_charging: charging,
        activity: ActivityAssessment::fixed(activity.into()),
        hour_of_day: hour,
    };
    let strategy = selector.evaluate(&context);

    println!("Strategy:");
    println!("  Interval: {:?}", strategy.interval);
    println!("  Batch size: {}", strategy.batch_size);
    println!("  Real time: {}", strategy.real_time);

    Ok(())
}

/// Resolve a conflict offline.
fn cmd_resolve(domain: &str, local: &str, server: &str) -> Result<()> {
    let domain = Domain::parse(domain);
    let now = chrono::Utc::now();
    let conflict = Conflict {
        domain: domain.clone(),
        local_data: parse_payload(&domain, local).context("Invalid local value")?,
        server_data: parse_payload(&domain, server).context("Invalid server value")?,
        local_timestamp: now,
        server_timestamp: now,
    };

    let resolver = ConflictResolver::default();
    let severity = resolver.conflict_severity(&conflict);
    let resolution = resolver.resolve(&conflict).context("Conflict not resolvable")?;

    println!("Resolution for {}:", domain);
    println!("  Policy: {:?}", resolver.policy_for(&domain));
    println!("  Source: {:?}", resolution.source);
    println!("  Confidence: {:?}", resolution.confidence);
    println!("  Severity: {:?}", severity);
    println!("  Reason: {}", resolution.reason);
    println!(
        "  Value: {}",
        serde_json::to_string_pretty(&resolution.resolved_data.to_value()?)?
    );

    Ok(())
}

/// Drop or release a blocked change.
async fn cmd_clear_blocked(settings: &Settings, id: &str, release: bool) -> Result<()> {
    let engine = open_engine(settings).await?;
    if release {
        engine
            .release_blocked(id)
            .await
            .context("Failed to release change")?;
        println!("Change released: {}", id);
    } else {
        engine
            .clear_blocked(id)
            .await
            .context("Failed to clear change")?;
        println!("Change dropped: {}", id);
    }
    Ok(())
}

/// In-memory walkthrough of the offline-first flow.
async fn cmd_demo() -> Result<()> {
    let remote = MemoryRemote::new();
    // Another device got ahead while we were offline.
    remote.seed(DomainPayload::Experience(ExperienceData {
        experience: 150,
        level: 3,
    }))?;
    remote.seed(DomainPayload::Vocabulary(VocabularyData {
        words: vec![VocabularyEntry::new("gato"), VocabularyEntry::new("perro")],
    }))?;

    let connectivity = SharedConnectivity::new(NetworkType::Offline);
    let engine = Arc::new(
        SyncEngine::open(
            Arc::new(MemoryStore::new()),
            Arc::new(remote.clone()),
            Arc::new(connectivity.clone()),
            SyncConfig {
                namespace: "demo".to_string(),
                ..SyncConfig::default()
            },
        )
        .await?,
    );

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::ConflictResolved {
                    domain,
                    source,
                    confidence,
                    severity,
                } => println!(
                    "  conflict on {}: kept {:?} ({:?} confidence, {:?} severity)",
                    domain, source, confidence, severity
                ),
                SyncEvent::ChangeDelivered {
                    change_id,
                    domain,
                    server_version,
                } => println!("  delivered {} to {} (server v{})", change_id, domain, server_version),
                _ => {}
            }
        }
    });

    println!("Recording offline...");
    let inputs = vec![
        (
            Domain::Experience,
            DomainPayload::Experience(ExperienceData {
                experience: 120,
                level: 2,
            }),
        ),
        (
            Domain::Vocabulary,
            DomainPayload::Vocabulary(VocabularyData {
                words: vec![VocabularyEntry::new("hola"), VocabularyEntry::new("gato")],
            }),
        ),
        (
            Domain::Progress,
            DomainPayload::Progress(ProgressData {
                counters: [("lesson_3".to_string(), 40)].into_iter().collect(),
            }),
        ),
        (
            Domain::UserStats,
            DomainPayload::UserStats(UserStatsData {
                words_learned: 2,
                reviews_completed: 5,
                ..UserStatsData::default()
            }),
        ),
    ];
    let recorded = futures::future::join_all(inputs.into_iter().map(|(domain, payload)| {
        let engine = engine.clone();
        async move {
            engine
                .record_change(domain, ChangeOperation::Update, payload)
                .await
        }
    }))
    .await;
    for id in recorded {
        println!("  recorded {}", id?);
    }

    let offline = engine.sync_now().await?;
    println!("Sync while offline: {:?}", offline.skipped);

    println!("Back online...");
    connectivity.set(NetworkType::Wifi);
    engine.on_network_available().await?;

    // Merged values are queued as fresh updates.
    let follow_up = engine.sync_now().await?;
    println!("Follow-up sync delivered {}", follow_up.changes_synced);

    println!("Final state:");
    for domain in [Domain::Experience, Domain::Vocabulary, Domain::Progress] {
        let local = engine.local_data(&domain).await?.to_value()?;
        let server = remote
            .snapshot(&domain)?
            .payload
            .map(|p| p.to_value())
            .transpose()?;
        println!("  {} local:  {}", domain, local);
        println!(
            "  {} server: {}",
            domain,
            server.unwrap_or(serde_json::Value::Null)
        );
    }

    let status = engine.get_sync_status();
    println!(
        "Status: {:?}, pending {}, blocked {}",
        status.status, status.queue_length, status.blocked
    );

    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_cli_parses_record() {
        let cli = Cli::try_parse_from([
            "lexisync",
            "--data-dir",
            "/tmp/lexisync",
            "record",
            "-d",
            "experience",
            "-p",
            r#"{"experience": 10, "level": 1}"#,
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Record { .. }));
        assert_eq!(cli.data_dir.unwrap(), Path::new("/tmp/lexisync"));
    }

    #[test]
    fn test_parse_payload_checks_domain_shape() {
        let payload = parse_payload(&Domain::Experience, r#"{"experience": 10, "level": 2}"#).unwrap();
        assert_eq!(payload.domain(), Domain::Experience);
        assert!(parse_payload(&Domain::Vocabulary, "[1, 2]").is_err());
    }

    #[tokio::test]
    async fn test_engine_opens_over_file_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = Settings {
            data_dir: Some(dir.path().to_path_buf()),
            config: None,
            token: None,
        };
        let engine = open_engine(&settings).await.unwrap();
        engine
            .record_change(
                Domain::Experience,
                ChangeOperation::Update,
                DomainPayload::Experience(ExperienceData {
                    experience: 5,
                    level: 1,
                }),
            )
            .await
            .unwrap();
        drop(engine);

        let reopened = open_engine(&settings).await.unwrap();
        assert_eq!(reopened.pending_changes().await.len(), 1);
    }

    #[test]
    fn test_config_file_defaults() {
        let config: CliConfig =
            serde_json::from_str(r#"{"sync": {"namespace": "u1"}}"#).unwrap();
        assert_eq!(config.sync.namespace, "u1");
        assert_eq!(config.remote.base_url, HttpRemoteConfig::default().base_url);
    }

    #[tokio::test]
    async fn test_config_file_with_inverted_bounds_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"sync": {"strategy": {"min_batch_size": 50, "max_batch_size": 5}}}"#,
        )
        .unwrap();

        let settings = Settings {
            data_dir: Some(dir.path().to_path_buf()),
            config: Some(path),
            token: None,
        };
        assert!(settings.load_config().await.is_err());
    }
}
