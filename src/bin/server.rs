use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridsql::log::recovery::RecoveryEngine;
use gridsql::meta::memory::{MemIndexFactory, MemPageStore, StaticCatalog};
use gridsql::net::blacklist::{Blacklist, RetrySender, RetryWorker};
use gridsql::net::dispatch::Dispatcher;
use gridsql::net::server::{NodeContext, Server};
use gridsql::xa::{ClusterOutcomes, XaManager};
use gridsql::{LogManager, NodeConfig};

/// Boot one cluster node: recover its logs, then serve.
#[derive(Debug, Parser)]
#[command(name = "gridsql-server")]
struct Args {
    /// JSON config file; omitted keys take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cluster roster, comma separated; the index is the node id.
    #[arg(long, value_delimiter = ',', default_value = "localhost")]
    hosts: Vec<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    node_id: Option<i32>,

    /// Run as a coordinator (owns the XA decision log).
    #[arg(long)]
    coordinator: bool,

    #[arg(long)]
    data_dirs: Option<String>,
}

fn main() -> gridsql::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::new(),
    };
    if let Some(port) = args.port {
        cfg.port_number = port;
    }
    if let Some(dir) = args.log_dir {
        cfg.log_dir = dir;
    }
    if let Some(id) = args.node_id {
        cfg.node_id = id;
    }
    if args.coordinator {
        cfg.coordinator = true;
    }
    if let Some(dirs) = args.data_dirs {
        cfg.data_directories = dirs;
    }

    let host = args
        .hosts
        .get(cfg.node_id as usize)
        .cloned()
        .unwrap_or_else(|| "localhost".to_string());

    let device_paths: Vec<String> = cfg
        .data_dirs()
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let pages = Arc::new(MemPageStore::new(cfg.node_id));
    for (device, path) in device_paths.iter().enumerate() {
        pages.add_device(path.clone(), device as i32);
    }
    let catalog = Arc::new(StaticCatalog::new(args.hosts.clone(), device_paths));
    let indexes = Arc::new(MemIndexFactory::new());

    let log = Arc::new(LogManager::from_config(&cfg));
    log.attach(&cfg.active_log_path())?;
    {
        let log = Arc::clone(&log);
        let gate_path = cfg.active_log_path();
        pages.set_wal_gate(move |lsn| log.flush(lsn, &gate_path));
    }

    let blacklist = Arc::new(Blacklist::new(Duration::from_secs(cfg.blacklist_base_secs)));
    let dispatch = Arc::new(Dispatcher::new(&cfg, Arc::clone(&blacklist)));

    let xa = if cfg.coordinator {
        Some(Arc::new(XaManager::new(
            Arc::clone(&log),
            cfg.xa_log_path(),
            Arc::clone(&dispatch),
            catalog.clone(),
            host.clone(),
        )?))
    } else {
        None
    };

    // recover every attached log before accepting work
    let outcomes = ClusterOutcomes::new(Arc::clone(&dispatch), xa.clone());
    let engine = RecoveryEngine::new(&log, &*pages, &outcomes);
    engine.recover(&cfg.active_log_path())?;
    if let Some(xa) = &xa {
        engine.recover(xa.xa_path())?;
    }

    log.start_flusher();
    let _reaper = RetryWorker::spawn(
        Arc::clone(&blacklist),
        Arc::clone(&dispatch) as Arc<dyn RetrySender>,
        Duration::from_secs(cfg.blacklist_base_secs),
    );

    info!(node = cfg.node_id, %host, coordinator = cfg.coordinator, "node recovered; serving");
    let ctx = Arc::new(NodeContext {
        host,
        log,
        pages,
        catalog,
        indexes,
        dispatch,
        xa,
        streamer: None,
        cfg,
    });
    Server::bind(ctx)?.run()
}
