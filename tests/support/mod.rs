//! Shared fixtures: in-process cluster nodes wired with the in-memory
//! reference collaborators, plus schema and request builders.
#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use gridsql::meta::memory::{MemIndexFactory, MemPageStore, StaticCatalog};
use gridsql::meta::{table_file, ColDef, ColType, IndexDef, PartitionMeta, TableSchema};
use gridsql::net::blacklist::Blacklist;
use gridsql::net::dispatch::Dispatcher;
use gridsql::net::server::{NodeContext, Server};
use gridsql::xa::XaManager;
use gridsql::{LogManager, NodeConfig};

pub struct TestNode {
    pub host: String,
    pub ctx: Arc<NodeContext>,
    pub pages: Arc<MemPageStore>,
    pub indexes: Arc<MemIndexFactory>,
    pub blacklist: Arc<Blacklist>,
    pub dir: TempDir,
    /// Kept so the listener can be launched (or deliberately dropped to
    /// simulate a dead node).
    pub listener: Option<TcpListener>,
}

impl TestNode {
    pub fn serve(&mut self) {
        let listener = self.listener.take().expect("node already serving");
        let server = Server::with_listener(Arc::clone(&self.ctx), listener).unwrap();
        let _ = server.spawn().unwrap();
    }

    /// Drop the listener without serving: connections to this node fail.
    pub fn kill(&mut self) {
        self.listener.take();
    }

    pub fn active_log(&self) -> std::path::PathBuf {
        self.ctx.cfg.active_log_path()
    }

    pub fn table_path(&self, schema: &TableSchema, device: usize) -> String {
        let root = self.dir.path().join(format!("d{device}"));
        table_file(&root.to_string_lossy(), schema)
    }
}

/// Build an `n`-node cluster on loopback ephemeral ports; node 0 is the
/// coordinator. Hosts are `127.0.0.1:<port>` so every node can dial every
/// other. Nothing is served until `serve()` is called per node.
pub fn cluster(n: usize, devices_per_node: usize) -> Vec<TestNode> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let hosts: Vec<String> = listeners
        .iter()
        .map(|l| format!("127.0.0.1:{}", l.local_addr().unwrap().port()))
        .collect();

    listeners
        .into_iter()
        .enumerate()
        .map(|(i, listener)| {
            let dir = TempDir::new().unwrap();
            let device_paths: Vec<String> = (0..devices_per_node)
                .map(|d| dir.path().join(format!("d{d}")).to_string_lossy().into_owned())
                .collect();

            let cfg = NodeConfig::new()
                .log_dir(dir.path().join("log"))
                .node_id(i as i32)
                .coordinator(i == 0)
                .data_directories(device_paths.join(","));
            let cfg = NodeConfig {
                connect_timeout_ms: 500,
                read_timeout_ms: 5_000,
                max_neighbor_nodes: 2,
                ..cfg
            };

            let pages = Arc::new(MemPageStore::new(i as i32));
            for (d, path) in device_paths.iter().enumerate() {
                pages.add_device(path.clone(), d as i32);
            }
            let catalog = Arc::new(StaticCatalog::new(hosts.clone(), device_paths));
            let indexes = Arc::new(MemIndexFactory::new());

            let log = Arc::new(LogManager::from_config(&cfg));
            log.attach(&cfg.active_log_path()).unwrap();
            {
                let log = Arc::clone(&log);
                let gate_path = cfg.active_log_path();
                pages.set_wal_gate(move |lsn| log.flush(lsn, &gate_path));
            }

            let blacklist = Arc::new(Blacklist::new(Duration::from_millis(100)));
            let dispatch = Arc::new(Dispatcher::new(&cfg, Arc::clone(&blacklist)));

            let xa = if cfg.coordinator {
                Some(Arc::new(
                    XaManager::new(
                        Arc::clone(&log),
                        cfg.xa_log_path(),
                        Arc::clone(&dispatch),
                        catalog.clone(),
                        hosts[i].clone(),
                    )
                    .unwrap(),
                ))
            } else {
                None
            };

            let ctx = Arc::new(NodeContext {
                host: hosts[i].clone(),
                log,
                pages: pages.clone(),
                catalog,
                indexes: indexes.clone(),
                dispatch,
                xa,
                streamer: None,
                cfg,
            });

            TestNode {
                host: hosts[i].clone(),
                ctx,
                pages,
                indexes,
                blacklist,
                dir,
                listener: Some(listener),
            }
        })
        .collect()
}

/// A dispatcher acting as a pure client (it sits in no tree).
pub fn client() -> Arc<Dispatcher> {
    let cfg = NodeConfig {
        connect_timeout_ms: 500,
        read_timeout_ms: 5_000,
        ..NodeConfig::new()
    };
    Arc::new(Dispatcher::new(
        &cfg,
        Arc::new(Blacklist::new(Duration::from_millis(100))),
    ))
}

/// Poll `check` until it holds or the timeout elapses.
pub fn wait_until<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

pub fn two_col_schema() -> TableSchema {
    TableSchema {
        schema: "test".into(),
        table: "items".into(),
        cols: vec![
            ColDef { name: "a".into(), ctype: ColType::Int },
            ColDef { name: "b".into(), ctype: ColType::Varchar },
        ],
    }
}

pub fn index_on_a() -> IndexDef {
    IndexDef {
        name: "items_a.idx".into(),
        key_cols: vec!["a".into()],
        types: vec![ColType::Int],
        ascending: vec![true],
    }
}

pub fn partition_on_a() -> PartitionMeta {
    PartitionMeta { cols: vec![0] }
}
