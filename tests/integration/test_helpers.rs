// tests/integration/test_helpers.rs

//! Shared helpers for spawning real nodes on ephemeral loopback ports.

use prismd::config::Config;
use prismd::core::cluster::NodeRole;
use prismd::core::cluster::client::RpcClient;
use prismd::server::{self, ServerHandle};
use std::time::Duration;
use tempfile::TempDir;

/// Initializes test tracing once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

/// Spawns a node with an ephemeral port and isolated data directories. The
/// media tool points at a binary that does not exist, so every media
/// invocation fails deterministically.
pub async fn spawn_node(role: NodeRole, master: Option<String>) -> (ServerHandle, TempDir) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        role,
        master,
        shards_dir: dir.path().join("video_shards"),
        master_data_dir: dir.path().join("master_data"),
        media_tool: "prismd-test-no-such-binary".to_string(),
        ..Config::default()
    };
    config.validate().unwrap();
    let handle = server::start(config).await.unwrap();
    (handle, dir)
}

pub async fn connect(addr: &str) -> RpcClient {
    RpcClient::connect(addr).await.unwrap()
}

/// Polls `check` until it returns true or the deadline passes.
pub async fn wait_for<F>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
