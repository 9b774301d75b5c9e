// tests/unit_config_test.rs

use prismd::config::Config;
use prismd::core::cluster::NodeRole;
use std::time::Duration;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.host, "localhost");
    assert_eq!(config.role, NodeRole::Worker);
    assert_eq!(config.announce_interval, Duration::from_secs(5));
    assert_eq!(config.health_check_interval, Duration::from_secs(1));
    assert_eq!(config.score_update_interval, Duration::from_secs(10));
    assert_eq!(config.backup_failure_window, Duration::from_secs(2));
    assert_eq!(config.election_base_timeout, Duration::from_secs(10));
    assert_eq!(config.segment_duration_secs, 10);
    assert_eq!(config.media_tool, "ffmpeg");
}

#[test]
fn test_master_from_args() {
    let config = Config::from_args(&args(&["--port", "50053", "--role", "master"])).unwrap();
    assert_eq!(config.role, NodeRole::Master);
    assert_eq!(config.address(), "localhost:50053");
    assert!(config.nodes.is_empty());
}

#[test]
fn test_worker_requires_master() {
    let err = Config::from_args(&args(&["--port", "50054", "--role", "worker"])).unwrap_err();
    assert!(err.to_string().contains("--master is required"));
}

#[test]
fn test_port_is_required() {
    let err = Config::from_args(&args(&["--role", "master"])).unwrap_err();
    assert!(err.to_string().contains("--port is required"));
}

#[test]
fn test_role_is_required() {
    let err = Config::from_args(&args(&["--port", "50053"])).unwrap_err();
    assert!(err.to_string().contains("--role is required"));
}

#[test]
fn test_invalid_role_and_port() {
    assert!(Config::from_args(&args(&["--port", "x", "--role", "master"])).is_err());
    assert!(Config::from_args(&args(&["--port", "50053", "--role", "overlord"])).is_err());
}

#[test]
fn test_worker_master_merged_into_nodes_and_self_removed() {
    let config = Config::from_args(&args(&[
        "--host",
        "localhost",
        "--port",
        "50054",
        "--role",
        "worker",
        "--master",
        "localhost:50053",
        "--nodes",
        "localhost:50054",
        "localhost:50055",
    ]))
    .unwrap();
    assert!(config.nodes.contains(&"localhost:50053".to_string()));
    assert!(config.nodes.contains(&"localhost:50055".to_string()));
    assert!(!config.nodes.contains(&"localhost:50054".to_string()));
}

#[test]
fn test_backup_master_role_parses() {
    let config = Config::from_args(&args(&[
        "--port",
        "50055",
        "--role",
        "backup_master",
        "--master",
        "localhost:50053",
    ]))
    .unwrap();
    assert_eq!(config.role, NodeRole::BackupMaster);
}

#[test]
fn test_config_file_with_cli_override() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prismd.toml");
    std::fs::write(
        &path,
        r#"
host = "10.0.0.1"
port = 50053
role = "master"
announce_interval = "2s"
election_base_timeout = "3s"
"#,
    )
    .unwrap();

    let loaded = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.announce_interval, Duration::from_secs(2));
    assert_eq!(loaded.election_base_timeout, Duration::from_secs(3));

    let config = Config::from_args(&args(&[
        "--config",
        path.to_str().unwrap(),
        "--port",
        "50099",
    ]))
    .unwrap();
    assert_eq!(config.host, "10.0.0.1");
    assert_eq!(config.port, 50099);
    assert_eq!(config.role, NodeRole::Master);
}
