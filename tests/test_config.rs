//! Tests for startup configuration loading.

use std::io::Write;

use nsa::cli::config::AppConfig;

#[test]
fn defaults_are_sensible() {
    let config = AppConfig::default();

    assert_eq!(config.server.port, 8080);
    assert_eq!(config.catalog.database, "nsa");
    assert_eq!(config.catalog.workflow_collection, "workflows");
    assert_eq!(config.catalog.datasource_collection, "datasources");
    assert_eq!(config.catalog.instance_collection, "workflow_instances");
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.bus.reload_interval_seconds, 30);
    assert_eq!(config.bus.lookupd_addresses, vec!["127.0.0.1:4161"]);
}

#[test]
fn partial_file_overlays_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nsa.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        "catalog:\n  database: production\nbus:\n  lookupd_addresses:\n    - nsqlookupd-1:4161\n    - nsqlookupd-2:4161\n  reload_interval_seconds: 5\nlogging:\n  level: debug"
    )
    .unwrap();

    let config = AppConfig::load(Some(&path)).unwrap();

    assert_eq!(config.catalog.database, "production");
    // Unspecified fields keep their defaults
    assert_eq!(config.catalog.workflow_collection, "workflows");
    assert_eq!(
        config.bus.lookupd_addresses,
        vec!["nsqlookupd-1:4161", "nsqlookupd-2:4161"]
    );
    assert_eq!(config.bus.reload_interval_seconds, 5);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.server.port, 8080);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let result = AppConfig::load(Some(std::path::Path::new("/nonexistent/nsa.yaml")));
    assert!(result.is_err());
}
