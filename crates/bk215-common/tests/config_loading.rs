//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use bk215_common::config::AppConfig;
use tempfile::tempdir;

#[test]
fn candidates_env_override_and_invalid_files() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let primary = dir.path().join("bk215.toml");
    fs::write(
        &primary,
        r#"
[device]
host = "192.168.1.50"
update_interval_secs = 10
read_only = true

[device.watchdog]
enabled = false
"#,
    )
    .unwrap();

    std::env::remove_var(AppConfig::ENV_CONFIG_PATH);
    let loaded = AppConfig::load_with_source(&[&missing, &primary]).unwrap();
    assert_eq!(loaded.source, primary);
    assert_eq!(loaded.config.device.host, "192.168.1.50");
    assert_eq!(loaded.config.device.update_interval, Duration::from_secs(10));
    assert!(loaded.config.device.read_only);
    assert!(!loaded.config.device.watchdog.enabled);

    let err = AppConfig::load_with_source(&[&missing]).unwrap_err();
    assert!(err.to_string().contains("no configuration files found"));

    let broken = dir.path().join("broken.toml");
    fs::write(&broken, "[device]\nhost = \"\"\n").unwrap();
    let err = AppConfig::load(&[&broken]).unwrap_err();
    assert!(format!("{err:#}").contains("broken.toml"));
    assert!(format!("{err:#}").contains("device.host"));

    let override_path = dir.path().join("override.toml");
    fs::write(&override_path, "[device]\nhost = \"10.1.1.1\"\nport = 8899\n").unwrap();
    std::env::set_var(AppConfig::ENV_CONFIG_PATH, &override_path);
    let loaded = AppConfig::load_with_source(&[&primary]).unwrap();
    std::env::remove_var(AppConfig::ENV_CONFIG_PATH);
    assert_eq!(loaded.source, override_path);
    assert_eq!(loaded.config.device.port(), 8_899);
}
