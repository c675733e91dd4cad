//! Sessions opened from a configuration file, the way an application would.

use figment::Jail;
use rust_cba::protocol::Checksum;
use rust_cba::transport::SimulatedCba4;
use rust_cba::{Cba4, DeviceError, DriverConfig};

#[test]
fn test_session_follows_loaded_config() {
    Jail::expect_with(|jail| {
        jail.create_dir("config")?;
        jail.create_file(
            "config/cba4.toml",
            r#"
[protocol]
timeout_ms = 25
max_retries = 4
retry_backoff_ms = 0
checksum = "xor8"

[keepalive]
enabled = false
"#,
        )?;
        jail.set_env("RUST_CBA_PROTOCOL__MAX_RETRIES", "1");

        let config = DriverConfig::load()?;
        assert_eq!(config.protocol.checksum, Checksum::Xor8);
        assert_eq!(config.protocol.max_retries, 1);

        let (sim, handle) = SimulatedCba4::with_checksum(config.protocol.checksum);
        let cba = Cba4::with_transport(Box::new(sim), &config).unwrap();
        assert!(cba.serial_number().is_some());
        assert!(!cba.keepalive_active());

        handle.drop_next_replies(3);
        match cba.read_measurement() {
            Err(DeviceError::CommandFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
        Ok(())
    });
}

#[test]
fn test_invalid_config_refuses_to_open() {
    Jail::expect_with(|jail| {
        jail.set_env("RUST_CBA_KEEPALIVE__INTERVAL_MS", "5000");
        let config = DriverConfig::load_from("missing.toml")?;

        let (sim, handle) = SimulatedCba4::new();
        match Cba4::with_transport(Box::new(sim), &config) {
            Err(DeviceError::InvalidParameter(reason)) => assert!(reason.contains("interval")),
            other => panic!("expected InvalidParameter, got {other:?}"),
        }
        assert!(handle.commands().is_empty());
        Ok(())
    });
}

#[test]
fn test_shipped_sample_config_matches_defaults() {
    // Inside a jail so environment overrides set by other tests cannot leak in
    Jail::expect_with(|_jail| {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/cba4.toml");
        let config = DriverConfig::load_from(path)?;
        assert_eq!(config, DriverConfig::default());
        Ok(())
    });
}
