use std::fs;
use std::rc::Rc;

use busbridge_host::{BridgeConfig, ConfigError, Runtime};
use busbridge_protocol::BusType;
use busbridge_transport::LoopbackTransport;
use tempfile::NamedTempFile;

#[test]
fn empty_input_uses_defaults() {
    let cfg = BridgeConfig::from_toml("").expect("parse");
    assert_eq!(cfg, BridgeConfig::default());
    assert_eq!(cfg.default_bus, BusType::Session);
    assert_eq!(cfg.read_write_timeout_ms, -1);
    assert_eq!(cfg.registry_sweep_interval, 64);
    assert_eq!(cfg.log_filter, "warn");
}

#[test]
fn parses_every_field() {
    let input = r#"
default_bus = "system"
read_write_timeout_ms = 250
registry_sweep_interval = 0
log_filter = "busbridge_host=debug"
"#;
    let cfg = BridgeConfig::from_toml(input).expect("parse");
    assert_eq!(cfg.default_bus, BusType::System);
    assert_eq!(cfg.read_write_timeout_ms, 250);
    assert_eq!(cfg.registry_sweep_interval, 0);
    assert_eq!(cfg.log_filter, "busbridge_host=debug");
}

#[test]
fn rejects_unknown_keys_and_bad_values() {
    assert!(matches!(
        BridgeConfig::from_toml("default_bus = \"system\"\nverbose = true"),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        BridgeConfig::from_toml("default_bus = \"desktop\""),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        BridgeConfig::from_toml("read_write_timeout_ms = -5"),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn loads_config_from_file() {
    let file = NamedTempFile::new().expect("temp file");
    fs::write(file.path(), "default_bus = \"starter\"\nread_write_timeout_ms = 10\n")
        .expect("write config");

    let cfg = BridgeConfig::from_path(file.path()).expect("load");
    assert_eq!(cfg.default_bus, BusType::Starter);

    let missing = file.path().with_extension("missing");
    assert!(matches!(BridgeConfig::from_path(&missing), Err(ConfigError::Io { .. })));
}

#[test]
fn runtime_follows_configuration() {
    let cfg = BridgeConfig::from_toml("default_bus = \"system\"\nread_write_timeout_ms = 0")
        .expect("parse");
    let transport = Rc::new(LoopbackTransport::new());
    let runtime = Runtime::with_config(transport.clone(), cfg);

    let bus = runtime.default_bus().expect("bus");
    let system = runtime.bus_get(BusType::System).expect("bus");
    assert!(bus.ptr_eq(&system));
    assert!(bus.read_write_default().expect("read_write"));
    assert_eq!(runtime.config().read_write_timeout_ms, 0);
}
