//! Environment-driven configuration tests
//!
//! These mutate process environment variables, so they run serially.

use serial_test::serial;
use shadowtrace::config::{
    CaptureConfig, CaptureMode, SerializerKind, ENV_BINARY_PATH, ENV_DEBUG_PATH,
    ENV_METHOD_FILTER, ENV_ONLINE, ENV_SERIALIZER, ENV_SPLIT_BINARY_FILES,
};
use shadowtrace::error::CaptureError;
use std::path::PathBuf;

const ALL_KEYS: [&str; 6] = [
    ENV_BINARY_PATH,
    ENV_DEBUG_PATH,
    ENV_SPLIT_BINARY_FILES,
    ENV_ONLINE,
    ENV_METHOD_FILTER,
    ENV_SERIALIZER,
];

fn clear_env() {
    for key in ALL_KEYS {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_from_env_defaults_when_unset() {
    clear_env();
    let config = CaptureConfig::from_env().unwrap();
    assert_eq!(config, CaptureConfig::default());
}

#[test]
#[serial]
fn test_from_env_reads_variables() {
    clear_env();
    std::env::set_var(ENV_BINARY_PATH, "/var/tmp/stacks.bin");
    std::env::set_var(ENV_SPLIT_BINARY_FILES, "1");
    std::env::set_var(ENV_METHOD_FILTER, r"^MyApp\.");

    let config = CaptureConfig::from_env().unwrap();
    clear_env();

    assert_eq!(config.binary_path, Some(PathBuf::from("/var/tmp/stacks.bin")));
    assert!(config.split_binary_files);
    assert_eq!(config.method_filter.as_deref(), Some(r"^MyApp\."));
    assert_eq!(config.serializer, SerializerKind::Binary);
}

#[test]
#[serial]
fn test_from_env_online_selects_streaming() {
    clear_env();
    std::env::set_var(ENV_ONLINE, "True");
    std::env::set_var(ENV_DEBUG_PATH, "/var/tmp/stacks.txt");
    std::env::set_var(ENV_SERIALIZER, "debug");

    let config = CaptureConfig::from_env().unwrap();
    clear_env();

    assert_eq!(config.mode, CaptureMode::Online);
    assert_eq!(config.serializer, SerializerKind::Streaming);
}

#[test]
#[serial]
fn test_from_env_rejects_unknown_serializer() {
    clear_env();
    std::env::set_var(ENV_SERIALIZER, "protobuf");

    let result = CaptureConfig::from_env();
    clear_env();

    assert!(matches!(
        result,
        Err(CaptureError::InvalidConfig { ref value, .. }) if value == "protobuf"
    ));
}
