//! ClientConfig defaults, validation and `from_env()`.

use std::env;
use std::sync::Mutex;
use std::time::Duration;

use kafkaesque_client::prelude::*;
use kafkaesque_client::telemetry::LogFormat;

/// Environment variables are process-global; env-based tests run one at a time.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "KAFKA_VERSION",
    "KAFKA_CLIENT_ID",
    "KAFKA_COMPRESSION",
    "KAFKA_ISOLATION_LEVEL",
    "KAFKA_MAX_OPEN_REQUESTS",
    "LOG_FORMAT",
];

/// Runs `f` with exactly `vars` set among the variables the config reads.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();
    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }
    result
}

fn problems(config: &ClientConfig) -> Vec<String> {
    config.validate().err().unwrap_or_default()
}

// ============================================================================
// Environment
// ============================================================================

#[test]
fn test_from_env_defaults() {
    with_env_vars(&[], || {
        let config = ClientConfig::from_env().expect("defaults parse");
        assert_eq!(config.version, KafkaVersion::default());
        assert_eq!(config.producer.compression, CompressionCodec::None);
        assert_eq!(config.consumer.isolation_level, IsolationLevel::ReadUncommitted);
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
}

#[test]
fn test_from_env_overrides() {
    with_env_vars(
        &[
            ("KAFKA_VERSION", "2.1.0"),
            ("KAFKA_CLIENT_ID", "billing"),
            ("KAFKA_COMPRESSION", "zstd"),
            ("KAFKA_ISOLATION_LEVEL", "read-committed"),
            ("KAFKA_MAX_OPEN_REQUESTS", "1"),
            ("LOG_FORMAT", "json"),
        ],
        || {
            let config = ClientConfig::from_env().expect("overrides parse");
            assert_eq!(config.version, KafkaVersion::V2_1_0_0);
            assert_eq!(config.client_id, "billing");
            assert_eq!(config.producer.compression, CompressionCodec::Zstd);
            assert_eq!(config.consumer.isolation_level, IsolationLevel::ReadCommitted);
            assert_eq!(config.net.max_open_requests, 1);
            assert!(config.validate().is_ok());
            assert_eq!(LogFormat::from_env(), LogFormat::Json);
        },
    );
}

#[test]
fn test_from_env_rejects_garbage() {
    for (key, value) in [
        ("KAFKA_VERSION", "latest"),
        ("KAFKA_COMPRESSION", "brotli"),
        ("KAFKA_ISOLATION_LEVEL", "serializable"),
        ("KAFKA_MAX_OPEN_REQUESTS", "-1"),
    ] {
        with_env_vars(&[(key, value)], || {
            assert!(ClientConfig::from_env().is_err(), "{}={}", key, value);
        });
    }
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_idempotent_prerequisites_reported_together() {
    let mut config = ClientConfig::default();
    config.version = KafkaVersion::V0_10_2_0;
    config.producer.idempotent = true;
    config.producer.retry.max = 0;
    config.net.max_open_requests = 5;

    let problems = problems(&config);
    assert!(problems.iter().any(|p| p.contains("0.11")));
    assert!(problems.iter().any(|p| p.contains("WaitForAll")));
    assert!(problems.iter().any(|p| p.contains("max_open_requests")));
    assert!(problems.iter().any(|p| p.contains("retry.max")));
    assert!(matches!(config.check(), Err(Error::Config(_))));
}

#[test]
fn test_transactional_requires_idempotent() {
    let mut config = ClientConfig::default();
    config.version = KafkaVersion::V2_0_0_0;
    config.producer.transaction.id = Some("payments".to_string());
    assert!(problems(&config).iter().any(|p| p.contains("idempotent")));

    config.producer.idempotent = true;
    config.producer.required_acks = RequiredAcks::WaitForAll;
    config.net.max_open_requests = 1;
    assert!(config.validate().is_ok());
}

#[test]
fn test_codec_gates() {
    let mut config = ClientConfig::default();
    for (version, codec, ok) in [
        (KafkaVersion::V0_8_2_0, CompressionCodec::Gzip, true),
        (KafkaVersion::V0_8_2_0, CompressionCodec::Snappy, true),
        (KafkaVersion::V0_8_2_0, CompressionCodec::Lz4, false),
        (KafkaVersion::V0_10_0_0, CompressionCodec::Lz4, true),
        (KafkaVersion::V2_0_0_0, CompressionCodec::Zstd, false),
        (KafkaVersion::V2_1_0_0, CompressionCodec::Zstd, true),
    ] {
        config.version = version;
        config.producer.compression = codec;
        assert_eq!(config.validate().is_ok(), ok, "{} at {}", codec, version);
        assert_eq!(version.supports_codec(codec), ok);
    }
}

#[test]
fn test_fetch_bounds() {
    let mut config = ClientConfig::default();
    config.consumer.fetch_default = 1_024;
    config.consumer.fetch_max = 512;
    assert!(problems(&config).iter().any(|p| p.contains("fetch_max")));

    config.consumer.fetch_max = 0;
    assert!(config.validate().is_ok());
}

#[test]
fn test_zero_timeouts_rejected() {
    let mut config = ClientConfig::default();
    config.net.dial_timeout = Duration::ZERO;
    config.producer.timeout = Duration::ZERO;
    let problems = problems(&config);
    assert_eq!(problems.len(), 2, "{:?}", problems);
}
