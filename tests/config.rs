use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use grid_ingest::config::{
    CompressionEntry, Config, ConfigLoader, ConfigOverrides, DEFAULT_BATCH_SIZE, DEFAULT_RETRIES,
};
use grid_ingest::domain::{FailurePolicy, FirstBatchPolicy};
use grid_ingest::error::IngestError;
use grid_ingest::zarr::Compressor;

fn base_config() -> Config {
    Config {
        source: Some("memory://src/2022/*.json".to_string()),
        store: Some("memory://out/sst.zarr".to_string()),
        ..Config::default()
    }
}

#[test]
fn defaults_apply_when_unset() {
    let resolved = ConfigLoader::resolve_config(base_config(), ConfigOverrides::default()).unwrap();
    assert_eq!(resolved.batch_size, DEFAULT_BATCH_SIZE);
    assert_eq!(resolved.retries, DEFAULT_RETRIES);
    assert_eq!(resolved.retry_delay, Duration::from_millis(200));
    assert_eq!(resolved.policy, FailurePolicy::FailFast);
    assert_eq!(resolved.first_batch_policy, FirstBatchPolicy::CreateFromPartial);
    assert_eq!(resolved.growth_dim, "time");
    assert!(resolved.workers >= 1);
    assert!(resolved.compressor.is_some());
    assert_eq!(resolved.store.to_string(), "memory://out/sst.zarr");
}

#[test]
fn parse_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid-ingest.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "source": "memory://src/*.json.gz",
            "store": "memory://out/sst.zarr",
            "variables": ["time", "lat", "lon", "sea_surface_temperature"],
            "chunks": {"time": 5, "lat": 100, "lon": 100},
            "batch_size": 4,
            "retries": 1,
            "retry_delay_ms": 0,
            "policy": "best-effort",
            "compression": "none"
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str(), ConfigOverrides::default()).unwrap();
    assert_eq!(resolved.source, "memory://src/*.json.gz");
    assert_eq!(resolved.allow_list.len(), 4);
    assert_eq!(resolved.geometry.get("time"), Some(5));
    assert_eq!(resolved.batch_size, 4);
    assert_eq!(resolved.retries, 1);
    assert_eq!(resolved.retry_delay, Duration::ZERO);
    assert_eq!(resolved.policy, FailurePolicy::BestEffort);
    assert!(resolved.compressor.is_none());
}

#[test]
fn cli_overrides_win() {
    let overrides = ConfigOverrides {
        store: Some("memory://elsewhere.zarr".to_string()),
        retries: Some(0),
        policy: Some(FailurePolicy::BestEffort),
        chunks: vec![("lat".to_string(), 10)],
        limit: Some(3),
        ..ConfigOverrides::default()
    };
    let resolved = ConfigLoader::resolve_config(base_config(), overrides).unwrap();
    assert_eq!(resolved.store.key(), "elsewhere.zarr");
    assert_eq!(resolved.retries, 0);
    assert_eq!(resolved.policy, FailurePolicy::BestEffort);
    assert_eq!(resolved.geometry.get("lat"), Some(10));
    assert_eq!(resolved.limit, Some(3));
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::load(path.to_str()),
        Err(IngestError::MissingConfig)
    );
}

#[test]
fn unknown_fields_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid-ingest.json");
    fs::write(&path, r#"{"source": "memory://a/*.json", "bogus": 1}"#).unwrap();
    assert_matches!(
        ConfigLoader::load(path.to_str()),
        Err(IngestError::ConfigParse(_))
    );
}

#[test]
fn invalid_values_are_rejected() {
    let zero_batch = ConfigOverrides {
        batch_size: Some(0),
        ..ConfigOverrides::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(base_config(), zero_batch),
        Err(IngestError::InvalidConfig(_))
    );

    let no_growth = Config {
        variables: Some(vec!["lat".to_string(), "lon".to_string()]),
        ..base_config()
    };
    assert_matches!(
        ConfigLoader::resolve_config(no_growth, ConfigOverrides::default()),
        Err(IngestError::InvalidConfig(_))
    );

    let bad_compression = Config {
        compression: Some(CompressionEntry::Shorthand("lz5".to_string())),
        ..base_config()
    };
    assert_matches!(
        ConfigLoader::resolve_config(bad_compression, ConfigOverrides::default()),
        Err(IngestError::InvalidConfig(_))
    );

    let missing_store = Config {
        store: None,
        ..base_config()
    };
    assert_matches!(
        ConfigLoader::resolve_config(missing_store, ConfigOverrides::default()),
        Err(IngestError::InvalidConfig(_))
    );
}

#[test]
fn gzip_compression_entries() {
    let detailed = Config {
        compression: Some(CompressionEntry::Detailed(Compressor::Gzip { level: 6 })),
        ..base_config()
    };
    let resolved = ConfigLoader::resolve_config(detailed, ConfigOverrides::default()).unwrap();
    assert_eq!(resolved.compressor, Some(Compressor::Gzip { level: 6 }));

    let too_high = Config {
        compression: Some(CompressionEntry::Detailed(Compressor::Gzip { level: 12 })),
        ..base_config()
    };
    assert_matches!(
        ConfigLoader::resolve_config(too_high, ConfigOverrides::default()),
        Err(IngestError::InvalidConfig(_))
    );
}

#[test]
fn store_that_would_erase_sources_is_rejected() {
    for store in ["/", "memory://", "memory://src", "memory://src/2022"] {
        let overrides = ConfigOverrides {
            store: Some(store.to_string()),
            ..ConfigOverrides::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(base_config(), overrides),
            Err(IngestError::InvalidLocation(_)),
            "{store}"
        );
    }
}
