use dbfixture::config::{Config, ConfigError};
use dbfixture::db::DriverKind;
use figment::providers::Serialized;
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

#[test]
fn test_config_load_defaults() {
    // Use figment directly without Env to avoid interference from other tests
    let figment = figment::Figment::from(Serialized::defaults(Config::default()));
    let config: Config = figment.extract().unwrap();
    assert_eq!(config.driver, DriverKind::Sqlite);
    assert_eq!(config.build.snapshot_prefix, "snapshot_");
    assert_eq!(config.build.grace_period_secs, 4 * 60 * 60);
    assert!(config.build.purge_stale);
}

#[test]
fn test_config_load_from_env() {
    std::env::set_var("DBFIXTURE_TEST_DRIVER", "mysql");
    // Use double underscore for nesting
    std::env::set_var("DBFIXTURE_TEST_BUILD__PROJECT_NAME", "billing");
    std::env::set_var("DBFIXTURE_TEST_MYSQL__PORT", "3307");

    // Use a private prefix so parallel tests do not see these variables
    use figment::{providers::Env, Figment};
    let figment = Figment::from(Serialized::defaults(Config::default()))
        .merge(Env::prefixed("DBFIXTURE_TEST_").split("__"));

    let config: Config = figment.extract().unwrap();

    assert_eq!(config.driver, DriverKind::Mysql);
    assert_eq!(config.build.project_name, "billing");
    assert_eq!(config.mysql.port, 3307);

    // Clean up
    std::env::remove_var("DBFIXTURE_TEST_DRIVER");
    std::env::remove_var("DBFIXTURE_TEST_BUILD__PROJECT_NAME");
    std::env::remove_var("DBFIXTURE_TEST_MYSQL__PORT");
}

#[test]
fn test_config_load_from_toml() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("dbfixture.toml");

    let toml_content = r#"
driver = "sqlite"

[sqlite]
directory = "var/db"

[build]
project_name = "shop"
original_database = "shop"
seeders = ["UserSeeder", "OrderSeeder"]
force_rebuild = true

[build.reuse]
transactions = false
journals = true

[build.snapshots]
after_seeders = true

[build.fingerprint]
prefix = "ci_"
migrations = "database/migrations"
hash_paths = ["database/factories"]
"#;
    fs::write(&config_path, toml_content).unwrap();

    let config = Config::try_load_from_path(Some(&config_path)).unwrap();

    assert_eq!(config.sqlite.directory, PathBuf::from("var/db"));
    assert_eq!(config.build.project_name, "shop");
    assert_eq!(config.build.seeders, vec!["UserSeeder", "OrderSeeder"]);
    assert!(config.build.force_rebuild);
    assert!(!config.build.reuse.transactions);
    assert!(config.build.reuse.journals);
    assert!(config.build.snapshots.after_seeders);
    assert!(!config.build.snapshots.after_migrations);
    assert_eq!(config.build.fingerprint.prefix, "ci_");
    assert_eq!(
        config.build.fingerprint.migrations,
        Some(PathBuf::from("database/migrations"))
    );
    // Unset keys keep their defaults.
    assert_eq!(config.build.snapshot_prefix, "snapshot_");
}

#[test]
fn test_config_invalid_value_is_reported() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("dbfixture.toml");
    fs::write(&config_path, "driver = \"oracle\"\n").unwrap();

    let err = Config::try_load_from_path(Some(&config_path)).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn test_config_save_and_reload() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("nested").join("dbfixture.toml");

    let mut config = Config::default();
    config.build.project_name = "roundtrip".to_string();
    config.build.seeders = vec!["A".to_string()];
    config.save(&config_path).unwrap();

    let loaded = Config::try_load_from_path(Some(&config_path)).unwrap();
    assert_eq!(loaded.build.project_name, "roundtrip");
    assert_eq!(loaded.build.seeders, vec!["A".to_string()]);
}
