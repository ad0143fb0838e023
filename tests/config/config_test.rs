//! Coverage for config parsing, env overrides and path resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cellchat::config::{config_dir, AccountConfig, Config};

fn parse(toml_str: &str) -> Config {
    match Config::from_toml(toml_str) {
        Ok(config) => config,
        Err(err) => panic!("config should parse: {err}"),
    }
}

fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn default_account_values() {
    let account = AccountConfig::default();
    assert_eq!(account.country, None);
    assert!(account.delivery_reports);
    assert_eq!(account.validity(), 7 * 24 * 60);
    assert_eq!(account.reference_retry(), Duration::from_secs(3));
}

#[test]
fn config_dir_resolves() {
    let path = match config_dir() {
        Ok(path) => path,
        Err(err) => panic!("config dir should resolve: {err}"),
    };
    assert!(path.ends_with("cellchat"));
}

#[test]
fn empty_file_gives_defaults() {
    let config = parse("");
    assert!(config.contacts.is_empty());
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.reaper.short_timeout(), Duration::from_secs(48 * 3600));
}

#[test]
fn parse_full_config() {
    let config = parse(
        r#"
[account]
country = "GB"
delivery_reports = false
validity_minutes = 1440
reference_retry_ms = 500

[reaper]
long_timeout_hours = 24
short_timeout_hours = 6
minimal_timeout_secs = 5
clock_skew_tolerance_secs = 60

[paths]
database = "/var/lib/cellchat/history.db"

[logging]
level = "debug"

[contacts]
"07700 900123" = "Bob"
"#,
    );

    assert_eq!(config.account.country.as_deref(), Some("GB"));
    assert!(!config.account.delivery_reports);
    assert_eq!(config.account.validity(), 1440);
    assert_eq!(config.account.reference_retry(), Duration::from_millis(500));
    assert_eq!(config.reaper.long_timeout(), Duration::from_secs(24 * 3600));
    assert_eq!(config.reaper.short_timeout(), Duration::from_secs(6 * 3600));
    assert_eq!(config.reaper.minimal_timeout(), Duration::from_secs(5));
    assert_eq!(config.reaper.clock_skew_tolerance(), Duration::from_secs(60));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.contacts.get("07700 900123").map(String::as_str), Some("Bob"));

    let db = config.database_path().expect("configured path");
    assert_eq!(db, PathBuf::from("/var/lib/cellchat/history.db"));
}

#[test]
fn zero_validity_is_raised_to_one_minute() {
    let config = parse("[account]\nvalidity_minutes = 0\n");
    assert_eq!(config.account.validity(), 1);
}

#[test]
fn wrong_types_are_rejected() {
    assert!(Config::from_toml("[account]\ndelivery_reports = \"sometimes\"\n").is_err());
}

#[test]
fn env_overrides_file_values() {
    let mut config = parse("[account]\ncountry = \"US\"\n");
    config.apply_overrides(env_of(&[
        ("CELLCHAT_COUNTRY", " de "),
        ("CELLCHAT_DB_PATH", "/tmp/other.db"),
        ("CELLCHAT_LOG_LEVEL", "trace"),
        ("CELLCHAT_DELIVERY_REPORTS", "off"),
    ]));

    assert_eq!(config.account.country.as_deref(), Some("DE"));
    assert_eq!(config.paths.database.as_deref(), Some(Path::new("/tmp/other.db")));
    assert_eq!(config.logging.level, "trace");
    assert!(!config.account.delivery_reports);
}

#[test]
fn empty_country_override_clears_the_region() {
    let mut config = parse("[account]\ncountry = \"US\"\n");
    config.apply_overrides(env_of(&[("CELLCHAT_COUNTRY", "")]));
    assert_eq!(config.account.country, None);
}

#[test]
fn invalid_boolean_override_is_ignored() {
    let mut config = Config::default();
    config.apply_overrides(env_of(&[("CELLCHAT_DELIVERY_REPORTS", "maybe")]));
    assert!(config.account.delivery_reports);
}

#[test]
fn missing_file_gives_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = Config::load_from(&tmp.path().join("absent.toml")).expect("defaults");
    assert_eq!(config.account.country, None);
}

#[test]
fn malformed_file_is_an_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[account\ncountry = ").expect("write");
    assert!(Config::load_from(&path).is_err());
}
