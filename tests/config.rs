use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use formcat::config::{Config, ConfigLoader};
use formcat::error::CatalogError;

#[test]
fn load_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("formcat.json");
    fs::write(
        &path,
        r#"{
            "schemaVersion": 1,
            "serverUrl": "https://forms.example.org/",
            "formListPath": "api/forms",
            "username": "enumerator",
            "password": "secret",
            "storageRoot": "/srv/forms",
            "hideOldVersions": true,
            "requestTimeoutSecs": 5,
            "downloadWorkers": 2
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(
        resolved.server.list_url(),
        "https://forms.example.org/api/forms"
    );
    let credentials = resolved.server.credentials.unwrap();
    assert_eq!(credentials.username, "enumerator");
    assert_eq!(credentials.password, "secret");
    assert_eq!(resolved.storage_root.unwrap(), "/srv/forms");
    assert!(resolved.hide_old_versions);
    assert_eq!(resolved.request_timeout, Duration::from_secs(5));
    assert_eq!(resolved.download_workers, 2);
}

#[test]
fn unreadable_path_is_config_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(CatalogError::ConfigRead(_))
    );
}

#[test]
fn malformed_json_is_config_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("formcat.json");
    fs::write(&path, "{ serverUrl: nope").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(CatalogError::ConfigParse(_))
    );
}

#[test]
fn validation_rules() {
    let missing_server = Config::default();
    assert_matches!(
        ConfigLoader::resolve_config(missing_server),
        Err(CatalogError::ConfigParse(_))
    );

    let orphan_password = Config {
        server_url: Some("https://forms.example.org".to_string()),
        password: Some("secret".to_string()),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(orphan_password),
        Err(CatalogError::ConfigParse(_))
    );

    let zero_timeout = Config {
        server_url: Some("https://forms.example.org".to_string()),
        request_timeout_secs: Some(0),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(zero_timeout),
        Err(CatalogError::ConfigParse(_))
    );

    let future_schema = Config {
        schema_version: Some(2),
        server_url: Some("https://forms.example.org".to_string()),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(future_schema),
        Err(CatalogError::ConfigParse(_))
    );
}
