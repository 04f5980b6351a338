use super::*;
use crate::registry::Language;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_empty_document_uses_defaults() {
    let config = ConfigLoader::from_str("").unwrap();
    assert_eq!(config.control.bind_addr, "0.0.0.0:443");
    assert_eq!(config.binding.bind_addr, "0.0.0.0:2076");
    assert_eq!(config.runtime.workdir, "/app");
    assert!(config.control.tls.is_none());
    assert_eq!(config.control.auth_timeout().as_secs(), 10);
}

#[test]
fn test_partial_document_keeps_other_defaults() {
    let yaml = r#"
control:
  bind_addr: "127.0.0.1:9443"
  tls:
    cert: "CA/server.pem"
    key: "CA/server.key"
runtime:
  images:
    go: "golang:1.22"
"#;
    let config = ConfigLoader::from_str(yaml).unwrap();
    assert_eq!(config.control.bind_addr, "127.0.0.1:9443");
    assert_eq!(config.control.key_file.to_str(), Some("login.key"));
    assert_eq!(config.runtime.images.for_language(Language::Go), "golang:1.22");
    assert_eq!(
        config.runtime.images.for_language(Language::Python3),
        "python:3.10-slim"
    );
    assert!(config.control.tls.is_some());
}

#[test]
fn test_invalid_bind_addr_is_rejected() {
    let err = ConfigLoader::from_str("binding:\n  bind_addr: \"not-an-addr\"\n").unwrap_err();
    assert!(err.to_string().contains("binding.bind_addr"));
}

#[test]
fn test_relative_workdir_is_rejected() {
    let err = ConfigLoader::from_str("runtime:\n  workdir: \"app\"\n").unwrap_err();
    assert!(err.to_string().contains("workdir"));
}

#[tokio::test]
async fn test_from_file_resolves_relative_paths() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runhub.yaml");
    std::fs::write(&path, "storage:\n  program_dir: \"store\"\n").unwrap();

    let config = ConfigLoader::from_file(&path).await.unwrap();
    assert_eq!(config.storage.program_dir, dir.path().join("store"));
    assert_eq!(config.control.key_file, dir.path().join("login.key"));
}

#[tokio::test]
async fn test_read_key_takes_first_token() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "s3cret trailing words").unwrap();
    let key = ConfigLoader::read_key(file.path()).await.unwrap();
    assert_eq!(key, "s3cret");
}

#[tokio::test]
async fn test_read_key_rejects_empty_file() {
    let file = NamedTempFile::new().unwrap();
    assert!(ConfigLoader::read_key(file.path()).await.is_err());
}
