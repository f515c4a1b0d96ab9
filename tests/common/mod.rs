#![allow(dead_code)]

use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use s3_sink::{Error, ObjectStore, Result, Settings};
use serde_json::{json, Value};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone)]
pub struct PutRecord {
    pub key: String,
    pub body: Vec<u8>,
}

/// Recording stand-in for the object store. Can be told to fail every call,
/// optionally after a delay, to exercise the retry and shutdown paths.
pub struct MockStore {
    puts: Mutex<Vec<PutRecord>>,
    attempts: AtomicUsize,
    fail: bool,
    delay: Duration,
}

impl MockStore {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            puts: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail: false,
            delay: Duration::ZERO,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            puts: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail: true,
            delay: Duration::ZERO,
        })
    }

    pub fn failing_after(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            puts: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail: true,
            delay,
        })
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.puts.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn put(&self, key: &str, file: &Path) -> Result {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(Error::Io(std::io::Error::other("injected upload failure")));
        }
        let body = tokio::fs::read(file).await?;
        self.puts.lock().unwrap().push(PutRecord {
            key: key.to_string(),
            body,
        });
        Ok(())
    }
}

pub fn test_settings(dir: &Path) -> Settings {
    Settings {
        access_key_id: None,
        secret_access_key: None,
        region: "us-east-1".to_string(),
        bucket: "chunks".to_string(),
        prefix: "p".to_string(),
        endpoint: None,
        temporary_directory: dir.to_path_buf(),
        seconds_per_chunk: 3600,
        retry_limit_seconds: 60,
        log: "s3_sink=info".to_string(),
        metrics: None,
    }
}

pub fn event(app_type: &str, message: &str) -> Value {
    json!({"message": message, "fields": {"appType": app_type}})
}

pub async fn gzip(data: &[u8]) -> Vec<u8> {
    use async_compression::tokio::write::GzipEncoder;
    use tokio::io::AsyncWriteExt;

    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(data).await.expect("gzip write");
    encoder.shutdown().await.expect("gzip close");
    encoder.into_inner()
}

pub async fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzipDecoder::new(bytes)
        .read_to_end(&mut out)
        .await
        .expect("valid gzip");
    out
}

pub async fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.expect("read dir");
    while let Some(entry) = entries.next_entry().await.expect("dir entry") {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names
}

pub async fn dir_is_empty(dir: &Path) -> bool {
    dir_entries(dir).await.is_empty()
}
