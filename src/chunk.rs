use crate::Result;
use async_compression::tokio::write::GzipEncoder;
use chrono::{DateTime, Utc};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
};

/// A current chunk: the one open file a consumer appends to.
#[derive(Debug)]
pub struct ChunkFile {
    file: File,
    path: PathBuf,
}

impl ChunkFile {
    /// Mints a fresh `<appType>_<unixNanos>.log` in `dir`. Never reuses or
    /// truncates an existing file; the nanosecond clock keeps names
    /// monotonic within a process.
    pub async fn create(dir: &Path, app_type: &str) -> Result<Self> {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .expect("nanosecond timestamp in range");
        let path = dir.join(format!("{app_type}_{nanos}.log"));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await?;
        tracing::info!(path = %path.display(), "created new chunk file");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn size(&self) -> Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    pub async fn append_line(&mut self, line: &str) -> Result {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn sync(&self) -> Result {
        Ok(self.file.sync_all().await?)
    }
}

/// Sets atime and mtime so a chunk's upload key follows the embedded event
/// time rather than the wall clock.
pub fn set_mod_time(path: &Path, time: DateTime<Utc>) -> io::Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    let time = std::time::SystemTime::from(time);
    file.set_times(
        std::fs::FileTimes::new()
            .set_accessed(time)
            .set_modified(time),
    )
}

pub async fn mod_time(path: &Path) -> Result<DateTime<Utc>> {
    Ok(fs::metadata(path).await?.modified()?.into())
}

/// Closes and unlinks without failing; a file that is already gone is not
/// worth reporting.
pub async fn remove_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => (),
        Err(err) => tracing::error!(path = %path.display(), ?err, "failed to remove file"),
    }
}

/// Seals a chunk into a sibling `.gz`, carrying the source mtime over, then
/// removes the source. A failed encode removes the partial `.gz` and leaves
/// the source intact for the leftover sweep.
pub async fn compress_file(path: &Path) -> Result<PathBuf> {
    let gz_path = compressed_path(path);
    tracing::info!(path = %path.display(), "compressing chunk");
    match write_gzip(path, &gz_path).await {
        Ok(mtime) => {
            if let Err(err) = set_mod_time(&gz_path, mtime) {
                tracing::error!(
                    path = %gz_path.display(),
                    ?err,
                    "failed to carry mtime onto compressed chunk"
                );
            }
            remove_file(path).await;
            Ok(gz_path)
        }
        Err(err) => {
            remove_file(&gz_path).await;
            Err(err)
        }
    }
}

async fn write_gzip(source: &Path, gz_path: &Path) -> Result<DateTime<Utc>> {
    let mut source_file = File::open(source).await?;
    let mtime: DateTime<Utc> = source_file.metadata().await?.modified()?.into();

    let gz_file = File::create(gz_path).await?;
    let mut encoder = GzipEncoder::new(BufWriter::new(gz_file));
    tokio::io::copy(&mut source_file, &mut encoder).await?;
    encoder.shutdown().await?;
    encoder.into_inner().into_inner().sync_all().await?;

    Ok(mtime)
}

fn compressed_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".gz");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::bufread::GzipDecoder;
    use tokio::io::AsyncReadExt;

    async fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzipDecoder::new(bytes)
            .read_to_end(&mut out)
            .await
            .expect("valid gzip");
        out
    }

    #[tokio::test]
    async fn mints_unique_chunk_files() {
        let tmp_dir = tempfile::tempdir().expect("temp dir");

        let first = ChunkFile::create(tmp_dir.path(), "app1").await.expect("chunk");
        let second = ChunkFile::create(tmp_dir.path(), "app1").await.expect("chunk");

        assert_ne!(first.path(), second.path());
        let name = first.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("app1_"));
        assert!(name.ends_with(".log"));
        assert_eq!(0, first.size().await.expect("size"));
    }

    #[tokio::test]
    async fn appends_lines_with_newline() {
        let tmp_dir = tempfile::tempdir().expect("temp dir");

        let mut chunk = ChunkFile::create(tmp_dir.path(), "app1").await.expect("chunk");
        chunk.append_line("one").await.expect("append");
        chunk.append_line("two").await.expect("append");
        chunk.sync().await.expect("sync");

        let content = std::fs::read(chunk.path()).expect("read chunk");
        assert_eq!(b"one\ntwo\n".to_vec(), content);
    }

    #[tokio::test]
    async fn compression_replaces_source_and_keeps_mtime() {
        let tmp_dir = tempfile::tempdir().expect("temp dir");

        let mut chunk = ChunkFile::create(tmp_dir.path(), "app1").await.expect("chunk");
        chunk.append_line("hello").await.expect("append");
        chunk.sync().await.expect("sync");

        let source = chunk.path().to_path_buf();
        let stamp = DateTime::parse_from_rfc3339("2023-10-01T12:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        set_mod_time(&source, stamp).expect("set mtime");

        let gz = compress_file(&source).await.expect("compress");

        assert!(!source.exists());
        assert!(gz.exists());
        assert_eq!(
            stamp.timestamp(),
            mod_time(&gz).await.expect("mtime").timestamp()
        );
        let body = std::fs::read(&gz).expect("read gz");
        assert_eq!(b"hello\n".to_vec(), gunzip(&body).await);
    }

    #[tokio::test]
    async fn compressing_missing_source_fails_cleanly() {
        let tmp_dir = tempfile::tempdir().expect("temp dir");
        let source = tmp_dir.path().join("app1_1.log");

        assert!(compress_file(&source).await.is_err());
        assert!(!tmp_dir.path().join("app1_1.log.gz").exists());
    }

    #[tokio::test]
    async fn mod_time_roundtrips_through_set() {
        let tmp_dir = tempfile::tempdir().expect("temp dir");
        let path = tmp_dir.path().join("app1_1.log");
        std::fs::write(&path, b"x").expect("write");

        let stamp = DateTime::parse_from_rfc3339("2021-06-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        set_mod_time(&path, stamp).expect("set mtime");

        assert_eq!(
            stamp.timestamp(),
            mod_time(&path).await.expect("mtime").timestamp()
        );
    }
}
