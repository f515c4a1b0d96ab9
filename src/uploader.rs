use crate::{chunk, store::ObjectStore, Error, Result};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs,
    sync::mpsc,
    time::{self, Instant},
};

pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

const CHUNKS_METRIC: &str = "s3_sink_chunks";

/// Builds the feeder/worker pair for one consumer. The queue is bounded to
/// one retry window of chunks so a stalled store applies backpressure to
/// the consumer instead of piling files up.
pub fn new(
    store: Arc<dyn ObjectStore>,
    app_type: String,
    prefix: String,
    chunk_duration: Duration,
    retry_limit: Duration,
) -> (Uploader, UploaderServer) {
    let capacity = queue_capacity(retry_limit, chunk_duration);
    tracing::debug!(%app_type, capacity, "computed upload queue capacity");

    let (sender, files) = mpsc::channel(capacity);
    let (trigger, listener) = triggered::trigger();

    metrics::register_counter!(CHUNKS_METRIC, "app_type" => app_type.clone(), "status" => "uploaded");

    (
        Uploader {
            sender,
            shutdown: trigger,
        },
        UploaderServer {
            files,
            shutdown: listener,
            store,
            app_type,
            prefix,
            retry_limit,
        },
    )
}

fn queue_capacity(retry_limit: Duration, chunk_duration: Duration) -> usize {
    let chunk_secs = chunk_duration.as_secs().max(1);
    retry_limit.as_secs().div_ceil(chunk_secs).max(1) as usize
}

pub fn object_key(prefix: &str, app_type: &str, timestamp: i64) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{app_type}/{timestamp}")
    } else {
        format!("{prefix}/{app_type}/{timestamp}")
    }
}

pub struct Uploader {
    sender: mpsc::Sender<PathBuf>,
    shutdown: triggered::Trigger,
}

impl Uploader {
    /// Blocks when the queue is full; that is the backpressure path.
    pub async fn enqueue(&self, file: PathBuf) -> Result {
        self.sender.send(file).await.map_err(|_| Error::channel())
    }

    /// Dropping the sender closes the queue; the trigger wakes any retry
    /// sleep so a failing upload is abandoned instead of served out.
    pub fn shutdown(self) {
        self.shutdown.trigger();
    }
}

pub struct UploaderServer {
    files: mpsc::Receiver<PathBuf>,
    shutdown: triggered::Listener,
    store: Arc<dyn ObjectStore>,
    app_type: String,
    prefix: String,
    retry_limit: Duration,
}

impl UploaderServer {
    pub async fn run(mut self) {
        tracing::debug!(app_type = %self.app_type, "uploader started");

        while let Some(file) = self.files.recv().await {
            if let Err(err) = self.try_upload(&file).await {
                tracing::error!(
                    app_type = %self.app_type,
                    %err,
                    "uploader exiting; chunks left on disk will be recovered on the next run"
                );
                break;
            }
        }

        tracing::debug!(app_type = %self.app_type, "uploader stopped");
    }

    /// Retries until the per-chunk budget runs out, then drops the chunk so
    /// the queue keeps moving. A shutdown during the retry sleep abandons
    /// the file on disk.
    async fn try_upload(&self, file: &Path) -> Result {
        if let Ok(meta) = fs::metadata(file).await {
            if meta.len() == 0 {
                tracing::warn!(file = %file.display(), "refusing to upload empty chunk");
                chunk::remove_file(file).await;
                return Ok(());
            }
        }

        let deadline = Instant::now() + self.retry_limit;
        loop {
            match self.put_chunk(file).await {
                Ok(()) => {
                    tracing::info!(
                        app_type = %self.app_type,
                        file = %file.display(),
                        "uploaded chunk"
                    );
                    metrics::increment_counter!(CHUNKS_METRIC, "app_type" => self.app_type.clone(), "status" => "uploaded");
                    chunk::remove_file(file).await;
                    return Ok(());
                }
                Err(err) => {
                    let now = Instant::now();
                    if now + RETRY_INTERVAL > deadline {
                        tracing::error!(
                            app_type = %self.app_type,
                            file = %file.display(),
                            %err,
                            "chunk failed to upload for too long, dropping it"
                        );
                        metrics::increment_counter!(CHUNKS_METRIC, "app_type" => self.app_type.clone(), "status" => "dropped");
                        chunk::remove_file(file).await;
                        return Ok(());
                    }

                    tracing::error!(
                        app_type = %self.app_type,
                        file = %file.display(),
                        %err,
                        "upload failed, retrying in {RETRY_INTERVAL:?}"
                    );
                    tokio::select! {
                        _ = self.shutdown.clone() => {
                            metrics::increment_counter!(CHUNKS_METRIC, "app_type" => self.app_type.clone(), "status" => "abandoned");
                            return Err(Error::UploadAbandoned);
                        }
                        _ = time::sleep(RETRY_INTERVAL) => (),
                    }
                }
            }
        }
    }

    async fn put_chunk(&self, file: &Path) -> Result {
        let mtime = chunk::mod_time(file).await?;
        let key = object_key(&self.prefix, &self.app_type, mtime.timestamp());
        tracing::debug!(
            app_type = %self.app_type,
            file = %file.display(),
            %key,
            "uploading chunk"
        );
        self.store.put(&key, file).await
    }
}
