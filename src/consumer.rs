use crate::{
    chunk::{self, ChunkFile},
    event::ConsumerOptions,
    settings::Settings,
    store::ObjectStore,
    uploader::{self, Uploader},
    Error, Result,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    fs,
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

/// Client half of a consumer. The dispatcher feeds lines through it and
/// tears the consumer down on close.
#[derive(Debug)]
pub struct ConsumerHandle {
    lines: mpsc::Sender<String>,
    timestamp_regex: Option<String>,
    timestamp_format: Option<String>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn sender(&self) -> mpsc::Sender<String> {
        self.lines.clone()
    }

    /// The first event seen for an app type fixes its timestamp rule; a
    /// later event naming a different rule is routed unchanged.
    pub fn rule_conflicts(&self, options: &ConsumerOptions) -> bool {
        let specified =
            options.timestamp_regex.is_some() || options.timestamp_format.is_some();
        specified
            && (options.timestamp_regex != self.timestamp_regex
                || options.timestamp_format != self.timestamp_format)
    }

    /// Signals the consumer to stop by closing its line channel, without
    /// waiting. The returned handle resolves once the consumer has drained
    /// its uploads or abandoned them.
    pub fn signal_shutdown(self) -> JoinHandle<()> {
        let Self { lines, join, .. } = self;
        drop(lines);
        join
    }

    /// Closes the line channel and waits for the consumer to drain its
    /// uploads or abandon them.
    pub async fn shutdown(self) {
        if let Err(err) = self.signal_shutdown().await {
            tracing::error!(?err, "consumer task failed");
        }
    }
}

#[derive(Debug)]
struct TimestampRule {
    regex: Regex,
    format: String,
}

impl TimestampRule {
    fn compile(regex: Option<String>, format: Option<String>) -> Result<Option<Self>> {
        match (regex, format) {
            (None, _) => Ok(None),
            (Some(_), None) => Err(Error::IncompleteTimestampRule),
            (Some(regex), Some(format)) => Ok(Some(Self {
                regex: Regex::new(&regex)?,
                format,
            })),
        }
    }

    fn line_timestamp(&self, line: &str) -> Result<DateTime<Utc>> {
        let raw = self
            .regex
            .find(line)
            .ok_or(Error::MissingTimestamp)?
            .as_str();
        match DateTime::parse_from_str(raw, &self.format) {
            Ok(timestamp) => Ok(timestamp.with_timezone(&Utc)),
            // Formats without a zone parse as naive timestamps, taken as UTC.
            Err(_) => Ok(NaiveDateTime::parse_from_str(raw, &self.format)?.and_utc()),
        }
    }
}

/// The single-writer actor for one app type. Owns the current chunk file,
/// the rotation ticker and the feeder queue to its uploader.
pub struct Consumer {
    app_type: String,
    dir: PathBuf,
    chunk_duration: Duration,
    chunk_start: DateTime<Utc>,
    rule: Option<TimestampRule>,
    lines: mpsc::Receiver<String>,
    current: Option<ChunkFile>,
    uploader: Uploader,
    upload_task: JoinHandle<()>,
}

impl Consumer {
    /// Builds the consumer and spawns its event loop. Construction starts
    /// the uploader, sweeps chunks left over by a previous run, then mints
    /// the first current chunk.
    pub async fn spawn(
        settings: &Settings,
        options: ConsumerOptions,
        store: Arc<dyn ObjectStore>,
    ) -> Result<ConsumerHandle> {
        let timestamp_regex = options.timestamp_regex.clone();
        let timestamp_format = options.timestamp_format.clone();

        let (lines, consumer) = Consumer::new(settings, options, store).await?;
        let join = tokio::spawn(consumer.run());

        Ok(ConsumerHandle {
            lines,
            timestamp_regex,
            timestamp_format,
            join,
        })
    }

    async fn new(
        settings: &Settings,
        options: ConsumerOptions,
        store: Arc<dyn ObjectStore>,
    ) -> Result<(mpsc::Sender<String>, Self)> {
        let ConsumerOptions {
            app_type,
            timestamp_regex,
            timestamp_format,
        } = options;

        let rule = TimestampRule::compile(timestamp_regex, timestamp_format)?;

        let (uploader, upload_server) = uploader::new(
            store,
            app_type.clone(),
            settings.prefix.clone(),
            settings.chunk_duration(),
            settings.retry_limit(),
        );
        let upload_task = tokio::spawn(upload_server.run());

        let (lines_tx, lines_rx) = mpsc::channel(1);

        let mut consumer = Self {
            app_type,
            dir: settings.temporary_directory.clone(),
            chunk_duration: settings.chunk_duration(),
            chunk_start: Utc::now(),
            rule,
            lines: lines_rx,
            current: None,
            uploader,
            upload_task,
        };

        consumer.sweep_leftovers().await?;
        consumer.current =
            Some(ChunkFile::create(&consumer.dir, &consumer.app_type).await?);

        Ok((lines_tx, consumer))
    }

    async fn run(mut self) {
        tracing::debug!(app_type = %self.app_type, "consumer started");

        let mut ticker = time::interval_at(
            time::Instant::now() + self.chunk_duration,
            self.chunk_duration,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.rotate(false).await {
                        tracing::error!(
                            app_type = %self.app_type,
                            %err,
                            "rotation failed, keeping current chunk"
                        );
                    }
                }
                line = self.lines.recv() => match line {
                    Some(line) => {
                        if let Err(err) = self.append(&line).await {
                            tracing::error!(app_type = %self.app_type, %err, "failed to append line");
                        }
                    }
                    None => break,
                }
            }
        }

        if let Err(err) = self.rotate(true).await {
            tracing::error!(
                app_type = %self.app_type,
                %err,
                "final rotation failed, chunk left for recovery"
            );
        }
        self.uploader.shutdown();
        tracing::info!(app_type = %self.app_type, "waiting for uploads to complete");
        if let Err(err) = (&mut self.upload_task).await {
            tracing::error!(app_type = %self.app_type, ?err, "uploader task failed");
        }
    }

    async fn append(&mut self, line: &str) -> Result {
        let timestamp = match self.line_timestamp(line) {
            Ok(timestamp) => timestamp,
            Err(err) => {
                tracing::warn!(
                    app_type = %self.app_type,
                    %err,
                    "proceeding without a line timestamp"
                );
                None
            }
        };

        if let Some(timestamp) = timestamp {
            if timestamp < self.chunk_start || timestamp > self.chunk_start + self.window() {
                if let Err(err) = self.rotate(false).await {
                    tracing::error!(
                        app_type = %self.app_type,
                        %err,
                        "rotation failed, appending to current chunk"
                    );
                }
                self.chunk_start = timestamp;
            }
        }

        let current = self.ensure_current().await?;
        current.append_line(line).await?;

        if let Some(timestamp) = timestamp {
            if let Err(err) = chunk::set_mod_time(current.path(), timestamp) {
                tracing::error!(app_type = %self.app_type, ?err, "failed to stamp chunk mtime");
            }
        }

        Ok(())
    }

    /// Seals the current chunk, hands the compressed result to the
    /// uploader, and unless shutting down mints the next chunk. Any error
    /// before the hand-off leaves the current chunk in place; the next tick
    /// retries.
    async fn rotate(&mut self, shutting_down: bool) -> Result {
        let Some(current) = self.current.as_ref() else {
            // A failed mint on a previous rotation leaves no current chunk;
            // recreate it so appends have somewhere to land.
            if !shutting_down {
                self.current = Some(ChunkFile::create(&self.dir, &self.app_type).await?);
            }
            return Ok(());
        };

        if current.size().await? == 0 {
            tracing::info!(app_type = %self.app_type, "chunk is empty, not uploading");
            if shutting_down {
                if let Some(empty) = self.current.take() {
                    chunk::remove_file(empty.path()).await;
                }
            }
            return Ok(());
        }

        current.sync().await?;
        let compressed = chunk::compress_file(current.path()).await?;
        // The source file is gone once compression succeeds; release the
        // stale handle before queueing the result.
        self.current = None;
        self.uploader.enqueue(compressed).await?;

        if !shutting_down {
            self.current = Some(ChunkFile::create(&self.dir, &self.app_type).await?);
        }

        Ok(())
    }

    /// Reclaims chunks written by a previous process: torn compressions are
    /// redone, finished `.gz` files and recompressed `.log` files go
    /// straight into the upload queue, empty chunks are unlinked.
    async fn sweep_leftovers(&self) -> Result {
        let file_prefix = format!("{}_", self.app_type);

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&file_prefix) || !name.ends_with(".log.gz") {
                continue;
            }
            let gz_path = entry.path();
            let log_path = gz_path.with_extension("");
            if fs::metadata(&log_path).await.is_ok() {
                // The uncompressed sibling survived, so the compression may
                // have been torn. Drop the .gz and recompress below.
                tracing::info!(
                    path = %gz_path.display(),
                    "removing possibly torn compressed chunk"
                );
                chunk::remove_file(&gz_path).await;
            } else {
                tracing::info!(
                    app_type = %self.app_type,
                    path = %gz_path.display(),
                    "found leftover compressed chunk, uploading it"
                );
                self.uploader.enqueue(gz_path).await?;
            }
        }

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&file_prefix) || !name.ends_with(".log") {
                continue;
            }
            let path = entry.path();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::error!(
                        path = %path.display(),
                        ?err,
                        "skipping unreadable leftover chunk"
                    );
                    continue;
                }
            };
            if meta.len() == 0 {
                tracing::debug!(path = %path.display(), "deleting empty leftover chunk");
                chunk::remove_file(&path).await;
                continue;
            }
            match chunk::compress_file(&path).await {
                Ok(gz_path) => {
                    tracing::info!(
                        app_type = %self.app_type,
                        path = %path.display(),
                        "found non-empty leftover chunk, uploading it"
                    );
                    self.uploader.enqueue(gz_path).await?;
                }
                Err(err) => {
                    tracing::error!(
                        path = %path.display(),
                        %err,
                        "skipping leftover chunk that failed to compress"
                    );
                }
            }
        }

        Ok(())
    }

    async fn ensure_current(&mut self) -> Result<&mut ChunkFile> {
        if self.current.is_none() {
            self.current = Some(ChunkFile::create(&self.dir, &self.app_type).await?);
        }
        // Unwrap is safe because the chunk is created above when missing.
        Ok(self.current.as_mut().unwrap())
    }

    fn line_timestamp(&self, line: &str) -> Result<Option<DateTime<Utc>>> {
        match &self.rule {
            None => Ok(None),
            Some(rule) => rule.line_timestamp(line).map(Some),
        }
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.chunk_duration.as_secs() as i64)
    }
}
