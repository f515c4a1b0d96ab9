use crate::{
    consumer::{Consumer, ConsumerHandle},
    event::{self, ConsumerOptions},
    plugin::{Output, Signaller},
    settings::Settings,
    store::ObjectStore,
    Error, Result,
};
use async_trait::async_trait;
use futures::future;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    fs::DirBuilder,
    sync::{mpsc, Mutex, RwLock},
};

/// Routes events to per-appType consumers, constructing them lazily on
/// first sight of a routing key.
pub struct S3Output {
    beat_name: String,
    settings: Settings,
    store: Arc<dyn ObjectStore>,
    consumers: RwLock<HashMap<String, ConsumerHandle>>,
    closing: AtomicBool,
    // Held for the whole drain so a racing close returns only after the
    // in-flight drain has finished.
    close_lock: Mutex<()>,
}

impl S3Output {
    pub async fn new(
        beat_name: impl ToString,
        settings: Settings,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        settings.validate()?;

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        builder.mode(0o700);
        builder.create(&settings.temporary_directory).await?;
        tracing::info!(
            dir = %settings.temporary_directory.display(),
            "created directory for temporary chunk files"
        );

        Ok(Self {
            beat_name: beat_name.to_string(),
            settings,
            store,
            consumers: RwLock::new(HashMap::new()),
            closing: AtomicBool::new(false),
            close_lock: Mutex::new(()),
        })
    }

    pub fn beat_name(&self) -> &str {
        &self.beat_name
    }

    /// Accepts one event, routing its message to the consumer for its app
    /// type. The signaller fires exactly once per call, success or not.
    pub async fn publish_event(&self, signaller: &dyn Signaller, data: &Value) -> Result {
        let res = self.publish(data).await;
        signaller.signal(&res);
        res
    }

    async fn publish(&self, data: &Value) -> Result {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::Closing);
        }

        let options = event::extract_options(data)?;
        let message = event::extract_message(data)?.to_owned();

        // Send outside the map lock: a consumer under backpressure must
        // never hold routing up for every other app type, nor block close.
        let sender = self.line_sender(options).await?;
        sender.send(message).await.map_err(|_| Error::channel())
    }

    async fn line_sender(&self, options: ConsumerOptions) -> Result<mpsc::Sender<String>> {
        {
            let consumers = self.consumers.read().await;
            if let Some(handle) = consumers.get(&options.app_type) {
                self.warn_on_conflict(handle, &options);
                return Ok(handle.sender());
            }
        }

        // Construction creates files, sweeps leftovers and spawns tasks, so
        // it runs under the writer lock with a re-check.
        let mut consumers = self.consumers.write().await;
        if let Some(handle) = consumers.get(&options.app_type) {
            self.warn_on_conflict(handle, &options);
            return Ok(handle.sender());
        }

        let app_type = options.app_type.clone();
        let handle = Consumer::spawn(&self.settings, options, Arc::clone(&self.store)).await?;
        let sender = handle.sender();
        consumers.insert(app_type, handle);
        Ok(sender)
    }

    fn warn_on_conflict(&self, handle: &ConsumerHandle, options: &ConsumerOptions) {
        if handle.rule_conflicts(options) {
            tracing::warn!(
                app_type = %options.app_type,
                "event carries a timestamp rule that differs from the consumer's, keeping the first-seen rule"
            );
        }
    }

    /// Shuts every consumer down and waits for their uploads to drain or be
    /// abandoned. Safe to call more than once; a repeat or concurrent call
    /// returns only once the in-flight drain has finished.
    pub async fn close(&self) -> Result {
        self.closing.store(true, Ordering::SeqCst);

        let _drain = self.close_lock.lock().await;

        let handles: Vec<(String, ConsumerHandle)> =
            self.consumers.write().await.drain().collect();

        // Signal every consumer before waiting on any of them; one stuck
        // uploader must not delay the stop signal to the rest.
        let mut draining = Vec::with_capacity(handles.len());
        for (app_type, handle) in handles {
            tracing::info!(%app_type, "waiting for consumer to drain");
            draining.push((app_type, handle.signal_shutdown()));
        }

        let (app_types, joins): (Vec<_>, Vec<_>) = draining.into_iter().unzip();
        for (app_type, result) in app_types.iter().zip(future::join_all(joins).await) {
            if let Err(err) = result {
                tracing::error!(%app_type, ?err, "consumer task failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Output for S3Output {
    async fn publish_event(&self, signaller: &dyn Signaller, data: &Value) -> Result {
        S3Output::publish_event(self, signaller, data).await
    }

    async fn close(&self) -> Result {
        S3Output::close(self).await
    }
}
