use crate::{output::S3Output, settings::Settings, store::S3Store, Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, RwLock},
};

/// Per-event acknowledgement callback supplied by the host pipeline. Fired
/// exactly once per publish call with the outcome.
pub trait Signaller: Send + Sync {
    fn signal(&self, result: &Result);
}

impl<F> Signaller for F
where
    F: Fn(&Result) + Send + Sync,
{
    fn signal(&self, result: &Result) {
        self(result)
    }
}

/// The surface the host pipeline drives a named output through.
#[async_trait]
pub trait Output: Send + Sync {
    async fn publish_event(&self, signaller: &dyn Signaller, data: &Value) -> Result;
    async fn close(&self) -> Result;
}

#[async_trait]
pub trait OutputFactory: Send + Sync {
    async fn build(&self, beat_name: &str, config: &mut Value) -> Result<Box<dyn Output>>;
}

static REGISTRY: LazyLock<RwLock<HashMap<String, Arc<dyn OutputFactory>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

pub fn register_output(name: impl ToString, factory: Arc<dyn OutputFactory>) {
    REGISTRY
        .write()
        .expect("output registry lock")
        .insert(name.to_string(), factory);
}

pub async fn create_output(
    name: &str,
    beat_name: &str,
    config: &mut Value,
) -> Result<Box<dyn Output>> {
    let factory = REGISTRY
        .read()
        .expect("output registry lock")
        .get(name)
        .cloned()
        .ok_or_else(|| Error::UnknownOutput(name.to_string()))?;
    factory.build(beat_name, config).await
}

pub fn register_builtin() {
    register_output("s3", Arc::new(S3OutputFactory));
}

pub struct S3OutputFactory;

#[async_trait]
impl OutputFactory for S3OutputFactory {
    async fn build(&self, beat_name: &str, config: &mut Value) -> Result<Box<dyn Output>> {
        // Events must arrive one at a time; batching in the host pipeline
        // is disabled before the output is handed back.
        disable_bulk(config);

        let settings: Settings = serde_json::from_value(config.clone())?;
        settings.validate()?;

        let store = S3Store::from_settings(&settings).await?;
        let output = S3Output::new(beat_name, settings, Arc::new(store)).await?;
        Ok(Box::new(output))
    }
}

pub fn disable_bulk(config: &mut Value) {
    if let Some(map) = config.as_object_mut() {
        map.insert("flush_interval".to_string(), Value::from(-1));
        map.insert("bulk_max_size".to_string(), Value::from(-1));
    }
}
