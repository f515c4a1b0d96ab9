use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use s3_sink::{plugin, Settings};
use serde_json::Value;
use std::path::PathBuf;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, clap::Parser)]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Ships log events to an S3 bucket as time-sliced, per-application chunks")]
pub struct Cli {
    /// Optional configuration file to use. If present the toml file at the
    /// given path will be loaded. Environment variables can override the
    /// settings in the given file.
    #[clap(short = 'c')]
    config: Option<PathBuf>,

    /// Name this sink reports to the host pipeline.
    #[clap(long, default_value = env!("CARGO_PKG_NAME"))]
    name: String,

    #[clap(subcommand)]
    cmd: Cmd,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let settings = Settings::new(self.config.as_ref())?;
        tracing_subscriber::registry()
            .with(EnvFilter::new(settings.log.clone()))
            .with(tracing_subscriber::fmt::layer())
            .init();
        self.cmd.run(&self.name, settings).await
    }
}

#[derive(Debug, clap::Subcommand)]
pub enum Cmd {
    Server(Server),
}

impl Cmd {
    pub async fn run(&self, name: &str, settings: Settings) -> Result<()> {
        match self {
            Self::Server(cmd) => cmd.run(name, settings).await,
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct Server {}

impl Server {
    pub async fn run(&self, name: &str, settings: Settings) -> Result<()> {
        // Install the prometheus metrics exporter when configured
        if let Some(addr) = settings.metrics {
            if let Err(err) = PrometheusBuilder::new().with_http_listener(addr).install() {
                tracing::error!(?err, "failed to install prometheus scrape endpoint");
            } else {
                tracing::info!(%addr, "metrics scrape endpoint listening");
            }
        }

        // configure shutdown trigger
        let (shutdown_trigger, shutdown) = triggered::trigger();
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => shutdown_trigger.trigger(),
                _ = signal::ctrl_c() => shutdown_trigger.trigger(),
            }
        });

        plugin::register_builtin();
        let mut config = serde_json::to_value(&settings)?;
        let output = plugin::create_output("s3", name, &mut config).await?;

        tracing::info!(name, "s3 sink started, reading events from stdin");

        let signaller = |_result: &s3_sink::Result| {};
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = shutdown.clone() => break,
                line = lines.next_line() => match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => match serde_json::from_str::<Value>(&line) {
                        Ok(event) => {
                            if let Err(err) = output.publish_event(&signaller, &event).await {
                                tracing::warn!(%err, "event rejected");
                            }
                        }
                        Err(err) => tracing::warn!(%err, "ignoring malformed event"),
                    },
                    None => break,
                },
            }
        }

        tracing::info!("shutting down, draining consumers");
        output.close().await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.run().await
}
