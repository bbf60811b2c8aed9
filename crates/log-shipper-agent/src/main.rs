// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod adapter;

use anyhow::{anyhow, Context};
use std::{env, path::PathBuf, sync::Arc};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use log_shipper::{
    client::{ClientFactory, DeliveryClientFactory},
    config::{log_level::LogLevel, Config},
    controller::Controller,
    metrics::Metrics,
    router::Router,
};

use adapter::Adapter;

const CLUSTER_EVENT_CHANNEL_SIZE: usize = 1024;
const DEFAULT_CLIENT_NAME: &str = "default";

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config_path = env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    let settings = config.validate().context("validating configuration")?;

    init_tracing(settings.log_level)?;
    debug!("Logging subsystem enabled");

    let metrics = Arc::new(Metrics::new());
    let factory = Arc::new(DeliveryClientFactory::new(
        settings.client.clone(),
        Arc::clone(&metrics),
    ));
    let default_client = factory
        .create(DEFAULT_CLIENT_NAME, &settings.default_url)
        .context("creating default client")?;
    let controller = Arc::new(Controller::new(factory, settings.controller.clone()));
    let router = Arc::new(Router::new(
        settings.router,
        Some(Arc::clone(&controller)),
        default_client,
        Arc::clone(&metrics),
    ));

    let (events_tx, events_rx) = mpsc::channel(CLUSTER_EVENT_CHANNEL_SIZE);
    let mut sync = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.start(events_rx).await })
    };

    let adapter = Adapter::new(
        Arc::clone(&router),
        events_tx,
        settings.tag_key,
        Arc::clone(&metrics),
    );
    let input = adapter.run(BufReader::new(tokio::io::stdin()));
    tokio::pin!(input);

    info!("Log shipper started, default client at {}", settings.default_url);
    let mut synced = false;
    let result = loop {
        tokio::select! {
            read = &mut input => {
                break read.context("reading input");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break Ok(());
            }
            started = &mut sync, if !synced => {
                synced = true;
                match started {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(anyhow!(e).context("starting controller")),
                    Err(e) => break Err(anyhow!(e).context("controller task failed")),
                }
            }
        }
    };

    if !synced {
        sync.abort();
    }
    router.stop().await;

    match serde_json::to_string(&metrics.snapshot()) {
        Ok(snapshot) => info!("Final counters: {snapshot}"),
        Err(e) => error!("Failed to serialize counters: {e}"),
    }
    result
}

fn init_tracing(level: LogLevel) -> anyhow::Result<()> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", level.as_str());

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}
