// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, path::PathBuf, process::ExitCode, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use datakit_io::{
    batcher::Outputs,
    config::{self, Config, DEFAULT_CONFIG_FILE},
    dataway::heartbeat::Heartbeat,
    election::{Candidate, ElectionState},
    filter::pull::LogFilterPuller,
    inputs::InputRegistry,
    io::IoService,
    logger::Formatter,
    sink::SinkRegistry,
    stats::Stats,
};

const CONFIG_PATH_VAR: &str = "DATAKIT_CONFIG";

fn init_logging(config: &Config) -> Result<(), String> {
    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,reqwest=off,{}",
        config.log_level.as_directive()
    );
    let filter = EnvFilter::try_new(env_filter).map_err(|e| e.to_string())?;
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|e| e.to_string())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_PATH_VAR).ok())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
    let config = config::get_config(&path);

    if let Err(e) = init_logging(&config) {
        eprintln!("Failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    if let Err(e) = config.validate() {
        error!("Invalid configuration in {}: {}", path.display(), e);
        return ExitCode::FAILURE;
    }
    let config = Arc::new(config);

    let stats = Arc::new(Stats::default());
    let outputs = match Outputs::from_config(&config, &SinkRegistry::with_builtin(), stats) {
        Ok(outputs) => outputs,
        Err(e) => {
            error!("Failed to build delivery outputs: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let election = ElectionState::new();
    let (service, io) = match IoService::new(
        Arc::clone(&config),
        outputs.clone(),
        election.clone(),
        cancel.clone(),
    ) {
        Ok(built) => built,
        Err(e) => {
            error!("Failed to build the io pipeline: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let pipeline = tokio::spawn(service.run());

    let candidate = if config.election.enable {
        match outputs.dataway.clone() {
            Some(dataway) => {
                let candidate = Candidate::new(&config, dataway, election);
                Some(tokio::spawn(candidate.run(cancel.clone())))
            }
            None => {
                warn!("Election enabled without a dataway, staying follower");
                None
            }
        }
    } else {
        None
    };

    let mut control = tokio::task::JoinSet::new();
    if let Some(dataway) = outputs.dataway.clone() {
        control.spawn(Heartbeat::new(&config, dataway.clone()).run(cancel.clone()));
        let puller = LogFilterPuller::new(
            dataway,
            io.filters().clone(),
            config.dataway.logfilter_interval,
        );
        control.spawn(puller.run(cancel.clone()));
    }

    let mut inputs = InputRegistry::with_builtin().start(&config, &io, &cancel);
    info!(
        "datakit-agent {} started on {}",
        datakit_io::DATAKIT_IO_VERSION,
        config.hostname
    );

    shutdown_signal().await;
    info!("Shutting down");
    cancel.cancel();

    while let Some(joined) = inputs.join_next().await {
        if let Err(e) = joined {
            error!("Input task failed: {}", e);
        }
    }
    while let Some(joined) = control.join_next().await {
        if let Err(e) = joined {
            error!("Dataway control task failed: {}", e);
        }
    }
    if let Some(candidate) = candidate {
        if let Err(e) = candidate.await {
            error!("Election task failed: {}", e);
        }
    }
    drop(io);
    if let Err(e) = pipeline.await {
        error!("Pipeline task failed: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
