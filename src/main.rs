use std::env;

use accessbot_config::Config;
use accessbot_runtime::{authority_from_config, check_authority, serve, Bot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: accessbot serve --config <path>");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match accessbot_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);

    if let Err(e) = run(cfg).await {
        error!("{e}");
        eprintln!("accessbot exited with error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(cfg: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log.level));

    let is_json = cfg.log.format == "json";
    let json_layer = is_json.then(|| tracing_subscriber::fmt::layer().json().flatten_event(true));
    let text_layer = (!is_json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

async fn run(cfg: Config) -> Result<(), String> {
    let authority = authority_from_config(&cfg.authority).map_err(|e| e.to_string())?;
    check_authority(authority.as_ref(), &cfg.authority.min_server_version)
        .await
        .map_err(|e| e.to_string())?;

    let cancel = CancellationToken::new();
    let bot = Bot::spawn(&cfg, authority, &cancel).map_err(|e| e.to_string())?;

    let listen_addr = cfg.server.listen_addr.clone();
    let state = bot.app_state();
    let server_cancel = cancel.clone();
    let mut server =
        tokio::spawn(async move { serve(&listen_addr, state, server_cancel).await });

    let mut server_result = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = bot.job.done() => {}
        res = &mut server => server_result = Some(res),
    }
    cancel.cancel();
    bot.job.done().await;
    let _ = bot.sweeper.await;

    let server_result = match server_result {
        Some(res) => res,
        None => server.await,
    };
    if let Some(err) = bot.job.err() {
        return Err(format!("watcher job failed: {err}"));
    }
    match server_result {
        Ok(res) => res,
        Err(e) => Err(format!("server task failed: {e}")),
    }
}
