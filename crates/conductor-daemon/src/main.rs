//! conductor-daemon: runs the engine behind the websocket server.
//!
//! On start the process snapshot is restored and enabled watches resume.
//! Ctrl-C stops watches, kills what is left running and writes a final
//! snapshot before exiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use conductor_core::{ConnectionRouter, Engine, EngineConfig};
use conductor_http::HttpState;

const TASK_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Parser, Debug)]
#[command(name = "conductor-daemon", version, about = "Process supervision and sync daemon")]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 7777)]
    port: u16,

    /// State directory (defaults to ~/.conductor)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Shell wrapper for commands, e.g. "/bin/bash -l -c"
    #[arg(long)]
    shell: Option<String>,

    /// Bearer token required on /ws
    #[arg(long, env = "CONDUCTOR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Kill a watch tick still running after this many seconds
    #[arg(long)]
    tick_timeout_secs: Option<u64>,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig, String> {
        let data_dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => EngineConfig::default_data_dir()?,
        };
        let mut config = EngineConfig {
            shell_prefix: self.shell.clone(),
            ..EngineConfig::default().with_data_dir(data_dir)
        };
        if let Some(secs) = self.tick_timeout_secs {
            config.default_tick_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested");
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match cli.engine_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to resolve data directory: {}", e);
            std::process::exit(1);
        }
    };
    let addr = match conductor_http::parse_addr(&cli.host, cli.port) {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Some(dir) = &config.data_dir {
        log::info!("Using data directory {}", dir.display());
    }
    let engine = Engine::new(config);
    engine.start();

    let sweeper = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TASK_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = engine.sweep_tasks();
                if removed > 0 {
                    log::debug!("Swept {} finished tasks", removed);
                }
            }
        })
    };

    let state = Arc::new(HttpState::new(ConnectionRouter::new(engine.clone())).with_auth_token(cli.token));
    if state.auth_token.is_none() {
        log::warn!("No auth token configured; /ws accepts any client");
    }

    let result = conductor_http::serve(state, addr, shutdown_signal()).await;

    sweeper.abort();
    engine.shutdown();

    if let Err(e) = result {
        log::error!("HTTP server error: {}", e);
        std::process::exit(1);
    }
}
