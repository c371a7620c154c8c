//! # Whisper Stream Server - Main Application Entry Point
//!
//! An HTTP server that streams speech-to-text results as Server-Sent Events,
//! keeping the Whisper model in memory only while it is in use.
//!
//! ## Commands:
//! - `serve` (default): Run the HTTP server
//! - `transcribe <AUDIO_PATH>`: One-shot transcription to stdout or a file
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config file, environment)
//! - **state**: Shared application state handed to every handler
//! - **lifecycle**: Activity lock, model manager and the idle reaper
//! - **transcription**: Event streaming on top of the speech model
//! - **audio**: Decoding, voice activity filtering and mel filters
//! - **handlers** / **health**: HTTP endpoints
//! - **middleware**: Authentication and request metrics
//! - **error**: HTTP and streaming error types

mod audio;
mod batch;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod lifecycle;
mod middleware;
mod state;
mod transcription;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::{Parser, Subcommand};
use crate::config::AppConfig;
use lifecycle::IdleReaper;
use state::AppState;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::whisper::WhisperLoader;

#[derive(Debug, Parser)]
#[command(name = "whisper-stream-server", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve {
        /// Overrides `server.host`
        #[arg(long)]
        host: Option<String>,
        /// Overrides `server.port`
        #[arg(long)]
        port: Option<u16>,
    },
    /// Transcribe one file and exit
    Transcribe(batch::TranscribeArgs),
}

#[actix_web::main]
async fn main() -> Result<ExitCode> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    });

    init_tracing(matches!(command, Command::Transcribe(_)));

    let mut config = AppConfig::load()?;

    match command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Transcribe(args) => {
            args.apply(&mut config);
            config.validate()?;
            let succeeded = batch::run(args, config, Arc::new(WhisperLoader)).await?;
            Ok(if succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

/// Run the HTTP server until a signal arrives or the idle reaper asks for
/// shutdown.
async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting whisper-stream-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Model '{}' ({}, device {}), unload after {}s idle, shutdown after {}",
        config.model.name,
        config.model.compute_type,
        config.model.device,
        config.lifecycle.unload_timeout_seconds,
        match config.lifecycle.shutdown_timeout_seconds {
            crate::config::SHUTDOWN_DISABLED => "never".to_string(),
            seconds => format!("{}s idle", seconds),
        }
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let max_upload_bytes = config.max_upload_bytes();
    let auth = config.auth.clone();
    if auth.password.is_none() {
        if auth.required {
            error!("Authentication is required but no password is configured; protected routes will fail");
        } else {
            info!("No password configured, endpoints are open");
        }
    }

    let reaper_settings = config.reaper_settings();
    let app_state = AppState::new(config, Arc::new(WhisperLoader), CancellationToken::new());
    let shutdown = app_state.shutdown.clone();

    let reaper = IdleReaper::new(
        Arc::clone(&app_state.activity),
        Arc::clone(&app_state.models),
        reaper_settings,
        shutdown.clone(),
    )
    .spawn();

    setup_signal_handlers(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Executed in reverse order: cors runs first
            .wrap(middleware::SharedSecretAuth::new(
                auth.password.clone(),
                auth.required,
            ))
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .wrap(cors)
            .configure(|cfg| handlers::routes(cfg, max_upload_bytes))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested, stopping server...");
            server_handle.stop(true).await;
        }
    }

    shutdown.cancel();
    if let Err(e) = reaper.await {
        error!("Idle reaper task failed: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Logs go to stderr for batch mode so stdout only carries JSON.
///
/// `RUST_LOG` controls the filter; defaults to
/// `whisper_stream_server=debug,actix_web=info`.
fn init_tracing(batch: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "whisper_stream_server=debug,actix_web=info".into());

    if batch {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                    (Err(e), _) | (_, Err(e)) => {
                        error!("Failed to install signal handlers: {}", e);
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        shutdown.cancel();
    });
}
