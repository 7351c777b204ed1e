// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! vidgate — RTSP→HLS video-ingest gateway
//!
//! Usage:
//!   vidgate serve --config vidgate.toml
//!   vidgate check --config vidgate.toml

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vidgate::api;
use vidgate::codec::gst::GstCodecFactory;
use vidgate::config::Config;
use vidgate::StreamGateway;

#[derive(Parser)]
#[command(name = "vidgate", about = "RTSP to HLS video-ingest gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway: supervisor core plus HTTP API.
    Serve {
        #[arg(short, long, default_value = "vidgate.toml")]
        config: PathBuf,
    },
    /// Load and validate a configuration file, print the effective values.
    Check {
        #[arg(short, long, default_value = "vidgate.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => {
            run_serve(config).await;
        }
        Command::Check { config } => {
            run_check(config);
        }
    }
}

async fn run_serve(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        hls_root = ?cfg.hls.root,
        target_fps = cfg.hls.target_fps,
        max_streams = cfg.limits.max_streams,
        workers = cfg.limits.worker_threads,
        "Starting vidgate"
    );

    let factory = match GstCodecFactory::new() {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!(error = %e, "Failed to initialize GStreamer");
            std::process::exit(1);
        }
    };

    let gateway = match StreamGateway::new(cfg.clone(), factory) {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "Failed to build gateway");
            std::process::exit(1);
        }
    };
    gateway.spawn_monitors();

    let state = Arc::new(api::AppState { gateway });

    if cfg.api.enabled {
        let api_state = state.clone();
        let port = cfg.api.port;
        tokio::spawn(async move {
            api::start_server(api_state, port).await;
        });
    }

    // Wait for CTRL+C.
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received CTRL+C, shutting down…");
        }
        Err(e) => {
            error!(error = %e, "Signal error");
        }
    }

    state.gateway.shutdown().await;
}

fn run_check(config_path: PathBuf) {
    match Config::from_file(&config_path) {
        Ok(cfg) => {
            println!("=== vidgate configuration ===");
            println!("HLS root        : {}", cfg.hls.root.display());
            println!("Target FPS      : {}", cfg.hls.target_fps);
            println!(
                "Segments        : {} s × {} in window",
                cfg.hls.segment_seconds, cfg.hls.playlist_window
            );
            println!("Max streams     : {}", cfg.limits.max_streams);
            println!("Worker threads  : {}", cfg.limits.worker_threads);
            println!("Startup spacing : {} ms", cfg.limits.startup_delay_ms);
            println!(
                "Reconnect       : base {} ms, cap {} ms",
                cfg.reconnect.base_delay_ms, cfg.reconnect.max_delay_ms
            );
            println!(
                "Health          : timeout {} ms, {} recycles, scan every {} ms",
                cfg.health.stream_timeout_ms, cfg.health.max_recycles, cfg.health.check_interval_ms
            );
            println!(
                "Metrics         : {} every {} ms",
                cfg.metrics.csv_path.display(),
                cfg.metrics.csv_interval_ms
            );
            println!(
                "API             : {} (port {})",
                if cfg.api.enabled { "enabled" } else { "disabled" },
                cfg.api.port
            );
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
