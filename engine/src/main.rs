//! Release Engine - Entry Point
//!
//! Runs the engine as a service, or follows one job's progress with
//! `--follow=<kind>/<id>`.

use std::collections::HashMap;
use std::env;

use release_engine::app::options::AppOptions;
use release_engine::app::run::run;
use release_engine::client::follow::{self, follow, parse_target};
use release_engine::filesys::file::File;
use release_engine::logs::{init_logging, LogOptions};
use release_engine::storage::layout::StorageLayout;
use release_engine::storage::settings::Settings;
use release_engine::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return;
    }

    // Follow one job and exit
    if let Some(target) = cli_args.get("follow") {
        let (kind, id) = match parse_target(target) {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(2);
            }
        };
        let mut options = follow::Options::default();
        if let Some(server) = cli_args.get("server") {
            options.server_url = server.clone();
        }
        if let Err(e) = follow(&options, kind, id).await {
            eprintln!("{e}");
            std::process::exit(1);
        }
        return;
    }

    // Run the engine starting here

    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => StorageLayout::default_settings_file(),
    };
    let settings = match settings_file.read_json::<Settings>().await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file {:?}: {e}", settings_file.path());
            std::process::exit(1);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        file: settings.log_to_file,
        log_dir: StorageLayout::new(&settings.data_dir).logs_dir().path().to_path_buf(),
        json_format: settings.log_json,
        ..Default::default()
    };
    // flushes the log file on drop
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Run the engine
    let options = AppOptions::from_settings(settings);
    info!(
        "Running release engine on {}:{} with {} module(s)",
        options.server.host,
        options.server.port,
        options.settings.apps.len()
    );
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the release engine: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
