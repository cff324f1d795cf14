use std::env;

use switchboard_config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: switchboard serve --config <path>\n       switchboard verify-audit <path>";

fn init_logging(cfg: &Config) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.as_str()));

    match cfg.logging.format.as_str() {
        "pretty" => tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .pretty()
            .init(),
        "json" => tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .json()
            .init(),
        _ => tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .compact()
            .init(),
    }
}

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();

    match cmd.as_str() {
        "serve" => {
            let mut config_path = String::from("./config/example-config.yaml");
            while let Some(arg) = args.next() {
                if arg == "--config" {
                    if let Some(v) = args.next() {
                        config_path = v;
                    }
                }
            }
            serve(&config_path).await;
        }
        "verify-audit" => {
            let Some(path) = args.next() else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            match switchboard_server::verify_audit_chain(&path) {
                Ok(report) => println!("{report}"),
                Err(e) => {
                    eprintln!("audit verification failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn serve(config_path: &str) {
    let cfg = match switchboard_config::load_and_validate(config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    init_logging(&cfg);
    info!(
        event_name = "server.starting",
        config_path,
        ack_mode = %cfg.server.ack_mode,
        store = %cfg.store.kind,
        responder = %cfg.responder.kind,
        "starting switchboard"
    );

    if let Err(e) = switchboard_server::serve(cfg).await {
        error!(event_name = "server.failed", error = %e, "server exited with error");
        std::process::exit(1);
    }
}
