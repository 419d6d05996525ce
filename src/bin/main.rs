use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::*;

use fedmarket::{
    evaluation::NoOpEvaluator,
    notifications::InMemoryNotifier,
    sessions::SessionManager,
    settings::Settings,
    storage::InMemoryStore,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        log: log_settings,
        protocol: protocol_settings,
        pricing: pricing_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let store = InMemoryStore::new();
    let notifier = InMemoryNotifier::new();
    let _manager = SessionManager::new(
        store.clone(),
        store,
        notifier,
        NoOpEvaluator,
        protocol_settings,
        pricing_settings,
    );
    info!("session manager ready");

    // Sessions are driven by their own spawned coordinator tasks; the main
    // task only keeps the runtime alive until interrupted.
    let _ = signal::ctrl_c().await;
    warn!("shutting down: interrupt received");
}
