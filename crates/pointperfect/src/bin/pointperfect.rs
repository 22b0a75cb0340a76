//! PointPerfect correction client
//!
//! Usage:
//!   pointperfect -j /config/config.json -l
//!   pointperfect -i <client-id> -d certs/ --localized -g tcp://192.168.1.20:2101

use argh::FromArgs;
use tokio::sync::watch;

use pointperfect::{launch, logging, Args};

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let strings: Vec<&str> = argv.iter().map(String::as_str).collect();
    let command = strings.first().copied().unwrap_or("pointperfect");

    let args = match Args::from_args(&[command], strings.get(1..).unwrap_or_default()) {
        Ok(args) => args,
        Err(exit) => match exit.status {
            Ok(()) => {
                println!("{}", exit.output);
                return;
            }
            Err(()) => {
                eprintln!("{}", exit.output);
                std::process::exit(2);
            }
        },
    };

    if let Err(e) = logging::setup_logging(&args.log_options()) {
        eprintln!("Failed to open log file: {}", e);
        std::process::exit(1);
    }
    log::info!("{}", argv.join(" "));

    let launch = match launch::prepare(&args) {
        Ok(launch) => launch,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    }) {
        log::error!("Failed to install signal handler: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = launch.run(shutdown_rx).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
