//! Thin demo binary wiring up a [`sixcore::server::Server`] from a
//! config file path given on the command line. The core is a library;
//! this binary exists to exercise it end-to-end and as a template for
//! embedders.

use std::env;

use sixcore::config::Config;
use sixcore::server::Server;

#[tokio::main]
async fn main() {
    let config_path = env::args().nth(1).unwrap_or_else(|| "sixcore.yaml".to_string());

    let config = Config::load_from_yaml(&config_path).unwrap_or_else(|e| {
        panic!("failed to load configuration from {config_path}: {e}");
    });

    let Some(server_config) = config.servers.into_iter().next() else {
        panic!("configuration defines no servers");
    };

    let server = Server::new(server_config);
    let log_file = server.log_file("main", "sixcore.log");
    log_file.init_env_logger();

    log::info!("sixcore starting up");

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    log::info!("shutdown signal received");
    server.shutdown(std::time::Duration::from_secs(30)).await;
}
