//! Relay server entrypoint.
//!
//! `RUST_LOG` controls verbosity via `env_logger`.

use clap::Parser;
use log::{error, info};

use tandem_collab::server::{CollabServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "tandem-server", about = "Multi-room relay for tandem")]
struct Args {
    /// Listen address; a bare `:port` binds every interface.
    #[arg(long, default_value = ":8084")]
    addr: String,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    info!("starting relay on {}", args.addr);
    let server = CollabServer::new(ServerConfig {
        bind_addr: args.addr,
        ..ServerConfig::default()
    });

    if let Err(e) = server.run().await {
        error!("server exited: {e}");
        std::process::exit(1);
    }
}
