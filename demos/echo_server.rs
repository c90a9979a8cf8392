//! Length-delimited echo server on a trunkline messenger.
//!
//! Usage: `cargo run --example echo_server [addr]` (default 127.0.0.1:7878).

use std::time::Duration;

use trunkline::{ConfigBuilder, Messenger};

fn main() -> Result<(), trunkline::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()
        .expect("invalid listen address");

    let config = ConfigBuilder::new("echo-server")
        .reactors(2)
        .connection_keepalive_time(Duration::from_secs(65))
        .coarse_timer_granularity(Duration::from_secs(1))
        .build()?;
    let messenger = Messenger::new(config)?;
    let local = messenger.add_acceptor(addr)?;
    println!("echo server listening on {local}");

    loop {
        std::thread::sleep(Duration::from_secs(5));
        let metrics = messenger.metrics()?;
        let inbound: usize = metrics.iter().map(|m| m.num_server_connections).sum();
        println!("{inbound} inbound connections");
    }
}
