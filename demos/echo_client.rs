//! Fires a batch of framed calls at an echo server and reports each
//! transfer's outcome.
//!
//! Usage: `cargo run --example echo_client [addr] [count]`.

use std::time::Duration;

use trunkline::{
    ConfigBuilder, ConnectionId, DelimitedContext, Messenger, OutboundCall, UserCredentials,
};

fn main() -> Result<(), trunkline::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()
        .expect("invalid server address");
    let count: usize = args
        .next()
        .map(|n| n.parse().expect("invalid count"))
        .unwrap_or(10);

    let config = ConfigBuilder::new("echo-client").reactors(1).build()?;
    let messenger = Messenger::new(config)?;

    let (tx, rx) = crossbeam_channel::bounded(count);
    let conn_id = ConnectionId::new(addr, UserCredentials::new("demo"), 0);
    for i in 0..count {
        let tx = tx.clone();
        let payload = DelimitedContext::encode(format!("hello #{i}").as_bytes());
        let call = OutboundCall::new(conn_id.clone(), payload, Some(Duration::from_secs(5)))
            .on_completion(move |result| {
                let _ = tx.send((i, result));
            });
        messenger.queue_outbound_call(call);
    }

    for _ in 0..count {
        match rx.recv_timeout(Duration::from_secs(10)) {
            Ok((i, Ok(()))) => println!("call #{i}: transferred"),
            Ok((i, Err(err))) => println!("call #{i}: failed: {err}"),
            Err(_) => {
                eprintln!("timed out waiting for call completions");
                break;
            }
        }
    }

    let dump = messenger.dump_running_rpcs(Default::default())?;
    for conn in &dump.outbound_connections {
        println!(
            "connection to {}: negotiated={} queued={} kicks={}",
            conn.remote, conn.negotiated, conn.queued_transfers, conn.outbound_kicks
        );
    }

    messenger.shutdown();
    Ok(())
}
