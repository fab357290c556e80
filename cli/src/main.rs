use std::process::exit;
use std::time::Duration;

use cumulus::{Broker, BrokerConfig};
use tracing::info;

fn usage() -> ! {
    eprintln!(
        "usage: cli [options]  (cumulus broker)\n\
         \n\
         options:\n\
           --addr <host:port>       listen address (default 0.0.0.0:45000)\n\
           --url <host:port>        address advertised to cloud peers\n\
           --seeds <url;url;...>    existing cloud members to join\n\
           --password <secret>      require this password from clients\n\
           --workers <n>            request workers per client (default 3)\n\
           --time-ordered           deliver strictly in arrival order\n\
           --no-udp                 do not offer a UDP port"
    );
    exit(2);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut addr = String::from("0.0.0.0:45000");
    let mut url = String::new();
    let mut seeds = String::new();
    let mut password = String::new();
    let mut workers = 3usize;
    let mut time_ordered = false;
    let mut udp = true;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--addr" => addr = args.next().unwrap_or_else(|| usage()),
            "--url" => url = args.next().unwrap_or_else(|| usage()),
            "--seeds" => seeds = args.next().unwrap_or_else(|| usage()),
            "--password" => password = args.next().unwrap_or_else(|| usage()),
            "--workers" => {
                workers = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage())
            }
            "--time-ordered" => time_ordered = true,
            "--no-udp" => udp = false,
            "--help" | "-h" => usage(),
            other => {
                eprintln!("unknown option {other}");
                usage();
            }
        }
    }

    let config = BrokerConfig::builder()
        .addr(addr)
        .advertised_url(url)
        .cloud_seeds(seeds)
        .password(password)
        .workers(workers)
        .time_ordered(time_ordered)
        .udp(udp)
        .build();

    let broker = match Broker::start(config).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("broker failed to start: {e}");
            exit(1);
        }
    };
    info!(url = %broker.url(), "running, ctrl-c to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("signal handling failed: {e}");
            // fall through to an orderly stop anyway
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    broker.shutdown().await;
}
