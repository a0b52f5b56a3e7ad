use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::{error, Level};

use sluice::common::parse_addr;
use sluice::config::load_config;
use sluice::proxy::Proxy;
use sluice::server::bind_front;
use sluice::worker;
use sluice::{init_tracing, init_tracing_to_file};

/// Splice-based TCP reverse proxy: forwards each accepted client to a
/// backend named by the dispatcher feed.
#[derive(Parser)]
#[command(name = "sluice")]
struct Args {
    /// Fork worker processes sharing the listening socket
    #[arg(short = 'f')]
    fork: bool,
    /// Detach from the terminal; log to the configured log_file
    #[arg(short = 'd')]
    daemon: bool,
    /// Path to a YAML settings file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bind URL for the client-facing listener, e.g. 0.0.0.0:8080
    front: String,
    /// Dispatcher feed endpoints to pull backend URLs from
    #[arg(required = true)]
    feeds: Vec<String>,
}

fn main() {
    let args = Args::parse();

    let conf = match load_config(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sluice: config: {}", e);
            exit(1);
        }
    };

    let front_addr = match parse_addr(&args.front) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("sluice: front: {}", e);
            exit(1);
        }
    };
    let feeds: Vec<SocketAddr> = match args.feeds.iter().map(|u| parse_addr(u)).collect() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("sluice: feed: {}", e);
            exit(2);
        }
    };

    let front_sock = match bind_front(front_addr) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("sluice: bind({}) failed: {}", front_addr, e);
            exit(1);
        }
    };

    if args.daemon {
        if let Err(e) = worker::daemonize() {
            eprintln!("sluice: daemon: {}", e);
            exit(2);
        }
    }
    match (args.daemon, &conf.log_file) {
        (true, Some(path)) => {
            // no terminal left to complain to if this fails; run silent
            let _ = init_tracing_to_file(Level::TRACE, path);
        }
        _ => init_tracing(Level::TRACE),
    }
    if let Err(e) = worker::install_signal_handlers() {
        error!(err = %e, "signal setup failed");
        exit(2);
    }

    // Each worker owns an independent multiplexer and feed connections;
    // only the bound listener socket is shared.
    let run = || {
        let listener = match front_sock.try_clone() {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e, "listener clone failed");
                exit(1);
            }
        };
        let mut proxy = match Proxy::new(conf, listener, front_addr, feeds.clone()) {
            Ok(p) => p,
            Err(e) => {
                error!(err = %e, "proxy setup failed");
                exit(-1);
            }
        };
        if let Err(e) = proxy.run() {
            error!(err = %e, "proxy failed");
            exit(-1);
        }
    };
    if args.fork {
        worker::run_workers(conf.num_workers(), run);
    } else {
        run();
    }
}
