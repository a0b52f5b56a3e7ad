use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::{error, Level};

use sluice::common::parse_addr;
use sluice::config::load_config;
use sluice::echo::EchoServer;
use sluice::server::bind_front;
use sluice::worker;
use sluice::{init_tracing, init_tracing_to_file};

/// Splice-based TCP echo server: every connection is tunnelled back to
/// itself through a kernel pipe.
#[derive(Parser)]
#[command(name = "sluice-echo")]
struct Args {
    /// Fork worker processes sharing the listening sockets
    #[arg(short = 'f')]
    fork: bool,
    /// Detach from the terminal; log to the configured log_file
    #[arg(short = 'd')]
    daemon: bool,
    /// Path to a YAML settings file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bind URLs to listen on, e.g. 127.0.0.1:9000
    #[arg(required = true)]
    urls: Vec<String>,
}

fn main() {
    let args = Args::parse();

    let conf = match load_config(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sluice-echo: config: {}", e);
            exit(1);
        }
    };

    let addrs: Vec<SocketAddr> = match args.urls.iter().map(|u| parse_addr(u)).collect() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("sluice-echo: {}", e);
            exit(1);
        }
    };
    let mut fronts = Vec::new();
    for addr in addrs {
        match bind_front(addr) {
            Ok(s) => fronts.push((s, addr)),
            Err(e) => {
                eprintln!("sluice-echo: bind({}) failed: {}", addr, e);
                exit(1);
            }
        }
    }

    if args.daemon {
        if let Err(e) = worker::daemonize() {
            eprintln!("sluice-echo: daemon: {}", e);
            exit(2);
        }
    }
    match (args.daemon, &conf.log_file) {
        (true, Some(path)) => {
            let _ = init_tracing_to_file(Level::TRACE, path);
        }
        _ => init_tracing(Level::TRACE),
    }
    if let Err(e) = worker::install_signal_handlers() {
        error!(err = %e, "signal setup failed");
        exit(2);
    }

    let run = || {
        let mut listeners = Vec::new();
        for (sock, addr) in &fronts {
            match sock.try_clone() {
                Ok(s) => listeners.push((s, *addr)),
                Err(e) => {
                    error!(err = %e, "listener clone failed");
                    exit(1);
                }
            }
        }
        let mut server = match EchoServer::new(conf, listeners) {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e, "echo setup failed");
                exit(-1);
            }
        };
        if let Err(e) = server.run() {
            error!(err = %e, "echo failed");
            exit(-1);
        }
    };
    if args.fork {
        worker::run_workers(conf.num_workers(), run);
    } else {
        run();
    }
}
