use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};

use tracing::{info, warn};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Cleared by INT/TERM; every engine loop re-checks it around its wait.
pub fn running() -> bool {
    !SHUTDOWN.load(Relaxed)
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, SeqCst);
}

/// INT and TERM stop the engine; PIPE, USR1 and USR2 are ignored so a
/// dying peer or an operator poke cannot kill the process. Installed
/// before forking so workers inherit the wiring.
pub fn install_signal_handlers() -> io::Result<()> {
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
            SHUTDOWN.store(true, SeqCst)
        })?;
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            SHUTDOWN.store(true, SeqCst)
        })?;
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGUSR1, libc::SIG_IGN);
        libc::signal(libc::SIGUSR2, libc::SIG_IGN);
    }
    Ok(())
}

/// Detach from the terminal. The working directory is kept (relative
/// paths in the config keep meaning); stdio is pointed at /dev/null, so
/// logging must already have been redirected.
pub fn daemonize() -> io::Result<()> {
    if unsafe { libc::daemon(1, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fork `count` workers, each running `run` over its own multiplexer and
/// feed connections (only the bound listener socket is shared). The
/// parent supervises: it forwards TERM once shutdown is requested and
/// reaps children as they exit.
pub fn run_workers<F: Fn()>(count: u32, run: F) {
    let mut children: Vec<libc::pid_t> = Vec::new();
    for _ in 0..count {
        match unsafe { libc::fork() } {
            -1 => {
                warn!(err = %io::Error::last_os_error(), "fork failed");
            }
            0 => {
                run();
                std::process::exit(0);
            }
            pid => children.push(pid),
        }
    }

    let mut kill_sent = false;
    while !children.is_empty() {
        if !running() && !kill_sent {
            kill_sent = true;
            for &pid in &children {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
            }
        }
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // interrupted by the shutdown signal: loop to forward it
                Some(libc::EINTR) => continue,
                _ => break,
            }
        }
        info!(pid, status, "worker exited");
        children.retain(|&p| p != pid);
    }
}
