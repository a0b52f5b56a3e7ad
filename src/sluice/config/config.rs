use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::sluice::common::{Error, Result};

/// Capacity of the anonymous kernel pipes used as staging buffers.
/// Socket buffers are sized so that one splice round fills exactly one pipe.
pub const PIPE_SIZE: usize = 524288;

/// Maximum readiness notifications consumed per multiplexer wait.
pub const MAX_EVENTS: usize = 64;

/// Longest backend URL the dispatcher feed may deliver.
pub const MAX_BACKEND_URL: usize = 128;

/// Hard cap on a single feed line; the remainder of a longer line is
/// discarded but the capped message is still delivered so it fails the
/// MAX_BACKEND_URL check exactly once.
pub const MAX_FEED_LINE: usize = 1024;

#[derive(Deserialize)]
pub struct Settings {
    /// listen_backlog is the accept queue depth requested for front sockets
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// set_buffer_sizes tunes SO_RCVBUF/SO_SNDBUF on channel sockets so one
    /// pipe round fills exactly. Default true.
    #[serde(default = "default_true")]
    pub set_buffer_sizes: bool,
    /// nodelay_front enables TCP_NODELAY on accepted client sockets
    #[serde(default = "default_true")]
    pub nodelay_front: bool,
    /// nodelay_back enables TCP_NODELAY on backend sockets
    #[serde(default = "default_true")]
    pub nodelay_back: bool,
    /// max_tunnels caps concurrent tunnels; the listener pauses at the cap.
    /// 0 derives the cap from RLIMIT_NOFILE/2 after raising the soft limit
    /// to the hard limit.
    #[serde(default)]
    pub max_tunnels: u32,
    /// feed_reconnect_ms is the flat interval between reconnect attempts to
    /// a lost dispatcher feed endpoint. Default 1000.
    #[serde(default = "default_feed_reconnect_ms")]
    pub feed_reconnect_ms: u64,
    /// feed_recv_buffer bounds the bytes of backend URLs buffered from the
    /// dispatcher feed; reading pauses while the queue is at the bound.
    /// Default 32768.
    #[serde(default = "default_feed_recv_buffer")]
    pub feed_recv_buffer: usize,
    /// workers is the number of children forked with -f. 0 means one per
    /// CPU. Default 2.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// log_file receives log output once the process is daemonized and the
    /// terminal is gone. Unset discards logs in daemon mode.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

const fn default_listen_backlog() -> i32 { 8192 }
const fn default_true() -> bool { true }
const fn default_feed_reconnect_ms() -> u64 { 1000 }
const fn default_feed_recv_buffer() -> usize { 32768 }
const fn default_workers() -> u32 { 2 }

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_backlog: default_listen_backlog(),
            set_buffer_sizes: true,
            nodelay_front: true,
            nodelay_back: true,
            max_tunnels: 0,
            feed_reconnect_ms: default_feed_reconnect_ms(),
            feed_recv_buffer: default_feed_recv_buffer(),
            workers: default_workers(),
            log_file: None,
        }
    }
}

impl Settings {
    pub fn num_workers(&self) -> u32 {
        if self.workers == 0 {
            num_cpus::get() as u32
        } else {
            self.workers
        }
    }

    fn validate(mut self) -> Result<Self> {
        if self.feed_reconnect_ms == 0 {
            self.feed_reconnect_ms = default_feed_reconnect_ms();
        }
        if self.feed_recv_buffer < MAX_FEED_LINE {
            self.feed_recv_buffer = default_feed_recv_buffer();
        }
        if self.listen_backlog <= 0 {
            return Err(Error::new("listen_backlog must be positive"));
        }
        Ok(self)
    }
}

/// Load settings from the given YAML file, from ./sluice.yaml if present,
/// or fall back to the defaults. The result is leaked: settings live for
/// the whole process, like the rest of the engine's shared state.
pub fn load_config(path: Option<&Path>) -> Result<&'static Settings> {
    let conf = match path {
        Some(p) => {
            info!(config_path = %p.to_string_lossy(), "loading config file");
            serde_yaml::from_reader::<_, Settings>(File::open(p)?)?
        }
        None => {
            let p = Path::new("sluice.yaml");
            if p.exists() {
                info!(config_path = %p.to_string_lossy(), "found config file");
                serde_yaml::from_reader::<_, Settings>(File::open(p)?)?
            } else {
                Settings::default()
            }
        }
    };
    Ok(&*Box::leak(Box::new(conf.validate()?)))
}
