use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_PORT: u16 = 6379;

/// Everything a `Server` needs to know before it binds.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to. Port 0 picks a free port.
    pub addr: SocketAddr,
    /// Connections accepted while this many are live are closed immediately.
    pub max_connections: usize,
    /// Budget for draining sessions on shutdown before they are force-closed.
    pub shutdown_timeout: Duration,
    /// Deadline for writing a single response to a client.
    pub write_timeout: Duration,
    /// Largest amount of buffered input a single request may occupy.
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 100,
            shutdown_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
