use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

/// Number of parallel dial workers.
pub(crate) const DEFAULT_DIAL_TASKS: usize = 15;
/// Overall deadline for one outbound dial, handshake included.
pub(crate) const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Retry interval for peers that answered "too many peers".
pub(crate) const DEFAULT_DIAL_BUSY_INTERVAL: Duration = Duration::from_secs(60);
/// Buffer size of the member-event channel; overflow drops events.
pub(crate) const EVENT_BUFFER: usize = 20;
/// Buffer size of the user dial queue.
pub(crate) const DIAL_QUEUE_BUFFER: usize = 20;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Client name advertised in the hello message.
    pub name: String,
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    /// Port the listener binds to.
    pub bind_port: u16,
    /// Maximum number of simultaneously connected peers.
    pub max_peers: usize,
    /// Addresses dialed at startup, in addition to the peer store contents.
    pub bootnodes: Vec<String>,
    /// Number of parallel dial workers.
    pub dial_tasks: usize,
    /// Deadline for one outbound dial.
    pub dial_timeout: Duration,
    /// Retry interval for busy peers.
    pub dial_busy_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: concat!("devp2p-rs/", env!("CARGO_PKG_VERSION")).to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 30303,
            max_peers: 10,
            bootnodes: Vec::new(),
            dial_tasks: DEFAULT_DIAL_TASKS,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            dial_busy_interval: DEFAULT_DIAL_BUSY_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Sets the advertised client name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the listener bind address.
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Sets the listener port.
    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    /// Sets the peer limit.
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Adds startup dial targets.
    pub fn with_bootnodes(mut self, bootnodes: impl IntoIterator<Item = String>) -> Self {
        self.bootnodes.extend(bootnodes);
        self
    }

    /// Sets the number of dial workers.
    pub fn with_dial_tasks(mut self, tasks: usize) -> Self {
        self.dial_tasks = tasks.max(1);
        self
    }

    /// Sets the busy-retry interval.
    pub fn with_dial_busy_interval(mut self, interval: Duration) -> Self {
        self.dial_busy_interval = interval;
        self
    }

    /// The socket address the listener binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }
}
