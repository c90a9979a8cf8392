use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Configuration for a [`Messenger`](crate::Messenger) and its reactor pool.
#[derive(Clone, Debug)]
pub struct Config {
    /// Messenger name, used as the prefix for reactor thread names.
    pub name: String,
    /// Number of reactor threads. Connections are hashed across them.
    pub num_reactors: usize,
    /// Number of negotiation worker threads.
    pub negotiation_threads: usize,
    /// Inbound connections idle longer than this are reaped by the
    /// periodic scanner (strictly longer; an exactly-equal delta is kept).
    pub connection_keepalive_time: Duration,
    /// Period of the coarse timer tick that drives the idle scanner and
    /// the reactor's low-resolution clock.
    pub coarse_timer_granularity: Duration,
    /// Idle reaping for outbound connections. Accepted for symmetry with
    /// `connection_keepalive_time` but not enforced: keep-alive is a
    /// server-side policy. `None` by default.
    pub client_keepalive_time: Option<Duration>,
    /// Deadline for negotiating a new connection, both directions.
    pub rpc_negotiation_timeout: Duration,
    /// Upper bound on the per-remote connection index. The messenger may
    /// open up to this many parallel connections to one remote.
    pub num_connections_to_server: u8,
    /// Source address for outbound IPv4 sockets. Unspecified = no bind.
    pub outbound_address_v4: Ipv4Addr,
    /// Source address for outbound IPv6 sockets. Unspecified = no bind.
    pub outbound_address_v6: Ipv6Addr,
    /// When set, suppresses the family-matched outbound bind above and
    /// binds every outbound socket to this address instead.
    pub local_ip_for_outbound_sockets: Option<IpAddr>,
    /// Enable TCP_NODELAY on all connections (accepted and outbound).
    pub tcp_nodelay: bool,
    /// TCP listen backlog for acceptors.
    pub backlog: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "messenger".to_string(),
            num_reactors: 4,
            negotiation_threads: 4,
            connection_keepalive_time: Duration::from_secs(65),
            coarse_timer_granularity: Duration::from_millis(100),
            client_keepalive_time: None,
            rpc_negotiation_timeout: Duration::from_millis(3000),
            num_connections_to_server: 8,
            outbound_address_v4: Ipv4Addr::UNSPECIFIED,
            outbound_address_v6: Ipv6Addr::UNSPECIFIED,
            local_ip_for_outbound_sockets: None,
            tcp_nodelay: true,
            backlog: 128,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is
    /// out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.name.is_empty() {
            return Err(crate::error::Error::InvalidConfig(
                "messenger name must not be empty".into(),
            ));
        }
        if self.num_reactors == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "num_reactors must be > 0".into(),
            ));
        }
        if self.negotiation_threads == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "negotiation_threads must be > 0".into(),
            ));
        }
        if self.coarse_timer_granularity.is_zero() {
            return Err(crate::error::Error::InvalidConfig(
                "coarse_timer_granularity must be > 0".into(),
            ));
        }
        if self.connection_keepalive_time.is_zero() {
            return Err(crate::error::Error::InvalidConfig(
                "connection_keepalive_time must be > 0".into(),
            ));
        }
        if self.num_connections_to_server == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "num_connections_to_server must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use trunkline::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new("my-client")
///     .reactors(2)
///     .connection_keepalive_time(Duration::from_secs(60))
///     .coarse_timer_granularity(Duration::from_secs(1))
///     .num_connections_to_server(1)
///     .build()
///     .expect("invalid config");
/// ```
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values and the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let config = Config {
            name: name.into(),
            ..Config::default()
        };
        Self { config }
    }

    // ── Pool sizes ───────────────────────────────────────────────────

    /// Set the number of reactor threads.
    pub fn reactors(mut self, n: usize) -> Self {
        self.config.num_reactors = n;
        self
    }

    /// Set the number of negotiation worker threads.
    pub fn negotiation_threads(mut self, n: usize) -> Self {
        self.config.negotiation_threads = n;
        self
    }

    // ── Timing ───────────────────────────────────────────────────────

    /// Set the inbound idle keep-alive time.
    pub fn connection_keepalive_time(mut self, d: Duration) -> Self {
        self.config.connection_keepalive_time = d;
        self
    }

    /// Set the coarse timer tick period.
    pub fn coarse_timer_granularity(mut self, d: Duration) -> Self {
        self.config.coarse_timer_granularity = d;
        self
    }

    /// Set the (currently unenforced) outbound idle keep-alive time.
    pub fn client_keepalive_time(mut self, d: Duration) -> Self {
        self.config.client_keepalive_time = Some(d);
        self
    }

    /// Set the connection negotiation deadline.
    pub fn rpc_negotiation_timeout(mut self, d: Duration) -> Self {
        self.config.rpc_negotiation_timeout = d;
        self
    }

    // ── Connection settings ──────────────────────────────────────────

    /// Set the per-remote parallel connection fan-out.
    pub fn num_connections_to_server(mut self, n: u8) -> Self {
        self.config.num_connections_to_server = n;
        self
    }

    /// Set the source address for outbound IPv4 sockets.
    pub fn outbound_address_v4(mut self, addr: Ipv4Addr) -> Self {
        self.config.outbound_address_v4 = addr;
        self
    }

    /// Set the source address for outbound IPv6 sockets.
    pub fn outbound_address_v6(mut self, addr: Ipv6Addr) -> Self {
        self.config.outbound_address_v6 = addr;
        self
    }

    /// Bind every outbound socket to this address, suppressing the
    /// family-matched outbound addresses above.
    pub fn local_ip_for_outbound_sockets(mut self, addr: IpAddr) -> Self {
        self.config.local_ip_for_outbound_sockets = Some(addr);
        self
    }

    /// Enable or disable TCP_NODELAY on all connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Set the TCP listen backlog for acceptors.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_reactors_rejected() {
        let err = ConfigBuilder::new("m").reactors(0).build().unwrap_err();
        assert!(err.is_invalid_config());
    }

    #[test]
    fn zero_granularity_rejected() {
        let err = ConfigBuilder::new("m")
            .coarse_timer_granularity(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.is_invalid_config());
    }

    #[test]
    fn zero_index_range_rejected() {
        let err = ConfigBuilder::new("m")
            .num_connections_to_server(0)
            .build()
            .unwrap_err();
        assert!(err.is_invalid_config());
    }
}
