//! Remote manager configuration.

use std::str::FromStr;
use std::time::Duration;

/// Ports tried, in order, when binding with port 0 and a range is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpPortRange {
    pub start: u16,
    pub count: u16,
    /// Upper bound on bind attempts.
    pub tries: u32,
}

impl TcpPortRange {
    pub fn new(start: u16, count: u16, tries: u32) -> Self {
        Self {
            start,
            count,
            tries,
        }
    }

    /// Candidate ports, capped by both `count` and `tries`, never past 65535.
    pub fn ports(&self) -> impl Iterator<Item = u16> + use<> {
        let start = self.start;
        let end = start.saturating_add(self.count.saturating_sub(1));
        let take = if self.count == 0 { 0 } else { self.tries as usize };
        (start..=end).take(take)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Largest frame accepted from a peer or sent to one.
    pub max_frame_length: usize,
    pub connect_timeout: Duration,
    /// How long an accepted connection may take to announce itself.
    pub handshake_timeout: Duration,
    /// How long `close()` waits for background tasks.
    pub shutdown_timeout: Duration,
    pub nodelay: bool,
    pub port_range: Option<TcpPortRange>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_frame_length: 16 * 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            nodelay: true,
            port_range: None,
        }
    }
}

impl RemoteConfig {
    /// Defaults overridden by `TETHER_*` environment variables.
    ///
    /// Only called by binaries and wiring code; the manager itself never
    /// reads the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            parse_var::<u64>(&lookup, name)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let port_range = match parse_var::<u16>(&lookup, "TETHER_TCP_PORT_RANGE_START") {
            Some(start) => {
                let count = parse_var::<u16>(&lookup, "TETHER_TCP_PORT_RANGE_COUNT").unwrap_or(1000);
                let tries = parse_var::<u32>(&lookup, "TETHER_TCP_PORT_RANGE_TRY_COUNT")
                    .unwrap_or(u32::from(count));
                Some(TcpPortRange::new(start, count, tries))
            }
            None => None,
        };

        Self {
            max_frame_length: parse_var(&lookup, "TETHER_MAX_FRAME_BYTES")
                .unwrap_or(defaults.max_frame_length),
            connect_timeout: millis("TETHER_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            handshake_timeout: millis("TETHER_HANDSHAKE_TIMEOUT_MS", defaults.handshake_timeout),
            shutdown_timeout: millis("TETHER_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout),
            nodelay: parse_var(&lookup, "TETHER_TCP_NODELAY").unwrap_or(defaults.nodelay),
            port_range,
        }
    }

    pub fn with_port_range(mut self, range: TcpPortRange) -> Self {
        self.port_range = Some(range);
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}
