//! Local port pair allocation for temporary instances.
//!
//! Every call probes fresh candidates: there is no shared counter or
//! reservation file. Two concurrent runs can still race between our probe and
//! the server's own bind; that window is accepted rather than locked around.

use crate::error::{Error, Result};
use rand::Rng;
use std::net::TcpListener;

/// Ports browsers refuse to connect to (X11 and IRC). Served front-ends on
/// these would be unreachable from a browser-driving step.
pub const BROWSER_BLOCKED_PORTS: &[u16] = &[6000, 6566, 6665, 6666, 6667, 6668, 6669, 6697];

pub const DEFAULT_MAX_ATTEMPTS: usize = 200;

#[derive(Debug, Clone)]
pub struct PortAllocator {
    low: u16,
    high: u16,
    max_attempts: usize,
}

impl PortAllocator {
    /// Allocator over the inclusive range `low..=high`.
    pub fn new(low: u16, high: u16) -> Self {
        Self {
            low,
            high,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn range(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    /// Two distinct ports that were both bindable at the instant of the
    /// check, as `(front_port, back_port)`.
    pub fn allocate_pair(&self) -> Result<(u16, u16)> {
        if self.low == 0 || self.high <= self.low {
            return Err(Error::PortAllocation(format!(
                "invalid port range {}-{}",
                self.low, self.high
            )));
        }

        let mut rng = rand::thread_rng();
        for attempt in 1..=self.max_attempts {
            let front = rng.gen_range(self.low..=self.high);
            let back = rng.gen_range(self.low..=self.high);
            if front == back || is_browser_blocked(front) || is_browser_blocked(back) {
                continue;
            }
            if is_port_available(front) && is_port_available(back) {
                tracing::debug!(front, back, attempt, "Allocated port pair");
                return Ok((front, back));
            }
        }

        Err(Error::PortAllocation(format!(
            "no free port pair in {}-{} after {} attempts",
            self.low, self.high, self.max_attempts
        )))
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(6000, 7000)
    }
}

pub fn is_browser_blocked(port: u16) -> bool {
    BROWSER_BLOCKED_PORTS.contains(&port)
}

/// Bind-and-release on both loopback and the wildcard address. On macOS a
/// loopback bind can succeed while `0.0.0.0` is taken, so both must pass.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_pair_distinct_and_free() {
        let allocator = PortAllocator::default();
        let (front, back) = allocator.allocate_pair().unwrap();
        assert_ne!(front, back);
        assert!((6000..=7000).contains(&front));
        assert!((6000..=7000).contains(&back));
        assert!(!is_browser_blocked(front));
        assert!(!is_browser_blocked(back));
        assert!(is_port_available(front));
        assert!(is_port_available(back));
    }

    #[test]
    fn test_occupied_port_is_not_available() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port));
        drop(listener);
    }

    #[test]
    fn test_exhausted_range_fails() {
        // Every pair in a two-port range includes the held port.
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let allocator = PortAllocator::new(port, port.saturating_add(1)).with_max_attempts(20);
        let err = allocator.allocate_pair().unwrap_err();
        assert!(matches!(err, Error::PortAllocation(_)));
    }

    #[test]
    fn test_invalid_range() {
        assert!(PortAllocator::new(7000, 7000).allocate_pair().is_err());
        assert!(PortAllocator::new(0, 10).allocate_pair().is_err());
    }

    #[test]
    fn test_blocked_ports() {
        assert!(is_browser_blocked(6667));
        assert!(is_browser_blocked(6000));
        assert!(!is_browser_blocked(6001));
    }
}
