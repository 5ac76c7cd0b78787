//! State shared by every transport task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::blacklist::AddressBlacklist;
use crate::config::ServerConfig;
use crate::pool::PacketPool;
use crate::rate_limit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::token::RetryTokenIssuer;

/// Everything the receive task, process loop and send task share.
///
/// Built once per server and handed around behind an `Arc`, so two servers in
/// one process (as in the tests) never see each other's state.
#[derive(Debug)]
pub struct TransportContext {
    pub config: ServerConfig,
    pub registry: ConnectionRegistry,
    pub blacklist: AddressBlacklist,
    pub limiter: RateLimiter,
    pub tokens: RetryTokenIssuer,
    pub pool: PacketPool,
    pub counters: Counters,
    running: AtomicBool,
}

impl TransportContext {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(
                config.max_connections,
                config.max_connections_per_address,
            ),
            blacklist: AddressBlacklist::new(config.blacklist_ttl()),
            limiter: RateLimiter::new(config.rate_limit_per_second, config.rate_limit_burst),
            tokens: RetryTokenIssuer::new(config.token_ttl()),
            pool: PacketPool::new(config.max_packet_size),
            counters: Counters::default(),
            running: AtomicBool::new(true),
            config,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Traffic totals, updated by the I/O tasks.
#[derive(Debug, Default)]
pub struct Counters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
}

impl Counters {
    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_follows_config() {
        let mut config = ServerConfig::default();
        config.max_connections = 1;
        let context = TransportContext::new(config);
        assert!(context.is_running());
        assert_eq!(context.pool.buffer_size(), 1200);
        assert_eq!(context.limiter.capacity(), 65.0);

        let addr = "127.0.0.1:9000".parse().unwrap();
        let now = std::time::Instant::now();
        assert!(context
            .registry
            .admit_pending(addr, context.config.connecting_timeout(), now)
            .is_ok());
        assert!(context
            .registry
            .admit_pending("127.0.0.2:9000".parse().unwrap(), context.config.connecting_timeout(), now)
            .is_err());
    }

    #[test]
    fn test_stop() {
        let context = TransportContext::new(ServerConfig::default());
        context.stop();
        assert!(!context.is_running());
    }

    #[test]
    fn test_counters() {
        let counters = Counters::default();
        counters.record_received(100);
        counters.record_received(20);
        counters.record_sent(64);
        counters.record_dropped();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.packets_received, 2);
        assert_eq!(snapshot.bytes_received, 120);
        assert_eq!(snapshot.packets_sent, 1);
        assert_eq!(snapshot.bytes_sent, 64);
        assert_eq!(snapshot.packets_dropped, 1);
    }
}
