//! Per-address connection accounting.
//!
//! Entries are created by the verification path and counted up/down per
//! connection. Only the periodic sweep deletes entries, and only once their
//! count has returned to zero.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Normalized registry key. IPv4-mapped IPv6 addresses collapse to IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpKey {
    V4(u32),
    V6([u8; 16]),
}

impl IpKey {
    pub fn from_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::V4(u32::from(v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::V4(u32::from(v4)),
                None => Self::V6(v6.octets()),
            },
        }
    }
}

/// Accounting record for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpData {
    /// Normalized address.
    pub address: IpAddr,
    /// Live verified connections from this address.
    pub connection_count: u32,
}

#[derive(Default)]
pub struct IpRegistry {
    entries: Mutex<HashMap<IpKey, IpData>>,
}

impl IpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, addr: IpAddr) -> Option<IpData> {
        self.entries.lock().get(&IpKey::from_addr(addr)).cloned()
    }

    /// Look up or insert the entry for `addr`.
    pub fn create(&self, addr: IpAddr) -> IpData {
        let mut entries = self.entries.lock();
        entries
            .entry(IpKey::from_addr(addr))
            .or_insert_with(|| IpData {
                address: normalize(addr),
                connection_count: 0,
            })
            .clone()
    }

    /// Find-or-create and count one more connection. Returns the new count.
    pub fn acquire(&self, addr: IpAddr) -> u32 {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(IpKey::from_addr(addr))
            .or_insert_with(|| IpData {
                address: normalize(addr),
                connection_count: 0,
            });
        entry.connection_count += 1;
        entry.connection_count
    }

    /// Count one connection fewer. Returns the new count, or `None` if the
    /// address is unknown.
    pub fn release(&self, addr: IpAddr) -> Option<u32> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&IpKey::from_addr(addr))?;
        entry.connection_count = entry.connection_count.saturating_sub(1);
        Some(entry.connection_count)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every idle entry. The lock is re-taken per removal and the
    /// count re-checked, so connections arriving mid-sweep are never lost.
    pub fn sweep(&self) -> usize {
        let candidates: Vec<IpKey> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, d)| d.connection_count == 0)
            .map(|(k, _)| *k)
            .collect();

        let mut removed = 0;
        for key in candidates {
            let mut entries = self.entries.lock();
            if entries.get(&key).is_some_and(|d| d.connection_count == 0) {
                if let Some(data) = entries.remove(&key) {
                    debug!(ip = %data.address, "erased IP data");
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Sweep every `interval` until shutdown. Each sweep schedules the next
    /// only after it completes.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "IP data sweep");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn mapped_v6_shares_v4_entry() {
        let reg = IpRegistry::new();
        reg.acquire(ip("::ffff:10.0.0.1"));
        reg.acquire(ip("10.0.0.1"));
        assert_eq!(reg.len(), 1);
        let data = reg.find(ip("10.0.0.1")).unwrap();
        assert_eq!(data.connection_count, 2);
        assert_eq!(data.address, ip("10.0.0.1"));
    }

    #[test]
    fn real_v6_is_distinct() {
        let reg = IpRegistry::new();
        reg.acquire(ip("2001:db8::1"));
        reg.acquire(ip("2001:db8::2"));
        assert_eq!(reg.len(), 2);
        assert_eq!(IpKey::from_addr(ip("2001:db8::1")), IpKey::V6(ip_octets("2001:db8::1")));
    }

    fn ip_octets(s: &str) -> [u8; 16] {
        match ip(s) {
            IpAddr::V6(v6) => v6.octets(),
            IpAddr::V4(_) => unreachable!(),
        }
    }

    #[test]
    fn counts_track_connects_and_removals() {
        let reg = IpRegistry::new();
        let a = ip("192.0.2.7");
        assert!(reg.find(a).is_none());
        assert_eq!(reg.acquire(a), 1);
        assert_eq!(reg.acquire(a), 2);
        assert_eq!(reg.release(a), Some(1));
        assert_eq!(reg.release(a), Some(0));
        assert_eq!(reg.release(a), Some(0));
        assert_eq!(reg.release(ip("192.0.2.8")), None);
    }

    #[test]
    fn sweep_only_removes_idle() {
        let reg = IpRegistry::new();
        let busy = ip("192.0.2.1");
        let idle = ip("192.0.2.2");
        reg.acquire(busy);
        reg.create(idle);
        assert_eq!(reg.sweep(), 1);
        assert!(reg.find(idle).is_none());
        assert_eq!(reg.find(busy).unwrap().connection_count, 1);

        reg.release(busy);
        assert_eq!(reg.sweep(), 1);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn sweeper_runs_and_stops() {
        let reg = Arc::new(IpRegistry::new());
        reg.create(ip("192.0.2.9"));
        let (tx, rx) = broadcast::channel(1);
        let task = reg.clone().spawn_sweeper(Duration::from_millis(20), rx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !reg.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
