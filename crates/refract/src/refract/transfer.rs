use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::watch;

/// Fixed lifetime of every redirect and cookie entry.
pub const ENTRY_TTL: Duration = Duration::from_secs(60);

const REAP_INTERVAL: Duration = Duration::from_secs(10);

pub type CookieJar = HashMap<String, Vec<u8>>;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn live_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Where a transfer sent a client, and what it should carry there.
#[derive(Debug, Default)]
pub struct TransferCache {
    redirects: DashMap<IpAddr, Entry<String>>,
    cookies: DashMap<IpAddr, Entry<CookieJar>>,
}

impl TransferCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_redirect(&self, client: IpAddr, target: String) {
        self.insert_redirect_at(client, target, Instant::now());
    }

    pub fn insert_redirect_at(&self, client: IpAddr, target: String, now: Instant) {
        self.redirects.insert(
            client,
            Entry {
                value: target,
                expires_at: now + ENTRY_TTL,
            },
        );
    }

    pub fn has_redirect(&self, client: IpAddr) -> bool {
        self.has_redirect_at(client, Instant::now())
    }

    pub fn has_redirect_at(&self, client: IpAddr, now: Instant) -> bool {
        self.redirects
            .get(&client)
            .is_some_and(|e| e.live_at(now))
    }

    /// Read-and-remove. Expired entries are dropped and reported as absent.
    pub fn take_redirect(&self, client: IpAddr) -> Option<String> {
        self.take_redirect_at(client, Instant::now())
    }

    pub fn take_redirect_at(&self, client: IpAddr, now: Instant) -> Option<String> {
        self.redirects
            .remove(&client)
            .and_then(|(_, e)| e.live_at(now).then_some(e.value))
    }

    pub fn insert_cookies(&self, client: IpAddr, jar: CookieJar) {
        self.insert_cookies_at(client, jar, Instant::now());
    }

    pub fn insert_cookies_at(&self, client: IpAddr, jar: CookieJar, now: Instant) {
        self.cookies.insert(
            client,
            Entry {
                value: jar,
                expires_at: now + ENTRY_TTL,
            },
        );
    }

    pub fn has_cookies(&self, client: IpAddr) -> bool {
        self.has_cookies_at(client, Instant::now())
    }

    pub fn has_cookies_at(&self, client: IpAddr, now: Instant) -> bool {
        self.cookies.get(&client).is_some_and(|e| e.live_at(now))
    }

    pub fn take_cookies(&self, client: IpAddr) -> Option<CookieJar> {
        self.take_cookies_at(client, Instant::now())
    }

    pub fn take_cookies_at(&self, client: IpAddr, now: Instant) -> Option<CookieJar> {
        self.cookies
            .remove(&client)
            .and_then(|(_, e)| e.live_at(now).then_some(e.value))
    }

    /// Drops every expired entry; returns how many went.
    pub fn reap(&self, now: Instant) -> usize {
        let before = self.redirects.len() + self.cookies.len();
        self.redirects.retain(|_, e| e.live_at(now));
        self.cookies.retain(|_, e| e.live_at(now));
        before.saturating_sub(self.redirects.len() + self.cookies.len())
    }

    pub fn len(&self) -> usize {
        self.redirects.len() + self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically reaps expired entries until shutdown flips.
pub fn spawn_reaper(
    cache: Arc<TransferCache>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(REAP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    let n = cache.reap(Instant::now());
                    if n > 0 && tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(reaped = n, "transfer: expired entries dropped");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn fixed_ttl_regardless_of_reads() {
        let cache = TransferCache::new();
        let t0 = Instant::now();
        cache.insert_redirect_at(ip(1), "backend-b:25565".into(), t0);

        for s in [1, 20, 40, 59] {
            assert!(cache.has_redirect_at(ip(1), t0 + Duration::from_secs(s)));
        }
        assert!(!cache.has_redirect_at(ip(1), t0 + Duration::from_secs(61)));
        assert_eq!(cache.take_redirect_at(ip(1), t0 + Duration::from_secs(61)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn take_consumes_the_entry() {
        let cache = TransferCache::new();
        let t0 = Instant::now();
        cache.insert_redirect_at(ip(2), "z:1".into(), t0);
        assert_eq!(
            cache.take_redirect_at(ip(2), t0 + Duration::from_secs(59)),
            Some("z:1".to_string())
        );
        assert!(!cache.has_redirect_at(ip(2), t0 + Duration::from_secs(59)));
        assert!(!cache.has_redirect_at(ip(3), t0));
    }

    #[test]
    fn cookies_are_independent_of_redirects() {
        let cache = TransferCache::new();
        let t0 = Instant::now();
        let mut jar = CookieJar::new();
        jar.insert("minecraft:token".into(), vec![1, 2, 3]);
        cache.insert_cookies_at(ip(4), jar.clone(), t0);

        assert!(!cache.has_redirect_at(ip(4), t0));
        assert!(cache.has_cookies_at(ip(4), t0 + Duration::from_secs(59)));
        assert_eq!(
            cache.take_cookies_at(ip(4), t0 + Duration::from_secs(30)),
            Some(jar)
        );
        assert!(!cache.has_cookies_at(ip(4), t0));
    }

    #[test]
    fn reap_drops_only_expired() {
        let cache = TransferCache::new();
        let t0 = Instant::now();
        cache.insert_redirect_at(ip(5), "old:1".into(), t0);
        cache.insert_redirect_at(ip(6), "new:1".into(), t0 + Duration::from_secs(30));
        cache.insert_cookies_at(ip(5), CookieJar::new(), t0);

        assert_eq!(cache.reap(t0 + Duration::from_secs(61)), 2);
        assert!(cache.has_redirect_at(ip(6), t0 + Duration::from_secs(61)));
        assert_eq!(cache.len(), 1);
    }
}
