#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::{collections::HashMap, io, net::IpAddr, sync::Arc};

use parking_lot::Mutex;

/// Resolves hostnames into addresses, typically backed by the system resolver.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>>;
}

/// A map from hostname to its pool of candidate addresses.
///
/// Entries are created lazily on first [`IpMap::get`] and live for as long
/// as the map, i.e. for the lifetime of the owning transport.
pub struct IpMap {
    resolver: Arc<dyn Resolver>,
    entries: Mutex<HashMap<String, Arc<Endpoint>>>,
}

impl IpMap {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the [`Endpoint`] for the given hostname.
    ///
    /// The first call for a hostname resolves it through the system
    /// resolver; a failed lookup still yields a (possibly empty) endpoint
    /// that can be populated via [`Endpoint::add`].
    pub async fn get(&self, hostname: &str) -> Arc<Endpoint> {
        if let Some(endpoint) = self.entries.lock().get(hostname) {
            return endpoint.clone();
        }

        let resolved = match self.resolver.lookup(hostname).await {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(%hostname, "Failed to resolve: {e}");

                Vec::new()
            }
        };

        let mut entries = self.entries.lock();

        // Two tasks may race the same first lookup; both merge into one entry.
        let endpoint = entries
            .entry(hostname.to_owned())
            .or_insert_with(|| Arc::new(Endpoint::new(self.resolver.clone())));

        for addr in resolved {
            endpoint.insert_resolved(addr);
        }

        endpoint.clone()
    }
}

/// The candidate addresses of a single hostname, with one confirmed slot.
///
/// The confirmed address, if set, is always a member of the address set.
pub struct Endpoint {
    resolver: Arc<dyn Resolver>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    addrs: Vec<IpAddr>,
    confirmed: Option<IpAddr>,
}

impl Endpoint {
    fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Adds an address, or every address a hostname resolves to.
    ///
    /// Duplicates (by address bytes) are collapsed; resolution failures are
    /// tolerated and leave the set unchanged.
    pub async fn add(&self, addr_or_host: &str) {
        if let Ok(addr) = addr_or_host.parse::<IpAddr>() {
            self.insert(addr);

            return;
        }

        match self.resolver.lookup(addr_or_host).await {
            Ok(addrs) => {
                for addr in addrs {
                    self.insert_resolved(addr);
                }
            }
            Err(e) => tracing::debug!(host = %addr_or_host, "Failed to resolve: {e}"),
        }
    }

    /// Snapshot of the address set in insertion order.
    pub fn get_all(&self) -> Vec<IpAddr> {
        self.inner.lock().addrs.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().addrs.is_empty()
    }

    pub fn confirmed(&self) -> Option<IpAddr> {
        self.inner.lock().confirmed
    }

    /// Marks an address as known-working so future dials try it first.
    ///
    /// An address we have never seen is added to the set first; confirming
    /// it must not break the membership invariant.
    pub fn confirm(&self, addr: IpAddr) {
        if addr.is_unspecified() {
            return;
        }

        let mut inner = self.inner.lock();

        if !inner.addrs.contains(&addr) {
            inner.addrs.push(addr);
        }

        inner.confirmed = Some(addr);
    }

    /// Clears the confirmed slot, but only if it still holds `addr`.
    ///
    /// Tolerates races with a concurrent [`Endpoint::confirm`] of a
    /// different address: the newer confirmation wins.
    pub fn disconfirm(&self, addr: IpAddr) {
        let mut inner = self.inner.lock();

        if inner.confirmed == Some(addr) {
            inner.confirmed = None;
        }
    }

    fn insert(&self, addr: IpAddr) {
        if addr.is_unspecified() {
            return;
        }

        let mut inner = self.inner.lock();

        if inner.addrs.contains(&addr) {
            return;
        }

        inner.addrs.push(addr);
    }

    /// Inserts an address learned from a resolver.
    ///
    /// A poisoned resolver must not be able to point us at ourselves, so
    /// loopback answers are dropped here but not in [`Endpoint::insert`],
    /// which only sees caller-supplied addresses.
    fn insert_resolved(&self, addr: IpAddr) {
        if addr.is_loopback() {
            tracing::debug!(%addr, "Ignoring loopback resolver answer");

            return;
        }

        self.insert(addr);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use proptest::prelude::*;

    use super::*;

    struct StaticResolver(HashMap<String, Vec<IpAddr>>);

    #[async_trait::async_trait]
    impl Resolver for StaticResolver {
        async fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
            self.0
                .get(hostname)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn resolver(entries: &[(&str, &[IpAddr])]) -> Arc<dyn Resolver> {
        Arc::new(StaticResolver(
            entries
                .iter()
                .map(|(h, a)| (h.to_string(), a.to_vec()))
                .collect(),
        ))
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn get_resolves_on_first_call() {
        let map = IpMap::new(resolver(&[("dns.example", &[ip("192.0.2.1"), ip("192.0.2.2")])]));

        let endpoint = map.get("dns.example").await;

        assert_eq!(endpoint.get_all(), vec![ip("192.0.2.1"), ip("192.0.2.2")]);
    }

    #[tokio::test]
    async fn get_returns_same_endpoint() {
        let map = IpMap::new(resolver(&[("dns.example", &[ip("192.0.2.1")])]));

        let first = map.get("dns.example").await;
        let second = map.get("dns.example").await;

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn failed_lookup_yields_empty_endpoint() {
        let map = IpMap::new(resolver(&[]));

        let endpoint = map.get("unknown.example").await;

        assert!(endpoint.is_empty());

        endpoint.add("192.0.2.9").await;

        assert_eq!(endpoint.get_all(), vec![ip("192.0.2.9")]);
    }

    #[tokio::test]
    async fn add_collapses_duplicates() {
        let map = IpMap::new(resolver(&[]));
        let endpoint = map.get("dns.example").await;

        endpoint.add("192.0.2.1").await;
        endpoint.add("192.0.2.1").await;

        assert_eq!(endpoint.get_all(), vec![ip("192.0.2.1")]);
    }

    #[tokio::test]
    async fn add_resolves_hostnames() {
        let map = IpMap::new(resolver(&[("fallback.example", &[ip("2001:db8::1")])]));
        let endpoint = map.get("unknown.example").await;

        endpoint.add("fallback.example").await;

        assert_eq!(endpoint.get_all(), vec![ip("2001:db8::1")]);
    }

    #[tokio::test]
    async fn loopback_resolver_answers_are_dropped() {
        let map = IpMap::new(resolver(&[(
            "dns.example",
            &[
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                ip("192.0.2.1"),
            ],
        )]));

        let endpoint = map.get("dns.example").await;

        assert_eq!(endpoint.get_all(), vec![ip("192.0.2.1")]);
    }

    #[tokio::test]
    async fn unspecified_addresses_are_dropped() {
        let map = IpMap::new(resolver(&[]));
        let endpoint = map.get("dns.example").await;

        endpoint.add("0.0.0.0").await;

        assert!(endpoint.is_empty());
    }

    #[tokio::test]
    async fn disconfirm_only_clears_matching_address() {
        let map = IpMap::new(resolver(&[]));
        let endpoint = map.get("dns.example").await;

        endpoint.confirm(ip("192.0.2.1"));
        endpoint.disconfirm(ip("192.0.2.2"));

        assert_eq!(endpoint.confirmed(), Some(ip("192.0.2.1")));

        endpoint.disconfirm(ip("192.0.2.1"));

        assert_eq!(endpoint.confirmed(), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        Confirm(u8),
        Disconfirm(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::Add),
            any::<u8>().prop_map(Op::Confirm),
            any::<u8>().prop_map(Op::Disconfirm),
        ]
    }

    proptest! {
        // The confirmed slot is always either empty or a member of the set.
        #[test]
        fn confirmed_is_always_a_member(ops in prop::collection::vec(op(), 0..50)) {
            let endpoint = Endpoint::new(resolver(&[]));

            for op in ops {
                match op {
                    Op::Add(octet) => endpoint.insert(IpAddr::V4(Ipv4Addr::new(192, 0, 2, octet))),
                    Op::Confirm(octet) => endpoint.confirm(IpAddr::V4(Ipv4Addr::new(192, 0, 2, octet))),
                    Op::Disconfirm(octet) => endpoint.disconfirm(IpAddr::V4(Ipv4Addr::new(192, 0, 2, octet))),
                }

                if let Some(confirmed) = endpoint.confirmed() {
                    prop_assert!(endpoint.get_all().contains(&confirmed));
                }
            }
        }
    }
}
