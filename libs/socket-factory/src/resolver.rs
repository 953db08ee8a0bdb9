use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use dns_wire::{DomainName, Query, RecordType, Response, records};

use crate::{ProtectedUdpFactory, Protector, SocketFactory, UdpSocket, unspecified_for};

const DNS_PORT: u16 = 53;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// To avoid fragmentation, IP and thus also UDP packets can only reliably be sent with an MTU of <= 1500 on the public Internet.
const BUF_SIZE: usize = 1500;

/// Plain-DNS resolver for bootstrapping, i.e. resolving the DoH hostname itself.
///
/// With a [`Protector`], queries go over protected UDP sockets to the
/// host's nameservers; each socket is used for exactly one exchange.
/// Without one, the OS resolver is used directly.
pub struct SystemResolver {
    nameservers: Vec<SocketAddr>,
    factory: Arc<dyn SocketFactory<UdpSocket>>,
}

impl SystemResolver {
    pub fn new(protector: Option<Arc<dyn Protector>>) -> Self {
        let nameservers = protector
            .as_ref()
            .map(|p| parse_resolvers(&p.resolvers()))
            .unwrap_or_default();

        Self {
            nameservers,
            factory: Arc::new(ProtectedUdpFactory::new(protector)),
        }
    }

    /// A resolver with an explicit nameserver list and socket factory.
    pub fn with_nameservers(
        nameservers: Vec<SocketAddr>,
        factory: Arc<dyn SocketFactory<UdpSocket>>,
    ) -> Self {
        Self {
            nameservers,
            factory,
        }
    }

    async fn query_server(&self, server: SocketAddr, domain: &DomainName) -> io::Result<Vec<IpAddr>> {
        let (v4, v6) = tokio::join!(
            self.query_one(server, domain.clone(), RecordType::A),
            self.query_one(server, domain.clone(), RecordType::AAAA),
        );

        // One failing address family is fine as long as the other answered.
        let mut addrs = Vec::new();

        match (v4, v6) {
            (Ok(v4), Ok(v6)) => {
                addrs.extend(v4);
                addrs.extend(v6);
            }
            (Ok(v4), Err(e)) => {
                tracing::debug!(%server, "AAAA lookup failed: {e}");
                addrs.extend(v4);
            }
            (Err(e), Ok(v6)) => {
                tracing::debug!(%server, "A lookup failed: {e}");
                addrs.extend(v6);
            }
            (Err(e), Err(_)) => return Err(e),
        }

        Ok(addrs)
    }

    async fn query_one(
        &self,
        server: SocketAddr,
        domain: DomainName,
        rtype: RecordType,
    ) -> io::Result<Vec<IpAddr>> {
        let socket = self.factory.bind(unspecified_for(server))?;

        let query = Query::new(domain, rtype);
        let id = query.id();

        let response =
            tokio::time::timeout(QUERY_TIMEOUT, socket.handshake::<BUF_SIZE>(server, query.as_bytes()))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DNS query timed out"))??;

        let response = Response::parse(&response).map_err(io::Error::other)?;

        if response.id() != id {
            return Err(io::Error::other("DNS response ID does not match query"));
        }

        Ok(response.records().filter_map(records::extract_ip).collect())
    }
}

#[async_trait::async_trait]
impl ip_map::Resolver for SystemResolver {
    async fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
        // Address literals resolve to themselves.
        if let Ok(addr) = hostname.parse::<IpAddr>() {
            return Ok(vec![addr]);
        }

        if self.nameservers.is_empty() {
            let addrs = tokio::net::lookup_host((hostname, 0)).await?;

            return Ok(addrs.map(|a| a.ip()).collect());
        }

        let domain = DomainName::vec_from_str(hostname)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut last_error = None;

        for &server in &self.nameservers {
            match self.query_server(server, &domain).await {
                Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
                Ok(_) => {
                    tracing::debug!(%server, %hostname, "Nameserver returned no addresses");
                }
                Err(e) => {
                    tracing::debug!(%server, %hostname, "Nameserver failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found")))
    }
}

fn parse_resolvers(list: &str) -> Vec<SocketAddr> {
    list.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();

            if entry.is_empty() {
                return None;
            }

            match entry.parse::<IpAddr>() {
                Ok(ip) => Some(SocketAddr::new(ip, DNS_PORT)),
                Err(_) => {
                    tracing::warn!(%entry, "Ignoring unparseable nameserver");

                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_wire::ResponseBuilder;
    use ip_map::Resolver as _;

    use super::*;

    #[test]
    fn parses_comma_separated_resolvers() {
        let nameservers = parse_resolvers("8.8.8.8, 2001:4860:4860::8888,,bogus");

        assert_eq!(
            nameservers,
            vec![
                "8.8.8.8:53".parse().unwrap(),
                "[2001:4860:4860::8888]:53".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn resolves_against_local_nameserver() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; BUF_SIZE];

            loop {
                let Ok((n, from)) = server.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = Query::parse(&buf[..n]) else {
                    continue;
                };

                let response = if query.qtype() == RecordType::A {
                    ResponseBuilder::for_query(&query, dns_wire::ResponseCode::NOERROR)
                        .with_records([(
                            query.domain(),
                            60,
                            records::a(Ipv4Addr::new(192, 0, 2, 77)),
                        )])
                        .build()
                } else {
                    ResponseBuilder::for_query(&query, dns_wire::ResponseCode::NOERROR).build()
                };

                let _ = server.send_to(&response.into_bytes(), from).await;
            }
        });

        let resolver =
            SystemResolver::with_nameservers(vec![server_addr], Arc::new(crate::udp));

        let addrs = resolver.lookup("doh.example").await.unwrap();

        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 77))]);
    }
}
