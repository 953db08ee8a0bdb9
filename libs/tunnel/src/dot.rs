use std::sync::Arc;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio_util::sync::CancellationToken;

use crate::DohSlot;

/// Serves DNS-over-TCP on the relay side of an in-memory pipe, resolving
/// each query through the currently active DoH transport.
///
/// Messages are framed with a 2-byte big-endian length prefix.
/// Source: <https://datatracker.ietf.org/doc/html/rfc1035#section-4.2.2>.
///
/// Queries are answered concurrently; responses are written back in
/// completion order, which DNS permits (replies are matched by ID).
pub(crate) async fn serve(stream: tokio::io::DuplexStream, doh: Arc<DohSlot>) {
    let (mut rx, tx) = tokio::io::split(stream);
    let tx = Arc::new(tokio::sync::Mutex::new(tx));

    loop {
        let mut len = [0u8; 2];

        if rx.read_exact(&mut len).await.is_err() {
            break; // Client side closed.
        }

        let mut query = vec![0u8; u16::from_be_bytes(len) as usize];

        if rx.read_exact(&mut query).await.is_err() {
            break;
        }

        // Load per query: a transport swap applies from the next query on.
        let transport = doh.load_full();
        let tx = tx.clone();

        tokio::spawn(async move {
            let cancel = CancellationToken::new();

            let response = match transport.query(&query, &cancel).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("DoT query failed: {e}");

                    match e.response {
                        Some(response) => response,
                        None => match dns_wire::servfail(&query) {
                            Some(response) => response,
                            None => return, // Nothing sensible to reply.
                        },
                    }
                }
            };

            let Ok(len) = u16::try_from(response.len()) else {
                tracing::debug!(len = response.len(), "Dropping oversized DNS response");

                return;
            };

            let mut tx = tx.lock().await;

            if tx.write_all(&len.to_be_bytes()).await.is_err() {
                return;
            }

            let _ = tx.write_all(&response).await;
        });
    }
}
