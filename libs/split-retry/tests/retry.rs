use std::{sync::Arc, time::Duration};

use socket_factory::{SocketFactory, TcpSocket};
use split_retry::{RetryStats, dial_with_split_retry};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
};

fn factory() -> Arc<dyn SocketFactory<TcpSocket>> {
    Arc::new(socket_factory::tcp)
}

/// Drops the connection with an RST instead of an orderly FIN.
fn reset(conn: TcpStream) {
    socket2::SockRef::from(&conn)
        .set_linger(Some(Duration::ZERO))
        .unwrap();

    drop(conn);
}

#[tokio::test]
async fn completes_without_retry_on_first_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();

        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(b"pong!").await.unwrap();

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(&buf).await.unwrap();
    });

    let stats = RetryStats::new();
    let mut stream = dial_with_split_retry(factory(), addr, Some(stats.clone()))
        .await
        .unwrap();

    stream.write_all(b"hello").await.unwrap();

    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong!");

    // The first reply completed the retry window; this write goes straight through.
    stream.write_all(b"more").await.unwrap();

    let mut echo = [0u8; 4];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"more");

    assert_eq!(stats.split(), 0);
    assert_eq!(stats.chunks(), 1);
    assert!(!stats.timeout());

    server.await.unwrap();
}

#[tokio::test]
async fn replays_hello_after_reset() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let hello = vec![0x42u8; 200];

    let server = tokio::spawn({
        let hello = hello.clone();

        async move {
            // First connection: swallow the hello, then reset it.
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; hello.len()];
            conn.read_exact(&mut buf).await.unwrap();
            reset(conn);

            // Second connection: the split replay must reassemble to the hello.
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; hello.len()];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, hello);

            conn.write_all(b"answer").await.unwrap();
        }
    });

    let stats = RetryStats::new();
    let mut stream = dial_with_split_retry(factory(), addr, Some(stats.clone()))
        .await
        .unwrap();

    stream.write_all(&hello).await.unwrap();

    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"answer");

    assert!(
        (16..=64).contains(&stats.split()),
        "split = {}",
        stats.split()
    );
    assert!(stats.chunks() >= 1);
    assert_eq!(stats.upload_bytes(), hello.len() as u64);
    assert!(!stats.timeout());

    server.await.unwrap();
}

#[tokio::test]
async fn fragments_tls_hello_across_records() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A single 200-byte TLS handshake record.
    let payload = (0..195).map(|i| i as u8).collect::<Vec<_>>();
    let mut hello = vec![22, 3, 1];
    hello.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    hello.extend_from_slice(&payload);

    let server = tokio::spawn({
        let payload = payload.clone();
        let hello = hello.clone();

        async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; hello.len()];
            conn.read_exact(&mut buf).await.unwrap();
            reset(conn);

            // The replay re-frames the record as two records carrying the
            // same payload bytes.
            let (mut conn, _) = listener.accept().await.unwrap();

            let first = read_record(&mut conn).await;
            let second = read_record(&mut conn).await;

            assert_eq!([first.as_slice(), second.as_slice()].concat(), payload);

            conn.write_all(b"ok").await.unwrap();
        }
    });

    let mut stream = dial_with_split_retry(factory(), addr, None).await.unwrap();

    stream.write_all(&hello).await.unwrap();

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ok");

    server.await.unwrap();
}

async fn read_record(conn: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 5];
    conn.read_exact(&mut header).await.unwrap();

    assert_eq!(header[0], 22);
    assert_eq!(header[1], 3);

    let len = u16::from_be_bytes([header[3], header[4]]) as usize;

    let mut payload = vec![0u8; len];
    conn.read_exact(&mut payload).await.unwrap();

    payload
}

#[tokio::test]
async fn deadline_triggers_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let hello = vec![0x13u8; 80];

    let server = tokio::spawn({
        let hello = hello.clone();

        async move {
            // First connection: read the hello but never answer.
            let (mut stalled, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; hello.len()];
            stalled.read_exact(&mut buf).await.unwrap();

            // Second connection: answer the replay.
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; hello.len()];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, hello);

            conn.write_all(b"late").await.unwrap();

            drop(stalled);
        }
    });

    let stats = RetryStats::new();
    let mut stream = dial_with_split_retry(factory(), addr, Some(stats.clone()))
        .await
        .unwrap();

    stream.write_all(&hello).await.unwrap();

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"late");

    assert!(stats.timeout());

    server.await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_in_both_orders() {
    for read_first in [true, false] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();

            // Drain until the peer's write half closes.
            let mut buf = [0u8; 64];
            while conn.read(&mut buf).await.unwrap() > 0 {}
        });

        let mut stream = dial_with_split_retry(factory(), addr, None).await.unwrap();

        if read_first {
            stream.close_read();
            stream.close_read();
            stream.shutdown().await.unwrap();
            stream.shutdown().await.unwrap();
        } else {
            stream.shutdown().await.unwrap();
            stream.shutdown().await.unwrap();
            stream.close_read();
            stream.close_read();
        }

        // A closed read half reads EOF, a closed write half refuses writes.
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.write_all(b"nope").await.is_err());

        server.await.unwrap();
    }
}
