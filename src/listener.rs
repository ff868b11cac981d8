use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::aggregator::Aggregator;

/// Largest datagram we accept; anything longer is truncated by the kernel.
const MAX_DATAGRAM: usize = 64 * 1024;

pub async fn bind(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    tracing::info!(addr = %socket.local_addr()?, "udp listener bound");
    Ok(socket)
}

/// Receive loop: every datagram goes straight into the aggregator.
/// Returns once `shutdown` flips to `true`.
pub async fn run(socket: UdpSocket, aggregator: Arc<Aggregator>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            changed = shutdown.changed() => {
                // A dropped sender also means shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match received {
            Ok((len, peer)) => {
                let msg = String::from_utf8_lossy(&buf[..len]);
                tracing::trace!(%peer, len, "datagram");
                aggregator.ingest(&msg);
            }
            // Transient (e.g. ICMP port unreachable surfaced on some
            // platforms); keep listening.
            Err(err) => tracing::warn!(%err, "udp receive failed"),
        }
    }

    tracing::info!("udp listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use std::time::Duration;

    #[tokio::test]
    async fn datagrams_reach_the_aggregator() {
        let aggregator = Arc::new(Aggregator::new(Arc::new(InMemoryBackend::new())));
        let socket = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run(socket, aggregator.clone(), rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hits:2|c\nhits:3|c", addr).await.unwrap();

        for _ in 0..100 {
            if aggregator.get("hits").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(aggregator.get("hits"), Some(5.0));

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
