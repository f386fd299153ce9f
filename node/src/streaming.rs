//! Snapshot streaming: one JSON line per broadcast frame.

use framecast_core::BroadcastEnvelope;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

type Frames = broadcast::Sender<Arc<BroadcastEnvelope>>;

pub async fn serve(listener: TcpListener, frames: Frames) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                info!("Streaming client {} connected", remote);
                tokio::spawn(stream_to_client(stream, remote, frames.subscribe()));
            }
            Err(e) => {
                warn!("Streaming accept failed: {}", e);
            }
        }
    }
}

async fn stream_to_client(
    mut stream: TcpStream,
    remote: SocketAddr,
    mut frames: broadcast::Receiver<Arc<BroadcastEnvelope>>,
) {
    loop {
        let envelope = match frames.recv().await {
            Ok(envelope) => envelope,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Streaming client {} lagged, skipped {} frames", remote, skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let mut line = match serde_json::to_vec(envelope.as_ref()) {
            Ok(line) => line,
            Err(e) => {
                warn!("Frame {} not encodable: {}", envelope.snapshot.frame, e);
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stream.write_all(&line).await {
            debug!("Streaming client {} gone: {}", remote, e);
            break;
        }
    }
    info!("Streaming client {} disconnected", remote);
}

#[cfg(test)]
mod tests {
    use super::*;
    use framecast_core::{BroadcastChannelSink, BroadcastSink, NodeRole, SessionId, WorldSnapshot};
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn envelope(frame: u64) -> BroadcastEnvelope {
        BroadcastEnvelope {
            snapshot: WorldSnapshot {
                session: SessionId::new(),
                role: NodeRole::Primary,
                frame,
                elapsed_seconds: frame as f64 * 0.05,
                actors: vec![],
            },
            delta_seconds: 0.05,
            topology_changed: frame == 1,
            pending_visual_update: false,
        }
    }

    #[tokio::test]
    async fn test_client_receives_json_lines() {
        let mut sink = BroadcastChannelSink::new(16);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, sink.sender()));

        let client = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(client).lines();

        // Wait until the server has subscribed the client
        while sink.sender().receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        sink.deliver(&envelope(1));
        sink.deliver(&envelope(2));

        let first: BroadcastEnvelope =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second: BroadcastEnvelope =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.snapshot.frame, 1);
        assert!(first.topology_changed);
        assert_eq!(second.snapshot.frame, 2);
    }
}
