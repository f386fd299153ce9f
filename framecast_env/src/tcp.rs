//! TCP frame transport.
//!
//! Wire layout per message: `[len: u32 BE][CBOR FrameEnvelope]`. A connection
//! starts with a handshake in which the secondary sends its 16-byte node id
//! and the primary answers with its own.
//!
//! All socket work happens on tokio tasks; the tick thread only touches the
//! bounded outboxes, the bounded inbound crossbeam queue and the atomic
//! liveness cells.
//!
//! A secondary whose inbound queue fills up drops its link and reconnects;
//! the primary treats that as a new connection and sends it a keyframe.

use crate::error::{io_status, EnvError, TransportStatus};
use crate::network::{FrameTransport, TransportBackend};
use crate::tokio_impl::TokioContext;
use crate::types::{FrameEnvelope, LinkState, Liveness, NodeId, PeerLink};
use crate::NodeContext;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Upper bound on a single framed message.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Envelopes buffered per secondary before sends report backpressure.
const OUTBOX_DEPTH: usize = 64;

/// Envelopes a secondary holds for its tick thread before it resyncs.
pub const DEFAULT_INBOUND_DEPTH: usize = 256;

const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializes an envelope for the wire.
pub fn encode_envelope(envelope: &FrameEnvelope) -> Result<Vec<u8>, EnvError> {
    serde_cbor::to_vec(envelope).map_err(|e| EnvError::SerializationError(e.to_string()))
}

/// Deserializes an envelope received from the wire.
pub fn decode_envelope(bytes: &[u8]) -> Result<FrameEnvelope, EnvError> {
    serde_cbor::from_slice(bytes).map_err(|e| EnvError::SerializationError(e.to_string()))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

// ============================================================================
// BACKEND
// ============================================================================

/// Production transport backend over TCP.
pub struct TcpBackend {
    context: Arc<TokioContext>,
    inbound_depth: usize,
}

impl TcpBackend {
    pub fn new(context: Arc<TokioContext>) -> Self {
        Self {
            context,
            inbound_depth: DEFAULT_INBOUND_DEPTH,
        }
    }

    pub fn with_inbound_depth(mut self, depth: usize) -> Self {
        self.inbound_depth = depth.max(1);
        self
    }

    /// Same as [`TransportBackend::listen`] but keeps the concrete type.
    pub fn listen_tcp(&self, local_id: NodeId, port: u16) -> Result<Arc<TcpPrimary>, EnvError> {
        let addr = format!("0.0.0.0:{}", port);
        let bind_error = |e: std::io::Error| EnvError::BindError {
            addr: addr.clone(),
            reason: e.to_string(),
        };

        // Bind synchronously so a bad port fails session start right away.
        let std_listener = std::net::TcpListener::bind(&addr).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = std_listener.local_addr().map_err(bind_error)?;
        let listener = {
            let _guard = self.context.handle().enter();
            TcpListener::from_std(std_listener).map_err(bind_error)?
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let primary = Arc::new(TcpPrimary {
            local_id,
            local_addr,
            peers: Arc::new(Mutex::new(HashMap::new())),
            _shutdown: shutdown_tx,
        });

        info!(%local_addr, node = %local_id, "listening for secondaries");
        self.context.spawn(
            "secondary-accept",
            accept_loop(listener, local_id, primary.peers.clone(), shutdown_rx),
        );

        Ok(primary)
    }
}

impl TransportBackend for TcpBackend {
    fn listen(&self, local_id: NodeId, port: u16) -> Result<Arc<dyn FrameTransport>, EnvError> {
        let primary: Arc<dyn FrameTransport> = self.listen_tcp(local_id, port)?;
        Ok(primary)
    }

    fn connect(
        &self,
        local_id: NodeId,
        host: &str,
        port: u16,
    ) -> Result<Arc<dyn FrameTransport>, EnvError> {
        let secondary: Arc<dyn FrameTransport> = self.connect_tcp(local_id, host, port);
        Ok(secondary)
    }
}

impl TcpBackend {
    /// Same as [`TransportBackend::connect`] but keeps the concrete type.
    pub fn connect_tcp(&self, local_id: NodeId, host: &str, port: u16) -> Arc<TcpSecondary> {
        let address = format!("{}:{}", host, port);
        let (inbound_tx, inbound_rx) = channel::bounded(self.inbound_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let liveness = Liveness::new(LinkState::Connecting);
        let primary_id = Arc::new(Mutex::new(NodeId(uuid::Uuid::nil())));
        let overflows = Arc::new(AtomicU64::new(0));

        let secondary = Arc::new(TcpSecondary {
            local_id,
            address: address.clone(),
            primary_id: primary_id.clone(),
            liveness: liveness.clone(),
            inbound: inbound_rx,
            overflows: overflows.clone(),
            _shutdown: shutdown_tx,
        });

        info!(%address, node = %local_id, "connecting to primary in background");
        self.context.spawn(
            "primary-link",
            maintain_primary_link(
                self.context.clone(),
                local_id,
                address,
                primary_id,
                liveness,
                Inbound {
                    queue: inbound_tx,
                    overflows,
                },
                shutdown_rx,
            ),
        );

        secondary
    }
}

// ============================================================================
// PRIMARY SIDE
// ============================================================================

struct PrimaryPeer {
    link: PeerLink,
    outbox: mpsc::Sender<Vec<u8>>,
}

/// Listening endpoint owned by a primary node.
pub struct TcpPrimary {
    local_id: NodeId,
    local_addr: SocketAddr,
    peers: Arc<Mutex<HashMap<NodeId, PrimaryPeer>>>,
    /// Dropping the sender stops every task spawned for this endpoint.
    _shutdown: watch::Sender<bool>,
}

impl TcpPrimary {
    /// Address the listener is bound to (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl FrameTransport for TcpPrimary {
    fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn peers(&self) -> Vec<PeerLink> {
        lock(&self.peers).values().map(|p| p.link.clone()).collect()
    }

    fn send(&self, target: NodeId, envelope: FrameEnvelope) -> Result<(), EnvError> {
        let table = lock(&self.peers);
        let peer = table.get(&target).ok_or_else(|| EnvError::unreachable(target))?;
        if !peer.link.liveness.is_connected() {
            return Err(EnvError::closed(target));
        }

        let bytes = encode_envelope(&envelope)?;
        match peer.outbox.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnvError::Backpressure(target.to_string())),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                peer.link.liveness.set(LinkState::Disconnected);
                Err(EnvError::closed(target))
            }
        }
    }

    fn try_recv(&self) -> Option<(NodeId, FrameEnvelope)> {
        // Secondaries never send frames upstream.
        None
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_id: NodeId,
    peers: Arc<Mutex<HashMap<NodeId, PrimaryPeer>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, remote)) => {
                tokio::spawn(serve_secondary(
                    stream,
                    remote.to_string(),
                    local_id,
                    peers.clone(),
                    shutdown.clone(),
                ));
            }
            Err(err) => warn!(%err, "accept failed"),
        }
    }
    debug!("secondary accept loop stopped");
}

async fn serve_secondary(
    mut stream: TcpStream,
    address: String,
    local_id: NodeId,
    peers: Arc<Mutex<HashMap<NodeId, PrimaryPeer>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut id_bytes = [0u8; 16];
    if let Err(err) = stream.read_exact(&mut id_bytes).await {
        warn!(%address, %err, "secondary handshake failed");
        return;
    }
    if let Err(err) = stream.write_all(local_id.as_bytes()).await {
        warn!(%address, %err, "secondary handshake reply failed");
        return;
    }
    let _ = stream.set_nodelay(true);

    let peer_id = NodeId::from_bytes(id_bytes);
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Vec<u8>>(OUTBOX_DEPTH);
    let liveness = Liveness::new(LinkState::Connected);
    let link = PeerLink {
        id: peer_id,
        address: address.clone(),
        liveness: liveness.clone(),
    };

    if let Some(previous) = lock(&peers).insert(peer_id, PrimaryPeer { link, outbox: outbox_tx }) {
        previous.link.liveness.set(LinkState::Disconnected);
    }
    info!(peer = %peer_id, %address, "secondary connected");

    let (mut reader, mut writer) = stream.into_split();
    let mut peek = [0u8; 1];
    loop {
        tokio::select! {
            next = outbox_rx.recv() => match next {
                Some(bytes) => {
                    if let Err(err) = write_frame(&mut writer, &bytes).await {
                        warn!(peer = %peer_id, %err, status = ?io_status(&err), "frame write failed");
                        break;
                    }
                }
                // Replaced by a newer connection from the same node.
                None => break,
            },
            read = reader.read(&mut peek) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            _ = shutdown.changed() => break,
        }
    }

    liveness.set(LinkState::Disconnected);
    {
        let mut table = lock(&peers);
        // A newer connection from the same node may already own the slot.
        if table
            .get(&peer_id)
            .is_some_and(|p| p.link.liveness.same_cell(&liveness))
        {
            table.remove(&peer_id);
        }
    }
    info!(peer = %peer_id, %address, "secondary disconnected");
}

// ============================================================================
// SECONDARY SIDE
// ============================================================================

/// Outbound link from a secondary node to its primary.
pub struct TcpSecondary {
    local_id: NodeId,
    address: String,
    primary_id: Arc<Mutex<NodeId>>,
    liveness: Liveness,
    inbound: Receiver<(NodeId, FrameEnvelope)>,
    overflows: Arc<AtomicU64>,
    _shutdown: watch::Sender<bool>,
}

impl TcpSecondary {
    /// Times the inbound queue filled up and the link was dropped.
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Acquire)
    }
}

/// I/O side of a secondary's inbound queue.
struct Inbound {
    queue: Sender<(NodeId, FrameEnvelope)>,
    overflows: Arc<AtomicU64>,
}

impl FrameTransport for TcpSecondary {
    fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn peers(&self) -> Vec<PeerLink> {
        vec![PeerLink {
            id: *lock(&self.primary_id),
            address: self.address.clone(),
            liveness: self.liveness.clone(),
        }]
    }

    fn send(&self, target: NodeId, _envelope: FrameEnvelope) -> Result<(), EnvError> {
        Err(EnvError::unreachable(target))
    }

    fn try_recv(&self) -> Option<(NodeId, FrameEnvelope)> {
        self.inbound.try_recv().ok()
    }
}

async fn open_link(address: &str, local_id: NodeId) -> std::io::Result<(TcpStream, NodeId)> {
    let mut stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    stream.write_all(local_id.as_bytes()).await?;
    let mut id_bytes = [0u8; 16];
    stream.read_exact(&mut id_bytes).await?;
    Ok((stream, NodeId::from_bytes(id_bytes)))
}

async fn maintain_primary_link(
    context: Arc<TokioContext>,
    local_id: NodeId,
    address: String,
    primary_id: Arc<Mutex<NodeId>>,
    liveness: Liveness,
    inbound: Inbound,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_MIN;
    loop {
        liveness.set(LinkState::Connecting);
        match open_link(&address, local_id).await {
            Ok((stream, remote_id)) => {
                *lock(&primary_id) = remote_id;
                liveness.set(LinkState::Connected);
                backoff = RECONNECT_MIN;
                info!(%address, primary = %remote_id, "connected to primary");

                let stopping = pump_frames(stream, remote_id, &inbound, &mut shutdown).await;
                liveness.set(LinkState::Disconnected);
                if stopping {
                    break;
                }
                warn!(%address, "lost primary link, reconnecting");
            }
            Err(err) => debug!(%address, %err, "primary not reachable yet"),
        }

        tokio::select! {
            _ = context.sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
    liveness.set(LinkState::Disconnected);
    debug!(%address, "primary link task stopped");
}

/// Forwards frames until the link drops. Returns `true` when the transport
/// itself is shutting down.
///
/// A full inbound queue means the tick thread is not keeping up; the link
/// is dropped so the primary resends full state after the reconnect.
async fn pump_frames(
    mut stream: TcpStream,
    from: NodeId,
    inbound: &Inbound,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        let frame = tokio::select! {
            read = read_frame(&mut stream) => read,
            _ = shutdown.changed() => return true,
        };

        match frame {
            Ok(bytes) => match decode_envelope(&bytes) {
                Ok(envelope) => match inbound.queue.try_send((from, envelope)) {
                    Ok(()) => {}
                    Err(TrySendError::Full((_, envelope))) => {
                        inbound.overflows.fetch_add(1, Ordering::AcqRel);
                        warn!(
                            frame = envelope.frame,
                            depth = inbound.queue.len(),
                            "inbound queue full, dropping primary link to resync"
                        );
                        return false;
                    }
                    Err(TrySendError::Disconnected(_)) => return true,
                },
                Err(err) => warn!(%err, "dropping undecodable envelope"),
            },
            Err(err) => {
                match io_status(&err) {
                    TransportStatus::Retryable => debug!(%err, "primary read interrupted"),
                    _ => warn!(%err, "primary read failed"),
                }
                return false;
            }
        }
    }
}
