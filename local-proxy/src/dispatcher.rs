//! Local dispatcher (spec §4.4): owns the outbound TLS tunnel, the
//! `stream_id -> client` table, and the reconnect loop. Grounded on the
//! teacher's `proxy.rs` accept-loop/per-connection-task shape
//! (`mtls-proxy/src/proxy.rs`), generalized from a single TLS-to-TLS pipe
//! into a multiplexed tunnel plus per-client SOCKS5 front ends.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use tunnel_proto::{FrameCodec, Message, ProtoError, StreamId, StreamIdAllocator};

use crate::config::Config;
use crate::socks5::{SocksAction, SocksFsm};

type SharedStreams = Arc<Mutex<HashMap<StreamId, mpsc::UnboundedSender<ClientInboundEvent>>>>;

/// What the inbound demux tells a waiting client task.
#[derive(Debug, Clone)]
enum ClientInboundEvent {
    Data(Bytes),
    ConnectFailed(u8),
    RemoteClosed,
}

/// Everything a freshly-accepted client connection needs in order to join
/// the currently-live tunnel.
struct TunnelEpoch {
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    streams: SharedStreams,
}

type EpochWatch = watch::Receiver<Option<Arc<TunnelEpoch>>>;

/// Drive the local proxy forever: bind the SOCKS5 listener once, then
/// connect/reconnect the tunnel in a loop. The first connect failure is
/// fatal (spec §4.4); every subsequent drop triggers an unbounded retry.
pub async fn run(cfg: Config) -> Result<()> {
    let client_cfg = Arc::new(
        tunnel_proto::tls::build_client_config(&cfg.tls).context("building TLS client config")?,
    );
    let allocator = Arc::new(StreamIdAllocator::new());
    let (epoch_tx, epoch_rx) = watch::channel(None::<Arc<TunnelEpoch>>);

    let listener = TcpListener::bind((cfg.listen.0.as_str(), cfg.listen.1))
        .await
        .with_context(|| format!("binding SOCKS5 listener on {}:{}", cfg.listen.0, cfg.listen.1))?;
    info!("SOCKS5 listener bound on {}:{}", cfg.listen.0, cfg.listen.1);

    tokio::spawn(accept_loop(listener, epoch_rx, allocator));

    let mut first_attempt = true;
    loop {
        match connect_tunnel(&cfg, &client_cfg).await {
            Ok(tls_stream) => {
                first_attempt = false;
                info!("tunnel connected to {}:{}", cfg.remote.0, cfg.remote.1);

                let streams: SharedStreams = Arc::new(Mutex::new(HashMap::new()));
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let epoch = Arc::new(TunnelEpoch {
                    outbound_tx,
                    streams: streams.clone(),
                });
                let _ = epoch_tx.send(Some(epoch));

                run_epoch(tls_stream, streams.clone(), outbound_rx).await;

                let _ = epoch_tx.send(None);
                abort_all(&streams).await;
                warn!("tunnel dropped; reconnecting");
            }
            Err(e) => {
                if first_attempt {
                    return Err(e.context("initial tunnel connect failed"));
                }
                warn!("tunnel reconnect failed: {e:#}; retrying");
            }
        }
    }
}

async fn connect_tunnel(
    cfg: &Config,
    client_cfg: &Arc<rustls::ClientConfig>,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect((cfg.remote.0.as_str(), cfg.remote.1))
        .await
        .with_context(|| format!("connecting to remote {}:{}", cfg.remote.0, cfg.remote.1))?;
    tcp.set_nodelay(true).ok();

    let server_name = rustls::pki_types::ServerName::try_from(cfg.remote.0.clone())
        .map_err(|_| anyhow::anyhow!("invalid remote hostname for TLS SNI: {}", cfg.remote.0))?;

    let connector = TlsConnector::from(client_cfg.clone());
    let stream = connector
        .connect(server_name, tcp)
        .await
        .context("TLS handshake with remote failed")?;
    Ok(stream)
}

/// Run one tunnel epoch until it drops: a reader task performs the
/// inbound demux, the caller's task performs the outbound mux. Returns
/// once either direction sees EOF/error.
async fn run_epoch(
    tls_stream: tokio_rustls::client::TlsStream<TcpStream>,
    streams: SharedStreams,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let framed = Framed::new(tls_stream, FrameCodec::default());
    let (mut sink, mut source) = framed.split();

    let reader = async {
        loop {
            match source.next().await {
                Some(Ok(frame)) => {
                    if let Err(e) = handle_inbound(frame, &streams).await {
                        error!("inbound demux error: {e}");
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!("tunnel framing error: {e}");
                    break;
                }
                None => {
                    info!("tunnel closed by peer");
                    break;
                }
            }
        }
    };

    let writer = async {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                error!("tunnel write error: {e}");
                break;
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = writer => {}
    }
}

async fn handle_inbound(frame: Bytes, streams: &SharedStreams) -> Result<(), ProtoError> {
    let message = match Message::decode(frame) {
        Ok(m) => m,
        Err(ProtoError::UnknownType(t)) => {
            warn!("dropping unknown message type {t}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    match message {
        Message::ConnectReply { id, code } => {
            if code == 0 {
                return Ok(());
            }
            let mut table = streams.lock().await;
            if let Some(tx) = table.remove(&id) {
                let _ = tx.send(ClientInboundEvent::ConnectFailed(code));
            } else {
                warn!("CONNECT_REPLY for unknown stream {id}");
            }
        }
        Message::DataIn { id, data } => {
            let table = streams.lock().await;
            if let Some(tx) = table.get(&id) {
                let _ = tx.send(ClientInboundEvent::Data(data));
            } else {
                warn!("DATA_IN for unknown stream {id}");
            }
        }
        Message::CloseRemote { id } => {
            let mut table = streams.lock().await;
            if let Some(tx) = table.remove(&id) {
                let _ = tx.send(ClientInboundEvent::RemoteClosed);
            } else {
                warn!("CLOSE_REMOTE for unknown stream {id}");
            }
        }
        other => {
            warn!("unexpected message direction on local side: {other:?}");
        }
    }
    Ok(())
}

async fn abort_all(streams: &SharedStreams) {
    let mut table = streams.lock().await;
    for (_, tx) in table.drain() {
        let _ = tx.send(ClientInboundEvent::RemoteClosed);
    }
}

async fn accept_loop(listener: TcpListener, epoch_rx: EpochWatch, allocator: Arc<StreamIdAllocator>) {
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let epoch_rx = epoch_rx.clone();
        let allocator = allocator.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, epoch_rx, allocator).await {
                debug!("client {peer_addr} session ended: {e:#}");
            }
        });
    }
}

async fn handle_client(
    mut socket: TcpStream,
    mut epoch_rx: EpochWatch,
    allocator: Arc<StreamIdAllocator>,
) -> Result<()> {
    // Wait for a live tunnel before doing anything with the client; during a
    // reconnect window new clients simply park here.
    let epoch = wait_for_epoch(&mut epoch_rx).await;

    let mut fsm = SocksFsm::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut read_buf = [0u8; 4096];
    let mut stream_id: Option<StreamId> = None;
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<ClientInboundEvent>();
    // Set on CONNECT_REPLY failure / CLOSE_REMOTE: the client TCP is
    // hard-aborted (plain drop, no FIN) rather than shut down gracefully
    // (spec §4.4/§9 "optimistic SOCKS success" — a failed remote connect
    // must surface to the client as a mid-stream RST, not a clean close).
    let mut abort = false;

    loop {
        tokio::select! {
            biased;

            event = inbound_rx.recv() => {
                match event {
                    Some(ClientInboundEvent::Data(data)) => {
                        if socket.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(ClientInboundEvent::ConnectFailed(code)) => {
                        warn!("remote connect failed (code {code}); aborting client stream");
                        abort = true;
                        break;
                    }
                    Some(ClientInboundEvent::RemoteClosed) | None => {
                        abort = true;
                        break;
                    }
                }
            }

            read_result = socket.read(&mut read_buf) => {
                match read_result {
                    Ok(0) => {
                        if let Some(id) = stream_id.take() {
                            let _ = epoch.outbound_tx.send(Message::CloseLocal { id }.encode().freeze());
                            epoch.streams.lock().await.remove(&id);
                        }
                        break;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&read_buf[..n]);
                        let actions = fsm.feed(&mut buf);
                        let mut should_close = false;
                        for action in actions {
                            match action {
                                SocksAction::Write(bytes) => {
                                    if socket.write_all(&bytes).await.is_err() {
                                        should_close = true;
                                        break;
                                    }
                                }
                                SocksAction::Connect { host, port } => {
                                    let id = allocator.allocate();
                                    stream_id = Some(id);
                                    epoch.streams.lock().await.insert(id, inbound_tx.clone());
                                    let _ = epoch
                                        .outbound_tx
                                        .send(Message::Connect { id, host, port }.encode().freeze());
                                }
                                SocksAction::Data(data) => {
                                    if let Some(id) = stream_id {
                                        let _ = epoch
                                            .outbound_tx
                                            .send(Message::DataOut { id, data }.encode().freeze());
                                    }
                                }
                                SocksAction::Close => {
                                    should_close = true;
                                    break;
                                }
                            }
                        }
                        if should_close {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    if !abort {
        let _ = socket.shutdown().await;
    }
    Ok(())
}

async fn wait_for_epoch(epoch_rx: &mut EpochWatch) -> Arc<TunnelEpoch> {
    loop {
        if let Some(epoch) = epoch_rx.borrow().clone() {
            return epoch;
        }
        if epoch_rx.changed().await.is_err() {
            // Sender dropped (process shutting down); park forever rather
            // than busy-loop — the task is reaped when the socket closes.
            futures::future::pending::<()>().await;
        }
    }
}
