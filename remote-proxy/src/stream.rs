//! Target stream lifecycle (spec §4.5, §3 "Target stream (remote side)").
//! Each accepted CONNECT spawns one task that resolves the host (if
//! needed), buffers any `DATA_OUT` that arrives before the upstream
//! connect completes, and relays bytes once connected. Grounded on
//! `original_source/s54http/server.py::SockProxy`.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tunnel_proto::{Message, StreamId};

use crate::dispatcher::SharedStreams;
use crate::dns::SharedResolver;

/// Messages the dispatcher forwards to a live target stream task.
#[derive(Debug)]
pub enum TargetEvent {
    Data(Bytes),
    CloseLocal,
}

const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Drive one target stream end to end. Removes its own entry from
/// `streams` on every exit path so a second CLOSE_LOCAL or a stale
/// DATA_OUT sees "unknown stream" rather than double-tearing-down.
pub async fn run(
    id: StreamId,
    host: Bytes,
    port: u16,
    resolver: SharedResolver,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    mut events: mpsc::UnboundedReceiver<TargetEvent>,
    streams: SharedStreams,
) {
    let host_str = match std::str::from_utf8(&host) {
        Ok(s) => s.to_owned(),
        Err(_) => {
            warn!("sock_id[{id}] host is not valid UTF-8");
            fail_connect(&outbound_tx, id, &streams).await;
            return;
        }
    };

    // Buffer whatever DATA_OUT/CLOSE_LOCAL arrives while resolution is in
    // flight — the dispatcher never blocks waiting on us (spec §4.5 step 1).
    let mut pending = BytesMut::new();
    let mut closed_early = false;

    let resolve_fut = resolver.resolve(&host_str);
    tokio::pin!(resolve_fut);

    let addr = loop {
        tokio::select! {
            res = &mut resolve_fut => {
                match res {
                    Ok(addr) => break addr,
                    Err(e) => {
                        warn!("sock_id[{id}] resolve host[{host_str}] failed[{e}]");
                        fail_connect(&outbound_tx, id, &streams).await;
                        return;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(TargetEvent::Data(data)) => pending.extend_from_slice(&data),
                    Some(TargetEvent::CloseLocal) | None => {
                        closed_early = true;
                        break String::new();
                    }
                }
            }
        }
    };

    if closed_early {
        streams.lock().await.remove(&id);
        return;
    }

    debug!("sock_id[{id}] resolved {host_str} -> {addr}");

    // Spec §4.5 step 3: resolution alone does not open the upstream TCP —
    // only if DATA_OUT is already buffered. Otherwise wait for the first
    // DATA_OUT to arrive (mirrors `SockProxy.resolveOk`/`sendRemote`'s
    // `has_connect` gating in `original_source/s54http/server.py`).
    if pending.is_empty() {
        loop {
            match events.recv().await {
                Some(TargetEvent::Data(data)) => {
                    pending.extend_from_slice(&data);
                    break;
                }
                Some(TargetEvent::CloseLocal) | None => {
                    info!("sock_id[{id}] local closed before any data was sent");
                    streams.lock().await.remove(&id);
                    return;
                }
            }
        }
    }

    info!("sock_id[{id}] connect {host_str}:{port} -> {addr}");
    let upstream = match TcpStream::connect((addr.as_str(), port)).await {
        Ok(s) => {
            s.set_nodelay(true).ok();
            s
        }
        Err(e) => {
            warn!("sock_id[{id}] connect {host_str}:{port} failed[{e}]");
            fail_connect(&outbound_tx, id, &streams).await;
            return;
        }
    };

    let (mut read_half, mut write_half) = upstream.into_split();

    if !pending.is_empty() && write_half.write_all(&pending).await.is_err() {
        close_remote(&outbound_tx, id, &streams).await;
        return;
    }

    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(TargetEvent::Data(data)) => {
                        if write_half.write_all(&data).await.is_err() {
                            close_remote(&outbound_tx, id, &streams).await;
                            return;
                        }
                    }
                    Some(TargetEvent::CloseLocal) | None => {
                        info!("sock_id[{id}] local closed");
                        streams.lock().await.remove(&id);
                        return;
                    }
                }
            }
            n = read_half.read(&mut buf) => {
                match n {
                    Ok(0) => {
                        close_remote(&outbound_tx, id, &streams).await;
                        return;
                    }
                    Ok(n) => {
                        let _ = outbound_tx.send(
                            Message::DataIn { id, data: Bytes::copy_from_slice(&buf[..n]) }
                                .encode()
                                .freeze(),
                        );
                    }
                    Err(_) => {
                        close_remote(&outbound_tx, id, &streams).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn fail_connect(outbound_tx: &mpsc::UnboundedSender<Bytes>, id: StreamId, streams: &SharedStreams) {
    let _ = outbound_tx.send(Message::ConnectReply { id, code: 1 }.encode().freeze());
    streams.lock().await.remove(&id);
}

async fn close_remote(outbound_tx: &mpsc::UnboundedSender<Bytes>, id: StreamId, streams: &SharedStreams) {
    let _ = outbound_tx.send(Message::CloseRemote { id }.encode().freeze());
    streams.lock().await.remove(&id);
}

/// Convenience used by the dispatcher when spawning a new stream.
pub fn spawn(
    id: StreamId,
    host: Bytes,
    port: u16,
    resolver: SharedResolver,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    streams: SharedStreams,
) -> mpsc::UnboundedSender<TargetEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(id, host, port, resolver, outbound_tx, rx, streams));
    tx
}

