//! Remote dispatcher (spec §4.5): accepts the inbound mTLS tunnel, demuxes
//! frames onto per-stream tasks, and muxes their replies back onto the
//! tunnel. One dispatcher instance per accepted TLS connection. Grounded
//! on `upstream-server/src/main.rs`'s accept-loop/TLS-acceptor shape and
//! `original_source/s54http/server.py::SocksDispatcher`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use tunnel_proto::{FrameCodec, Message, ProtoError, StreamId};

use crate::config::Config;
use crate::dns::SharedResolver;
use crate::stream::{self, TargetEvent};

pub type SharedStreams = Arc<Mutex<HashMap<StreamId, mpsc::UnboundedSender<TargetEvent>>>>;

pub async fn run(cfg: Config, resolver: SharedResolver) -> Result<()> {
    let server_cfg = Arc::new(
        tunnel_proto::tls::build_server_config(&cfg.tls).context("building TLS server config")?,
    );
    let acceptor = TlsAcceptor::from(server_cfg);

    let listener = TcpListener::bind((cfg.listen.0.as_str(), cfg.listen.1))
        .await
        .with_context(|| format!("binding tunnel listener on {}:{}", cfg.listen.0, cfg.listen.1))?;
    info!("remote proxy listening on {}:{}", cfg.listen.0, cfg.listen.1);

    loop {
        let (tcp, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        tcp.set_nodelay(true).ok();

        let acceptor = acceptor.clone();
        let resolver = resolver.clone();
        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(tls_stream) => {
                    info!("tunnel established with {peer_addr}");
                    run_tunnel(tls_stream, resolver).await;
                    info!("tunnel with {peer_addr} closed");
                }
                Err(e) => {
                    warn!("TLS handshake with {peer_addr} failed: {e}");
                }
            }
        });
    }
}

async fn run_tunnel(tls_stream: tokio_rustls::server::TlsStream<TcpStream>, resolver: SharedResolver) {
    let streams: SharedStreams = Arc::new(Mutex::new(HashMap::new()));
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();

    let framed = Framed::new(tls_stream, FrameCodec::default());
    let (mut sink, mut source) = framed.split();

    let reader = {
        let streams = streams.clone();
        let outbound_tx = outbound_tx.clone();
        let resolver = resolver.clone();
        async move {
            loop {
                match source.next().await {
                    Some(Ok(frame)) => {
                        if let Err(e) =
                            handle_inbound(frame, &streams, &outbound_tx, &resolver).await
                        {
                            error!("inbound demux error: {e}");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("tunnel framing error: {e}");
                        break;
                    }
                    None => break,
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

    abort_all(&streams).await;
}

async fn handle_inbound(
    frame: Bytes,
    streams: &SharedStreams,
    outbound_tx: &mpsc::UnboundedSender<Bytes>,
    resolver: &SharedResolver,
) -> Result<(), ProtoError> {
    let message = match Message::decode(frame) {
        Ok(m) => m,
        Err(ProtoError::UnknownType(t)) => {
            warn!("dropping unknown message type {t}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    match message {
        Message::Connect { id, host, port } => {
            info!("sock_id[{id}] connect request host_len={} port={port}", host.len());
            let tx = stream::spawn(id, host, port, resolver.clone(), outbound_tx.clone(), streams.clone());
            streams.lock().await.insert(id, tx);
        }
        Message::DataOut { id, data } => {
            let table = streams.lock().await;
            if let Some(tx) = table.get(&id) {
                let _ = tx.send(TargetEvent::Data(data));
            } else {
                warn!("sock_id[{id}] receive data after closed");
            }
        }
        Message::CloseLocal { id } => {
            let mut table = streams.lock().await;
            if let Some(tx) = table.remove(&id) {
                let _ = tx.send(TargetEvent::CloseLocal);
            } else {
                warn!("sock_id[{id}] closed again");
            }
        }
        other => {
            warn!("unexpected message direction on remote side: {other:?}");
        }
    }
    Ok(())
}

async fn abort_all(streams: &SharedStreams) {
    let mut table = streams.lock().await;
    for (_, tx) in table.drain() {
        let _ = tx.send(TargetEvent::CloseLocal);
    }
}
