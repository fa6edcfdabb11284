//! Wire server
//!
//! Length-prefixed JSON frames over persistent TCP, optionally behind TLS.
//! Unary calls dispatch into `VigilApi`; subscriptions stream batched
//! incident events from the hub. The server pings every 15 s and closes a
//! channel silent for 30 s.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use vigil_core::protocol::{read_frame, write_frame, ClientFrame, Envelope};
use vigil_core::VigilApi;

const PING_INTERVAL: Duration = Duration::from_secs(15);
const SILENCE_CUTOFF: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 64;

/// Accept loop. Returns when the shutdown token fires.
pub async fn run(
    api: VigilApi,
    bind: &str,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    tracing::info!(bind, tls = tls.is_some(), "vigil server listening");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("accept failed")?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        tracing::debug!(%peer, "connection accepted");

        let api = api.clone();
        let conn_shutdown = shutdown.clone();
        match &tls {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            handle_connection(api, tls_stream, conn_shutdown).await;
                        }
                        Err(err) => {
                            tracing::warn!(%peer, error = %err, "tls handshake failed");
                        }
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    handle_connection(api, stream, conn_shutdown).await;
                });
            }
        }
    }
}

/// Builds a TLS acceptor from PEM files.
pub fn tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_path).with_context(|| format!("open {}", cert_path))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("parse certificates")?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path).with_context(|| format!("open {}", key_path))?,
    ))
    .context("parse private key")?
    .context("no private key found")?;
    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build tls config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

struct ConnectionState {
    /// Active subscription: hub id plus the forwarder task
    subscription: Option<(u64, tokio::task::JoinHandle<()>)>,
}

async fn handle_connection<S>(api: VigilApi, stream: S, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);

    // Single writer task; everything outbound goes through this channel.
    let (out_tx, out_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let mut state = ConnectionState { subscription: None };
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await; // first tick fires immediately; skip it
    let mut last_inbound = tokio::time::Instant::now();
    let mut ping_seq = 0u64;

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(envelope)) => {
                        last_inbound = tokio::time::Instant::now();
                        if !handle_frame(&api, envelope, &out_tx, &mut state).await {
                            break;
                        }
                    }
                    Ok(None) => break, // clean EOF
                    Err(err) => {
                        tracing::debug!(error = %err, "read failed, closing connection");
                        break;
                    }
                }
            }
            _ = ping_timer.tick() => {
                if last_inbound.elapsed() >= SILENCE_CUTOFF {
                    tracing::debug!("peer silent past cutoff, closing connection");
                    break;
                }
                ping_seq += 1;
                let ping = Envelope::ping(&format!("ping-{}", ping_seq));
                if out_tx.send(ping).await.is_err() {
                    break;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    if let Some((sub_id, task)) = state.subscription.take() {
        api.unsubscribe(sub_id);
        task.abort();
    }
    drop(out_tx);
    let _ = writer_task.await;
}

async fn write_loop<S>(mut writer: WriteHalf<S>, mut rx: mpsc::Receiver<Envelope>)
where
    S: AsyncRead + AsyncWrite,
{
    while let Some(envelope) = rx.recv().await {
        if let Err(err) = write_frame(&mut writer, &envelope).await {
            tracing::debug!(error = %err, "write failed, dropping connection");
            return;
        }
    }
}

/// Dispatches one inbound frame. Returns false to close the connection.
async fn handle_frame(
    api: &VigilApi,
    envelope: Envelope,
    out_tx: &mpsc::Sender<Envelope>,
    state: &mut ConnectionState,
) -> bool {
    let frame = match ClientFrame::from_envelope(envelope) {
        Ok(frame) => frame,
        Err(err) => {
            // Malformed frame: answer with a correlated error if possible
            tracing::debug!(error = %err, "unparseable frame");
            return out_tx.send(Envelope::error("", &err)).await.is_ok();
        }
    };

    match frame {
        ClientFrame::Call { id, method, params } => {
            let response = match api.handle_call(&method, params).await {
                Ok(result) => Envelope::result(&id, result),
                Err(err) => Envelope::error(&id, &err),
            };
            out_tx.send(response).await.is_ok()
        }
        ClientFrame::Subscribe { id, filter } => {
            // One subscription per connection; a new one replaces the old
            if let Some((old_id, task)) = state.subscription.take() {
                api.unsubscribe(old_id);
                task.abort();
            }
            let (sub_id, mut rx) = api.stream_incidents(filter);
            if out_tx.send(Envelope::subscribed(&id, sub_id)).await.is_err() {
                api.unsubscribe(sub_id);
                return false;
            }
            let forward_tx = out_tx.clone();
            let stream_id = id.clone();
            let task = tokio::spawn(async move {
                while let Some(batch) = rx.recv().await {
                    let payload = match serde_json::to_value(&batch) {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    if forward_tx
                        .send(Envelope::event(&stream_id, payload))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
            state.subscription = Some((sub_id, task));
            true
        }
        ClientFrame::Unsubscribe { .. } => {
            if let Some((sub_id, task)) = state.subscription.take() {
                api.unsubscribe(sub_id);
                task.abort();
            }
            true
        }
        ClientFrame::Ping { id } => out_tx.send(Envelope::pong(&id)).await.is_ok(),
        ClientFrame::Pong { .. } => {
            if let Some((sub_id, _)) = &state.subscription {
                api.heartbeat(*sub_id);
            }
            true
        }
        ClientFrame::Unknown { kind, .. } => {
            // Back-compat: unknown frame types are ignored
            tracing::debug!(kind, "ignoring unknown frame type");
            true
        }
    }
}
