use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use tungstenite::Message;

use crate::{
    context::RequestContext,
    server::{
        client::Connection,
        message::{self, JsonRpcResponse},
        ServerState,
    },
    utils::error::{JsonRpcError, RelayError},
};

/// Decodes one text frame and produces the reply frame: a single response
/// object for an object request, an array for a batch.
#[instrument(skip_all, fields(request_id = %ctx.request_id))]
async fn handle_text(
    text: &str,
    conn: &Arc<Connection>,
    state: &ServerState,
    ctx: &RequestContext,
) -> Result<Message, RelayError> {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("{} Failed to parse message: {}", ctx, e);
            let response = JsonRpcResponse::error(JsonRpcError::invalid_request(), Value::Null);
            return Message::try_from(&response);
        }
    };

    match parsed {
        Value::Array(requests) => {
            let responses = state.dispatcher.dispatch_batch(conn, requests, ctx).await;
            message::create_batch_message(&responses)
        }
        request => {
            let response = state.dispatcher.dispatch(conn, request, ctx).await;
            Message::try_from(&response)
        }
    }
}

/// Processes one inbound text frame on its own task so slow upstream calls
/// never stall the read loop.
fn spawn_request(text: String, conn: Arc<Connection>, state: Arc<ServerState>) {
    tokio::spawn(async move {
        let ctx = RequestContext::new(conn.id, conn.ip());
        match handle_text(&text, &conn, &state, &ctx).await {
            Ok(reply) => {
                if let Err(e) = conn.send(reply) {
                    debug!("{} Dropping response: {}", ctx, e);
                }
            }
            Err(e) => error!("{} Failed to encode response: {}", ctx, e),
        }
    });
}

/// Sends keep-alive pings until the connection closes. Pings are not
/// activity and do not postpone the inactivity TTL.
fn spawn_ping_task(conn: &Arc<Connection>, period: Option<Duration>) -> Option<JoinHandle<()>> {
    let period = period?;
    let conn = conn.clone();
    Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = conn.closed() => break,
            }
            if conn.send_untracked(message::create_ping_message()).is_err() {
                break;
            }
        }
    }))
}

/// Reads frames until the peer goes away or the connection is closed locally.
async fn read_loop<R>(
    reader: &mut R,
    conn: &Arc<Connection>,
    state: &Arc<ServerState>,
) -> Result<(), RelayError>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = conn.closed() => return Ok(()),
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let frame = frame.map_err(|e| RelayError::ConnectionError(e.to_string()))?;

        state.metrics.messages_received.inc();
        state.limiter.reset_inactivity_ttl_timer(conn);

        match frame {
            Message::Text(text) => spawn_request(text, conn.clone(), state.clone()),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => spawn_request(text, conn.clone(), state.clone()),
                Err(_) => {
                    let response =
                        JsonRpcResponse::error(JsonRpcError::invalid_request(), Value::Null);
                    conn.send(Message::try_from(&response)?)?;
                }
            },
            Message::Close(frame) => {
                debug!("Connection {} sent close frame: {:?}", conn.id, frame);
                return Ok(());
            }
            _ => {}
        }
    }
}

/// Runs one WebSocket connection from handshake to teardown.
///
/// # Arguments
///
/// * `stream` - The accepted TCP or TLS stream.
/// * `addr` - The peer address.
/// * `state` - Shared server state.
///
/// # Errors
///
/// Returns `RelayError::ConnectionError` if the handshake fails or the
/// socket errors mid-session. Teardown runs in either case once the
/// connection has been counted.
#[instrument(skip(stream, state))]
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| RelayError::ConnectionError(e.to_string()))?;
    let (writer, mut reader) = ws_stream.split();
    let conn = Connection::with_writer(addr, writer, state.metrics.messages_sent.clone());

    let snapshot = state.limiter.increment_counters(&conn);
    info!(
        "New connection {} from {}. Current active connections: {}",
        conn.id,
        addr,
        state.limiter.connection_count()
    );

    if !state.limiter.apply_limits(&conn, snapshot) {
        state.limiter.decrement_counters(&conn);
        return Ok(());
    }

    state.clients.add(conn.clone());
    let ping_interval = state.config.read().ping_interval();
    let ping_task = spawn_ping_task(&conn, ping_interval);

    let result = read_loop(&mut reader, &conn, &state).await;
    if let Err(e) = &result {
        warn!("Connection {} ended with error: {}", conn.id, e);
    }

    conn.mark_closed();
    if let Some(task) = ping_task {
        task.abort();
    }
    let removed = state.relay.subs().unsubscribe(conn.id, None);
    state.limiter.decrement_subs(&conn, removed);
    state.limiter.decrement_counters(&conn);
    state.clients.remove(&conn.id);
    state
        .metrics
        .connection_duration
        .observe(conn.created_at.elapsed().as_secs_f64());

    info!(
        "Connection {} closed after {:?}. Current active connections: {}",
        conn.id,
        conn.created_at.elapsed(),
        state.limiter.connection_count()
    );
    result
}

/// Accepts TCP connections forever, upgrading to TLS when configured, and
/// runs each connection on its own task.
pub async fn accept_connections(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let result = match state.tls_acceptor.clone() {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => handle_connection(tls_stream, addr, state).await,
                    Err(e) => {
                        error!("TLS handshake with {} failed: {}", addr, e);
                        return;
                    }
                },
                None => handle_connection(stream, addr, state).await,
            };
            if let Err(e) = result {
                debug!("Connection from {} failed: {}", addr, e);
            }
        });
    }
}
