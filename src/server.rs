//! The WebSocket server: connection lifecycle, the per-connection message
//! dispatcher, and the NIP-11 HTTP surface, all on a single axum route.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::{mpsc, Notify};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::connection::ConnectionContext;
use crate::error::{InitError, ProtocolError, StoreError};
use crate::message::{ClientMessage, RelayMessage};
use crate::negentropy::{decode_id_list, encode_id_list};
use crate::nips::{nip11, nip42};
use crate::policy::{ingest_event, ModuleRegistry};
use crate::store::EventStore;
use crate::subscriptions::SubscriptionManager;
use crate::util::unix_now;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Shared dependencies, built once at startup.
pub struct AppState {
    pub cfg: RelayConfig,
    pub store: EventStore,
    pub subs: SubscriptionManager,
    pub modules: ModuleRegistry,
}

pub async fn build_state(cfg: RelayConfig) -> Result<Arc<AppState>, InitError> {
    let store = EventStore::open(&cfg.db_path).await.map_err(|e| match e {
        StoreError::Database(db) => InitError::Database(db),
        other => InitError::Config(other.to_string()),
    })?;
    let subs = SubscriptionManager::new(
        cfg.max_subscriptions_per_connection,
        cfg.max_filters_per_subscription,
    );
    Ok(Arc::new(AppState {
        cfg,
        store,
        subs,
        modules: ModuleRegistry::builtin(),
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind, serve, and drain on SIGINT/SIGTERM.
pub async fn run(cfg: RelayConfig) -> Result<(), InitError> {
    let state = build_state(cfg).await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], state.cfg.listen_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!("cannot install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("termination signal received, draining connections");
}

async fn root(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(ws) = ws {
        return ws
            .on_upgrade(move |socket| handle_socket(socket, state, addr))
            .into_response();
    }

    if let Some(accept) = headers.get("accept") {
        if accept
            .to_str()
            .unwrap_or("")
            .contains("application/nostr+json")
        {
            let doc = nip11::build_info_document(&state.modules, &state.cfg);
            return Json(doc).into_response();
        }
    }

    format!(
        "{}: a Nostr relay. Connect with a WebSocket client.",
        state.cfg.name
    )
    .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let mut ctx = ConnectionContext::new(&state.cfg, addr.to_string());
    let conn_id = ctx.conn_id.clone();
    debug!(%conn_id, %addr, "websocket connection established");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.cfg.outbound_queue_size);
    let disconnect = Arc::new(Notify::new());
    state
        .subs
        .register(&conn_id, tx.clone(), disconnect.clone())
        .await;

    // Writer task: the only thing that touches the socket sink.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sender.send(msg).await {
                warn!("failed to send message: {e}");
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Keepalive pings.
    let tx_ping = tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if tx_ping.send(Message::Ping(vec![])).await.is_err() {
                break;
            }
        }
    });

    send(&tx, RelayMessage::auth(ctx.challenge.clone())).await;

    let mut sweep = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > state.cfg.max_message_length {
                            send(&tx, RelayMessage::notice(format!(
                                "invalid: message exceeds {} bytes",
                                state.cfg.max_message_length
                            ))).await;
                            continue;
                        }
                        if !ctx.within_rate() {
                            send(&tx, RelayMessage::notice("rate-limited: slow down")).await;
                            continue;
                        }
                        handle_text(&text, &mut ctx, &state, &tx).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        send(&tx, RelayMessage::notice(
                            format!("invalid: {}", ProtocolError::BinaryFrame),
                        )).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        warn!(%conn_id, "websocket error: {e}");
                        break;
                    }
                    None => break,
                }
            }
            _ = disconnect.notified() => {
                let reason = state.subs.take_disconnect_reason(&conn_id).await;
                warn!(%conn_id, reason = reason.as_deref().unwrap_or("unknown"),
                    "server-initiated disconnect");
                break;
            }
            _ = sweep.tick() => {
                for sub_id in ctx.sessions.expire(Instant::now()) {
                    send(&tx, RelayMessage::neg_err(sub_id, "closed: session timeout")).await;
                }
            }
        }
    }

    state.subs.unregister(&conn_id).await;
    send_task.abort();
    heartbeat_task.abort();
    debug!(%conn_id, "websocket connection terminated");
}

/// Dispatch one inbound text frame. Runs on the connection's reader task,
/// so messages from one client are handled strictly in receive order.
pub async fn handle_text(
    text: &str,
    ctx: &mut ConnectionContext,
    state: &AppState,
    tx: &mpsc::Sender<Message>,
) {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(conn_id = %ctx.conn_id, "bad frame: {e}");
            send(tx, RelayMessage::notice(format!("invalid: {e}"))).await;
            return;
        }
    };

    match msg {
        ClientMessage::Event(event) => {
            let event_id = event.id.clone();
            let outcome =
                ingest_event(*event, &ctx.snapshot(), &state.cfg, &state.store, &state.modules)
                    .await;
            send(
                tx,
                RelayMessage::ok(event_id, outcome.accepted, outcome.message),
            )
            .await;
            if let Some(admitted) = outcome.broadcast {
                let delivered = state.subs.broadcast(&admitted).await;
                debug!(id = %admitted.id, delivered, "event fanned out");
            }
        }
        ClientMessage::Req { sub_id, filters } => {
            handle_req(sub_id, filters, ctx, state, tx).await;
        }
        ClientMessage::Close(sub_id) => {
            // Client-initiated teardown draws no CLOSED frame.
            state.subs.close(&ctx.conn_id, &sub_id).await;
        }
        ClientMessage::Count { sub_id, filters } => {
            match state.store.count(&filters).await {
                Ok(count) => send(tx, RelayMessage::count(sub_id, count)).await,
                Err(e) => {
                    warn!("count query failed: {e}");
                    send(tx, RelayMessage::closed(sub_id, "error: count failed")).await;
                }
            }
        }
        ClientMessage::Auth(event) => {
            let event_id = event.id.clone();
            match nip42::verify_auth(&event, &ctx.challenge, &state.cfg, unix_now()) {
                Ok(pubkey) => {
                    info!(conn_id = %ctx.conn_id, %pubkey, "connection authenticated");
                    ctx.auth_pubkey = Some(pubkey);
                    send(tx, RelayMessage::ok(event_id, true, "")).await;
                }
                Err(reason) => {
                    send(tx, RelayMessage::ok(event_id, false, reason)).await;
                }
            }
        }
        ClientMessage::NegOpen {
            sub_id,
            filter,
            initial_msg,
        } => {
            let client_ids = match decode_id_list(&initial_msg) {
                Ok(ids) => ids,
                Err(e) => {
                    send(tx, RelayMessage::neg_err(sub_id, format!("error: {e}"))).await;
                    return;
                }
            };
            let relay_ids = match state.store.ids_matching(&filter).await {
                Ok(ids) => ids.into_iter().collect(),
                Err(e) => {
                    warn!("negentropy id query failed: {e}");
                    send(tx, RelayMessage::neg_err(sub_id, "error: query failed")).await;
                    return;
                }
            };
            match ctx.sessions.open(&sub_id, relay_ids, &client_ids) {
                Ok(needs) => {
                    send(tx, RelayMessage::neg_msg(sub_id, encode_id_list(&needs))).await;
                }
                Err(reason) => send(tx, RelayMessage::neg_err(sub_id, reason)).await,
            }
        }
        ClientMessage::NegMsg { sub_id, msg } => {
            let client_ids = match decode_id_list(&msg) {
                Ok(ids) => ids,
                Err(e) => {
                    send(tx, RelayMessage::neg_err(sub_id, format!("error: {e}"))).await;
                    return;
                }
            };
            match ctx.sessions.reconcile(&sub_id, &client_ids) {
                Ok(needs) => {
                    send(tx, RelayMessage::neg_msg(sub_id, encode_id_list(&needs))).await;
                }
                Err(reason) => send(tx, RelayMessage::neg_err(sub_id, reason)).await,
            }
        }
        ClientMessage::NegClose { sub_id } => {
            ctx.sessions.close(&sub_id);
        }
    }
}

async fn handle_req(
    sub_id: String,
    mut filters: Vec<crate::filter::Filter>,
    ctx: &mut ConnectionContext,
    state: &AppState,
    tx: &mpsc::Sender<Message>,
) {
    if sub_id.len() > state.cfg.max_subid_length {
        send(
            tx,
            RelayMessage::closed(sub_id, "invalid: subscription id too long"),
        )
        .await;
        return;
    }
    if let Err(reason) = state
        .subs
        .check_caps(&ctx.conn_id, &sub_id, filters.len())
        .await
    {
        send(tx, RelayMessage::closed(sub_id, reason)).await;
        return;
    }

    for filter in &mut filters {
        if let Some(limit) = filter.limit {
            filter.limit = Some(limit.min(state.cfg.max_limit));
        }
    }

    let events = match state.store.query(&filters).await {
        Ok(events) => events,
        Err(e) => {
            warn!("stored-history query failed: {e}");
            send(tx, RelayMessage::closed(sub_id, "error: query failed")).await;
            return;
        }
    };

    debug!(conn_id = %ctx.conn_id, %sub_id, count = events.len(), "replaying stored history");
    for event in events {
        send(tx, RelayMessage::event(sub_id.clone(), event)).await;
    }
    send(tx, RelayMessage::eose(sub_id.clone())).await;

    // Going live only after EOSE keeps real-time frames strictly behind
    // the stored-history replay for this subscription.
    state.subs.open(&ctx.conn_id, &sub_id, filters).await;
}

async fn send(tx: &mpsc::Sender<Message>, msg: RelayMessage) {
    let _ = tx.send(Message::Text(msg.as_json())).await;
}
