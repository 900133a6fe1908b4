use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use service::{Hub, proto::IceConfig};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

use crate::{config::Config, observer::Observer};

/// Limit the size of inbound frames; no legal frame comes close and an
/// oversized one is a transport fault, not a protocol error.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

struct AppState {
    config: Arc<Config>,
    hub: Arc<Hub<Observer>>,
}

/// Start the public server: the signaling WebSocket, the thin auxiliary
/// endpoints, and the static frontend when the public dir exists.
pub async fn start_server(config: Arc<Config>, hub: Arc<Hub<Observer>>) -> Result<()> {
    let state = Arc::new(AppState { config: config.clone(), hub });

    let mut app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/turn", get(turn_credentials))
        .route("/api/push/public-key", get(push_public_key))
        .route("/ws", get(upgrade))
        .with_state(state);

    if config.net.public_dir.is_dir() {
        app = app.fallback_service(ServeDir::new(&config.net.public_dir));
    } else {
        log::warn!("public dir not found: path={:?}, serving api only", config.net.public_dir);
    }

    let listener = TcpListener::bind((config.net.host, config.port())).await?;
    log::info!(
        "hub listening: listen={}, tls={}",
        listener.local_addr()?,
        config.tls.enabled()
    );

    #[cfg(feature = "ssl")]
    if config.tls.enabled() {
        return ssl::serve(listener, &config, app).await;
    }

    #[cfg(not(feature = "ssl"))]
    if config.tls.enabled() {
        anyhow::bail!("tls paths are configured but the ssl feature is compiled out");
    }

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn turn_credentials(State(state): State<Arc<AppState>>) -> Json<IceConfig> {
    Json(crate::turn::ice_config(&state.config.turn))
}

async fn push_public_key(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "enabled": state.config.push.enabled(),
        "publicKey": state.config.push.vapid_public_key,
    }))
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(address): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| session(socket, state, address))
}

/// Drive one signaling connection.
///
/// The select loop owns both directions: frames queued by the hub drain to
/// the socket, inbound text frames run through the hub one at a time, and
/// any terminal condition falls through to the disconnect handler exactly
/// once.
async fn session(socket: WebSocket, state: Arc<AppState>, address: SocketAddr) {
    let (id, mut outbound) = state.hub.accept(address.ip());
    log::info!("websocket accept: addr={address}, session={id}");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };

                let Ok(text) = serde_json::to_string(&frame) else {
                    break;
                };

                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => state.hub.handle_frame(&id, text.as_str()).await,
                    // The transport layer answers pings by itself; binary
                    // frames are not part of this protocol.
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }
    }

    state.hub.disconnect(&id);
    log::info!("websocket disconnect: addr={address}, session={id}");
}

#[cfg(feature = "ssl")]
mod ssl {
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use tokio_rustls::{
        TlsAcceptor,
        rustls::{
            ServerConfig,
            pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
        },
    };
    use tower::{Service, ServiceExt};

    use super::*;

    /// Terminate TLS in-process and hand each stream to hyper.
    ///
    /// `axum::serve` only accepts a plain listener, so the accept loop is
    /// manual: handshake, then drive the connection with upgrades enabled so
    /// the WebSocket route keeps working.
    pub(super) async fn serve(listener: TcpListener, config: &Config, app: Router) -> Result<()> {
        let (Some(cert), Some(key)) = (&config.tls.cert_path, &config.tls.key_path) else {
            anyhow::bail!("tls serving requires both certificate and key paths");
        };

        let acceptor = TlsAcceptor::from(Arc::new(
            ServerConfig::builder().with_no_client_auth().with_single_cert(
                CertificateDer::pem_file_iter(cert)?.collect::<Result<Vec<_>, _>>()?,
                PrivateKeyDer::from_pem_file(key)?,
            )?,
        ));

        let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();

        loop {
            let Ok((socket, address)) = listener.accept().await else {
                continue;
            };

            let acceptor = acceptor.clone();
            let tower_service = make_service.call(address).await.unwrap_or_else(|err| match err {});

            tokio::spawn(async move {
                let Ok(socket) = acceptor.accept(socket).await else {
                    return;
                };

                let hyper_service = service_fn(move |request| tower_service.clone().oneshot(request));

                if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(TokioIo::new(socket), hyper_service)
                    .await
                {
                    log::warn!("tls connection error: addr={address}, err={err:?}");
                }
            });
        }
    }
}
