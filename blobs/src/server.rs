//! HTTP and WebSocket surface of the relay.

use std::fmt::Write as _;
use std::future::Future;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use blobs_proto::{BlobId, PeerId, SessionMessage, decode_session, encode_session};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{Error, Result};
use crate::relay::{Created, Joined, Relay};
use crate::token::Grant;
use crate::tunnel::{PeerSession, TunnelHandle};

/// JSON body of an error response.
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    /// Error kind, see [`Error::kind`].
    error: &'a str,
    /// Human-readable detail.
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Capacity | Self::Busy(_) => StatusCode::CONFLICT,
            Self::Config(_) | Self::Internal(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Address of the caller, from the configured proxy header or the TCP peer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ClientIp(pub String);

impl FromRequestParts<Relay> for ClientIp {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, relay: &Relay) -> Result<Self> {
        if let Some(name) = &relay.config().client_ip_header {
            return parts
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| Self(v.to_owned()))
                .ok_or_else(|| Error::BadRequest(format!("missing {name} header")));
        }
        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| Self(addr.ip().to_string()))
            .ok_or_else(|| Error::Internal("client address unavailable".into()))
    }
}

/// `?t=` of an authenticated request.
#[derive(Debug, Deserialize)]
struct TokenQuery {
    /// Capability token.
    t: Option<String>,
}

/// A caller whose token checked out, with the tunnel it names.
#[derive(Debug)]
#[non_exhaustive]
pub struct Authorized {
    /// What the token grants.
    pub grant: Grant,
    /// The tunnel it grants it on.
    pub tunnel: TunnelHandle,
}

impl FromRequestParts<Relay> for Authorized {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, relay: &Relay) -> Result<Self> {
        let ClientIp(ip) = ClientIp::from_request_parts(parts, relay).await?;
        let Query(query) = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .map_err(|e| Error::BadRequest(e.body_text()))?;
        let token = query
            .t
            .filter(|t| !t.is_empty())
            .ok_or(Error::Unauthorized("missing token"))?;
        let (grant, tunnel) = relay.authorize(&token, &ip)?;
        Ok(Self { grant, tunnel })
    }
}

/// Builds the relay's router.
pub fn router(relay: Relay) -> Router {
    let api = Router::new()
        .route("/new", put(create))
        .route("/join", put(join))
        .route("/tunnel", get(tunnel))
        .route("/download", get(download))
        .route("/session", get(session))
        .layer(middleware::from_fn_with_state(relay.clone(), check_origin));
    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(relay)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve(
    relay: Relay,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "relay listening");
    axum::serve(
        listener,
        router(relay).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    info!("relay stopped");
    Ok(())
}

/// Rejects callers from origins outside the allow-list and answers CORS
/// preflights for the ones inside it.
async fn check_origin(State(relay): State<Relay>, request: Request, next: Next) -> Response {
    let allowed = &relay.config().allowed_origins;
    if allowed.is_empty() {
        return next.run(request).await;
    }
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .filter(|value| value.to_str().is_ok_and(|o| allowed.iter().any(|a| a == o)))
        .cloned();
    let Some(origin) = origin else {
        return Error::BadRequest("unrecognized origin".into()).into_response();
    };

    let mut response = if request.method() == Method::OPTIONS {
        let mut preflight = StatusCode::NO_CONTENT.into_response();
        preflight.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, PUT, OPTIONS"),
        );
        preflight
    } else {
        next.run(request).await
    };
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    response
}

/// Liveness check.
async fn health() -> &'static str {
    "ok"
}

/// Opens a tunnel; the caller becomes its creator.
async fn create(State(relay): State<Relay>, ClientIp(ip): ClientIp) -> Result<Json<Created>> {
    Ok(Json(relay.create(&ip)?))
}

/// `?s=` of a join request.
#[derive(Debug, Deserialize)]
struct JoinQuery {
    /// Pairing secret.
    s: Option<String>,
}

/// Redeems a pairing secret; the caller becomes the joiner.
async fn join(
    State(relay): State<Relay>,
    ClientIp(ip): ClientIp,
    Query(query): Query<JoinQuery>,
) -> Result<Json<Joined>> {
    let secret = query
        .s
        .ok_or_else(|| Error::BadRequest("missing pairing secret".into()))?;
    Ok(Json(relay.join(&secret, &ip)?))
}

/// Attaches a peer socket. The slot is claimed before upgrading, so a full
/// tunnel answers with an HTTP error instead of a socket that closes.
async fn tunnel(
    State(relay): State<Relay>,
    Authorized { grant, tunnel }: Authorized,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let session = tunnel.connect(grant.peer).await?;
    let span = info_span!("socket", tunnel = tunnel.id(), peer = %grant.peer);
    Ok(ws
        .max_message_size(relay.config().max_message_size)
        .on_upgrade(move |socket| pump(socket, session).instrument(span)))
}

/// Moves frames between a peer socket and its tunnel until either side
/// stops.
async fn pump(socket: WebSocket, session: PeerSession) {
    let (inbound, mut outbound) = session.split();
    let (mut sink, mut stream) = socket.split();
    debug!("socket attached");

    let writer = async {
        while let Some(msg) = outbound.recv().await {
            let frame = match blobs_proto::encode(&msg) {
                Ok(buf) => WsMessage::Binary(buf.into()),
                Err(e) => {
                    warn!(error = %e, kind = msg.kind(), "dropping unencodable message");
                    continue;
                }
            };
            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "socket write failed");
                return;
            }
        }
        let _ = sink.close().await;
    };
    let reader = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Binary(data)) => {
                    if let Err(e) = inbound.deliver(&data) {
                        warn!(error = %e, len = data.len(), "dropping malformed frame");
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(WsMessage::Text(_)) => debug!("ignoring text frame"),
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "socket read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        () = writer => debug!("tunnel closed the socket"),
        () = reader => debug!("peer closed the socket"),
    }
    drop(inbound);
}

/// `?o=&i=` of a download, next to the token.
#[derive(Debug, Deserialize)]
struct DownloadQuery {
    /// Owner's peer id, `1` or `2`.
    o: Option<String>,
    /// Owner-assigned blob id.
    i: Option<String>,
}

/// Streams a blob from its uploader as the response body.
async fn download(
    Authorized { grant, tunnel }: Authorized,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let owner: PeerId = query
        .o
        .ok_or_else(|| Error::BadRequest("missing owner".into()))?
        .parse()
        .map_err(|e: blobs_proto::ParsePeerIdError| Error::BadRequest(e.to_string()))?;
    let id = query
        .i
        .filter(|i| !i.is_empty())
        .ok_or_else(|| Error::BadRequest("missing blob id".into()))?;

    let source = tunnel.download(BlobId::new(owner, id)).await?;
    let meta = source.metadata().clone();
    info!(tunnel = tunnel.id(), blob = %meta.id, by = %grant.peer, size = meta.size, "download started");

    let content_type = Some(meta.mime_type.as_str())
        .filter(|m| !m.is_empty())
        .and_then(|m| HeaderValue::from_str(m).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, content_disposition(&meta.name))
        .header(header::CONTENT_ENCODING, "gzip")
        .header(header::CONNECTION, "close")
        .body(Body::from_stream(source.into_stream()))
        .map_err(|e| Error::Internal(e.to_string()))
}

/// `attachment; filename="…"`, adding an RFC 5987 `filename*` for names
/// that are not plain ASCII.
fn content_disposition(name: &str) -> HeaderValue {
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    let mut value = format!("attachment; filename=\"{fallback}\"");
    if !name.is_ascii() {
        value.push_str("; filename*=UTF-8''");
        for b in name.bytes() {
            if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
                value.push(char::from(b));
            } else {
                let _ = write!(value, "%{b:02X}");
            }
        }
    }
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Waiting-room socket, spoken in JSON text frames.
async fn session(
    State(relay): State<Relay>,
    ClientIp(ip): ClientIp,
    ws: WebSocketUpgrade,
) -> Response {
    let span = info_span!("session", %ip);
    ws.on_upgrade(move |socket| waiting_room(socket, relay, ip).instrument(span))
}

/// Echoes keepalives and creates tunnels on request.
async fn waiting_room(mut socket: WebSocket, relay: Relay, ip: String) {
    while let Some(Ok(frame)) = socket.recv().await {
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let reply = match decode_session(text.as_str()) {
            Ok(SessionMessage::Keepalive) => SessionMessage::Keepalive,
            Ok(SessionMessage::TunnelCreate) => match relay.create(&ip) {
                Ok(created) => SessionMessage::TunnelCreated {
                    tunnel_id: created.tunnel_id,
                    secret: created.secret,
                    token: created.token,
                },
                Err(e) => {
                    warn!(error = %e, "could not create tunnel");
                    continue;
                }
            },
            Ok(other) => {
                debug!(?other, "ignoring session message");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "malformed session message");
                continue;
            }
        };
        let answer = match encode_session(&reply) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "could not encode session reply");
                continue;
            }
        };
        if socket.send(WsMessage::Text(answer.into())).await.is_err() {
            break;
        }
    }
    debug!("session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_quotes_plain_names() {
        assert_eq!(
            content_disposition("a.txt"),
            "attachment; filename=\"a.txt\""
        );
        assert_eq!(
            content_disposition("say \"hi\".txt"),
            "attachment; filename=\"say _hi_.txt\""
        );
    }

    #[test]
    fn disposition_encodes_unicode_names() {
        assert_eq!(
            content_disposition("résumé.pdf"),
            "attachment; filename=\"r_sum_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"
        );
    }

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (Error::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthorized("x"), StatusCode::FORBIDDEN),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::Capacity, StatusCode::CONFLICT),
            (
                Error::Busy(BlobId::new(PeerId::Creator, "1")),
                StatusCode::CONFLICT,
            ),
            (Error::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Config("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
