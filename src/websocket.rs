//! # Voice WebSocket Handler
//!
//! Clients connect to `/ws/voice/{session_id}` (or the older
//! `/ws/realtime-voice/{session_id}`) for a real-time spoken interview.
//!
//! ## Lifecycle:
//! 1. **Upgrade**: unknown sessions get a 404 before the upgrade happens
//! 2. **Connect**: the socket actor registers itself with the connection
//!    manager as a `Transport`; the manager starts a conversation actor
//! 3. **Streaming**: client frames are forwarded, in order, to the conversation
//!    actor; its output comes back through the manager as `SendText`/`SendBinary`
//! 4. **Stop**: the socket asks the manager to disconnect its conversation actor
//!
//! See `conversation::events` for the message formats.

use crate::conversation::actor::ConversationActor;
use crate::conversation::manager::ConnectionManager;
use crate::conversation::transport::Transport;
use crate::error::{AppError, TransportError};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How often protocol-level pings are sent.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Close the socket when the client has been silent this long.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Frames headed for the conversation actor.
enum ClientFrame {
    Text(String),
    Binary(Bytes),
}

/// WebSocket actor for one voice connection.
pub struct VoiceSocket {
    manager: Arc<ConnectionManager>,
    session_id: String,
    actor: Option<ConversationActor>,
    /// Feeds the forwarding task; dropping it ends the task
    frames: Option<mpsc::UnboundedSender<ClientFrame>>,
    last_heartbeat: Instant,
}

impl VoiceSocket {
    pub fn new(manager: Arc<ConnectionManager>, session_id: String) -> Self {
        Self {
            manager,
            session_id,
            actor: None,
            frames: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Spawn the task that hands client frames to the conversation actor one
    /// at a time, so a slow enqueue never reorders audio.
    fn forward_frames(actor: ConversationActor) -> mpsc::UnboundedSender<ClientFrame> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    ClientFrame::Text(text) => actor.handle_text(&text).await,
                    ClientFrame::Binary(data) => actor.handle_binary(data).await,
                }
            }
        });
        tx
    }

    fn forward(&mut self, frame: ClientFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(frames) = &self.frames else {
            debug!(session_id = %self.session_id, "Frame received before the session was ready");
            return;
        };
        if frames.send(frame).is_err() {
            warn!(session_id = %self.session_id, "Frame forwarder stopped, closing socket");
            ctx.stop();
        }
    }
}

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Voice socket opened");

        let transport: Arc<dyn Transport> = Arc::new(ActixTransport::new(ctx.address()));
        let manager = self.manager.clone();
        let session_id = self.session_id.clone();

        // Hold back client frames until the conversation actor exists
        ctx.wait(
            async move { manager.connect(transport, &session_id).await }
                .into_actor(self)
                .map(|result, act, ctx| match result {
                    Ok(actor) => {
                        act.frames = Some(Self::forward_frames(actor.clone()));
                        act.actor = Some(actor);
                    }
                    Err(e) => {
                        warn!(session_id = %act.session_id, "Voice connection rejected: {}", e);
                        ctx.close(Some(ws::CloseReason {
                            code: ws::CloseCode::Policy,
                            description: Some(e.to_string()),
                        }));
                        ctx.stop();
                    }
                }),
        );

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "Voice socket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.frames = None;
        if let Some(actor) = self.actor.take() {
            self.manager.disconnect_actor(&self.session_id, actor.id());
        }
        info!(session_id = %self.session_id, "Voice socket closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(ClientFrame::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward(ClientFrame::Binary(data), ctx);
            }
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "Client closed voice socket: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

#[derive(Message)]
#[rtype(result = "()")]
struct SendBinary(Bytes);

#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket;

impl Handler<SendText> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<SendBinary> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: SendBinary, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<CloseSocket> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// `Transport` over a running `VoiceSocket`.
pub struct ActixTransport {
    addr: Addr<VoiceSocket>,
}

impl ActixTransport {
    pub fn new(addr: Addr<VoiceSocket>) -> Self {
        Self { addr }
    }
}

fn mailbox_error(err: MailboxError) -> TransportError {
    match err {
        MailboxError::Closed => TransportError::Closed,
        MailboxError::Timeout => TransportError::Send("socket mailbox timed out".to_string()),
    }
}

#[async_trait]
impl Transport for ActixTransport {
    /// The HTTP upgrade has already happened; only check the socket is alive.
    async fn accept(&self, _session_id: &str) -> Result<(), TransportError> {
        if self.addr.connected() {
            Ok(())
        } else {
            Err(TransportError::Handshake("socket closed before accept".to_string()))
        }
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.addr.send(SendText(text)).await.map_err(mailbox_error)
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.addr.send(SendBinary(data)).await.map_err(mailbox_error)
    }

    async fn close(&self) {
        // Already stopped is fine
        let _ = self.addr.send(CloseSocket).await;
    }
}

/// WebSocket upgrade for a voice session.
///
/// Serves both `/ws/voice/{session_id}` and `/ws/realtime-voice/{session_id}`.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let session_id = path.into_inner();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "Voice socket upgrade requested"
    );

    if state.store.get(&session_id).await.is_none() {
        return Err(AppError::NotFound(format!("Session {} not found", session_id)).into());
    }

    ws::start(VoiceSocket::new(state.manager.clone(), session_id), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::actor::tests::{silence, speech};
    use crate::state::tests::test_state;
    use actix_web::{test, App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/ws/voice/{session_id}", web::get().to(voice_websocket))
            .route("/ws/realtime-voice/{session_id}", web::get().to(voice_websocket));
    }

    #[actix_web::test]
    async fn test_unknown_session_is_rejected_before_upgrade() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .configure(routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/ws/voice/missing").to_request(),
        )
        .await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    /// Read text events until one named `event` arrives, skipping binary frames.
    async fn next_event(client: &mut Client, event: &str) -> serde_json::Value {
        let wait = async {
            while let Some(message) = client.next().await {
                if let Message::Text(text) = message.unwrap() {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value["event"] == event {
                        return value;
                    }
                }
            }
            panic!("socket closed before {}", event);
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", event))
    }

    #[actix_web::test]
    async fn test_voice_socket_end_to_end() {
        let state = web::Data::new(test_state());
        let session = state
            .store
            .create("Backend engineer".to_string(), Some("technical".to_string()))
            .await;

        let server_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(server_state.clone())
                .configure(routes)
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        let url = format!("ws://{}/ws/realtime-voice/{}", addr, session.session_id);
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let connected = next_event(&mut client, "connected").await;
        assert_eq!(connected["session_id"], session.session_id.as_str());
        assert_eq!(connected["state"], "silence");

        client
            .send(Message::Text(r#"{"event": "ping", "timestamp": 42.0}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_event(&mut client, "pong").await["timestamp"], 42.0);

        client
            .send(Message::Text(r#"{"event": "start_listening"}"#.to_string()))
            .await
            .unwrap();
        next_event(&mut client, "listening_started").await;

        for _ in 0..5 {
            client.send(Message::Binary(speech().to_vec())).await.unwrap();
        }
        client.send(Message::Binary(silence().to_vec())).await.unwrap();
        client
            .send(Message::Text(r#"{"event": "stop_listening"}"#.to_string()))
            .await
            .unwrap();

        let transcript = next_event(&mut client, "final_transcript").await;
        assert_eq!(transcript["text"], "I have five years of experience");
        assert!(!next_event(&mut client, "assistant_text").await["text"]
            .as_str()
            .unwrap()
            .is_empty());
        next_event(&mut client, "speech_start").await;
        assert_eq!(next_event(&mut client, "speech_end").await["interrupted"], false);

        assert_eq!(state.manager.stats().active_connections, 1);

        client.close(None).await.unwrap();
        let wait = async {
            while state.manager.stats().active_connections > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();

        let stored = state.store.get(&session.session_id).await.unwrap();
        assert_eq!(stored.history.len(), 2);

        handle.stop(false).await;
    }

    #[actix_web::test]
    async fn test_reconnect_replaces_connection() {
        let state = web::Data::new(test_state());
        let session = state.store.create("Designer".to_string(), None).await;

        let server_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(server_state.clone())
                .configure(routes)
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        let url = format!("ws://{}/ws/voice/{}", addr, session.session_id);
        let (mut first, _) = tokio_tungstenite::connect_async(url.clone()).await.unwrap();
        next_event(&mut first, "connected").await;

        let (mut second, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        next_event(&mut second, "connected").await;

        // The replaced socket is closed by the server
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match first.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        let stats = state.manager.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);

        second
            .send(Message::Text(r#"{"type": "ping"}"#.to_string()))
            .await
            .unwrap();
        next_event(&mut second, "pong").await;

        handle.stop(false).await;
    }
}
