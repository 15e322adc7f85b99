//! # WebSocket Relay Handler
//!
//! Bridges actix WebSocket connections to the two transport-agnostic engines.
//!
//! ## Endpoints:
//! - **`/ws`**: duplex [`Session`](crate::audio::session::Session); raw codec bytes in,
//!   tagged binary frames out
//! - **`/pipeline`**: discrete [`TurnPipeline`](crate::pipeline::turn::TurnPipeline);
//!   JSON messages in (text or binary), JSON text frames out
//!
//! ## Connection Lifecycle:
//! 1. **Admission**: over `performance.max_concurrent_sessions` the upgrade is refused
//!    with 503
//! 2. **Start**: the actor creates the channels and spawns the engine with fresh state;
//!    inbound frames may be up to `server.max_frame_bytes`
//! 3. **Relay**: client frames go to the engine in arrival order; engine frames are
//!    written back as they come
//! 4. **Close**: the engine's close frame ends the connection; if the client leaves
//!    first, the engine is cancelled and tears down on its own task
//!
//! The actor never blocks on the engine. Client frames wait in a bounded queue of
//! `server.inbound_queue_frames`; a client that overruns it is closed with 1011.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::pipeline::turn::TurnOutcome;
use crate::state::{AppState, SessionSlot};
use crate::transport::{CloseCode, Inbound, Outbound};

/// Which engine serves a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Duplex,
    Pipeline,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Duplex => "duplex",
            Endpoint::Pipeline => "pipeline",
        }
    }
}

impl From<CloseCode> for ws::CloseCode {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => ws::CloseCode::Normal,
            CloseCode::InternalError => ws::CloseCode::Error,
        }
    }
}

/// One WebSocket connection.
pub struct RelaySocket {
    endpoint: Endpoint,
    state: web::Data<AppState>,

    /// Client frames waiting for the engine; `None` once the client is gone
    inbound: Option<mpsc::Sender<Inbound>>,

    /// Cancels the engine when the connection goes away first
    cancel: CancellationToken,

    last_heartbeat: Instant,

    /// Released when the actor is dropped
    _slot: SessionSlot,
}

impl RelaySocket {
    pub fn new(endpoint: Endpoint, state: web::Data<AppState>, slot: SessionSlot) -> Self {
        Self {
            endpoint,
            state,
            inbound: None,
            cancel: CancellationToken::new(),
            last_heartbeat: Instant::now(),
            _slot: slot,
        }
    }

    fn forward(&mut self, frame: Inbound, ctx: &mut ws::WebsocketContext<Self>) {
        self.last_heartbeat = Instant::now();
        let Some(inbound) = &self.inbound else {
            return;
        };

        match inbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    endpoint = self.endpoint.as_str(),
                    capacity = self.state.config.server.inbound_queue_frames,
                    "Engine is not keeping up with the client, closing connection"
                );
                self.inbound = None;
                ctx.close(Some(ws::CloseReason {
                    code: CloseCode::InternalError.into(),
                    description: Some("inbound queue full".to_string()),
                }));
                ctx.stop();
            }
            Err(TrySendError::Closed(_)) => {
                debug!(endpoint = self.endpoint.as_str(), "Engine already finished, dropping frame");
            }
        }
    }

    /// Spawn the engine for this endpoint on its own task.
    fn spawn_engine(&mut self, inbound: mpsc::Receiver<Inbound>, outbound: mpsc::Sender<Outbound>) {
        let metrics = self.state.metrics.clone();
        match self.endpoint {
            Endpoint::Duplex => {
                let session = self.state.new_session();
                self.cancel = session.cancel_token();
                info!(session_id = %session.id(), "Duplex session starting");
                tokio::spawn(async move {
                    match session.run(inbound, outbound).await {
                        Ok(summary) => metrics.session_completed(&summary),
                        Err(e) => {
                            error!(error = %e, "Duplex session failed");
                            metrics.session_failed();
                        }
                    }
                });
            }
            Endpoint::Pipeline => {
                let mut turn = self.state.new_turn();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    match turn.run(inbound, outbound, cancel).await {
                        Ok(TurnOutcome::Completed(summary)) => metrics.turn_completed(&summary),
                        Ok(TurnOutcome::Disconnected) => {}
                        Err(e) => {
                            warn!(error = %e, "Turn failed");
                            metrics.turn_failed();
                        }
                    }
                });
            }
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let server = &self.state.config.server;
        let heartbeat = Duration::from_secs(server.heartbeat_interval_secs.max(1));
        let timeout = Duration::from_secs(server.client_timeout_secs.max(1));
        let inbound_capacity = server.inbound_queue_frames.max(1);
        let outbound_capacity = self.state.config.duplex.channel_capacity.max(1);

        info!(endpoint = self.endpoint.as_str(), "WebSocket connection started");

        ctx.run_interval(heartbeat, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(endpoint = act.endpoint.as_str(), "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
        self.inbound = Some(inbound_tx);
        ctx.add_stream(ReceiverStream::new(outbound_rx));
        self.spawn_engine(inbound_rx, outbound_tx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(endpoint = self.endpoint.as_str(), "WebSocket connection stopped");
        self.inbound = None;
        self.cancel.cancel();
    }
}

/// Client → engine.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => self.forward(Inbound::Binary(data.to_vec()), ctx),
            Ok(ws::Message::Text(text)) => self.forward(Inbound::Text(text.to_string()), ctx),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(endpoint = self.endpoint.as_str(), ?reason, "Client closed connection");
                self.inbound = None;
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Engine → client.
impl StreamHandler<Outbound> for RelaySocket {
    fn handle(&mut self, frame: Outbound, ctx: &mut Self::Context) {
        match frame {
            Outbound::Binary(bytes) => ctx.binary(bytes),
            Outbound::Text(text) => ctx.text(text),
            Outbound::Close(code) => {
                debug!(endpoint = self.endpoint.as_str(), code = code.code(), "Engine closed connection");
                ctx.close(Some(ws::CloseReason {
                    code: code.into(),
                    description: None,
                }));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

fn start(
    endpoint: Endpoint,
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let Some(slot) = state.admit() else {
        warn!(endpoint = endpoint.as_str(), "Connection refused: session limit reached");
        return Err(AppError::Unavailable("Maximum concurrent sessions reached".to_string()).into());
    };

    info!(
        endpoint = endpoint.as_str(),
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );
    let max_frame_bytes = state.config.server.max_frame_bytes;
    ws::WsResponseBuilder::new(RelaySocket::new(endpoint, state, slot), &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}

/// `GET /ws`
pub async fn duplex_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start(Endpoint::Duplex, req, stream, state)
}

/// `GET /pipeline`
pub async fn pipeline_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start(Endpoint::Pipeline, req, stream, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::protocol::{ClientMessage, ProtocolCodec, ServerMessage, TaggedMessage};
    use crate::testing::{
        mock_collaborators, mock_collaborators_with_duplex, MockDuplexModel, MockSet,
        MockSynthesizer, MockTranscriber,
    };
    use actix_web::{dev::ServerHandle, http::StatusCode, test as actix_test, App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::inference::CollaboratorKind;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn state(max_sessions: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = max_sessions;
        let mocks = mock_collaborators(MockTranscriber::new(), vec![], MockSynthesizer::new());
        AppState::with_collaborators(config, mocks.collaborators)
    }

    fn state_with(mocks: &MockSet, config: AppConfig) -> AppState {
        AppState::with_collaborators(config, mocks.collaborators.clone())
    }

    /// Serve both WebSocket routes on an ephemeral port.
    fn serve(state: AppState) -> (String, ServerHandle) {
        let data = web::Data::new(state);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws", web::get().to(duplex_websocket))
                .route("/pipeline", web::get().to(pipeline_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        (format!("ws://{}", addr), handle)
    }

    async fn connect(base: &str, path: &str) -> Client {
        let (client, _) = connect_async(format!("{}{}", base, path)).await.unwrap();
        client
    }

    /// Read until the server's close frame, returning the data frames and the close code.
    async fn read_to_close(client: &mut Client) -> (Vec<Message>, Option<u16>) {
        let mut frames = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for the server");
            match next {
                Some(Ok(Message::Close(frame))) => {
                    return (frames, frame.map(|f| u16::from(f.code)))
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(message)) => frames.push(message),
                Some(Err(_)) | None => return (frames, None),
            }
        }
    }

    fn server_messages(frames: &[Message]) -> Vec<ServerMessage> {
        frames
            .iter()
            .map(|frame| match frame {
                Message::Text(text) => ProtocolCodec::decode_server(text.as_bytes()).unwrap(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect()
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(ws::CloseCode::from(CloseCode::Normal), ws::CloseCode::Normal);
        assert_eq!(ws::CloseCode::from(CloseCode::InternalError), ws::CloseCode::Error);
        assert_eq!(u16::from(ws::CloseCode::from(CloseCode::InternalError)), 1011);
    }

    /// Test that a connection over the session limit is refused before upgrading.
    #[actix_web::test]
    async fn test_admission_refused_when_full() {
        let state = state(1);
        let _held = state.admit().unwrap();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(duplex_websocket)),
        )
        .await;

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/ws").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "unavailable");
        assert_eq!(state.metrics.snapshot().sessions_rejected, 1);
    }

    /// Test that a plain GET without upgrade headers is rejected and frees its slot.
    #[actix_web::test]
    async fn test_non_upgrade_request_rejected() {
        let state = state(1);
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/pipeline", web::get().to(pipeline_websocket)),
        )
        .await;

        let resp =
            actix_test::call_service(&app, actix_test::TestRequest::get().uri("/pipeline").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.metrics.active_sessions(), 0);
    }

    /// Test a full turn where JSON arrives in both text and binary frames.
    #[actix_web::test]
    async fn test_pipeline_turn_over_socket() {
        let mocks = mock_collaborators(MockTranscriber::new(), vec!["Hi."], MockSynthesizer::new());
        let (base, server) = serve(state_with(&mocks, AppConfig::default()));
        let mut client = connect(&base, "/pipeline").await;

        let wav = ProtocolCodec::encode_client(&ClientMessage::Wav(b"hello".to_vec()));
        let end = ProtocolCodec::encode_client(&ClientMessage::End);
        client.send(Message::Text(wav)).await.unwrap();
        client.send(Message::Binary(end.into_bytes())).await.unwrap();

        let (frames, code) = read_to_close(&mut client).await;
        assert_eq!(
            server_messages(&frames),
            vec![
                ServerMessage::Transcript("hello-text".into()),
                ServerMessage::Text("Hi. ".into()),
                ServerMessage::Wav(b"audio:Hi.".to_vec()),
            ]
        );
        assert_eq!(code, Some(1000));
        server.stop(false).await;
    }

    /// Test that a chunk well past the default WebSocket frame limit gets through.
    #[actix_web::test]
    async fn test_large_wav_chunk_accepted() {
        let mocks = mock_collaborators(MockTranscriber::new(), vec!["Ok."], MockSynthesizer::new());
        let (base, server) = serve(state_with(&mocks, AppConfig::default()));
        let mut client = connect(&base, "/pipeline").await;

        let audio = vec![b'a'; 120_000];
        let wav = ProtocolCodec::encode_client(&ClientMessage::Wav(audio.clone()));
        client.send(Message::Text(wav)).await.unwrap();
        client
            .send(Message::Text(ProtocolCodec::encode_client(&ClientMessage::End)))
            .await
            .unwrap();

        let (frames, code) = read_to_close(&mut client).await;
        let expected = format!("{}-text", String::from_utf8(audio).unwrap());
        assert_eq!(server_messages(&frames)[0], ServerMessage::Transcript(expected));
        assert_eq!(code, Some(1000));
        server.stop(false).await;
    }

    /// Test that a model failure reaches the client as close code 1011.
    #[actix_web::test]
    async fn test_duplex_failure_closes_with_1011() {
        let mocks = mock_collaborators_with_duplex(
            MockTranscriber::new(),
            vec![],
            MockSynthesizer::new(),
            MockDuplexModel::new(4).failing_at_step(1),
        );
        let (base, server) = serve(state_with(&mocks, AppConfig::default()));
        let mut client = connect(&base, "/ws").await;

        client.send(Message::Binary(vec![0u8; 8])).await.unwrap();
        let (_, code) = read_to_close(&mut client).await;
        assert_eq!(code, Some(1011));
        server.stop(false).await;
    }

    /// Test that dropping the connection cancels a live duplex session.
    #[actix_web::test]
    async fn test_duplex_disconnect_cancels_session() {
        let mocks = mock_collaborators(MockTranscriber::new(), vec![], MockSynthesizer::new());
        let state = state_with(&mocks, AppConfig::default());
        let (base, server) = serve(state.clone());
        let mut client = connect(&base, "/ws").await;

        let input: Vec<u8> = [1i16, 2, 3, 4].iter().flat_map(|s| s.to_le_bytes()).collect();
        client.send(Message::Binary(input)).await.unwrap();
        let mut echoed = false;
        while !echoed {
            match client.next().await {
                Some(Ok(Message::Binary(frame))) => {
                    echoed = matches!(TaggedMessage::decode(&frame), Ok(TaggedMessage::Audio(_)))
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended early: {:?}", other),
            }
        }
        assert_eq!(mocks.duplex.live_streams(), 1);

        drop(client);
        wait_until(|| mocks.duplex.live_streams() == 0).await;
        wait_until(|| state.metrics.active_sessions() == 0).await;
        server.stop(false).await;
    }

    /// Test that dropping the connection mid-turn aborts outstanding transcriptions.
    #[actix_web::test]
    async fn test_pipeline_disconnect_aborts_calls() {
        let transcriber = MockTranscriber::new().with_delay(b"slow", Duration::from_secs(30));
        let mocks = mock_collaborators(transcriber, vec![], MockSynthesizer::new());
        let state = state_with(&mocks, AppConfig::default());
        let (base, server) = serve(state.clone());
        let mut client = connect(&base, "/pipeline").await;

        let wav = ProtocolCodec::encode_client(&ClientMessage::Wav(b"slow".to_vec()));
        client.send(Message::Text(wav)).await.unwrap();
        wait_until(|| state.registry.in_flight(CollaboratorKind::Transcriber) == 1).await;

        drop(client);
        wait_until(|| state.registry.in_flight(CollaboratorKind::Transcriber) == 0).await;
        wait_until(|| state.metrics.active_sessions() == 0).await;
        server.stop(false).await;
    }

    /// Test that a client flooding a stalled engine is closed instead of buffered.
    #[actix_web::test]
    async fn test_inbound_flood_closes_connection() {
        let synthesizer = MockSynthesizer::new().with_delay("Wait.", Duration::from_secs(30));
        let mocks = mock_collaborators(MockTranscriber::new(), vec!["Wait."], synthesizer);
        let mut config = AppConfig::default();
        config.server.inbound_queue_frames = 1;
        let (base, server) = serve(state_with(&mocks, config));
        let mut client = connect(&base, "/pipeline").await;

        // After `end` the turn stops reading, so the queue can only fill up.
        client
            .send(Message::Text(ProtocolCodec::encode_client(&ClientMessage::End)))
            .await
            .unwrap();
        for _ in 0..8 {
            if client.send(Message::Text("{}".into())).await.is_err() {
                break;
            }
        }

        let (_, code) = read_to_close(&mut client).await;
        assert_eq!(code, Some(1011));
        server.stop(false).await;
    }
}
