use futures_util::{SinkExt, StreamExt};
use minion_core::protocol::{classify, encode_frame, format_hex, Inbound, NewCommandsRequest, ProtocolError};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{self, InvalidHeaderValue};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

use crate::config::Config;
use crate::executor;

/// The single duplex connection to the controller and its lifecycle.
pub struct Session {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: Config,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid controller location: {0}")]
    InvalidLocation(#[from] url::ParseError),
    #[error("invalid origin header: {0}")]
    InvalidOrigin(#[from] InvalidHeaderValue),
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("websocket transport error: {0}")]
    Transport(#[from] WsError),
    #[error("connection closed by controller")]
    ConnectionClosed,
    #[error("unexpected websocket frame type: {0}")]
    UnexpectedFrame(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Session {
    /// Dial the controller at `config.location`, presenting an `Origin`
    /// header equal to that location. Certificate verification is skipped
    /// only when the config explicitly opts in.
    pub async fn connect(config: Config) -> Result<Self, SessionError> {
        Url::parse(&config.location)?;
        let mut request = config.location.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(header::ORIGIN, HeaderValue::from_str(&config.location)?);

        let connector = if config.danger_accept_invalid_certs {
            warn!("accepting any controller certificate; transport authentication is disabled");
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (ws, _response) = connect_async_tls_with_config(request, None, false, connector).await?;
        Ok(Self { ws, config })
    }

    /// Run the read loop until a terminal error. There is no reconnect:
    /// every fatal condition surfaces as the returned error and the caller
    /// is expected to exit.
    ///
    /// The loop is also the outbound writer: all producers (the subscription
    /// sender and every command executor) feed one mpsc channel, and only
    /// this task ever writes to the socket, so outbound frames never
    /// interleave. A failed send is logged and the session continues.
    pub async fn run(self) -> Result<(), SessionError> {
        let Session { ws, config } = self;
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let mut executors: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let frame = frame.ok_or(SessionError::ConnectionClosed)??;
                    handle_frame(&config, frame, &outbound_tx, &mut executors)?;
                }
                Some(payload) = outbound_rx.recv() => {
                    if let Err(err) = sink.send(Message::Text(payload.clone())).await {
                        warn!(payload = %payload, "frame_send_failed: {err}");
                    }
                }
                Some(_finished) = executors.join_next(), if !executors.is_empty() => {}
            }
        }
    }
}

/// Classify one inbound frame and dispatch it. Command execution is handed
/// off to a spawned executor so the read loop never blocks on completion.
fn handle_frame(
    config: &Config,
    frame: Message,
    outbound: &mpsc::Sender<String>,
    executors: &mut JoinSet<()>,
) -> Result<(), SessionError> {
    let text = match frame {
        Message::Text(text) => text,
        Message::Binary(bytes) => {
            info!("< {}", format_hex(&bytes));
            return Ok(());
        }
        Message::Close(_) => return Err(SessionError::ConnectionClosed),
        Message::Ping(_) => return Err(SessionError::UnexpectedFrame("ping")),
        Message::Pong(_) => return Err(SessionError::UnexpectedFrame("pong")),
        Message::Frame(_) => return Err(SessionError::UnexpectedFrame("raw")),
    };
    info!("< {text}");

    match classify(&text)? {
        Inbound::Connected => {
            info!("controller handshake complete, subscribing for commands");
            let payload = encode_frame(&NewCommandsRequest::new(&config.server_id))?;
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let _ = outbound.send(payload).await;
            });
        }
        Inbound::NewCommands(command) => {
            info!(id = %command.id, command = %command.command, "received new command");
            executors.spawn(executor::execute(command, outbound.clone()));
        }
        Inbound::OutputEcho(value) => info!("output_command echo: {value}"),
        Inbound::UpdateEcho(value) => info!("update_command echo: {value}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use minion_core::{Command, CommandOutput};
    use std::collections::{HashMap, HashSet};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn test_config(addr: SocketAddr) -> Config {
        Config {
            location: format!("ws://{addr}"),
            server_id: "abc123".to_string(),
            danger_accept_invalid_certs: false,
        }
    }

    /// Connect a session to a loopback controller and hand both ends back.
    async fn connect_pair() -> (Session, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            accept_async(stream).await.expect("ws handshake")
        });
        let session = Session::connect(test_config(addr)).await.expect("connect");
        let controller = accept.await.expect("controller task");
        (session, controller)
    }

    async fn next_text(controller: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            let frame = timeout(TEST_TIMEOUT, controller.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("read frame");
            match frame {
                Message::Text(text) => return text,
                Message::Close(_) => panic!("agent closed the connection"),
                _ => continue,
            }
        }
    }

    fn is_prefix(prev: &[CommandOutput], next: &[CommandOutput]) -> bool {
        next.len() >= prev.len() && prev.iter().zip(next.iter()).all(|(a, b)| a == b)
    }

    #[tokio::test]
    async fn handshake_subscribes_with_configured_identity() {
        let (session, mut controller) = connect_pair().await;
        let run = tokio::spawn(session.run());

        controller
            .send(Message::Text(r#"{"action":"connected"}"#.to_string()))
            .await
            .expect("send handshake");

        let subscription = next_text(&mut controller).await;
        let value: serde_json::Value = serde_json::from_str(&subscription).expect("json");
        assert_eq!(value["action"], "new_commands");
        assert_eq!(value["server_id"], "abc123");
        run.abort();
    }

    #[tokio::test]
    async fn executes_command_and_streams_output() {
        let (session, mut controller) = connect_pair().await;
        let run = tokio::spawn(session.run());

        controller
            .send(Message::Text(
                r#"{"action":"new_commands","new_val":{"id":"1","command":"echo hi"}}"#.to_string(),
            ))
            .await
            .expect("send command");

        let completed = loop {
            let frame = next_text(&mut controller).await;
            let snapshot: Command = serde_json::from_str(&frame).expect("command snapshot");
            if snapshot.completed_at != 0 {
                break snapshot;
            }
        };
        assert_eq!(completed.action, "update_command");
        assert_eq!(completed.id, "1");
        assert_eq!(completed.stdout.len(), 1);
        assert_eq!(completed.stdout[0].output, "hi");
        assert!(completed.stderr.is_empty());
        assert!(completed.started_at <= completed.stdout[0].at);
        assert!(completed.stdout[0].at <= completed.completed_at);
        run.abort();
    }

    #[tokio::test]
    async fn unknown_action_terminates_session() {
        let (session, mut controller) = connect_pair().await;
        controller
            .send(Message::Text(r#"{"action":"bogus"}"#.to_string()))
            .await
            .expect("send frame");

        let err = timeout(TEST_TIMEOUT, session.run())
            .await
            .expect("timed out")
            .expect_err("session must terminate");
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::UnknownAction(ref action)) if action == "bogus"
        ));
    }

    #[tokio::test]
    async fn malformed_frame_terminates_session() {
        let (session, mut controller) = connect_pair().await;
        controller
            .send(Message::Text("not-json".to_string()))
            .await
            .expect("send frame");

        let err = timeout(TEST_TIMEOUT, session.run())
            .await
            .expect("timed out")
            .expect_err("session must terminate");
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn binary_frames_are_display_only() {
        let (session, mut controller) = connect_pair().await;
        controller
            .send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef]))
            .await
            .expect("send binary");
        // A follow-up bad frame proves the binary frame was tolerated.
        controller
            .send(Message::Text(r#"{"action":"bogus"}"#.to_string()))
            .await
            .expect("send frame");

        let err = timeout(TEST_TIMEOUT, session.run())
            .await
            .expect("timed out")
            .expect_err("session terminates on the second frame");
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::UnknownAction(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_commands_interleave_as_well_formed_frames() {
        let (session, mut controller) = connect_pair().await;
        let run = tokio::spawn(session.run());

        for id in ["1", "2"] {
            let frame = format!(
                r#"{{"action":"new_commands","new_val":{{"id":"{id}","command":"seq 1 25"}}}}"#
            );
            controller
                .send(Message::Text(frame))
                .await
                .expect("send command");
        }

        let mut last_snapshot: HashMap<String, Command> = HashMap::new();
        let mut completed: HashSet<String> = HashSet::new();
        while completed.len() < 2 {
            let frame = next_text(&mut controller).await;
            let snapshot: Command =
                serde_json::from_str(&frame).expect("every frame is one well-formed command");
            if let Some(prev) = last_snapshot.get(&snapshot.id) {
                assert!(
                    is_prefix(&prev.stdout, &snapshot.stdout),
                    "stdout snapshots must be append-only"
                );
                assert!(
                    is_prefix(&prev.stderr, &snapshot.stderr),
                    "stderr snapshots must be append-only"
                );
            }
            if snapshot.completed_at != 0 {
                assert_eq!(snapshot.stdout.len(), 25);
                completed.insert(snapshot.id.clone());
            }
            last_snapshot.insert(snapshot.id.clone(), snapshot);
        }
        run.abort();
    }
}
