//! One-shot status query.
//!
//! Opens a connection, runs the Handshake(next=Status) + Status Request
//! exchange and parses the JSON status response. The query never negotiates
//! compression or mutates anything beyond the single round trip, so it's
//! safe to run repeatedly and concurrently against the same host.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::{
    Endpoint, ProtocolError, ProtocolState, TransportError,
    codec::Reader,
    packet::{NextState, StatusRequest},
    session::Session,
};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Protocol(ProtocolError),
    /// The port is open but whatever answered is not a game server, e.g. a
    /// web server squatting on the port.
    #[error("listener does not speak the game protocol")]
    NotAMinecraftServer,
    #[error("status response is not valid json: {0}")]
    BadJson(#[from] serde_json::Error),
}

impl From<ProtocolError> for StatusError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Transport(transport) => StatusError::Transport(transport),
            other => StatusError::Protocol(other),
        }
    }
}

impl From<TransportError> for StatusError {
    fn from(err: TransportError) -> Self {
        StatusError::Transport(err)
    }
}

/// `version` object of the status response.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplePlayer {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusPlayers {
    pub online: i64,
    pub max: i64,
    #[serde(default)]
    pub sample: Option<Vec<SamplePlayer>>,
}

/// Typed view over the fields we care about. Servers put a lot of
/// non-vanilla extras in here, those stay available through
/// [`StatusPing::raw`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerStatus {
    #[serde(default)]
    pub version: Option<StatusVersion>,
    #[serde(default)]
    pub players: Option<StatusPlayers>,
    /// Chat component, either a bare string or an object.
    #[serde(default)]
    pub description: Option<serde_json::Value>,
    /// Base64-encoded png.
    #[serde(default)]
    pub favicon: Option<String>,
    /// Old forge servers.
    #[serde(default)]
    pub modinfo: Option<serde_json::Value>,
    /// Modern forge servers.
    #[serde(default, rename = "forgeData")]
    pub forge_data: Option<serde_json::Value>,
    #[serde(default, rename = "enforcesSecureChat")]
    pub enforces_secure_chat: Option<bool>,
    #[serde(default, rename = "previewsChat")]
    pub previews_chat: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct StatusPing {
    /// The response document exactly as the server sent it.
    pub raw: serde_json::Value,
    pub status: ServerStatus,
}

impl StatusPing {
    /// Protocol version the server advertised, if any.
    pub fn protocol_version(&self) -> Option<i32> {
        self.status.version.as_ref().map(|v| v.protocol)
    }

    pub fn is_modded(&self) -> bool {
        self.status.modinfo.is_some() || self.status.forge_data.is_some()
    }
}

pub async fn query(
    endpoint: &Endpoint,
    protocol_version: i32,
    timeout: Duration,
) -> Result<StatusPing, StatusError> {
    let mut session = Session::connect(endpoint.clone(), protocol_version, timeout).await?;
    session.handshake(NextState::Status).await?;
    session.send(&StatusRequest).await?;

    let body = session.recv_body().await?;
    let mut reader = Reader::new(&body);
    let id = match reader.read_varint() {
        Ok(id) => id,
        Err(_) if looks_like_http(&body) => return Err(StatusError::NotAMinecraftServer),
        Err(err) => return Err(ProtocolError::Codec(err).into()),
    };
    if id != 0x00 {
        if looks_like_http(&body) {
            return Err(StatusError::NotAMinecraftServer);
        }
        return Err(ProtocolError::UnexpectedPacket {
            state: ProtocolState::Status,
            id,
        }
        .into());
    }

    let json = match reader.read_string() {
        Ok(json) => json,
        Err(_) if looks_like_http(&body) => return Err(StatusError::NotAMinecraftServer),
        Err(err) => return Err(ProtocolError::Codec(err).into()),
    };
    if !json.trim_start().starts_with('{') {
        return Err(StatusError::NotAMinecraftServer);
    }

    let raw: serde_json::Value = serde_json::from_str(&repair_truncated_json(&json))?;
    let status: ServerStatus = serde_json::from_value(raw.clone()).unwrap_or_default();
    debug!(addr = %endpoint, version = ?status.version, "status ping ok");

    Ok(StatusPing { raw, status })
}

/// Some servers truncate the favicon and send JSON with unbalanced braces.
/// Appending the missing closers salvages the parse more often than not.
fn repair_truncated_json(json: &str) -> String {
    let open = json.matches('{').count();
    let close = json.matches('}').count();
    if open > close {
        let mut repaired = json.to_string();
        repaired.extend(std::iter::repeat_n('}', open - close));
        repaired
    } else {
        json.to_string()
    }
}

/// A raw HTTP preamble in the stream means a non-game TCP listener.
fn looks_like_http(body: &[u8]) -> bool {
    // the leading 'H' gets eaten as the frame length varint, so the body
    // usually starts at "TTP/"
    body.starts_with(b"TTP/") || body.starts_with(b"HTTP/")
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::protocol::{codec, frame};

    const STATUS_JSON: &str = r#"{"version":{"name":"1.20.4","protocol":765},"players":{"online":3,"max":20},"description":{"text":"hi"}}"#;

    async fn spawn_status_server(response_json: &'static str) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    // drain the handshake + request frames
                    let mut buf = [0u8; 512];
                    let _ = stream.read(&mut buf).await;

                    let mut body = vec![0x00];
                    codec::write_string(&mut body, response_json);
                    let framed = frame::encode(&body, frame::COMPRESSION_OFF).unwrap();
                    let _ = stream.write_all(&framed).await;
                });
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn query_parses_fields() {
        let endpoint = spawn_status_server(STATUS_JSON).await;
        let ping = query(&endpoint, 765, Duration::from_secs(5)).await.unwrap();

        let version = ping.status.version.clone().unwrap();
        assert_eq!(version.name, "1.20.4");
        assert_eq!(version.protocol, 765);
        let players = ping.status.players.clone().unwrap();
        assert_eq!(players.online, 3);
        assert_eq!(players.max, 20);
        assert_eq!(ping.raw["description"]["text"], "hi");
        assert!(!ping.is_modded());
    }

    #[tokio::test]
    async fn query_is_idempotent() {
        let endpoint = spawn_status_server(STATUS_JSON).await;
        let first = query(&endpoint, 765, Duration::from_secs(5)).await.unwrap();
        let second = query(&endpoint, 765, Duration::from_secs(5)).await.unwrap();
        assert_eq!(first.raw, second.raw);
    }

    #[tokio::test]
    async fn http_listener_is_not_a_game_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n")
                .await;
            // pad so the bogus frame length can be satisfied
            let _ = stream.write_all(&[b' '; 64]).await;
        });

        match query(&endpoint, 765, Duration::from_secs(5)).await {
            Err(StatusError::NotAMinecraftServer) => {}
            other => panic!("expected NotAMinecraftServer, got {other:?}"),
        }
    }

    #[test]
    fn repairs_unbalanced_braces() {
        assert_eq!(
            repair_truncated_json(r#"{"a":{"b":1}"#),
            r#"{"a":{"b":1}}"#
        );
        assert_eq!(repair_truncated_json("{}"), "{}");
    }
}
