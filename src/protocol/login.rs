//! Login engine: joins a server far enough to classify how it handles
//! authentication, then hangs up.
//!
//! The engine never establishes the post-handshake AES stream. It only ever
//! needs the packets up to Login Success / Disconnect, all of which arrive
//! before the symmetric cipher would start, so classification works without
//! it and no play-state traffic is ever exchanged.

use std::time::Duration;

use rsa::{Pkcs1v15Encrypt, RsaPublicKey, pkcs8::DecodePublicKey};
use serde::Serialize;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Endpoint, ProtocolError, TransportError,
    packet::{EncryptionRequest, EncryptionResponse, LoginStart, NextState},
    session::Session,
};
use crate::auth::AuthError;

/// How a join attempt resolved. Produced once per attempt and consumed by
/// the storage collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerClassification {
    /// Login Success without any encryption request: no account needed.
    Cracked,
    /// The server requires a verified session.
    Premium,
    /// Rejected the join with a plain disconnect, no mod-loader marker.
    Vanilla,
    /// Mod-loader marker in the disconnect reason, or a plugin request.
    Modded,
    /// Login rejected after the session verified: access control.
    Whitelisted,
    /// Never completed the TCP handshake.
    Offline,
    /// Well-formed connection but unrecognized behavior.
    Unknown,
    /// The account behind the token does not own the game.
    NoGame,
    /// Credential verification was rejected.
    BadToken,
}

impl std::fmt::Display for ServerClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerClassification::Cracked => "CRACKED",
            ServerClassification::Premium => "PREMIUM",
            ServerClassification::Vanilla => "VANILLA",
            ServerClassification::Modded => "MODDED",
            ServerClassification::Whitelisted => "WHITELISTED",
            ServerClassification::Offline => "OFFLINE",
            ServerClassification::Unknown => "UNKNOWN",
            ServerClassification::NoGame => "NO_GAME",
            ServerClassification::BadToken => "BAD_TOKEN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to parse server public key: {0}")]
    KeyParse(String),
    #[error("rsa encryption failed: {0}")]
    Encrypt(String),
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Protocol(ProtocolError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("username {0:?} is longer than 16 characters")]
    InvalidUsername(String),
}

impl From<ProtocolError> for LoginError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Transport(transport) => LoginError::Transport(transport),
            other => LoginError::Protocol(other),
        }
    }
}

impl From<TransportError> for LoginError {
    fn from(err: TransportError) -> Self {
        LoginError::Transport(err)
    }
}

/// Credential verification against the profile service, performed during
/// the encryption branch. The production implementation lives in
/// [`crate::auth`]; tests substitute their own.
pub trait SessionService {
    /// Whether the account behind the token owns the game.
    fn check_entitlement(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<bool, AuthError>> + Send;

    /// Announces the join to the session server with the computed server
    /// hash so the target server's `hasJoined` lookup succeeds.
    fn join_session(
        &self,
        access_token: &str,
        profile_id: Uuid,
        server_hash: &str,
    ) -> impl Future<Output = Result<(), AuthError>> + Send;
}

/// Bearer token and profile for premium verification.
#[derive(Debug, Clone)]
pub struct JoinCredentials {
    pub access_token: String,
    pub profile_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub endpoint: Endpoint,
    pub protocol_version: i32,
    pub username: String,
    /// Profile uuid, written into Login Start on versions that require it.
    pub uuid: Uuid,
    pub timeout: Duration,
}

/// Runs the login sequence against one server and classifies the outcome.
///
/// Transport and protocol errors are returned, not classified: whether they
/// mean OFFLINE or UNKNOWN is the caller's call (see
/// [`classify_login_error`]).
pub async fn join<S: SessionService>(
    request: &JoinRequest,
    credentials: Option<&JoinCredentials>,
    services: &S,
) -> Result<ServerClassification, LoginError> {
    if request.username.chars().count() > 16 {
        return Err(LoginError::InvalidUsername(request.username.clone()));
    }

    let mut session = Session::connect(
        request.endpoint.clone(),
        request.protocol_version,
        request.timeout,
    )
    .await?;
    session.handshake(NextState::Login).await?;
    session
        .send(&LoginStart {
            protocol_version: request.protocol_version,
            username: &request.username,
            uuid: request.uuid,
        })
        .await?;

    use super::packet::Clientbound::*;
    loop {
        match session.recv().await? {
            SetCompression { threshold } => {
                session.set_compression(threshold);
            }
            LoginSuccess => return Ok(ServerClassification::Cracked),
            Disconnect { reason } => {
                let reason = flatten_reason(&reason);
                debug!(addr = %request.endpoint, reason, "login rejected before encryption");
                return Ok(classify_disconnect(&reason, false));
            }
            PluginRequest { channel, .. } => {
                debug!(addr = %request.endpoint, channel, "plugin request during login");
                return Ok(ServerClassification::Modded);
            }
            EncryptionRequest(encryption) => {
                let Some(credentials) = credentials else {
                    // can't go further without a token, but the server
                    // demanding a verified session tells us what it is
                    return Ok(ServerClassification::Premium);
                };
                return encryption_branch(&mut session, request, credentials, services, encryption)
                    .await;
            }
            StatusResponse { .. } => {
                // unreachable by construction, the session is in Login state
                return Ok(ServerClassification::Unknown);
            }
        }
    }
}

async fn encryption_branch<S: SessionService>(
    session: &mut Session,
    request: &JoinRequest,
    credentials: &JoinCredentials,
    services: &S,
    encryption: EncryptionRequest,
) -> Result<ServerClassification, LoginError> {
    let shared_secret: [u8; 16] = rand::random();
    let server_hash = server_hash(
        &encryption.server_id,
        &shared_secret,
        &encryption.public_key,
    );

    match services.check_entitlement(&credentials.access_token).await {
        Ok(true) => {}
        Ok(false) => return Ok(ServerClassification::NoGame),
        Err(err) => {
            warn!(addr = %request.endpoint, %err, "entitlement check failed");
            return Ok(ServerClassification::BadToken);
        }
    }
    if let Err(err) = services
        .join_session(
            &credentials.access_token,
            credentials.profile_id,
            &server_hash,
        )
        .await
    {
        warn!(addr = %request.endpoint, %err, "session join rejected");
        return Ok(ServerClassification::BadToken);
    }

    let public_key = RsaPublicKey::from_public_key_der(&encryption.public_key)
        .map_err(|err| CryptoError::KeyParse(err.to_string()))?;
    // ThreadRng is not Send, so both encryptions finish before any await
    let (encrypted_secret, encrypted_verify_token) = {
        let mut rng = rand::thread_rng();
        let secret = public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, &shared_secret)
            .map_err(|err| CryptoError::Encrypt(err.to_string()))?;
        let token = public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, &encryption.verify_token)
            .map_err(|err| CryptoError::Encrypt(err.to_string()))?;
        (secret, token)
    };

    session
        .send(&EncryptionResponse {
            encrypted_secret,
            encrypted_verify_token,
        })
        .await?;

    use super::packet::Clientbound::*;
    loop {
        match session.recv().await {
            Ok(SetCompression { threshold }) => {
                session.set_compression(threshold);
            }
            Ok(LoginSuccess) => return Ok(ServerClassification::Premium),
            Ok(Disconnect { reason }) => {
                let reason = flatten_reason(&reason);
                debug!(addr = %request.endpoint, reason, "login rejected after session join");
                return Ok(classify_disconnect(&reason, true));
            }
            Ok(_) | Err(ProtocolError::UnexpectedPacket { .. }) => {
                return Ok(ServerClassification::Unknown);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Computes `SHA-1(server_id || shared_secret || public_key)` as lowercase
/// hex, the id the session server verifies the join against.
pub fn server_hash(server_id: &str, shared_secret: &[u8], public_key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_id.as_bytes());
    hasher.update(shared_secret);
    hasher.update(public_key);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

const MOD_MARKERS: &[&str] = &["fml", "forge", "modded", "mods"];
const WHITELIST_MARKERS: &[&str] = &[
    "whitelist",
    "not whitelisted",
    "multiplayer.disconnect.not_whitelisted",
];

fn classify_disconnect(reason: &str, after_session_join: bool) -> ServerClassification {
    let lower = reason.to_lowercase();
    if MOD_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ServerClassification::Modded;
    }
    if after_session_join {
        // the credentials verified, so a rejection here is access control
        return ServerClassification::Whitelisted;
    }
    if WHITELIST_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ServerClassification::Whitelisted;
    }
    ServerClassification::Vanilla
}

/// Disconnect reasons are chat components. Flattens `text`, `extra`,
/// `translate` and `with` into plain text for marker matching.
pub fn flatten_reason(reason: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(reason) {
        Ok(value) => flatten_chat(&value),
        Err(_) => reason.to_string(),
    }
}

fn flatten_chat(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(obj) => {
            let mut out = String::new();
            if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
            if let Some(extra) = obj.get("extra").and_then(|v| v.as_array()) {
                for part in extra {
                    out.push_str(&flatten_chat(part));
                }
            }
            if let Some(translate) = obj.get("translate").and_then(|v| v.as_str()) {
                out.push_str(translate);
                out.push_str(": ");
            }
            if let Some(with) = obj.get("with").and_then(|v| v.as_array()) {
                out.push_str(
                    &with
                        .iter()
                        .map(flatten_chat)
                        .collect::<Vec<_>>()
                        .join(", "),
                );
            }
            out
        }
        other => other.to_string(),
    }
}

/// Downgrades a login failure to the classification the discovery pipeline
/// reports: never completing the TCP handshake is OFFLINE, anything the
/// server sent that we couldn't make sense of is UNKNOWN.
pub fn classify_login_error(err: &LoginError) -> ServerClassification {
    match err {
        LoginError::Transport(
            TransportError::Timeout | TransportError::Refused | TransportError::Dns(_),
        ) => ServerClassification::Offline,
        _ => ServerClassification::Unknown,
    }
}
