//! The identity-provider chain.
//!
//! Four sequential token exchanges, each hop consuming exactly the previous
//! hop's output: authorization code → OAuth access token → Xbox Live token
//! + user hash → XSTS token → game-service access token, then the
//! entitlement check and profile fetch keyed off that last token. Every hop
//! fails on its own with the stage it died at; nothing is cached across
//! login attempts.
//!
//! Endpoint shapes follow wiki.vg's Microsoft authentication scheme. Field
//! names are contract, not convention.

use std::{net::SocketAddr, time::Duration};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::oneshot,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::login::SessionService;

const AUTHORIZE_URL: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/authorize";
const TOKEN_URL: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";
const XBL_URL: &str = "https://user.auth.xboxlive.com/user/authenticate";
const XSTS_URL: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";
const GAME_LOGIN_URL: &str = "https://api.minecraftservices.com/authentication/login_with_xbox";
const ENTITLEMENTS_URL: &str = "https://api.minecraftservices.com/entitlements/mcstore";
const PROFILE_URL: &str = "https://api.minecraftservices.com/minecraft/profile";
const SESSION_JOIN_URL: &str = "https://sessionserver.mojang.com/session/minecraft/join";

const SCOPE: &str = "XboxLive.signin offline_access";

const SESSION_JOIN_ATTEMPTS: u32 = 5;

/// Which hop of the chain failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    /// Authorization code (or refresh token) → OAuth access token.
    TokenExchange,
    /// Access token → XBL token + user hash.
    XboxLive,
    /// XBL token → XSTS token.
    SessionTicket,
    /// XSTS token → game-service access token.
    GameService,
    Entitlement,
    Profile,
    SessionJoin,
    /// The loopback redirect listener.
    Callback,
}

#[derive(Debug, Error)]
#[error("{stage:?}: {detail}")]
pub struct AuthError {
    pub stage: AuthStage,
    pub detail: String,
}

impl AuthError {
    fn new(stage: AuthStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}

/// PKCE verifier/challenge pair, regenerated per login attempt.
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
    pub method: &'static str,
}

pub fn generate_pkce() -> PkceChallenge {
    let verifier = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
        + &URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
        + &URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
    let verifier = verifier[..128.min(verifier.len())].to_string();
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    PkceChallenge {
        verifier,
        challenge,
        method: "S256",
    }
}

/// Random `state` parameter, checked against the redirect to resist CSRF.
pub fn generate_state() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 16]>())
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
}

/// End product of the chain: the game-service bearer token plus the profile
/// it belongs to. Scoped to one login attempt.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub profile: Profile,
}

#[derive(Deserialize)]
struct XboxResponse {
    #[serde(rename = "Token")]
    token: String,
    #[serde(rename = "DisplayClaims")]
    display_claims: DisplayClaims,
}

#[derive(Deserialize)]
struct DisplayClaims {
    xui: Vec<XuiClaim>,
}

#[derive(Deserialize)]
struct XuiClaim {
    uhs: String,
}

#[derive(Deserialize)]
struct GameLoginResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct Entitlements {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

pub struct IdentityClient {
    http: reqwest::Client,
    client_id: String,
    redirect_uri: String,
}

impl IdentityClient {
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// The url the user signs in at. The provider redirects back to
    /// `redirect_uri` with `code` and `state` query parameters.
    pub fn authorize_url(&self, state: &str, pkce: &PkceChallenge) -> String {
        let mut url = reqwest::Url::parse(AUTHORIZE_URL).expect("static url");
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", SCOPE)
            .append_pair("prompt", "select_account")
            .append_pair("state", state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", pkce.method);
        url.into()
    }

    /// Hop 1: authorization code → OAuth access + refresh token.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: Option<&str>,
    ) -> Result<OAuthTokens, AuthError> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("scope", SCOPE),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier", verifier));
        }
        self.token_request(&form).await
    }

    /// Hop 1, refresh variant: re-enters the chain with a stored refresh
    /// token. Hops 2–4 are unchanged.
    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens, AuthError> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("scope", SCOPE),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        self.token_request(&form).await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<OAuthTokens, AuthError> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(form)
            .send()
            .await
            .map_err(|err| AuthError::new(AuthStage::TokenExchange, err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::new(
                AuthStage::TokenExchange,
                format!("status {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| AuthError::new(AuthStage::TokenExchange, err.to_string()))
    }

    /// Hop 2: OAuth access token → XBL token + user hash.
    async fn xbox_authenticate(&self, access_token: &str) -> Result<(String, String), AuthError> {
        let body = json!({
            "Properties": {
                "AuthMethod": "RPS",
                "SiteName": "user.auth.xboxlive.com",
                "RpsTicket": format!("d={access_token}"),
            },
            "RelyingParty": "http://auth.xboxlive.com",
            "TokenType": "JWT",
        });
        let response: XboxResponse = self
            .post_json(XBL_URL, &body, AuthStage::XboxLive)
            .await?;
        let user_hash = response
            .display_claims
            .xui
            .first()
            .map(|claim| claim.uhs.clone())
            .ok_or_else(|| AuthError::new(AuthStage::XboxLive, "no user hash in response"))?;
        Ok((response.token, user_hash))
    }

    /// Hop 3: XBL token → XSTS token.
    async fn xsts_authorize(&self, xbl_token: &str) -> Result<String, AuthError> {
        let body = json!({
            "Properties": {
                "SandboxId": "RETAIL",
                "UserTokens": [xbl_token],
            },
            "RelyingParty": "rp://api.minecraftservices.com/",
            "TokenType": "JWT",
        });
        let response: XboxResponse = self
            .post_json(XSTS_URL, &body, AuthStage::SessionTicket)
            .await?;
        Ok(response.token)
    }

    /// Hop 4: XSTS token + user hash → game-service access token.
    async fn game_login(&self, user_hash: &str, xsts_token: &str) -> Result<String, AuthError> {
        let body = json!({
            "identityToken": format!("XBL3.0 x={user_hash};{xsts_token}"),
        });
        let response: GameLoginResponse = self
            .post_json(GAME_LOGIN_URL, &body, AuthStage::GameService)
            .await?;
        Ok(response.access_token)
    }

    async fn fetch_profile(&self, game_token: &str) -> Result<Profile, AuthError> {
        let response = self
            .http
            .get(PROFILE_URL)
            .bearer_auth(game_token)
            .send()
            .await
            .map_err(|err| AuthError::new(AuthStage::Profile, err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::new(
                AuthStage::Profile,
                format!("status {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| AuthError::new(AuthStage::Profile, err.to_string()))
    }

    /// Hops 2–4 plus the profile fetch. Takes the hop-1 output so both the
    /// code and refresh entry points share it.
    pub async fn complete(&self, tokens: OAuthTokens) -> Result<Credentials, AuthError> {
        let (xbl_token, user_hash) = self.xbox_authenticate(&tokens.access_token).await?;
        let xsts_token = self.xsts_authorize(&xbl_token).await?;
        let game_token = self.game_login(&user_hash, &xsts_token).await?;
        let profile = self.fetch_profile(&game_token).await?;
        debug!(name = profile.name, id = %profile.id, "identity chain complete");
        Ok(Credentials {
            access_token: game_token,
            refresh_token: tokens.refresh_token,
            profile,
        })
    }

    pub async fn login_with_code(
        &self,
        code: &str,
        verifier: Option<&str>,
    ) -> Result<Credentials, AuthError> {
        let tokens = self.exchange_code(code, verifier).await?;
        self.complete(tokens).await
    }

    pub async fn login_with_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Credentials, AuthError> {
        let tokens = self.refresh(refresh_token).await?;
        self.complete(tokens).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
        stage: AuthStage,
    ) -> Result<T, AuthError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| AuthError::new(stage, err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::new(
                stage,
                format!("status {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| AuthError::new(stage, err.to_string()))
    }
}

/// Entitlement check and session join against the game services, used by
/// the login engine's encryption branch.
#[derive(Clone, Default)]
pub struct GameServices {
    http: reqwest::Client,
}

impl GameServices {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionService for GameServices {
    async fn check_entitlement(&self, access_token: &str) -> Result<bool, AuthError> {
        let response = self
            .http
            .get(ENTITLEMENTS_URL)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| AuthError::new(AuthStage::Entitlement, err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::new(
                AuthStage::Entitlement,
                format!("status {}", response.status()),
            ));
        }
        let entitlements: Entitlements = response
            .json()
            .await
            .map_err(|err| AuthError::new(AuthStage::Entitlement, err.to_string()))?;
        Ok(!entitlements.items.is_empty())
    }

    async fn join_session(
        &self,
        access_token: &str,
        profile_id: Uuid,
        server_hash: &str,
    ) -> Result<(), AuthError> {
        let body = json!({
            "accessToken": access_token,
            "selectedProfile": { "id": profile_id.simple().to_string() },
            "serverId": server_hash,
        });

        for attempt in 1..=SESSION_JOIN_ATTEMPTS {
            let response = self
                .http
                .post(SESSION_JOIN_URL)
                .json(&body)
                .send()
                .await
                .map_err(|err| AuthError::new(AuthStage::SessionJoin, err.to_string()))?;

            let status = response.status();
            match status.as_u16() {
                // the session server answers an empty 204 on success
                200..=299 => return Ok(()),
                503 => {
                    warn!(attempt, "session server unavailable, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                429 => {
                    warn!(attempt, "session server rate limit, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                _ => {
                    let detail = response.text().await.unwrap_or_default();
                    return Err(AuthError::new(
                        AuthStage::SessionJoin,
                        format!("status {status}: {detail}"),
                    ));
                }
            }
        }
        Err(AuthError::new(
            AuthStage::SessionJoin,
            format!("gave up after {SESSION_JOIN_ATTEMPTS} attempts"),
        ))
    }
}

/// The authorization code delivered to the redirect listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCallback {
    pub code: String,
    pub state: Option<String>,
}

/// Binds a loopback listener for the provider redirect and hands the parsed
/// callback to the waiting caller through a oneshot channel. The listener
/// answers exactly one redirect carrying a `code` and then shuts down.
/// Returns the bound address so callers can put it in the redirect uri.
pub async fn spawn_redirect_listener(
    addr: SocketAddr,
) -> Result<(SocketAddr, oneshot::Receiver<AuthCallback>), AuthError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AuthError::new(AuthStage::Callback, err.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| AuthError::new(AuthStage::Callback, err.to_string()))?;
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut tx = Some(tx);
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 4096];
            let Ok(n) = stream.read(&mut buf).await else {
                continue;
            };
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();

            let _ = stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/html\r\n\r\n\
                      Thanks for logging in! You can close this tab.",
                )
                .await;

            if let Some(callback) = parse_redirect_request(&request) {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(callback);
                }
                return;
            }
            // probably a favicon request or similar, keep waiting
        }
    });

    Ok((local_addr, rx))
}

/// Pulls `code` and `state` out of the request line of the provider
/// redirect (`GET /callback?code=...&state=... HTTP/1.1`).
fn parse_redirect_request(request: &str) -> Option<AuthCallback> {
    let request_line = request.lines().next()?;
    let path = request_line.split_whitespace().nth(1)?;
    let url = reqwest::Url::parse(&format!("http://localhost{path}")).ok()?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }
    Some(AuthCallback {
        code: code?,
        state,
    })
}
