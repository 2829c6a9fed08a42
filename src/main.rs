use std::{env, sync::Arc, time::Duration};

use dotenv::dotenv;
use eyre::{OptionExt, eyre};
use mcprobe::{
    auth::{self, GameServices, IdentityClient},
    config::Config,
    protocol::login::JoinCredentials,
    scanner::{self, CONSUMER_BACKOFF, RangeScanner, ScanQueue, Verifier, targets},
    report::LogSink,
    tracing::init_tracing,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();

    // first command line argument is the location of the config file
    let args = env::args().collect::<Vec<String>>();
    let config_file = args.get(1).cloned().unwrap_or("config.toml".to_string());
    let config = Config::load(&config_file)?;

    init_tracing(&config);
    info!(config = config_file, "starting");

    let mut ranges = Vec::new();
    if let Some(file) = &config.target.file {
        ranges.extend(targets::parse_file(file)?);
    }
    for line in &config.target.ranges {
        ranges.push(targets::parse_range(line)?);
    }
    if ranges.is_empty() {
        return Err(eyre!("no target ranges configured"));
    }
    let address_count: usize = ranges.iter().map(|range| range.count()).sum();
    // one unit of scan work per /24
    let ranges: Vec<_> = ranges
        .iter()
        .flat_map(|range| range.split_slash24())
        .collect();
    info!(
        ranges = ranges.len(),
        addresses = address_count,
        "targets parsed"
    );

    let credentials = if config.scanner.fast_mode {
        None
    } else {
        acquire_credentials(&config).await?
    };

    let queue = Arc::new(ScanQueue::new());
    let verifier = Verifier {
        protocol_version: config.target.protocol_version,
        username: config.login.username.clone(),
        uuid: credentials
            .as_ref()
            .map(|credentials| credentials.profile_id)
            .unwrap_or_else(uuid::Uuid::new_v4),
        timeout: config.target.timeout(),
        fast_mode: config.scanner.fast_mode,
        credentials,
        services: GameServices::new(),
    };
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let consumer = tokio::spawn(scanner::consume(
        queue.clone(),
        verifier,
        LogSink,
        CONSUMER_BACKOFF,
        shutdown_rx,
    ));

    let range_scanner = Arc::new(RangeScanner {
        binary: config.scanner.binary.clone().into(),
        rate: config.scanner.rate,
        ports: config.scanner.ports.clone(),
    });
    scanner::produce(
        range_scanner,
        ranges,
        queue.clone(),
        config.scanner.workers.unwrap_or(4),
    )
    .await;

    // the consumer drains the queue, finishes any in-flight
    // classification and then exits
    let _ = shutdown_tx.send(true);
    consumer.await?;

    info!("scan complete");
    Ok(())
}

/// Runs the identity chain once, scoped to this process. Order of
/// preference: refresh token from the environment, refresh token from the
/// config, interactive browser sign-in.
async fn acquire_credentials(config: &Config) -> eyre::Result<Option<JoinCredentials>> {
    let Some(auth_config) = &config.auth else {
        warn!("no auth section, servers that request encryption will be classified PREMIUM");
        return Ok(None);
    };

    let client = IdentityClient::new(&auth_config.client_id, &auth_config.redirect_uri);

    let refresh_token = env::var("MCPROBE_REFRESH_TOKEN")
        .ok()
        .or_else(|| auth_config.refresh_token.clone());

    let credentials = if let Some(refresh_token) = refresh_token {
        client.login_with_refresh_token(&refresh_token).await?
    } else {
        let redirect = reqwest::Url::parse(&auth_config.redirect_uri)?;
        let host = redirect.host_str().ok_or_eyre("redirect uri has no host")?;
        // the redirect listener binds an address, not a name
        let host = if host == "localhost" { "127.0.0.1" } else { host };
        let listen_addr = format!("{host}:{}", redirect.port().unwrap_or(80)).parse()?;
        let (addr, rx) = auth::spawn_redirect_listener(listen_addr).await?;

        let pkce = auth::generate_pkce();
        let state = auth::generate_state();
        println!("Sign in at:\n\n  {}\n", client.authorize_url(&state, &pkce));
        info!(%addr, "waiting for the provider redirect");

        let callback = rx.await?;
        if callback.state.as_deref() != Some(state.as_str()) {
            return Err(eyre!("state mismatch in provider redirect"));
        }
        client
            .login_with_code(&callback.code, Some(&pkce.verifier))
            .await?
    };

    info!(name = credentials.profile.name, "signed in");
    Ok(Some(JoinCredentials {
        access_token: credentials.access_token,
        profile_id: credentials.profile.id,
    }))
}
