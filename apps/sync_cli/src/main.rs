use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use shared::domain::{ProfileId, ServerId};
use sync_core::{
    signals::WELCOME_NOTICE, ApiClient, ChatApi, NavigationTarget, StaticCredential, StoreAction,
    SyncOrchestrator, SyncSettings, SyncSignal, WebSocketConnector,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Keeps a live replica of the chat servers a profile belongs to")]
struct Args {
    #[arg(long, default_value = "sync.toml")]
    config: PathBuf,
    #[arg(long, env = "SYNC_TOKEN")]
    token: Option<String>,
    #[arg(long)]
    profile_id: ProfileId,
}

enum Feed {
    Signal(SyncSignal),
    Change(u64, StoreAction),
}

async fn active_memberships(sync: &SyncOrchestrator, profile_id: ProfileId) -> Vec<ServerId> {
    sync.store()
        .read(|replica| {
            replica
                .active_servers(profile_id)
                .iter()
                .map(|server| server.id)
                .collect()
        })
        .await
}

async fn remount(sync: &SyncOrchestrator, profile_id: ProfileId) {
    let server_ids = active_memberships(sync, profile_id).await;
    match sync.remount(server_ids).await {
        Ok(outcome) => info!(?outcome, "remounted"),
        Err(err) => warn!("remount failed: {err:#}"),
    }
}

async fn on_signal(sync: &SyncOrchestrator, profile_id: ProfileId, signal: SyncSignal) {
    match signal {
        SyncSignal::Welcome { server_id } => {
            info!(%server_id, "{WELCOME_NOTICE}");
            match sync.api().server_details(server_id).await {
                Ok(server) => {
                    sync.store().apply(StoreAction::ServerUpserted(server)).await;
                    remount(sync, profile_id).await;
                }
                Err(err) => warn!(%server_id, "failed to load joined server: {err}"),
            }
        }
        SyncSignal::Notice { level, text } => info!(?level, "{text}"),
        SyncSignal::Navigate(NavigationTarget::Root) => remount(sync, profile_id).await,
        SyncSignal::Navigate(target) => info!(?target, "navigate"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = SyncSettings::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let credentials = Arc::new(match args.token {
        Some(token) => StaticCredential::new(token),
        None => StaticCredential::anonymous(),
    });
    let api: Arc<dyn ChatApi> = Arc::new(ApiClient::new(settings.api_base()?, credentials.clone()));
    let sync = SyncOrchestrator::new(
        settings,
        args.profile_id,
        Arc::new(WebSocketConnector::default()),
        credentials,
        Arc::clone(&api),
    );

    let servers = api
        .servers_for_profile(args.profile_id)
        .await
        .context("failed to load servers")?;
    info!(count = servers.len(), "servers loaded");
    sync.store().apply(StoreAction::ServersLoaded(servers)).await;

    let signals = BroadcastStream::new(sync.signals().subscribe())
        .filter_map(|signal| signal.ok().map(Feed::Signal));
    let changes = BroadcastStream::new(sync.store().subscribe())
        .filter_map(|change| change.ok().map(|c| Feed::Change(c.revision, c.action)));
    let mut feed = signals.merge(changes);

    let server_ids = active_memberships(&sync, args.profile_id).await;
    let outcome = sync.mount(server_ids).await?;
    info!(?outcome, "mounted");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = feed.next() => match next {
                Some(Feed::Signal(signal)) => on_signal(&sync, args.profile_id, signal).await,
                Some(Feed::Change(revision, action)) => info!(revision, ?action, "replica changed"),
                None => break,
            },
        }
    }

    sync.shutdown().await;
    Ok(())
}
