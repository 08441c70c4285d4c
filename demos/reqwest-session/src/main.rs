use std::{str::FromStr, sync::Arc, time::Duration};

use sessionware::{
    FileSessionStore, LogoutReason, SessionClient, SessionConfig, SessionEvent, SessionEventKind,
};
use tracing_subscriber::EnvFilter;
use url::Url;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sessionware=debug")),
        )
        .init();

    let config = SessionConfig::builder()
        .base_url(Url::from_str("https://api.example.com/api").unwrap())
        .timeout(Duration::from_secs(10))
        .build();

    // The session survives restarts. A stored credential is picked up here.
    let store = Arc::new(FileSessionStore::new(".session.json"));
    let client = SessionClient::with_store(config, store).unwrap();

    // Redirect to the login screen when the session can no longer be renewed.
    let _logout_watch = client
        .events()
        .on(SessionEventKind::LoggedOut, |event| {
            if let SessionEvent::LoggedOut { reason } = event {
                if reason != LogoutReason::UserRequested {
                    tracing::warn!("Session ended ({reason:?}). Please log in again.");
                }
            }
        });

    if !client.session().get().is_authenticated() {
        if let Err(e) = client.login("ada@example.com", "hunter2").await {
            tracing::error!("{}", e.user_message());
            return;
        }
    }

    // The access token is attached, and renewed once if the backend rejects it.
    let request = client.get("users/me").unwrap();
    match client.send_builder(request).await {
        Ok(response) => println!("{}", response.text().await.unwrap_or_default()),
        Err(e) => tracing::error!("{}", e.user_message()),
    }

    client.shutdown();
}
