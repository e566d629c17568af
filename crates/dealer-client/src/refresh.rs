//! Background proactive refresh
//!
//! Periodically refreshes the access token when it nears expiry so most
//! requests never pay refresh latency. Runs through the same coordinator as
//! the request path, so it can never race a request-triggered refresh.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::pipeline::ApiClient;

/// Spawn a task that runs the proactive refresh check every `interval`.
///
/// Failures are logged and the next tick tries again; a refresh token the
/// server rejects ends the session through the usual expiry notification.
pub fn spawn_refresh_task(client: ApiClient, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; credentials were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&client).await;
        }
    })
}

async fn refresh_cycle(client: &ApiClient) {
    if !client.is_authenticated() {
        debug!("no credentials, skipping background refresh");
        return;
    }

    match client.refresh_if_expiring().await {
        Ok(true) => info!("background token refresh succeeded"),
        Ok(false) => debug!("token not expiring, nothing to refresh"),
        Err(e) => warn!(error = %e, "background token refresh failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ClientConfig;
    use crate::testing::{Reply, ScriptedTransport, token_reply};
    use dealer_auth::{CredentialPair, CredentialStore, now_millis};
    use std::sync::Arc;

    fn client(pair: CredentialPair, transport: Arc<ScriptedTransport>) -> ApiClient {
        let store = Arc::new(CredentialStore::in_memory());
        store.set(pair);
        ApiClient::new(ClientConfig::new("http://dealer.test"), transport, store)
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_cycle_skips_valid_tokens() {
        let transport = ScriptedTransport::new(|_, _| token_reply("A2", "R2"));
        let later = now_millis() + 3_600_000;
        let client = client(
            CredentialPair::new("A1", "R1").with_expiry(Some(later)),
            transport.clone(),
        );

        refresh_cycle(&client).await;
        assert!(transport.calls().is_empty());
        assert_eq!(client.credentials().unwrap().access_token.expose(), "A1");
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_cycle_refreshes_expiring_token() {
        let transport = ScriptedTransport::new(|_, _| token_reply("A2", "R2"));
        let soon = now_millis() + 10_000;
        let client = client(
            CredentialPair::new("A1", "R1").with_expiry(Some(soon)),
            transport.clone(),
        );

        refresh_cycle(&client).await;
        assert_eq!(transport.calls().len(), 1);
        let pair = client.credentials().unwrap();
        assert_eq!(pair.access_token.expose(), "A2");
        assert_eq!(pair.refresh_token.expose(), "R2");
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_cycle_rejected_refresh_ends_session() {
        let transport = ScriptedTransport::new(|_, _| Reply::status(401));
        let soon = now_millis() + 10_000;
        let client = client(
            CredentialPair::new("A1", "R1").with_expiry(Some(soon)),
            transport.clone(),
        );
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fired.clone();
        client.on_auth_expired(move || flag.store(true, std::sync::atomic::Ordering::SeqCst));

        refresh_cycle(&client).await;
        assert!(!client.is_authenticated());
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_task_refreshes_on_tick() {
        let transport = ScriptedTransport::new(|_, _| token_reply("A2", "R2"));
        let soon = now_millis() + 10_000;
        let client = client(
            CredentialPair::new("A1", "R1").with_expiry(Some(soon)),
            transport.clone(),
        );

        let handle = spawn_refresh_task(client.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(transport.calls().is_empty(), "first tick is skipped");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(client.credentials().unwrap().access_token.expose(), "A2");
        handle.abort();
    }
}
