//! Remote relays through `nostr-sdk`.
//!
//! # Architecture
//!
//! One `nostr_sdk::Client` holds every relay connection. Each engine query
//! becomes one relay subscription per filter, with ids `<query>:<n>`, so
//! EOSE can be tracked per filter and reported once for the whole query.
//! A single task drains the client's notification channel and routes
//! events and relay messages to the owning query's channel.

use super::{MessageReceiver, MessageSender, PeerMessage, Query, RelayConnection};
use crate::{Error, Result};
use hearth_core::Event;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

/// Routing state for one engine query.
struct Route {
    query_id: String,
    tx: MessageSender,
    /// Relay subscription ids of this query still waiting for EOSE.
    waiting: Arc<Mutex<HashSet<String>>>,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// [`RelayConnection`] over a shared `nostr_sdk::Client`.
#[derive(Clone)]
pub struct NostrPool {
    client: Client,
    routes: Routes,
}

impl NostrPool {
    /// Wrap `client` and start routing its notifications.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(client: Client) -> Self {
        let routes: Routes = Arc::default();
        tokio::spawn(route_notifications(client.clone(), routes.clone()));
        Self { client, routes }
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Disconnect from every relay.
    pub async fn shutdown(&self) {
        self.client.disconnect().await;
    }
}

impl RelayConnection for NostrPool {
    fn open(&self, url: &str) -> Result<()> {
        let relay_url = parse_url(url)?;
        let client = self.client.clone();
        tokio::spawn(async move {
            connect(&client, &relay_url).await;
        });
        Ok(())
    }

    fn send(&self, url: &str, query: Query) -> Result<MessageReceiver> {
        let relay_url = parse_url(url)?;

        // Translate up front so bad filters fail the call, not the task.
        let mut subscriptions = Vec::with_capacity(query.filters.len());
        for (n, filter) in query.filters.iter().enumerate() {
            let json = serde_json::to_string(filter).map_err(hearth_core::Error::from)?;
            let filter = nostr_sdk::Filter::from_json(&json)
                .map_err(|e| Error::InvalidFilter(e.to_string()))?;
            subscriptions.push((SubscriptionId::new(format!("{}:{n}", query.id)), filter));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if subscriptions.is_empty() {
            let _ = tx.send(PeerMessage::Eose);
            return Ok(rx);
        }

        let waiting: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(
            subscriptions.iter().map(|(id, _)| id.to_string()).collect(),
        ));
        {
            let mut routes = self.routes.lock();
            for (id, _) in &subscriptions {
                routes.insert(
                    id.to_string(),
                    Route {
                        query_id: query.id.clone(),
                        tx: tx.clone(),
                        waiting: waiting.clone(),
                    },
                );
            }
        }

        let client = self.client.clone();
        let routes = self.routes.clone();
        let query_id = query.id;
        tokio::spawn(async move {
            connect(&client, &relay_url).await;

            for (id, filter) in subscriptions {
                if let Err(e) = client
                    .subscribe_with_id_to([relay_url.clone()], id.clone(), filter, None)
                    .await
                {
                    tracing::warn!(peer = %relay_url, query = %query_id, "subscribe failed: {}", e);
                    close_route(&routes, &id.to_string(), Some(e.to_string()));
                }
            }
        });

        Ok(rx)
    }

    fn close(&self, _url: &str, query_id: &str) {
        let ids: Vec<String> = {
            let mut routes = self.routes.lock();
            let ids: Vec<String> = routes
                .iter()
                .filter(|(_, route)| route.query_id == query_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                routes.remove(id);
            }
            ids
        };

        if ids.is_empty() {
            return;
        }

        let client = self.client.clone();
        tokio::spawn(async move {
            for id in ids {
                let _ = client.unsubscribe(&SubscriptionId::new(id)).await;
            }
        });
    }
}

fn parse_url(url: &str) -> Result<RelayUrl> {
    RelayUrl::parse(url).map_err(|e| Error::InvalidPeer {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Add and connect a relay; both calls are no-ops once connected.
async fn connect(client: &Client, url: &RelayUrl) {
    match client.add_relay(url.clone()).await {
        Ok(true) => {
            if let Err(e) = client.connect_relay(url.clone()).await {
                tracing::warn!(peer = %url, "Failed to connect: {}", e);
            } else {
                tracing::debug!(peer = %url, "Added relay");
            }
        }
        Ok(false) => {}
        Err(e) => tracing::warn!(peer = %url, "Failed to add relay: {}", e),
    }
}

/// Report `Closed` for the query owning `subscription_id` and drop its routes.
fn close_route(routes: &Routes, subscription_id: &str, reason: Option<String>) {
    let mut routes = routes.lock();
    let Some(route) = routes.remove(subscription_id) else {
        return;
    };
    let _ = route.tx.send(PeerMessage::Closed(reason));
    routes.retain(|_, other| other.query_id != route.query_id);
}

async fn route_notifications(client: Client, routes: Routes) {
    let mut notifications = client.notifications();

    // Rate-limited lag warning (avoid log spam during bursts)
    let mut last_lag_warning = Instant::now();
    let mut lagged_since_warning = 0u64;
    let lag_warning_interval = Duration::from_secs(10);

    loop {
        let notification = match notifications.recv().await {
            Ok(n) => n,
            Err(broadcast::error::RecvError::Closed) => {
                tracing::info!("Notification channel closed");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(count)) => {
                metrics::counter!("engine_notifications_lagged_total").increment(count);
                lagged_since_warning += count;
                if last_lag_warning.elapsed() >= lag_warning_interval {
                    tracing::warn!(
                        "Notification receiver dropped {} messages in last {:?}",
                        lagged_since_warning,
                        last_lag_warning.elapsed()
                    );
                    last_lag_warning = Instant::now();
                    lagged_since_warning = 0;
                }
                continue;
            }
        };

        match notification {
            RelayPoolNotification::Event {
                subscription_id,
                event,
                ..
            } => {
                let routes = routes.lock();
                if let Some(route) = routes.get(&subscription_id.to_string()) {
                    let _ = route.tx.send(PeerMessage::Event(Event::from(&*event)));
                }
            }

            RelayPoolNotification::Message { relay_url, message } => match message {
                RelayMessage::EndOfStoredEvents(subscription_id) => {
                    let subscription_id = subscription_id.to_string();
                    let routes = routes.lock();
                    if let Some(route) = routes.get(&subscription_id) {
                        let mut waiting = route.waiting.lock();
                        if waiting.remove(&subscription_id) && waiting.is_empty() {
                            let _ = route.tx.send(PeerMessage::Eose);
                        }
                    }
                }
                RelayMessage::Closed {
                    subscription_id,
                    message,
                } => {
                    tracing::debug!(
                        peer = %relay_url,
                        "Relay closed subscription {}: {}",
                        subscription_id,
                        message
                    );
                    close_route(&routes, &subscription_id.to_string(), Some(message.to_string()));
                }
                RelayMessage::Notice(notice) => {
                    tracing::debug!(peer = %relay_url, "Relay notice: {}", notice);
                }
                _ => {}
            },

            RelayPoolNotification::Shutdown => {
                tracing::info!("Relay pool shutdown notification received");
                let mut routes = routes.lock();
                for (_, route) in routes.drain() {
                    let _ = route.tx.send(PeerMessage::Closed(Some("shutdown".to_string())));
                }
                break;
            }
        }
    }
}
