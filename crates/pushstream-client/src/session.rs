//! Streaming session facade
//!
//! Owns the HTTP side of one multiplexed streaming connection: the
//! subscription registry, the event loop that feeds request completions back
//! into subscriptions, frame routing by reference id, heartbeats,
//! server-initiated resets, reconnect handling, orphan checks and bulk
//! unsubscribe-by-tag. The socket itself lives outside this crate; a
//! connection driver calls [`StreamingSession::handle_message`],
//! [`StreamingSession::handle_heartbeat`] and the connection state methods.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pushstream_core::{
    ParserFacade, StreamingMessage, SubscriptionArgs, Transport, TransportRequest, TransportResult,
};

use crate::subscription::{Subscription, SubscriptionEvent, SubscriptionOptions};

/// Session-local identifier of a subscription
pub type SubscriptionKey = u64;

/// Everything the session's event loop processes
#[derive(Debug)]
pub enum SessionEvent {
    /// Completion of a request or timer owned by one subscription
    Subscription {
        key: SubscriptionKey,
        event: SubscriptionEvent,
    },
    /// Completion of a bulk unsubscribe-by-tag DELETE
    TagUnsubscribed {
        service_path: String,
        url: String,
        tag: String,
        result: TransportResult,
    },
}

/// Hands a subscription's spawned tasks a way to report back to the
/// session's event loop.
#[derive(Clone)]
pub struct EventSink {
    key: SubscriptionKey,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(key: SubscriptionKey, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { key, tx }
    }

    pub(crate) fn send(&self, event: SubscriptionEvent) {
        // A closed receiver means the session is gone; late completions are
        // dropped on purpose.
        let _ = self.tx.send(SessionEvent::Subscription {
            key: self.key,
            event,
        });
    }
}

/// Client-side endpoint of one streaming connection.
pub struct StreamingSession {
    transport: Arc<dyn Transport>,
    parsers: Arc<ParserFacade>,
    context_id: String,
    connection_available: bool,
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    next_key: SubscriptionKey,
    /// Tag DELETEs currently in flight, keyed by (service path, url, tag)
    pending_tag_deletes: HashSet<(String, String, String)>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl StreamingSession {
    pub fn new(transport: Arc<dyn Transport>, parsers: Arc<ParserFacade>) -> Self {
        Self::with_context_id(transport, parsers, Uuid::new_v4().simple().to_string())
    }

    pub fn with_context_id(
        transport: Arc<dyn Transport>,
        parsers: Arc<ParserFacade>,
        context_id: impl Into<String>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            parsers,
            context_id: context_id.into(),
            connection_available: false,
            subscriptions: HashMap::new(),
            next_key: 1,
            pending_tag_deletes: HashSet::new(),
            events_tx,
            events_rx,
        }
    }

    /// Identifier of the multiplexed connection, sent with every subscribe.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    // =========================================================================
    // Subscription management
    // =========================================================================

    /// Create a subscription and immediately request a subscribe.
    pub fn create_subscription(
        &mut self,
        service_path: impl Into<String>,
        url: impl Into<String>,
        args: SubscriptionArgs,
        options: SubscriptionOptions,
    ) -> SubscriptionKey {
        let key = self.next_key;
        self.next_key += 1;

        let sink = EventSink::new(key, self.events_tx.clone());
        let mut subscription = Subscription::new(
            self.context_id.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.parsers),
            service_path,
            url,
            args,
            options,
            sink,
        );
        if self.connection_available {
            subscription.on_connection_available();
        }
        // A freshly created subscription cannot be disposed.
        let _ = subscription.on_subscribe();
        self.subscriptions.insert(key, subscription);
        key
    }

    pub fn subscription(&self, key: SubscriptionKey) -> Option<&Subscription> {
        self.subscriptions.get(&key)
    }

    pub fn subscription_mut(&mut self, key: SubscriptionKey) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(&key)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Force-unsubscribe, dispose and drop a subscription. The DELETE goes
    /// out before the disposed flag blocks further requests; its response
    /// is dropped with the subscription.
    pub fn remove_subscription(&mut self, key: SubscriptionKey) {
        if let Some(mut subscription) = self.subscriptions.remove(&key) {
            subscription.on_unsubscribe(true);
            subscription.dispose();
        }
    }

    // =========================================================================
    // Connection state
    // =========================================================================

    pub fn on_connection_available(&mut self) {
        self.connection_available = true;
        for subscription in self.subscriptions.values_mut() {
            subscription.on_connection_available();
        }
    }

    pub fn on_connection_unavailable(&mut self) {
        self.connection_available = false;
        for subscription in self.subscriptions.values_mut() {
            subscription.on_connection_unavailable();
        }
    }

    /// The transport reconnected under a new streaming context: re-point
    /// every subscription at it and resubscribe from scratch.
    pub fn on_reconnect(&mut self, new_context_id: impl Into<String>) {
        self.context_id = new_context_id.into();
        info!(context_id = %self.context_id, "streaming context replaced after reconnect");
        for subscription in self.subscriptions.values_mut() {
            subscription.set_streaming_context_id(self.context_id.clone());
        }
        self.on_connection_available();
        for subscription in self.subscriptions.values_mut() {
            subscription.reset();
        }
    }

    // =========================================================================
    // Incoming frames
    // =========================================================================

    /// Route a data frame to the subscription holding its reference id.
    pub fn handle_message(&mut self, message: StreamingMessage) {
        let reference_id = message.reference_id.clone();
        let Some(subscription) = self
            .subscriptions
            .values_mut()
            .find(|subscription| subscription.reference_id() == Some(reference_id.as_str()))
        else {
            debug!(reference_id = %reference_id, "frame for an unknown subscription");
            return;
        };
        if !subscription.on_streaming_data(message) {
            warn!(reference_id = %reference_id, "frame for an inactive subscription");
        }
    }

    /// Refresh activity for the subscriptions named in a heartbeat control
    /// frame.
    pub fn handle_heartbeat(&mut self, originating_reference_ids: &[String]) {
        for reference_id in originating_reference_ids {
            match self
                .subscriptions
                .values_mut()
                .find(|subscription| subscription.reference_id() == Some(reference_id.as_str()))
            {
                Some(subscription) => subscription.on_heartbeat(),
                None => {
                    debug!(reference_id = %reference_id, "heartbeat for an unknown subscription");
                }
            }
        }
    }

    /// Service a server-initiated reset control frame: the listed
    /// subscriptions, or all of them when none are listed.
    pub fn reset_subscriptions(&mut self, reference_ids: Option<&[String]>) {
        match reference_ids {
            None => {
                for subscription in self.subscriptions.values_mut() {
                    subscription.reset();
                }
            }
            Some(ids) => {
                for reference_id in ids {
                    match self.subscriptions.values_mut().find(|subscription| {
                        subscription.reference_id() == Some(reference_id.as_str())
                    }) {
                        Some(subscription) => subscription.reset(),
                        None => {
                            debug!(reference_id = %reference_id, "reset for an unknown subscription");
                        }
                    }
                }
            }
        }
    }

    // =========================================================================
    // Orphan detection
    // =========================================================================

    /// Reset every subscription whose inactivity window has elapsed.
    /// Drive this periodically from the embedder's timer of choice.
    pub fn check_orphans(&mut self, now_ms: i64) {
        let orphaned: Vec<SubscriptionKey> = self
            .subscriptions
            .iter()
            .filter_map(|(key, subscription)| match subscription.time_till_orphaned(now_ms) {
                Some(remaining) if remaining <= 0 => Some(*key),
                _ => None,
            })
            .collect();
        for key in orphaned {
            if let Some(subscription) = self.subscriptions.get_mut(&key) {
                warn!(
                    reference_id = ?subscription.reference_id(),
                    url = %subscription.url(),
                    "subscription went silent past its inactivity timeout; resetting"
                );
                subscription.reset();
            }
        }
    }

    // =========================================================================
    // Bulk unsubscribe-by-tag
    // =========================================================================

    /// Unsubscribe every subscription carrying `tag` with one DELETE per
    /// (service path, url) group.
    ///
    /// Each subscription parks itself first; the DELETE goes out once every
    /// member of a group reports ready, and completion (success or failure)
    /// releases them all to `Unsubscribed`.
    pub fn unsubscribe_by_tag(&mut self, tag: &str) {
        let mut groups: HashSet<(String, String)> = HashSet::new();
        for subscription in self.subscriptions.values_mut() {
            if subscription.tag() == Some(tag) {
                groups.insert((
                    subscription.service_path().to_string(),
                    subscription.url().to_string(),
                ));
                subscription.on_unsubscribe_by_tag_pending();
            }
        }
        for (service_path, url) in groups {
            self.try_complete_tag_unsubscribe(&service_path, &url, tag);
        }
    }

    fn try_complete_tag_unsubscribe(&mut self, service_path: &str, url: &str, tag: &str) {
        let group_key = (
            service_path.to_string(),
            url.to_string(),
            tag.to_string(),
        );
        if self.pending_tag_deletes.contains(&group_key) {
            return;
        }

        let mut any_member = false;
        for subscription in self.subscriptions.values() {
            if subscription.service_path() == service_path
                && subscription.url() == url
                && subscription.tag() == Some(tag)
            {
                any_member = true;
                if !subscription.is_ready_for_unsubscribe_by_tag() {
                    return;
                }
            }
        }
        if !any_member {
            return;
        }

        debug!(tag, url, "all tagged subscriptions parked; issuing bulk delete");
        self.pending_tag_deletes.insert(group_key);

        let request = TransportRequest::new(service_path, format!("{url}/{{contextId}}"))
            .with_template_arg("contextId", self.context_id.as_str())
            .with_query(format!("Tag={tag}"));
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let (service_path, url, tag) = (
            service_path.to_string(),
            url.to_string(),
            tag.to_string(),
        );
        tokio::spawn(async move {
            let result = transport.delete(request).await;
            let _ = events.send(SessionEvent::TagUnsubscribed {
                service_path,
                url,
                tag,
                result,
            });
        });
    }

    fn on_tag_unsubscribed(
        &mut self,
        service_path: String,
        url: String,
        tag: String,
        result: TransportResult,
    ) {
        self.pending_tag_deletes
            .remove(&(service_path.clone(), url.clone(), tag.clone()));
        if let Err(failure) = result {
            // Mirror the single-subscription unsubscribe: the server has
            // most likely dropped them already.
            info!(%failure, tag, "bulk unsubscribe failed; treating the subscriptions as removed");
        }
        for subscription in self.subscriptions.values_mut() {
            if subscription.service_path() == service_path
                && subscription.url() == url
                && subscription.tag() == Some(tag.as_str())
                && subscription.is_ready_for_unsubscribe_by_tag()
            {
                subscription.on_unsubscribe_by_tag_complete();
            }
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Process queued events without blocking.
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.process_event(event);
        }
    }

    /// Wait for and process one event. Returns `false` when the channel is
    /// closed.
    pub async fn process_next_event(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.process_event(event);
                true
            }
            None => false,
        }
    }

    fn process_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Subscription { key, event } => {
                let Some(subscription) = self.subscriptions.get_mut(&key) else {
                    debug!(key, "event for a removed subscription");
                    return;
                };
                subscription.handle_event(event);
                // A subscription that just parked itself may have been the
                // last one its tag group was waiting for.
                if subscription.is_ready_for_unsubscribe_by_tag() {
                    if let Some(tag) = subscription.tag().map(str::to_string) {
                        let service_path = subscription.service_path().to_string();
                        let url = subscription.url().to_string();
                        self.try_complete_tag_unsubscribe(&service_path, &url, &tag);
                    }
                }
            }
            SessionEvent::TagUnsubscribed {
                service_path,
                url,
                tag,
                result,
            } => self.on_tag_unsubscribed(service_path, url, tag, result),
        }
    }
}
