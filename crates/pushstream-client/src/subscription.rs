//! Per-subscription lifecycle engine
//!
//! A subscription mediates between caller intent (subscribe, modify,
//! unsubscribe, reset) and a transport that only partially cooperates:
//! responses race with resets, the server may reject a format or report a
//! duplicate key, and the connection can drop at any point. All of that is
//! reconciled against a single in-flight request slot guarded by the state
//! machine; bursts of intent are absorbed by the owned [`ActionQueue`].
//!
//! Requests and the network-retry timer run as spawned tasks. Their
//! completions come back as [`SubscriptionEvent`]s through the session's
//! event channel, so every mutation of the subscription happens on one
//! logical thread.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pushstream_core::{
    MessageData, ParserFacade, StreamParser, StreamingMessage, SubscribeResponse, SubscriptionArgs,
    Transport, TransportFailure, TransportRequest, TransportResponse, TransportResult, UpdateType,
    ERROR_DUPLICATE_KEY_MESSAGE, ERROR_UNSUPPORTED_FORMAT, FORMAT_JSON, FORMAT_PROTOBUF,
};

use crate::error::SubscriptionError;
use crate::queue::{Action, ActionQueue};
use crate::session::EventSink;

/// Delay before retrying a subscribe that failed with a network error
pub const NETWORK_ERROR_RETRY_DELAY: Duration = Duration::from_secs(5);

// Reference ids are a server-side key within the streaming session, so the
// counter is process wide: two subscriptions must never share an id.
static NEXT_REFERENCE_ID: AtomicU64 = AtomicU64::new(1);

fn next_reference_id() -> String {
    NEXT_REFERENCE_ID.fetch_add(1, Ordering::Relaxed).to_string()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Subscription lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    SubscribeRequested,
    Subscribed,
    UnsubscribeRequested,
    PatchRequested,
    /// Parked awaiting the bulk unsubscribe-by-tag DELETE issued by the session
    ReadyForUnsubscribeByTag,
}

impl SubscriptionState {
    /// True while an HTTP request is outstanding or a tag operation is
    /// parked; new actions queue instead of executing.
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            SubscriptionState::SubscribeRequested
                | SubscriptionState::UnsubscribeRequested
                | SubscriptionState::PatchRequested
                | SubscriptionState::ReadyForUnsubscribeByTag
        )
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::SubscribeRequested => "subscribe_requested",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::UnsubscribeRequested => "unsubscribe_requested",
            SubscriptionState::PatchRequested => "patch_requested",
            SubscriptionState::ReadyForUnsubscribeByTag => "ready_for_unsubscribe_by_tag",
        };
        f.write_str(s)
    }
}

/// Ids captured when a request is issued.
///
/// Response handlers compare the captured reference id against the current
/// one; a mismatch means the subscription was reset or resubscribed in the
/// meantime and the response must be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedIds {
    pub context_id: String,
    pub reference_id: String,
}

/// Completion of a request or timer owned by a subscription
#[derive(Debug)]
pub enum SubscriptionEvent {
    SubscribeResult {
        captured: CapturedIds,
        result: TransportResult,
    },
    UnsubscribeResult {
        captured: CapturedIds,
        result: TransportResult,
    },
    PatchResult {
        captured: CapturedIds,
        result: TransportResult,
    },
    /// The network-error retry timer fired
    RetrySubscribe,
}

pub type UpdateCallback = Box<dyn FnMut(&StreamingMessage, UpdateType) + Send>;
pub type ErrorCallback = Box<dyn FnMut(&TransportFailure) + Send>;
pub type NotifyCallback = Box<dyn FnMut() + Send>;
pub type StateChangedCallback = Arc<dyn Fn(SubscriptionState) + Send + Sync>;

/// Construction-time hooks and request headers
#[derive(Default)]
pub struct SubscriptionOptions {
    /// Delivery callback for snapshots and deltas
    pub on_update: Option<UpdateCallback>,
    /// Surfaced non-recoverable subscribe error
    pub on_error: Option<ErrorCallback>,
    /// Fires after the final queued action completes
    pub on_queue_empty: Option<NotifyCallback>,
    /// Fires on every successful subscribe response
    pub on_subscription_created: Option<NotifyCallback>,
    /// Fires when a network-error retry is armed
    pub on_network_error: Option<NotifyCallback>,
    /// Merged into subscribe request headers
    pub headers: Option<HashMap<String, String>>,
}

/// Arguments to [`Subscription::on_modify`]
#[derive(Debug, Default)]
pub struct ModifyOptions {
    /// Modify in place with a PATCH instead of replacing the subscription
    pub is_patch: bool,
    /// Delta sent as the PATCH body; required when `is_patch` is set
    pub patch_delta: Option<Value>,
}

/// A client-side handle to one server-push data stream.
///
/// All methods, including [`Subscription::handle_event`], must be called
/// from one logical thread; the session's event loop provides that.
pub struct Subscription {
    service_path: String,
    url: String,
    transport: Arc<dyn Transport>,
    parsers: Arc<ParserFacade>,
    events: EventSink,

    args: SubscriptionArgs,
    headers: HashMap<String, String>,

    streaming_context_id: String,
    /// Context id snapshotted at subscribe time, so a DELETE issued after a
    /// reconnect still targets the context the subscription was created on
    current_streaming_context_id: Option<String>,
    reference_id: Option<String>,

    state: SubscriptionState,
    connection_available: bool,
    queue: ActionQueue,

    parser: Box<dyn StreamParser>,
    /// Last schema name seen; used to decode binary deltas
    schema_name: Option<String>,

    /// Seconds of silence before the subscription counts as orphaned; zero
    /// means never
    inactivity_timeout: u32,
    /// Wall-clock ms of the last snapshot, delta or heartbeat
    latest_activity: i64,

    /// Deltas that arrived while the subscribe request was in flight,
    /// replayed after the snapshot
    updates_before_subscribed: Vec<StreamingMessage>,
    network_retry: Option<JoinHandle<()>>,
    is_disposed: bool,

    on_update: Option<UpdateCallback>,
    on_error: Option<ErrorCallback>,
    on_queue_empty: Option<NotifyCallback>,
    on_subscription_created: Option<NotifyCallback>,
    on_network_error: Option<NotifyCallback>,
    state_changed: Vec<StateChangedCallback>,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        streaming_context_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        parsers: Arc<ParserFacade>,
        service_path: impl Into<String>,
        url: impl Into<String>,
        mut args: SubscriptionArgs,
        options: SubscriptionOptions,
        events: EventSink,
    ) -> Self {
        args.normalize();
        let parser = parsers.get_parser(&args.format);
        Self {
            service_path: service_path.into(),
            url: url.into(),
            transport,
            parsers,
            events,
            headers: options.headers.unwrap_or_default(),
            args,
            streaming_context_id: streaming_context_id.into(),
            current_streaming_context_id: None,
            reference_id: None,
            state: SubscriptionState::Unsubscribed,
            connection_available: false,
            queue: ActionQueue::new(),
            parser,
            schema_name: None,
            inactivity_timeout: 0,
            latest_activity: now_ms(),
            updates_before_subscribed: Vec::new(),
            network_retry: None,
            is_disposed: false,
            on_update: options.on_update,
            on_error: options.on_error,
            on_queue_empty: options.on_queue_empty,
            on_subscription_created: options.on_subscription_created,
            on_network_error: options.on_network_error,
            state_changed: Vec::new(),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn reference_id(&self) -> Option<&str> {
        self.reference_id.as_deref()
    }

    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn args(&self) -> &SubscriptionArgs {
        &self.args
    }

    pub fn tag(&self) -> Option<&str> {
        self.args.tag.as_deref()
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed
    }

    /// Point the subscription at a new streaming context after a reconnect.
    pub fn set_streaming_context_id(&mut self, context_id: impl Into<String>) {
        self.streaming_context_id = context_id.into();
    }

    // =========================================================================
    // Caller intent
    // =========================================================================

    /// Request a (re)subscribe.
    pub fn on_subscribe(&mut self) -> Result<(), SubscriptionError> {
        if self.is_disposed {
            return Err(SubscriptionError::Disposed);
        }
        self.try_perform(Action::Subscribe);
        Ok(())
    }

    /// Replace the subscription arguments.
    ///
    /// With `is_patch` the change is sent as a PATCH delta; otherwise the
    /// subscription is replaced outright with a forced unsubscribe followed
    /// by a fresh subscribe.
    pub fn on_modify(
        &mut self,
        new_args: Option<Value>,
        options: ModifyOptions,
    ) -> Result<(), SubscriptionError> {
        self.args.arguments = new_args;
        if options.is_patch {
            let delta = options
                .patch_delta
                .ok_or(SubscriptionError::MissingPatchDelta)?;
            self.try_perform(Action::ModifyPatch { delta });
            Ok(())
        } else {
            self.on_unsubscribe(true);
            self.on_subscribe()
        }
    }

    /// Request an unsubscribe. A forced unsubscribe survives queue
    /// coalescing against a later subscribe.
    pub fn on_unsubscribe(&mut self, force: bool) {
        if self.is_disposed {
            warn!(
                reference_id = ?self.reference_id,
                "unsubscribe requested on a disposed subscription"
            );
        }
        self.try_perform(Action::Unsubscribe { force });
    }

    /// Server-initiated reset: tear the subscription down and build it back
    /// up so the server re-sends a snapshot.
    pub fn reset(&mut self) {
        if self.is_disposed {
            debug!("ignoring reset on a disposed subscription");
            return;
        }
        match self.state {
            SubscriptionState::Unsubscribed | SubscriptionState::UnsubscribeRequested => return,
            // The bulk tag path completes on its own.
            SubscriptionState::ReadyForUnsubscribeByTag => return,
            SubscriptionState::SubscribeRequested | SubscriptionState::Subscribed => {
                // An unsubscribe already queued achieves the same teardown.
                if self.head_unsubscribes() {
                    return;
                }
            }
            SubscriptionState::PatchRequested => {
                // The patch is abandoned; settle back to subscribed so the
                // teardown can proceed.
                self.set_state(SubscriptionState::Subscribed);
            }
        }
        self.on_unsubscribe(true);
        // A non-disposed subscription cannot refuse a subscribe.
        let _ = self.on_subscribe();
    }

    /// Mark the subscription disposed. No further HTTP requests are issued;
    /// in-flight responses are still processed and streaming data is dropped
    /// silently.
    pub fn dispose(&mut self) {
        self.cancel_network_retry();
        self.is_disposed = true;
    }

    // =========================================================================
    // Connection state
    // =========================================================================

    pub fn on_connection_available(&mut self) {
        self.connection_available = true;
        if !self.state.is_transitioning() {
            self.ready_for_next();
        }
    }

    pub fn on_connection_unavailable(&mut self) {
        self.connection_available = false;
        self.cancel_network_retry();
    }

    // =========================================================================
    // Streaming input
    // =========================================================================

    /// Deliver a delta frame.
    ///
    /// Returns `false` when the frame was not meant for this subscription
    /// (already unsubscribed), so the session can flag orphaned frames.
    pub fn on_streaming_data(&mut self, message: StreamingMessage) -> bool {
        self.latest_activity = now_ms();
        if self.is_disposed {
            return true;
        }
        match self.state {
            SubscriptionState::UnsubscribeRequested => true,
            SubscriptionState::Unsubscribed => false,
            SubscriptionState::SubscribeRequested => {
                self.updates_before_subscribed.push(message);
                true
            }
            SubscriptionState::Subscribed | SubscriptionState::PatchRequested => {
                self.process_update(message);
                true
            }
            SubscriptionState::ReadyForUnsubscribeByTag => {
                error!(
                    state = %self.state,
                    reference_id = ?self.reference_id,
                    "streaming data arrived in an unexpected state"
                );
                true
            }
        }
    }

    /// Refresh the activity stamp used for orphan detection.
    pub fn on_heartbeat(&mut self) {
        if self.state == SubscriptionState::SubscribeRequested {
            debug!(
                reference_id = ?self.reference_id,
                "heartbeat received while the subscribe request is in flight"
            );
        }
        self.latest_activity = now_ms();
    }

    // =========================================================================
    // Bulk unsubscribe-by-tag
    // =========================================================================

    /// Park the subscription for a session-driven bulk unsubscribe.
    pub fn on_unsubscribe_by_tag_pending(&mut self) {
        self.try_perform(Action::UnsubscribeByTagPending);
    }

    /// The session's bulk DELETE completed; the subscription is gone
    /// server side.
    pub fn on_unsubscribe_by_tag_complete(&mut self) {
        self.set_state(SubscriptionState::Unsubscribed);
        self.ready_for_next();
    }

    pub fn is_ready_for_unsubscribe_by_tag(&self) -> bool {
        self.state == SubscriptionState::ReadyForUnsubscribeByTag
    }

    // =========================================================================
    // Orphan detection
    // =========================================================================

    /// Milliseconds until the subscription counts as orphaned, or `None`
    /// when it never will (no connection, no timeout, or no active stream).
    pub fn time_till_orphaned(&self, now_ms: i64) -> Option<i64> {
        if !self.connection_available || self.inactivity_timeout == 0 {
            return None;
        }
        match self.state {
            SubscriptionState::Unsubscribed
            | SubscriptionState::UnsubscribeRequested
            | SubscriptionState::SubscribeRequested => None,
            _ => Some(i64::from(self.inactivity_timeout) * 1000 - (now_ms - self.latest_activity)),
        }
    }

    // =========================================================================
    // State observers
    // =========================================================================

    /// Register a state-change observer. Registering the same `Arc` twice
    /// is ignored.
    pub fn add_state_changed_callback(&mut self, callback: StateChangedCallback) {
        if self
            .state_changed
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &callback))
        {
            return;
        }
        self.state_changed.push(callback);
    }

    /// Remove a previously registered observer by identity.
    pub fn remove_state_changed_callback(&mut self, callback: &StateChangedCallback) {
        self.state_changed
            .retain(|existing| !Arc::ptr_eq(existing, callback));
    }

    // =========================================================================
    // Event handling
    // =========================================================================

    /// Process the completion of a request or timer this subscription issued.
    pub fn handle_event(&mut self, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::SubscribeResult { captured, result } => match result {
                Ok(response) => self.on_subscribe_success(captured, response),
                Err(failure) => self.on_subscribe_error(captured, failure),
            },
            SubscriptionEvent::UnsubscribeResult { captured, result } => match result {
                Ok(_) => self.on_unsubscribe_success(captured),
                Err(failure) => self.on_unsubscribe_error(captured, failure),
            },
            SubscriptionEvent::PatchResult { captured, result } => match result {
                Ok(_) => self.on_patch_success(captured),
                Err(failure) => self.on_patch_error(captured, failure),
            },
            SubscriptionEvent::RetrySubscribe => self.on_retry_subscribe(),
        }
    }

    // =========================================================================
    // Action dispatch
    // =========================================================================

    fn try_perform(&mut self, action: Action) {
        // Any deliberate action supersedes a pending retry.
        self.cancel_network_retry();
        if !self.connection_available || self.state.is_transitioning() {
            self.queue.enqueue(action);
        } else {
            self.perform_action(action, false);
        }
    }

    fn ready_for_next(&mut self) {
        if !self.connection_available {
            return;
        }
        if let Some(action) = self.queue.dequeue() {
            let is_last = self.queue.is_empty();
            self.perform_action(action, is_last);
        }
    }

    fn perform_action(&mut self, action: Action, is_last_queued: bool) {
        match action {
            Action::Subscribe => match self.state {
                SubscriptionState::Subscribed => {}
                SubscriptionState::Unsubscribed => {
                    // About to subscribe: queued subscribes and patches are
                    // redundant now, only a terminal unsubscribe survives.
                    self.queue.clear_patches();
                    self.subscribe();
                }
                state => {
                    error!(%state, "subscribe requested in an unexpected state");
                }
            },
            Action::ModifyPatch { delta } => match self.state {
                SubscriptionState::Subscribed => self.modify_patch(delta),
                state => {
                    error!(%state, "patch requested in an unexpected state");
                }
            },
            Action::Unsubscribe { .. } => match self.state {
                SubscriptionState::Subscribed => self.unsubscribe(),
                SubscriptionState::Unsubscribed => {}
                state => {
                    error!(%state, "unsubscribe requested in an unexpected state");
                }
            },
            Action::UnsubscribeByTagPending => match self.state {
                SubscriptionState::Subscribed | SubscriptionState::Unsubscribed => {
                    self.set_state(SubscriptionState::ReadyForUnsubscribeByTag);
                }
                state => {
                    error!(%state, "tag unsubscribe requested in an unexpected state");
                }
            },
        }
        if is_last_queued {
            if let Some(on_queue_empty) = self.on_queue_empty.as_mut() {
                on_queue_empty();
            }
        }
        if !self.queue.is_empty() && !self.state.is_transitioning() {
            self.ready_for_next();
        }
    }

    fn head_unsubscribes(&self) -> bool {
        self.queue
            .peek_action()
            .map(Action::unsubscribes)
            .unwrap_or(false)
    }

    // =========================================================================
    // Request issue points
    // =========================================================================

    fn subscribe(&mut self) {
        if self.is_disposed {
            error!("subscribe attempted on a disposed subscription");
            return;
        }
        let reference_id = next_reference_id();
        self.reference_id = Some(reference_id.clone());
        self.updates_before_subscribed.clear();
        let context_id = self.streaming_context_id.clone();
        self.current_streaming_context_id = Some(context_id.clone());

        let mut body = self.args.to_body();
        body.insert("ContextId".into(), Value::String(context_id.clone()));
        body.insert("ReferenceId".into(), Value::String(reference_id.clone()));
        body.insert("KnownSchemas".into(), json!(self.parser.schema_names()));

        let mut request = TransportRequest::new(self.service_path.as_str(), self.url.as_str())
            .with_body(Value::Object(body))
            .with_headers(self.headers.clone());
        if let Some(top) = self.args.top {
            request = request.with_query(format!("$top={top}"));
        }

        self.set_state(SubscriptionState::SubscribeRequested);
        debug!(reference_id = %reference_id, url = %self.url, "subscribing");

        let captured = CapturedIds {
            context_id,
            reference_id,
        };
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = transport.post(request).await;
            events.send(SubscriptionEvent::SubscribeResult { captured, result });
        });
    }

    fn unsubscribe(&mut self) {
        if self.is_disposed {
            error!("unsubscribe attempted on a disposed subscription");
            return;
        }
        let Some(captured) = self.captured_ids() else {
            error!("unsubscribe attempted without an active subscription key");
            return;
        };
        self.set_state(SubscriptionState::UnsubscribeRequested);
        debug!(reference_id = %captured.reference_id, "unsubscribing");

        let request = self.context_request(&captured);
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = transport.delete(request).await;
            events.send(SubscriptionEvent::UnsubscribeResult { captured, result });
        });
    }

    fn modify_patch(&mut self, delta: Value) {
        if self.is_disposed {
            error!("patch attempted on a disposed subscription");
            return;
        }
        let Some(captured) = self.captured_ids() else {
            error!("patch attempted without an active subscription key");
            return;
        };
        self.set_state(SubscriptionState::PatchRequested);
        debug!(reference_id = %captured.reference_id, "patching subscription");

        let request = self.context_request(&captured).with_body(delta);
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = transport.patch(request).await;
            events.send(SubscriptionEvent::PatchResult { captured, result });
        });
    }

    /// DELETE issued against the ids an errored subscribe was made with, so
    /// the server frees the key it is still holding.
    fn cleanup_after_duplicate(&self, captured: &CapturedIds) {
        if self.is_disposed {
            return;
        }
        let request = self.context_request(captured);
        let transport = Arc::clone(&self.transport);
        let reference_id = captured.reference_id.clone();
        tokio::spawn(async move {
            if let Err(error) = transport.delete(request).await {
                warn!(%error, %reference_id, "cleanup delete for duplicate subscription failed");
            }
        });
    }

    fn captured_ids(&self) -> Option<CapturedIds> {
        Some(CapturedIds {
            context_id: self.current_streaming_context_id.clone()?,
            reference_id: self.reference_id.clone()?,
        })
    }

    fn context_request(&self, captured: &CapturedIds) -> TransportRequest {
        TransportRequest::new(
            self.service_path.as_str(),
            format!("{}/{{contextId}}/{{referenceId}}", self.url),
        )
        .with_template_arg("contextId", captured.context_id.as_str())
        .with_template_arg("referenceId", captured.reference_id.as_str())
    }

    // =========================================================================
    // Response handlers
    // =========================================================================

    fn is_current(&self, captured: &CapturedIds) -> bool {
        self.reference_id.as_deref() == Some(captured.reference_id.as_str())
    }

    fn on_subscribe_success(&mut self, captured: CapturedIds, response: TransportResponse) {
        if !self.is_current(&captured) {
            debug!(
                stale = %captured.reference_id,
                "ignoring subscribe response for a previous subscription"
            );
            return;
        }

        let data = match response.body {
            Some(body) => match serde_json::from_value::<SubscribeResponse>(body) {
                Ok(data) => data,
                Err(error) => {
                    warn!(%error, "subscribe response body did not match the expected envelope");
                    SubscribeResponse::default()
                }
            },
            None => SubscribeResponse::default(),
        };

        let inactivity_timeout = data.inactivity_timeout.unwrap_or(0);
        if inactivity_timeout == 0 {
            warn!(
                reference_id = %captured.reference_id,
                "no inactivity timeout; the subscription will never be treated as orphaned"
            );
        }
        self.inactivity_timeout = inactivity_timeout;
        self.latest_activity = now_ms();
        self.set_state(SubscriptionState::Subscribed);
        info!(reference_id = %captured.reference_id, url = %self.url, "subscription created");

        if let Some(on_subscription_created) = self.on_subscription_created.as_mut() {
            on_subscription_created();
        }

        // When an unsubscribe is already queued the data is about to be
        // thrown away; skip snapshot processing and replay entirely.
        if !self.head_unsubscribes() {
            self.process_snapshot(&data);
            let buffered = std::mem::take(&mut self.updates_before_subscribed);
            for message in buffered {
                self.on_streaming_data(message);
            }
        }
        self.updates_before_subscribed.clear();
        self.ready_for_next();
    }

    fn on_subscribe_error(&mut self, captured: CapturedIds, failure: TransportFailure) {
        let duplicate_key = failure.message() == Some(ERROR_DUPLICATE_KEY_MESSAGE);

        if !self.is_current(&captured) {
            // Even a stale duplicate-key error means the server is holding
            // the captured key; free it.
            if duplicate_key {
                self.cleanup_after_duplicate(&captured);
            }
            debug!(
                stale = %captured.reference_id,
                "ignoring subscribe error for a previous subscription"
            );
            return;
        }

        let will_unsubscribe = self.head_unsubscribes();
        self.set_state(SubscriptionState::Unsubscribed);
        self.updates_before_subscribed.clear();

        if duplicate_key {
            error!(
                reference_id = %captured.reference_id,
                "subscription key already in use; unsubscribing the remote duplicate"
            );
            self.cleanup_after_duplicate(&captured);
            if !will_unsubscribe {
                self.try_perform(Action::Subscribe);
                return;
            }
        } else if failure.error_code() == Some(ERROR_UNSUPPORTED_FORMAT)
            && self.args.format == FORMAT_PROTOBUF
        {
            warn!(
                "server does not support {}; downgrading to {}",
                FORMAT_PROTOBUF, FORMAT_JSON
            );
            self.args.format = FORMAT_JSON.to_string();
            self.parser = self.parsers.default_parser();
            if !will_unsubscribe {
                self.try_perform(Action::Subscribe);
                return;
            }
        } else if failure.is_network_error {
            if !will_unsubscribe {
                debug!(
                    reference_id = %captured.reference_id,
                    "network error while subscribing; retrying in {:?}",
                    NETWORK_ERROR_RETRY_DELAY
                );
                self.arm_network_retry();
                if let Some(on_network_error) = self.on_network_error.as_mut() {
                    on_network_error();
                }
                return;
            }
        } else {
            error!(
                reference_id = %captured.reference_id,
                %failure,
                "subscribe request rejected"
            );
            if !will_unsubscribe {
                if let Some(on_error) = self.on_error.as_mut() {
                    on_error(&failure);
                }
            }
        }
        self.ready_for_next();
    }

    fn on_unsubscribe_success(&mut self, captured: CapturedIds) {
        if !self.is_current(&captured) {
            debug!(
                stale = %captured.reference_id,
                "ignoring unsubscribe response for a previous subscription"
            );
            return;
        }
        self.set_state(SubscriptionState::Unsubscribed);
        self.ready_for_next();
    }

    fn on_unsubscribe_error(&mut self, captured: CapturedIds, failure: TransportFailure) {
        if !self.is_current(&captured) {
            debug!(
                stale = %captured.reference_id,
                "ignoring unsubscribe error for a previous subscription"
            );
            return;
        }
        // The server has most likely dropped the subscription already, for
        // instance after a disconnect.
        info!(
            reference_id = %captured.reference_id,
            %failure,
            "unsubscribe failed; treating the subscription as removed"
        );
        self.set_state(SubscriptionState::Unsubscribed);
        self.ready_for_next();
    }

    fn on_patch_success(&mut self, captured: CapturedIds) {
        if !self.is_current(&captured) {
            debug!(
                stale = %captured.reference_id,
                "ignoring patch response for a previous subscription"
            );
            return;
        }
        self.set_state(SubscriptionState::Subscribed);
        self.ready_for_next();
    }

    fn on_patch_error(&mut self, captured: CapturedIds, failure: TransportFailure) {
        if !self.is_current(&captured) {
            debug!(
                stale = %captured.reference_id,
                "ignoring patch error for a previous subscription"
            );
            return;
        }
        // A failed patch leaves the subscription itself intact.
        error!(
            reference_id = %captured.reference_id,
            %failure,
            "patch rejected; the subscription remains active"
        );
        self.set_state(SubscriptionState::Subscribed);
        self.ready_for_next();
    }

    fn on_retry_subscribe(&mut self) {
        // A `take` returning nothing means the retry was cancelled after
        // the timer had already fired; drop the event.
        if self.network_retry.take().is_none() {
            return;
        }
        self.try_perform(Action::Subscribe);
    }

    // =========================================================================
    // Updates
    // =========================================================================

    fn process_snapshot(&mut self, data: &SubscribeResponse) {
        if let Some(name) = &data.schema_name {
            self.schema_name = Some(name.clone());
            if let Some(schema) = &data.schema {
                if let Err(error) = self.parser.add_schema(schema, name) {
                    error!(%error, schema_name = %name, "failed to register schema from subscribe response");
                }
            }
        } else if self.args.format == FORMAT_PROTOBUF && self.parser.schema_name().is_none() {
            // No schema on the wire and none cached: binary deltas cannot be
            // decoded, so fall back to the default format for the next
            // subscribe.
            warn!(
                "no schema in the subscribe response; downgrading from {} to {}",
                FORMAT_PROTOBUF, FORMAT_JSON
            );
            self.args.format = FORMAT_JSON.to_string();
            self.parser = self.parsers.default_parser();
        }

        if let Some(snapshot) = &data.snapshot {
            let message = StreamingMessage::json(
                self.reference_id.clone().unwrap_or_default(),
                snapshot.clone(),
            );
            if let Some(on_update) = self.on_update.as_mut() {
                let delivery =
                    catch_unwind(AssertUnwindSafe(|| on_update(&message, UpdateType::Snapshot)));
                if delivery.is_err() {
                    error!("update callback panicked while processing the snapshot");
                }
            }
        }
    }

    fn process_update(&mut self, mut message: StreamingMessage) {
        let parsed = self
            .parser
            .parse(&message.data, self.schema_name.as_deref());
        match parsed {
            Ok(data) => {
                message.data = MessageData::Json(data);
                if let Some(on_update) = self.on_update.as_mut() {
                    on_update(&message, UpdateType::Delta);
                }
            }
            Err(error) => {
                // Assume synchronization is lost; a reset makes the server
                // re-send a snapshot.
                error!(
                    %error,
                    reference_id = ?self.reference_id,
                    "failed to parse streaming delta; resetting subscription"
                );
                self.reset();
            }
        }
    }

    // =========================================================================
    // Timers and state
    // =========================================================================

    fn arm_network_retry(&mut self) {
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(NETWORK_ERROR_RETRY_DELAY).await;
            events.send(SubscriptionEvent::RetrySubscribe);
        });
        self.network_retry = Some(handle);
    }

    fn cancel_network_retry(&mut self) {
        if let Some(handle) = self.network_retry.take() {
            handle.abort();
        }
    }

    fn set_state(&mut self, state: SubscriptionState) {
        self.state = state;
        for callback in &self.state_changed {
            callback(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitioning_states_block_new_actions() {
        assert!(!SubscriptionState::Unsubscribed.is_transitioning());
        assert!(!SubscriptionState::Subscribed.is_transitioning());
        assert!(SubscriptionState::SubscribeRequested.is_transitioning());
        assert!(SubscriptionState::UnsubscribeRequested.is_transitioning());
        assert!(SubscriptionState::PatchRequested.is_transitioning());
        assert!(SubscriptionState::ReadyForUnsubscribeByTag.is_transitioning());
    }

    #[test]
    fn reference_ids_are_unique_and_increasing() {
        let first: u64 = next_reference_id().parse().unwrap();
        let second: u64 = next_reference_id().parse().unwrap();
        assert!(second > first);
    }
}
