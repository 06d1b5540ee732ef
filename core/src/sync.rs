/// Conversation synchronization engine
///
/// Keeps one conversation's message list consistent with the remote store
/// under two concurrent producers, the poll timer and user-initiated sends,
/// without duplicate entries and with live delivery feedback on sends.
use crate::backend::{MessageBackend, RemoteMessage};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::events::EventEmitter;
use crate::session::Session;
use crate::types::{ChatEvent, DeliveryState, Message, MessageId, SortOrder};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How the engine refreshes its conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Fetch records newer than the watermark
    Incremental,
    /// Fetch the whole conversation; confirmed entries are rebuilt each poll
    Snapshot,
}

pub(crate) struct SyncState {
    pub(crate) messages: Vec<Message>,
    pub(crate) known_ids: HashSet<i64>,
    pub(crate) watermark: Option<DateTime<Utc>>,
}

impl SyncState {
    pub(crate) fn new() -> Self {
        Self {
            messages: Vec::new(),
            known_ids: HashSet::new(),
            watermark: None,
        }
    }
}

/// Single-conversation engine
pub struct ChatSync<B: MessageBackend> {
    backend: Arc<B>,
    session: Session,

    /// The other participant of the conversation
    peer_id: i64,

    mode: FetchMode,
    order: SortOrder,
    poll_interval: Duration,
    send_grace: Duration,

    state: Arc<RwLock<SyncState>>,
    events: EventEmitter,

    /// Cleared on teardown; late poll/send results are discarded
    alive: Arc<AtomicBool>,

    /// At most one poll in flight; overlapping calls are skipped
    poll_gate: Arc<AtomicBool>,

    poll_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<B: MessageBackend + 'static> ChatSync<B> {
    pub fn new(
        backend: Arc<B>,
        session: Session,
        peer_id: i64,
        mode: FetchMode,
        order: SortOrder,
        config: &Config,
        events: EventEmitter,
    ) -> Self {
        Self {
            backend,
            session,
            peer_id,
            mode,
            order,
            poll_interval: config.poll_interval,
            send_grace: config.send_grace,
            state: Arc::new(RwLock::new(SyncState::new())),
            events,
            alive: Arc::new(AtomicBool::new(true)),
            poll_gate: Arc::new(AtomicBool::new(false)),
            poll_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn peer_id(&self) -> i64 {
        self.peer_id
    }

    /// Reset the cursor and perform one immediate poll.
    ///
    /// `since` is the starting watermark: `None` fetches the full history,
    /// `Some(now)` picks up only messages from here on.
    pub async fn initialize(&self, since: Option<DateTime<Utc>>) -> Result<usize> {
        {
            let mut state = self.state.write().await;
            state.messages.clear();
            state.known_ids.clear();
            state.watermark = since;
        }
        self.alive.store(true, Ordering::SeqCst);
        info!("Initialized conversation with peer {}", self.peer_id);
        self.poll().await
    }

    /// Fetch and merge new messages; returns how many candidates were merged.
    ///
    /// If a poll is already in flight the call is skipped, not queued.
    pub async fn poll(&self) -> Result<usize> {
        if self.poll_gate.swap(true, Ordering::SeqCst) {
            debug!("Poll already in flight for peer {}, skipping", self.peer_id);
            return Ok(0);
        }
        let result = self.poll_inner().await;
        self.poll_gate.store(false, Ordering::SeqCst);
        result
    }

    async fn poll_inner(&self) -> Result<usize> {
        let since = self.state.read().await.watermark;

        let fetched = match self.mode {
            FetchMode::Incremental => {
                self.backend
                    .fetch_messages_since(self.peer_id, since)
                    .await
            }
            FetchMode::Snapshot => self.backend.fetch_conversation(self.peer_id).await,
        };

        let candidates = match fetched {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Poll failed for peer {}: {}", self.peer_id, e);
                self.events
                    .emit(ChatEvent::PollFailed {
                        reason: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        if !self.alive.load(Ordering::SeqCst) {
            debug!(
                "Conversation with peer {} torn down, discarding poll result",
                self.peer_id
            );
            return Ok(0);
        }

        let outcome = {
            let mut state = self.state.write().await;
            if self.mode == FetchMode::Snapshot {
                // Confirmed entries are rebuilt wholesale; pending sends survive
                state.messages.retain(|m| m.is_optimistic());
                state.known_ids.clear();
            }
            let state = &mut *state;
            merge_candidates(
                &mut state.messages,
                &mut state.known_ids,
                &mut state.watermark,
                &candidates,
                self.order,
            )
        };

        for message in &outcome.new_messages {
            self.events
                .emit(ChatEvent::NewMessage {
                    peer_id: self.peer_id,
                    message: message.clone(),
                })
                .await;
        }
        for id in &outcome.delivered {
            self.events
                .emit(ChatEvent::MessageDelivered {
                    id: *id,
                    peer_id: self.peer_id,
                })
                .await;
        }

        Ok(outcome.merged())
    }

    /// Append an optimistic entry and dispatch the send.
    ///
    /// Returns the temporary id of the optimistic entry. The entry converges
    /// to the canonical record either through the post-send grace swap or
    /// through poll correlation, whichever lands first. A failed send leaves
    /// the entry visible as failed; retrying is a new `send`.
    pub async fn send(&self, text: &str) -> Result<Uuid> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let temp_id = Uuid::new_v4();
        let optimistic = Message::optimistic(temp_id, self.session.user_id, self.peer_id, trimmed);
        {
            let mut state = self.state.write().await;
            state.messages.push(optimistic.clone());
            sort_messages(&mut state.messages, self.order);
        }
        self.events
            .emit(ChatEvent::NewMessage {
                peer_id: self.peer_id,
                message: optimistic,
            })
            .await;

        match self
            .backend
            .send_message(self.session.user_id, self.peer_id, trimmed)
            .await
        {
            Ok(remote) => {
                if !self.alive.load(Ordering::SeqCst) {
                    debug!(
                        "Conversation with peer {} torn down, discarding send result",
                        self.peer_id
                    );
                    return Ok(temp_id);
                }
                {
                    let mut state = self.state.write().await;
                    if let Some(entry) = state
                        .messages
                        .iter_mut()
                        .find(|m| m.id == MessageId::Temp(temp_id))
                    {
                        entry.mark_sent();
                    }
                }
                self.spawn_grace_swap(temp_id, remote);
            }
            Err(e) => {
                warn!("Send to peer {} failed: {}", self.peer_id, e);
                if self.alive.load(Ordering::SeqCst) {
                    {
                        let mut state = self.state.write().await;
                        if let Some(entry) = state
                            .messages
                            .iter_mut()
                            .find(|m| m.id == MessageId::Temp(temp_id))
                        {
                            entry.mark_failed();
                        }
                    }
                    self.events
                        .emit(ChatEvent::SendFailed {
                            peer_id: self.peer_id,
                            text: trimmed.to_string(),
                        })
                        .await;
                }
            }
        }

        Ok(temp_id)
    }

    /// After the grace period, swap the optimistic entry for the canonical
    /// record unless a poll already merged it.
    fn spawn_grace_swap(&self, temp_id: Uuid, remote: RemoteMessage) {
        let state = self.state.clone();
        let events = self.events.clone();
        let alive = self.alive.clone();
        let grace = self.send_grace;
        let order = self.order;
        let peer_id = self.peer_id;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            let swapped = {
                let mut state = state.write().await;
                let position = state
                    .messages
                    .iter()
                    .position(|m| m.id == MessageId::Temp(temp_id));
                match position {
                    Some(idx) => {
                        state.messages.remove(idx);
                        if !state.known_ids.contains(&remote.id) {
                            state.known_ids.insert(remote.id);
                            state.messages.push(confirmed_message(&remote));
                            sort_messages(&mut state.messages, order);
                        }
                        true
                    }
                    // A poll already replaced the entry via correlation
                    None => false,
                }
            };
            if swapped {
                events
                    .emit(ChatEvent::MessageDelivered {
                        id: remote.id,
                        peer_id,
                    })
                    .await;
            }
        });
    }

    /// Start the periodic poll timer. A second call replaces the running
    /// timer rather than doubling it.
    pub async fn start_polling(&self) {
        self.alive.store(true, Ordering::SeqCst);

        let mut task_slot = self.poll_task.lock().await;
        if let Some(task) = task_slot.take() {
            debug!("Replacing existing poll timer for peer {}", self.peer_id);
            task.abort();
        }

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(engine.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !engine.alive.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = engine.poll().await {
                    debug!("Scheduled poll for peer {} failed: {}", engine.peer_id, e);
                }
            }
        });
        *task_slot = Some(handle);
        info!(
            "Polling conversation with peer {} every {:?}",
            self.peer_id, self.poll_interval
        );
    }

    /// Stop the poll timer and discard any in-flight results. Idempotent;
    /// must be called when the conversation view is torn down.
    pub async fn stop_polling(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut task_slot = self.poll_task.lock().await;
        if let Some(task) = task_slot.take() {
            task.abort();
            info!("Stopped polling conversation with peer {}", self.peer_id);
        }
    }

    /// Snapshot of the message list in presentation order
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// Current incremental-fetch watermark
    pub async fn watermark(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.watermark
    }

    /// Delivery state of an optimistic entry; `None` once it has been
    /// replaced by its canonical record
    pub async fn delivery_of(&self, temp_id: Uuid) -> Option<DeliveryState> {
        self.state
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.id == MessageId::Temp(temp_id))
            .map(|m| m.delivery)
    }
}

impl<B: MessageBackend> Clone for ChatSync<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            session: self.session.clone(),
            peer_id: self.peer_id,
            mode: self.mode,
            order: self.order,
            poll_interval: self.poll_interval,
            send_grace: self.send_grace,
            state: self.state.clone(),
            events: self.events.clone(),
            alive: self.alive.clone(),
            poll_gate: self.poll_gate.clone(),
            poll_task: self.poll_task.clone(),
        }
    }
}

pub(crate) struct MergeOutcome {
    /// Confirmed messages appended without a matching optimistic entry
    pub(crate) new_messages: Vec<Message>,
    /// Server ids that replaced an optimistic entry
    pub(crate) delivered: Vec<i64>,
}

impl MergeOutcome {
    pub(crate) fn merged(&self) -> usize {
        self.new_messages.len() + self.delivered.len()
    }
}

/// Merge a candidate set into a message list.
///
/// Known server ids are skipped (the watermark can be boundary-inclusive on
/// some servers), candidates matching a pending optimistic entry replace it,
/// everything else is appended. The list is re-sorted by timestamp and the
/// watermark advances to the newest candidate, never backward.
pub(crate) fn merge_candidates(
    messages: &mut Vec<Message>,
    known_ids: &mut HashSet<i64>,
    watermark: &mut Option<DateTime<Utc>>,
    candidates: &[RemoteMessage],
    order: SortOrder,
) -> MergeOutcome {
    let mut outcome = MergeOutcome {
        new_messages: Vec::new(),
        delivered: Vec::new(),
    };

    for candidate in candidates {
        if known_ids.contains(&candidate.id) {
            continue;
        }
        let confirmed = confirmed_message(candidate);
        let correlated = messages.iter().position(|m| correlates(m, candidate));
        match correlated {
            Some(idx) => {
                messages.remove(idx);
                outcome.delivered.push(candidate.id);
            }
            None => {
                outcome.new_messages.push(confirmed.clone());
            }
        }
        messages.push(confirmed);
        known_ids.insert(candidate.id);
    }

    sort_messages(messages, order);

    if let Some(newest) = candidates.iter().map(|c| c.timestamp).max() {
        if watermark.map_or(true, |w| newest > w) {
            *watermark = Some(newest);
        }
    }

    outcome
}

/// An optimistic entry correlates with a confirmed candidate when the
/// sender/receiver/text triple matches and the entry is still pending.
/// Failed entries stay visible and are never stolen by a later candidate.
fn correlates(entry: &Message, candidate: &RemoteMessage) -> bool {
    entry.is_optimistic()
        && matches!(entry.delivery, DeliveryState::Sending | DeliveryState::Sent)
        && entry.sender_id == candidate.sender_id
        && entry.receiver_id == candidate.receiver_id
        && entry.text == candidate.text
}

pub(crate) fn confirmed_message(remote: &RemoteMessage) -> Message {
    Message {
        id: MessageId::Server(remote.id),
        sender_id: remote.sender_id,
        receiver_id: remote.receiver_id,
        text: remote.text.clone(),
        timestamp: remote.timestamp,
        read: remote.read,
        delivery: DeliveryState::Sent,
    }
}

/// Stable sort, so equal timestamps keep arrival order
pub(crate) fn sort_messages(messages: &mut [Message], order: SortOrder) {
    match order {
        SortOrder::OldestFirst => messages.sort_by_key(|m| m.timestamp),
        SortOrder::NewestFirst => messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn remote(id: i64, sender: i64, receiver: i64, text: &str, secs: i64) -> RemoteMessage {
        RemoteMessage {
            id,
            sender_id: sender,
            receiver_id: receiver,
            text: text.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            read: false,
        }
    }

    #[test]
    fn test_merge_skips_known_ids() {
        let mut messages = Vec::new();
        let mut known = HashSet::new();
        let mut watermark = None;
        let candidates = vec![remote(5, 1, 2, "hi", 100)];

        let first = merge_candidates(&mut messages, &mut known, &mut watermark, &candidates, SortOrder::OldestFirst);
        assert_eq!(first.merged(), 1);

        // Merging the same result again is a no-op
        let second = merge_candidates(&mut messages, &mut known, &mut watermark, &candidates, SortOrder::OldestFirst);
        assert_eq!(second.merged(), 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::Server(5));
    }

    #[test]
    fn test_merge_replaces_correlated_optimistic_entry() {
        let temp = Uuid::new_v4();
        let mut messages = vec![Message::optimistic(temp, 1, 2, "hey")];
        let mut known = HashSet::new();
        let mut watermark = None;

        let candidates = vec![remote(9, 1, 2, "hey", 50)];
        let outcome = merge_candidates(&mut messages, &mut known, &mut watermark, &candidates, SortOrder::OldestFirst);

        assert_eq!(outcome.delivered, vec![9]);
        assert!(outcome.new_messages.is_empty());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::Server(9));
        assert_eq!(messages[0].delivery, DeliveryState::Sent);
    }

    #[test]
    fn test_merge_never_steals_failed_entries() {
        let temp = Uuid::new_v4();
        let mut failed = Message::optimistic(temp, 1, 2, "hey");
        failed.mark_failed();
        let mut messages = vec![failed];
        let mut known = HashSet::new();
        let mut watermark = None;

        // Same sender/receiver/text, but the local entry already failed: the
        // candidate is someone else's delivery, appended alongside
        let candidates = vec![remote(9, 1, 2, "hey", 50)];
        let outcome = merge_candidates(&mut messages, &mut known, &mut watermark, &candidates, SortOrder::OldestFirst);

        assert_eq!(outcome.new_messages.len(), 1);
        assert!(outcome.delivered.is_empty());
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.delivery == DeliveryState::Failed));
    }

    #[test]
    fn test_merge_sorts_out_of_order_candidates() {
        let mut messages = Vec::new();
        let mut known = HashSet::new();
        let mut watermark = None;

        // Arrive as [T2, T1]
        let candidates = vec![remote(2, 1, 2, "second", 200), remote(1, 2, 1, "first", 100)];
        merge_candidates(&mut messages, &mut known, &mut watermark, &candidates, SortOrder::OldestFirst);
        assert_eq!(messages[0].text, "first");
        assert_eq!(messages[1].text, "second");

        let mut inverted = messages.clone();
        sort_messages(&mut inverted, SortOrder::NewestFirst);
        assert_eq!(inverted[0].text, "second");
        assert_eq!(inverted[1].text, "first");
    }

    #[test]
    fn test_watermark_is_monotone() {
        let mut messages = Vec::new();
        let mut known = HashSet::new();
        let mut watermark = None;

        merge_candidates(&mut messages, &mut known, &mut watermark, &[remote(1, 1, 2, "a", 500)], SortOrder::OldestFirst);
        assert_eq!(watermark, Some(Utc.timestamp_opt(500, 0).unwrap()));

        // Older stragglers never move the watermark backward
        merge_candidates(&mut messages, &mut known, &mut watermark, &[remote(2, 1, 2, "b", 300)], SortOrder::OldestFirst);
        assert_eq!(watermark, Some(Utc.timestamp_opt(500, 0).unwrap()));

        // An empty fetch leaves it untouched
        merge_candidates(&mut messages, &mut known, &mut watermark, &[], SortOrder::OldestFirst);
        assert_eq!(watermark, Some(Utc.timestamp_opt(500, 0).unwrap()));
    }

    #[test]
    fn test_merge_correlates_at_most_one_entry() {
        // Two identical pending sends: one candidate confirms only one of them
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let mut messages = vec![
            Message::optimistic(t1, 1, 2, "hi"),
            Message::optimistic(t2, 1, 2, "hi"),
        ];
        let mut known = HashSet::new();
        let mut watermark = None;

        let candidates = vec![remote(7, 1, 2, "hi", 60)];
        merge_candidates(&mut messages, &mut known, &mut watermark, &candidates, SortOrder::OldestFirst);

        assert_eq!(messages.len(), 2);
        let optimistic_left = messages.iter().filter(|m| m.is_optimistic()).count();
        assert_eq!(optimistic_left, 1);
    }
}
