/// Trainer-side inbox: every client thread behind one incremental cursor
///
/// The trainer endpoint returns messages for all of the trainer's clients in
/// one stream; the inbox routes each record to the thread of the other
/// participant and applies the same merge rules as the single-conversation
/// engine, with one global watermark and known-id set.
use crate::backend::{MessageBackend, RemoteMessage};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::events::EventEmitter;
use crate::session::Session;
use crate::sync::{merge_candidates, sort_messages};
use crate::types::{ChatEvent, DeliveryState, Message, MessageId, SortOrder, ThreadSummary};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PREVIEW_CHARS: usize = 80;

struct InboxState {
    threads: BTreeMap<i64, Vec<Message>>,
    known_ids: HashSet<i64>,
    watermark: Option<DateTime<Utc>>,
}

impl InboxState {
    fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            known_ids: HashSet::new(),
            watermark: None,
        }
    }
}

pub struct TrainerInbox<B: MessageBackend> {
    backend: Arc<B>,
    session: Session,
    poll_interval: Duration,
    send_grace: Duration,

    state: Arc<RwLock<InboxState>>,
    events: EventEmitter,
    alive: Arc<AtomicBool>,
    poll_gate: Arc<AtomicBool>,
    poll_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<B: MessageBackend + 'static> TrainerInbox<B> {
    pub fn new(backend: Arc<B>, session: Session, config: &Config, events: EventEmitter) -> Self {
        Self {
            backend,
            session,
            poll_interval: config.poll_interval,
            send_grace: config.send_grace,
            state: Arc::new(RwLock::new(InboxState::new())),
            events,
            alive: Arc::new(AtomicBool::new(true)),
            poll_gate: Arc::new(AtomicBool::new(false)),
            poll_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Reset the cursor and perform one immediate poll.
    ///
    /// `None` fetches the full history; `Some(now)` starts from here on.
    pub async fn initialize(&self, since: Option<DateTime<Utc>>) -> Result<usize> {
        {
            let mut state = self.state.write().await;
            state.threads.clear();
            state.known_ids.clear();
            state.watermark = since;
        }
        self.alive.store(true, Ordering::SeqCst);
        info!("Initialized inbox for trainer {}", self.session.user_id);
        self.poll().await
    }

    /// Fetch and merge new messages across all threads.
    ///
    /// If a poll is already in flight the call is skipped, not queued.
    pub async fn poll(&self) -> Result<usize> {
        if self.poll_gate.swap(true, Ordering::SeqCst) {
            debug!("Inbox poll already in flight, skipping");
            return Ok(0);
        }
        let result = self.poll_inner().await;
        self.poll_gate.store(false, Ordering::SeqCst);
        result
    }

    async fn poll_inner(&self) -> Result<usize> {
        let since = self.state.read().await.watermark;

        let candidates = match self
            .backend
            .fetch_messages_since(self.session.user_id, since)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Inbox poll failed: {}", e);
                self.events
                    .emit(ChatEvent::PollFailed {
                        reason: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        if !self.alive.load(Ordering::SeqCst) {
            debug!("Inbox torn down, discarding poll result");
            return Ok(0);
        }

        // Route each record to the thread of the other participant
        let me = self.session.user_id;
        let mut grouped: BTreeMap<i64, Vec<RemoteMessage>> = BTreeMap::new();
        for candidate in candidates {
            let peer = if candidate.sender_id == me {
                candidate.receiver_id
            } else {
                candidate.sender_id
            };
            grouped.entry(peer).or_default().push(candidate);
        }

        let mut events = Vec::new();
        let mut merged = 0;
        {
            let mut state = self.state.write().await;
            let InboxState {
                threads,
                known_ids,
                watermark,
            } = &mut *state;
            for (peer_id, group) in grouped {
                let thread = threads.entry(peer_id).or_default();
                let outcome =
                    merge_candidates(thread, known_ids, watermark, &group, SortOrder::OldestFirst);
                merged += outcome.merged();
                for message in outcome.new_messages {
                    events.push(ChatEvent::NewMessage { peer_id, message });
                }
                for id in outcome.delivered {
                    events.push(ChatEvent::MessageDelivered { id, peer_id });
                }
            }
        }
        for event in events {
            self.events.emit(event).await;
        }

        Ok(merged)
    }

    /// Append an optimistic entry to the client's thread and dispatch the
    /// send. Same convergence rules as the single-conversation engine.
    pub async fn send(&self, receiver_id: i64, text: &str) -> Result<Uuid> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let temp_id = Uuid::new_v4();
        let optimistic = Message::optimistic(temp_id, self.session.user_id, receiver_id, trimmed);
        {
            let mut state = self.state.write().await;
            let thread = state.threads.entry(receiver_id).or_default();
            thread.push(optimistic.clone());
            sort_messages(thread, SortOrder::OldestFirst);
        }
        self.events
            .emit(ChatEvent::NewMessage {
                peer_id: receiver_id,
                message: optimistic,
            })
            .await;

        match self
            .backend
            .send_message(self.session.user_id, receiver_id, trimmed)
            .await
        {
            Ok(remote) => {
                if !self.alive.load(Ordering::SeqCst) {
                    debug!("Inbox torn down, discarding send result");
                    return Ok(temp_id);
                }
                {
                    let mut state = self.state.write().await;
                    if let Some(entry) = state
                        .threads
                        .get_mut(&receiver_id)
                        .and_then(|t| t.iter_mut().find(|m| m.id == MessageId::Temp(temp_id)))
                    {
                        entry.mark_sent();
                    }
                }
                self.spawn_grace_swap(receiver_id, temp_id, remote);
            }
            Err(e) => {
                warn!("Send to client {} failed: {}", receiver_id, e);
                if self.alive.load(Ordering::SeqCst) {
                    {
                        let mut state = self.state.write().await;
                        if let Some(entry) = state
                            .threads
                            .get_mut(&receiver_id)
                            .and_then(|t| t.iter_mut().find(|m| m.id == MessageId::Temp(temp_id)))
                        {
                            entry.mark_failed();
                        }
                    }
                    self.events
                        .emit(ChatEvent::SendFailed {
                            peer_id: receiver_id,
                            text: trimmed.to_string(),
                        })
                        .await;
                }
            }
        }

        Ok(temp_id)
    }

    fn spawn_grace_swap(&self, peer_id: i64, temp_id: Uuid, remote: RemoteMessage) {
        let state = self.state.clone();
        let events = self.events.clone();
        let alive = self.alive.clone();
        let grace = self.send_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            let swapped = {
                let mut state = state.write().await;
                let InboxState {
                    threads, known_ids, ..
                } = &mut *state;
                match threads.get_mut(&peer_id) {
                    Some(thread) => {
                        let position =
                            thread.iter().position(|m| m.id == MessageId::Temp(temp_id));
                        match position {
                            Some(idx) => {
                                thread.remove(idx);
                                if !known_ids.contains(&remote.id) {
                                    known_ids.insert(remote.id);
                                    thread.push(crate::sync::confirmed_message(&remote));
                                    sort_messages(thread, SortOrder::OldestFirst);
                                }
                                true
                            }
                            None => false,
                        }
                    }
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
            debug!("Replacing existing inbox poll timer");
            task.abort();
        }

        let inbox = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(inbox.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !inbox.alive.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = inbox.poll().await {
                    debug!("Scheduled inbox poll failed: {}", e);
                }
            }
        });
        *task_slot = Some(handle);
        info!(
            "Polling inbox for trainer {} every {:?}",
            self.session.user_id, self.poll_interval
        );
    }

    /// Stop the poll timer and discard any in-flight results. Idempotent.
    pub async fn stop_polling(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut task_slot = self.poll_task.lock().await;
        if let Some(task) = task_slot.take() {
            task.abort();
            info!("Stopped inbox polling for trainer {}", self.session.user_id);
        }
    }

    /// Thread summaries for the console list view, newest activity first
    pub async fn summaries(&self) -> Vec<ThreadSummary> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for (peer_id, messages) in &state.threads {
            if let Some(last) = messages.last() {
                let unread = messages
                    .iter()
                    .filter(|m| m.sender_id == *peer_id && !m.read)
                    .count();
                out.push(ThreadSummary {
                    peer_id: *peer_id,
                    last_preview: preview(&last.text),
                    last_timestamp: last.timestamp,
                    unread,
                });
            }
        }
        out.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
        out
    }

    /// Chronological messages of one thread, optionally limited to the tail
    pub async fn history(&self, peer_id: i64, limit: Option<usize>) -> Vec<Message> {
        let state = self.state.read().await;
        let thread = match state.threads.get(&peer_id) {
            Some(thread) => thread,
            None => return Vec::new(),
        };
        match limit {
            Some(limit) if thread.len() > limit => thread[thread.len() - limit..].to_vec(),
            _ => thread.clone(),
        }
    }

    /// Delivery state of an optimistic entry; `None` once replaced
    pub async fn delivery_of(&self, temp_id: Uuid) -> Option<DeliveryState> {
        let state = self.state.read().await;
        state
            .threads
            .values()
            .flatten()
            .find(|m| m.id == MessageId::Temp(temp_id))
            .map(|m| m.delivery)
    }

    pub async fn watermark(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.watermark
    }

    pub async fn thread_count(&self) -> usize {
        self.state.read().await.threads.len()
    }

    pub async fn total_messages(&self) -> usize {
        let state = self.state.read().await;
        state.threads.values().map(|t| t.len()).sum()
    }

    pub fn trainer_id(&self) -> i64 {
        self.session.user_id
    }
}

impl<B: MessageBackend> Clone for TrainerInbox<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            session: self.session.clone(),
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

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        text.chars().take(PREVIEW_CHARS).collect()
    } else {
        text.to_string()
    }
}
