//! Raft core: leader election, log replication, commit advancement, and the
//! apply loop that feeds committed entries to the chat state machine.
//!
//! One node-level mutex guards all mutable Raft and state-machine state.
//! Persistent state (term, vote, log) is written to the store before any RPC
//! response that depends on it leaves the node.

use crate::state::{ChatState, CommandReply};
use crate::store::{Store, META_COMMIT_INDEX, META_CURRENT_TERM, META_LAST_APPLIED, META_VOTED_FOR};
use crate::{read_frame, write_frame, Command, LogEntry, RaftMessage, ServerRole};
use anyhow::{anyhow, bail, Result};
use log::{debug, error, info};
use rand::{Rng, RngCore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::sleep;

/// Cap on entries shipped in one AppendEntries, so a freshly restarted
/// follower catches up over several RPCs instead of one huge frame.
const MAX_ENTRIES_PER_RPC: usize = 32;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: String,
    /// `(peer node id, raft address)` for every other node.
    pub peers: Vec<(String, String)>,
    pub election_timeout_min: u64, // milliseconds
    pub election_timeout_max: u64, // milliseconds
    pub heartbeat_interval: u64,   // milliseconds
    /// How long a client proposal waits for commit + apply.
    pub propose_timeout: u64, // milliseconds
}

impl RaftConfig {
    /// Defaults: 150-300ms election window, 50ms heartbeat.
    pub fn new(node_id: String, peers: Vec<(String, String)>) -> Self {
        Self {
            node_id,
            peers,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            propose_timeout: 5000,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min > self.election_timeout_max {
            bail!("election timeout range is inverted");
        }
        if self.heartbeat_interval * 2 >= self.election_timeout_min {
            bail!(
                "heartbeat interval {}ms must stay under half the minimum election timeout {}ms",
                self.heartbeat_interval,
                self.election_timeout_min
            );
        }
        Ok(())
    }
}

/// Why a proposal did not produce a state-machine reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposeError {
    /// This node is not the leader; `leader_id` is the last-known one.
    NotLeader { leader_id: Option<String> },
    /// The entry may or may not commit later; the client should retry.
    Unavailable,
    /// Commit did not happen within the proposal timeout.
    Timeout,
}

struct Waiter {
    term: u64,
    tx: oneshot::Sender<Result<CommandReply, ProposeError>>,
}

/// All mutable node state, guarded by the node mutex.
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub role: ServerRole,
    pub leader_id: Option<String>,
    pub last_heartbeat: Instant,

    pub log: Vec<LogEntry>,
    pub commit_index: i64,
    pub last_applied: i64,

    // Leader-only volatile state.
    pub next_index: HashMap<String, i64>,
    pub match_index: HashMap<String, i64>,

    // Leader-side id assignment, recomputed on every election win.
    pub next_user_id: u32,
    pub next_message_id: u32,

    pub chat: ChatState,
    pub store: Store,

    waiters: HashMap<i64, Waiter>,
}

impl RaftState {
    pub fn last_log_index(&self) -> i64 {
        self.log.len() as i64 - 1
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn term_at(&self, index: i64) -> u64 {
        if index < 0 {
            return 0;
        }
        self.log.get(index as usize).map(|e| e.term).unwrap_or(0)
    }
}

/// A mutation as the router hands it over, before the leader fills in
/// assigned ids, the session token, and the timestamp.
#[derive(Debug, Clone)]
pub enum CommandDraft {
    CreateAccount {
        username: String,
        password_hash: [u8; 32],
    },
    DeleteAccount {
        user_id: u32,
    },
    SendMessage {
        sender_id: u32,
        recipient_id: u32,
        content: String,
    },
    MarkRead {
        user_id: u32,
        message_id: u32,
    },
    ReadN {
        user_id: u32,
        n: u32,
    },
    DeleteMessage {
        message_id: u32,
    },
}

pub struct RaftNode {
    pub config: RaftConfig,
    pub state: Arc<Mutex<RaftState>>,
    apply_notify: Arc<Notify>,
}

impl RaftNode {
    /// Build a node, recovering term, vote, log, and the materialized state
    /// machine from the durable store.
    pub fn new(config: RaftConfig, store: Store) -> Result<RaftNode> {
        config.validate()?;

        let current_term = store.get_meta_i64(META_CURRENT_TERM)?.unwrap_or(0) as u64;
        let voted_for = store.get_meta(META_VOTED_FOR)?.filter(|v| !v.is_empty());
        let log = store.scan_log()?;
        let last = log.len() as i64 - 1;
        let commit_index = store
            .get_meta_i64(META_COMMIT_INDEX)?
            .unwrap_or(-1)
            .min(last);
        let last_applied = store
            .get_meta_i64(META_LAST_APPLIED)?
            .unwrap_or(-1)
            .min(commit_index);
        let chat = ChatState::rebuild(store.scan_users()?, store.scan_messages()?);

        info!(
            "[{}] recovered: term={}, voted_for={:?}, {} log entries, commit={}, applied={}, {} users, {} messages",
            config.node_id,
            current_term,
            voted_for,
            log.len(),
            commit_index,
            last_applied,
            chat.user_count(),
            chat.message_count()
        );

        let mut state = RaftState {
            current_term,
            voted_for,
            role: ServerRole::Follower,
            leader_id: None,
            last_heartbeat: Instant::now(),
            log,
            commit_index,
            last_applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            next_user_id: 1,
            next_message_id: 1,
            chat,
            store,
            waiters: HashMap::new(),
        };
        recompute_next_ids(&mut state);

        Ok(RaftNode {
            config,
            state: Arc::new(Mutex::new(state)),
            apply_notify: Arc::new(Notify::new()),
        })
    }

    /// Spawn the election timer, heartbeat sender, and apply loop.
    pub async fn start(self: Arc<Self>) {
        let election = Arc::clone(&self);
        tokio::spawn(async move {
            election.run_election_timer().await;
        });

        let heartbeat = Arc::clone(&self);
        tokio::spawn(async move {
            heartbeat.run_heartbeat_sender().await;
        });

        let apply = Arc::clone(&self);
        tokio::spawn(async move {
            apply.run_apply_loop().await;
        });

        // Recovery may have left committed-but-unapplied entries behind.
        self.apply_notify.notify_one();
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == ServerRole::Leader
    }

    pub async fn leader_id(&self) -> Option<String> {
        self.state.lock().await.leader_id.clone()
    }

    // --- Election ---

    async fn run_election_timer(&self) {
        loop {
            let timeout = self.random_election_timeout();
            sleep(timeout).await;

            let should_start = {
                let state = self.state.lock().await;
                state.role != ServerRole::Leader && state.last_heartbeat.elapsed() >= timeout
            };

            if should_start {
                info!(
                    "[{}] election timeout, starting election",
                    self.config.node_id
                );
                self.start_election().await;
            }
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Duration::from_millis(ms)
    }

    /// Become a candidate for the next term and solicit votes.
    pub async fn start_election(&self) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().await;
            state.role = ServerRole::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.config.node_id.clone());
            state.leader_id = None;
            state.last_heartbeat = Instant::now();

            let term = state.current_term;
            if let Err(e) = state
                .store
                .put_term_and_vote(term, Some(self.config.node_id.as_str()))
            {
                fatal_store(&self.config.node_id, e);
            }
            info!(
                "[{}] starting election for term {}",
                self.config.node_id, term
            );
            (term, state.last_log_index(), state.last_log_term())
        };

        let request = RaftMessage::RequestVote {
            term,
            candidate_id: self.config.node_id.clone(),
            last_log_index,
            last_log_term,
        };

        let mut tasks = Vec::new();
        for (peer_id, addr) in self.config.peers.clone() {
            let request = request.clone();
            let rpc_timeout = self.config.heartbeat_interval;
            tasks.push(tokio::spawn(async move {
                (peer_id, exchange(&addr, &request, rpc_timeout).await)
            }));
        }

        let majority = (self.config.peers.len() + 1) / 2 + 1;
        let mut granted = 1; // our own vote

        // A single-node cluster is its own majority.
        if granted >= majority {
            self.become_leader(term).await;
            return;
        }

        for task in tasks {
            let (peer_id, result) = match task.await {
                Ok(r) => r,
                Err(_) => continue,
            };
            match result {
                Ok(RaftMessage::RequestVoteResponse {
                    term: resp_term,
                    vote_granted,
                    voter_id,
                }) => {
                    if resp_term > term {
                        let mut state = self.state.lock().await;
                        if let Err(e) = step_down(&mut state, resp_term, &self.config.node_id) {
                            fatal_store(&self.config.node_id, e);
                        }
                        return;
                    }
                    if vote_granted {
                        granted += 1;
                        debug!(
                            "[{}] vote from {} ({}/{})",
                            self.config.node_id, voter_id, granted, majority
                        );
                        if granted >= majority {
                            self.become_leader(term).await;
                            return;
                        }
                    }
                }
                Ok(_) => debug!(
                    "[{}] unexpected vote reply from {}",
                    self.config.node_id, peer_id
                ),
                Err(e) => debug!("[{}] no vote from {}: {}", self.config.node_id, peer_id, e),
            }
        }

        debug!(
            "[{}] election for term {} fell short ({}/{})",
            self.config.node_id, term, granted, majority
        );
        // Stay a candidate; the timer loop re-randomizes and retries.
    }

    /// Take leadership for `term`, unless something already changed it.
    pub async fn become_leader(&self, term: u64) {
        {
            let mut state = self.state.lock().await;
            if state.current_term != term || state.role != ServerRole::Candidate {
                return;
            }
            state.role = ServerRole::Leader;
            state.leader_id = Some(self.config.node_id.clone());
            let next = state.log.len() as i64;
            state.next_index.clear();
            state.match_index.clear();
            for (peer_id, _) in &self.config.peers {
                state.next_index.insert(peer_id.clone(), next);
                state.match_index.insert(peer_id.clone(), -1);
            }
            recompute_next_ids(&mut state);
            info!("[{}] became leader for term {}", self.config.node_id, term);

            // A single-node cluster commits by itself.
            match self.advance_commit(&mut state) {
                Ok(true) => self.apply_notify.notify_one(),
                Ok(false) => {}
                Err(e) => fatal_store(&self.config.node_id, e),
            }
        }

        self.send_append_entries().await;
    }

    // --- Replication ---

    async fn run_heartbeat_sender(&self) {
        loop {
            sleep(Duration::from_millis(self.config.heartbeat_interval)).await;
            let is_leader = self.state.lock().await.role == ServerRole::Leader;
            if is_leader {
                self.send_append_entries().await;
            }
        }
    }

    /// Ship each peer its pending log suffix (or an empty heartbeat).
    async fn send_append_entries(&self) {
        let (term, requests) = {
            let state = self.state.lock().await;
            if state.role != ServerRole::Leader {
                return;
            }
            let term = state.current_term;
            let mut requests = Vec::new();
            for (peer_id, addr) in &self.config.peers {
                let next = *state
                    .next_index
                    .get(peer_id)
                    .unwrap_or(&(state.log.len() as i64));
                let prev_log_index = next - 1;
                let prev_log_term = state.term_at(prev_log_index);
                let mut entries: Vec<LogEntry> = if (next as usize) < state.log.len() {
                    state.log[next as usize..].to_vec()
                } else {
                    Vec::new()
                };
                entries.truncate(MAX_ENTRIES_PER_RPC);
                let sent = entries.len() as i64;
                let message = RaftMessage::AppendEntries {
                    term,
                    leader_id: self.config.node_id.clone(),
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: state.commit_index,
                };
                requests.push((peer_id.clone(), addr.clone(), message, prev_log_index, sent));
            }
            (term, requests)
        };

        let mut tasks = Vec::new();
        for (peer_id, addr, message, prev_log_index, sent) in requests {
            let rpc_timeout = self.config.heartbeat_interval;
            tasks.push(tokio::spawn(async move {
                let result = exchange(&addr, &message, rpc_timeout).await;
                (peer_id, result, prev_log_index, sent)
            }));
        }

        for task in tasks {
            let (peer_id, result, prev_log_index, sent) = match task.await {
                Ok(r) => r,
                Err(_) => continue,
            };
            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    debug!(
                        "[{}] append to {} failed: {}",
                        self.config.node_id, peer_id, e
                    );
                    continue;
                }
            };
            if let RaftMessage::AppendEntriesResponse {
                term: resp_term,
                follower_id: _,
                success,
                last_log_index,
            } = response
            {
                let mut state = self.state.lock().await;
                if resp_term > state.current_term {
                    if let Err(e) = step_down(&mut state, resp_term, &self.config.node_id) {
                        fatal_store(&self.config.node_id, e);
                    }
                    return;
                }
                if state.role != ServerRole::Leader || state.current_term != term {
                    return;
                }

                if success {
                    let matched = prev_log_index + sent;
                    let current = state.match_index.get(&peer_id).copied().unwrap_or(-1);
                    if matched > current {
                        state.match_index.insert(peer_id.clone(), matched);
                        state.next_index.insert(peer_id.clone(), matched + 1);
                    }
                    match self.advance_commit(&mut state) {
                        Ok(true) => self.apply_notify.notify_one(),
                        Ok(false) => {}
                        Err(e) => fatal_store(&self.config.node_id, e),
                    }
                } else {
                    // Walk next_index back; the follower's own last index is a
                    // safe upper bound for the retry.
                    let current = state
                        .next_index
                        .get(&peer_id)
                        .copied()
                        .unwrap_or(state.log.len() as i64);
                    let backed = (current - 1).min(last_log_index + 1).max(0);
                    debug!(
                        "[{}] follower {} rejected append, next_index {} -> {}",
                        self.config.node_id, peer_id, current, backed
                    );
                    state.next_index.insert(peer_id.clone(), backed);
                }
            }
        }
    }

    /// Leader commit rule: the highest index replicated on a majority whose
    /// entry is from the current term.
    fn advance_commit(&self, state: &mut RaftState) -> Result<bool> {
        let majority = (self.config.peers.len() + 1) / 2 + 1;
        let last = state.last_log_index();
        let mut advanced = false;
        for n in (state.commit_index + 1)..=last {
            if state.log[n as usize].term != state.current_term {
                continue;
            }
            let mut count = 1; // the leader holds every entry
            for matched in state.match_index.values() {
                if *matched >= n {
                    count += 1;
                }
            }
            if count >= majority {
                state.commit_index = n;
                advanced = true;
            }
        }
        if advanced {
            let commit = state.commit_index;
            state
                .store
                .put_meta(META_COMMIT_INDEX, &commit.to_string())?;
            debug!("[{}] commit index -> {}", self.config.node_id, commit);
        }
        Ok(advanced)
    }

    // --- Proposals ---

    /// Leader entry point for client mutations: assign ids, append, replicate,
    /// and wait for the applied reply.
    pub async fn propose(&self, draft: CommandDraft) -> Result<CommandReply, ProposeError> {
        let (rx, index) = {
            let mut state = self.state.lock().await;
            if state.role != ServerRole::Leader {
                return Err(ProposeError::NotLeader {
                    leader_id: state.leader_id.clone(),
                });
            }

            let command = fill_draft(&mut state, draft);
            let term = state.current_term;
            let index = state.log.len() as i64;
            if let Err(e) = state.store.append_log(index, term, &command) {
                fatal_store(&self.config.node_id, e);
            }
            state.log.push(LogEntry { term, command });

            let (tx, rx) = oneshot::channel();
            state.waiters.insert(index, Waiter { term, tx });

            match self.advance_commit(&mut state) {
                Ok(true) => self.apply_notify.notify_one(),
                Ok(false) => {}
                Err(e) => fatal_store(&self.config.node_id, e),
            }
            (rx, index)
        };

        self.send_append_entries().await;

        match tokio::time::timeout(Duration::from_millis(self.config.propose_timeout), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProposeError::Unavailable),
            Err(_) => {
                // Raft has no abort; the entry may still commit later.
                let mut state = self.state.lock().await;
                state.waiters.remove(&index);
                Err(ProposeError::Timeout)
            }
        }
    }

    // --- Apply loop ---

    async fn run_apply_loop(&self) {
        loop {
            tokio::select! {
                _ = self.apply_notify.notified() => {}
                _ = sleep(Duration::from_millis(self.config.heartbeat_interval)) => {}
            }
            if let Err(e) = self.apply_ready().await {
                fatal_store(&self.config.node_id, e);
            }
        }
    }

    /// Advance `last_applied` toward `commit_index`, applying in log order and
    /// waking any proposal waiter parked on each index.
    async fn apply_ready(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        while state.last_applied < state.commit_index {
            let index = state.last_applied + 1;
            let entry = state.log[index as usize].clone();
            let (reply, effects) = state.chat.apply(&entry.command);
            state.store.apply_entry(index, &effects)?;
            state.last_applied = index;
            debug!(
                "[{}] applied index {} (term {})",
                self.config.node_id, index, entry.term
            );

            if let Some(waiter) = state.waiters.remove(&index) {
                let result = if waiter.term == entry.term {
                    Ok(reply)
                } else {
                    // A different leader's entry landed here; the original
                    // proposal was lost to a log rewrite.
                    Err(ProposeError::Unavailable)
                };
                let _ = waiter.tx.send(result);
            }
        }
        Ok(())
    }

    // --- Inbound RPCs ---

    /// Handle one inbound Raft RPC. Persistent state is durable before the
    /// response is returned.
    pub async fn handle_raft_message(&self, message: RaftMessage) -> Result<Option<RaftMessage>> {
        let mut state = self.state.lock().await;

        // Any request carrying a higher term demotes us first.
        match &message {
            RaftMessage::RequestVote { term, .. } | RaftMessage::AppendEntries { term, .. } => {
                if *term > state.current_term {
                    info!(
                        "[{}] observed higher term {} (was {}), stepping down",
                        self.config.node_id, term, state.current_term
                    );
                    step_down(&mut state, *term, &self.config.node_id)?;
                }
            }
            _ => {}
        }

        match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let mut vote_granted = false;
                if term >= state.current_term
                    && (state.voted_for.is_none()
                        || state.voted_for.as_deref() == Some(candidate_id.as_str()))
                {
                    let up_to_date = last_log_term > state.last_log_term()
                        || (last_log_term == state.last_log_term()
                            && last_log_index >= state.last_log_index());
                    if up_to_date {
                        state.voted_for = Some(candidate_id.clone());
                        state.last_heartbeat = Instant::now();
                        let current = state.current_term;
                        state
                            .store
                            .put_term_and_vote(current, Some(candidate_id.as_str()))?;
                        vote_granted = true;
                        info!(
                            "[{}] granted vote to {} for term {}",
                            self.config.node_id, candidate_id, term
                        );
                    } else {
                        debug!(
                            "[{}] denied vote to {}: log not up to date",
                            self.config.node_id, candidate_id
                        );
                    }
                }
                Ok(Some(RaftMessage::RequestVoteResponse {
                    term: state.current_term,
                    vote_granted,
                    voter_id: self.config.node_id.clone(),
                }))
            }

            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let mut success = false;
                if term >= state.current_term {
                    // Valid leader for this term: follow it and reset the timer.
                    state.role = ServerRole::Follower;
                    state.leader_id = Some(leader_id.clone());
                    state.last_heartbeat = Instant::now();

                    let consistent = prev_log_index < 0
                        || (prev_log_index <= state.last_log_index()
                            && state.term_at(prev_log_index) == prev_log_term);

                    if consistent {
                        success = true;

                        // Truncate on conflict, append what is new.
                        let mut insert = prev_log_index + 1;
                        let mut first_new: Option<i64> = None;
                        for entry in &entries {
                            if insert <= state.last_log_index() {
                                if state.log[insert as usize].term != entry.term {
                                    debug!(
                                        "[{}] log conflict at {}, truncating",
                                        self.config.node_id, insert
                                    );
                                    state.log.truncate(insert as usize);
                                    state.store.truncate_log(insert)?;
                                    state.log.push(entry.clone());
                                    first_new.get_or_insert(insert);
                                }
                            } else {
                                state.log.push(entry.clone());
                                first_new.get_or_insert(insert);
                            }
                            insert += 1;
                        }
                        if let Some(first) = first_new {
                            let suffix = state.log[first as usize..].to_vec();
                            state.store.append_log_batch(first, &suffix)?;
                            debug!(
                                "[{}] appended {} entries from index {}",
                                self.config.node_id,
                                suffix.len(),
                                first
                            );
                        }

                        if leader_commit > state.commit_index {
                            let new_commit = leader_commit.min(state.last_log_index());
                            if new_commit > state.commit_index {
                                state.commit_index = new_commit;
                                state
                                    .store
                                    .put_meta(META_COMMIT_INDEX, &new_commit.to_string())?;
                                self.apply_notify.notify_one();
                            }
                        }
                    } else {
                        debug!(
                            "[{}] append rejected: no entry with term {} at {} (log len {})",
                            self.config.node_id,
                            prev_log_term,
                            prev_log_index,
                            state.log.len()
                        );
                    }
                }
                Ok(Some(RaftMessage::AppendEntriesResponse {
                    term: state.current_term,
                    follower_id: self.config.node_id.clone(),
                    success,
                    last_log_index: state.last_log_index(),
                }))
            }

            // Responses are consumed by the sender tasks.
            RaftMessage::RequestVoteResponse { .. } | RaftMessage::AppendEntriesResponse { .. } => {
                Ok(None)
            }
        }
    }
}

/// Demote to follower, adopting `term` if it is newer, and fail every parked
/// proposal so its client retries elsewhere.
fn step_down(state: &mut RaftState, term: u64, node_id: &str) -> Result<()> {
    if term > state.current_term {
        state.current_term = term;
        state.voted_for = None;
        state.store.put_term_and_vote(term, None)?;
    }
    if state.role != ServerRole::Follower {
        info!(
            "[{}] stepping down to follower in term {}",
            node_id, state.current_term
        );
    }
    state.role = ServerRole::Follower;
    state.leader_id = None;
    for (_, waiter) in state.waiters.drain() {
        let _ = waiter.tx.send(Err(ProposeError::Unavailable));
    }
    Ok(())
}

/// Fill a draft into a full command: ids from the leader's counters, a fresh
/// token for account creation, the wall clock for message timestamps.
fn fill_draft(state: &mut RaftState, draft: CommandDraft) -> Command {
    match draft {
        CommandDraft::CreateAccount {
            username,
            password_hash,
        } => {
            let user_id = state.next_user_id;
            state.next_user_id += 1;
            let mut token = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut token);
            Command::CreateAccount {
                username,
                password_hash,
                user_id,
                token,
            }
        }
        CommandDraft::DeleteAccount { user_id } => Command::DeleteAccount { user_id },
        CommandDraft::SendMessage {
            sender_id,
            recipient_id,
            content,
        } => {
            let message_id = state.next_message_id;
            state.next_message_id += 1;
            Command::SendMessage {
                sender_id,
                recipient_id,
                content,
                message_id,
                timestamp: now_millis(),
            }
        }
        CommandDraft::MarkRead {
            user_id,
            message_id,
        } => Command::MarkRead {
            user_id,
            message_id,
        },
        CommandDraft::ReadN { user_id, n } => Command::ReadN { user_id, n },
        CommandDraft::DeleteMessage { message_id } => Command::DeleteMessage { message_id },
    }
}

/// Next assignable ids: one past the highest id in applied state or anywhere
/// in the log (entries may be appended but not yet applied).
fn recompute_next_ids(state: &mut RaftState) {
    let (mut max_user, mut max_message) = state.chat.max_ids();
    for entry in &state.log {
        match &entry.command {
            Command::CreateAccount { user_id, .. } => max_user = max_user.max(*user_id),
            Command::SendMessage { message_id, .. } => max_message = max_message.max(*message_id),
            _ => {}
        }
    }
    state.next_user_id = max_user + 1;
    state.next_message_id = max_message + 1;
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One framed request/response exchange with a peer, bounded by the RPC
/// timeout so a dead peer never stalls the tick loops.
async fn exchange(addr: &str, message: &RaftMessage, timeout_ms: u64) -> Result<RaftMessage> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, message).await?;
        read_frame::<RaftMessage>(&mut stream).await
    })
    .await
    .map_err(|_| anyhow!("rpc to {} timed out", addr))?
}

/// A failed durable write means we can no longer promise anything we already
/// acknowledged; stop the node instead of serving non-durable state.
fn fatal_store(node_id: &str, err: anyhow::Error) -> ! {
    error!("[{}] durable store failure: {:#}", node_id, err);
    std::process::exit(1);
}
