//! The deterministic chat state machine.
//!
//! `apply` is a pure function of (current state, command): no clocks, no
//! randomness, no hash-order iteration. Everything nondeterministic arrives
//! inside the command, so replaying the same log on any replica produces an
//! identical `ChatState`.

use crate::store::{ApplyEffects, MessageRow, UserData, UserRow};
use crate::Command;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: u32,
    pub username: String,
    pub password_hash: [u8; 32],
    /// Unread message ids, ascending.
    pub unread: BTreeSet<u32>,
    /// Conversation partners, most recent first, deduplicated.
    pub recent_conversants: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u32,
    pub sender_id: u32,
    pub receiver_id: u32,
    pub content: String,
    pub read_flag: bool,
    pub timestamp: i64,
}

/// Deterministic outcome of one applied command. Rejections are committed
/// outcomes too, not consensus failures.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    AccountCreated { user_id: u32, token: [u8; 32] },
    UsernameTaken,
    Ok,
    ReadCount { count: u32 },
    Rejected { reason: String },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChatState {
    users: BTreeMap<u32, User>,
    by_username: HashMap<String, u32>,
    messages: BTreeMap<u32, Message>,
    /// Unordered user pair (stored low-high) -> message ids ascending.
    conversations: BTreeMap<(u32, u32), Vec<u32>>,
}

fn pair(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Move `other` to the front of the user's recent-conversant list.
fn touch_conversant(user: &mut User, other: u32) {
    user.recent_conversants.retain(|&id| id != other);
    user.recent_conversants.insert(0, other);
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the in-memory indices from durable rows at startup.
    pub fn rebuild(users: Vec<UserRow>, messages: Vec<MessageRow>) -> Self {
        let mut state = ChatState::new();
        for row in users {
            let user = User {
                id: row.id,
                username: row.username,
                password_hash: row.password_hash,
                unread: row.data.unread.into_iter().collect(),
                recent_conversants: row.data.recent_conversants,
            };
            state.by_username.insert(user.username.clone(), user.id);
            state.users.insert(user.id, user);
        }
        for row in messages {
            state
                .conversations
                .entry(pair(row.sender, row.receiver))
                .or_default()
                .push(row.id);
            state.messages.insert(
                row.id,
                Message {
                    id: row.id,
                    sender_id: row.sender,
                    receiver_id: row.receiver,
                    content: row.content,
                    read_flag: row.read,
                    timestamp: row.ts,
                },
            );
        }
        state
    }

    /// Apply one committed command, returning its reply and the row changes
    /// the caller must persist.
    pub fn apply(&mut self, command: &Command) -> (CommandReply, ApplyEffects) {
        let mut effects = ApplyEffects::default();
        let reply = match command {
            Command::CreateAccount {
                username,
                password_hash,
                user_id,
                token,
            } => {
                if let Some(&existing) = self.by_username.get(username) {
                    // Re-applying our own entry after a crash is not a
                    // conflict; a live different user is.
                    if existing != *user_id {
                        return (CommandReply::UsernameTaken, effects);
                    }
                }
                let user = User {
                    id: *user_id,
                    username: username.clone(),
                    password_hash: *password_hash,
                    unread: BTreeSet::new(),
                    recent_conversants: Vec::new(),
                };
                self.by_username.insert(username.clone(), *user_id);
                effects.upsert_users.push(user_row(&user));
                self.users.insert(*user_id, user);
                CommandReply::AccountCreated {
                    user_id: *user_id,
                    token: *token,
                }
            }

            Command::DeleteAccount { user_id } => {
                let user = match self.users.remove(user_id) {
                    Some(u) => u,
                    None => return (reject("unknown user"), effects),
                };
                self.by_username.remove(&user.username);
                effects.delete_users.push(*user_id);

                // Cascade: every message the user sent or received goes away.
                let doomed: Vec<u32> = self
                    .messages
                    .values()
                    .filter(|m| m.sender_id == *user_id || m.receiver_id == *user_id)
                    .map(|m| m.id)
                    .collect();
                for id in &doomed {
                    self.messages.remove(id);
                    effects.delete_messages.push(*id);
                }
                self.conversations
                    .retain(|&(a, b), _| a != *user_id && b != *user_id);

                // Scrub the deleted user and their messages from everyone else.
                let doomed_set: BTreeSet<u32> = doomed.into_iter().collect();
                for other in self.users.values_mut() {
                    let had_unread = other.unread.iter().any(|id| doomed_set.contains(id));
                    let had_recent = other.recent_conversants.contains(user_id);
                    if had_unread {
                        other.unread.retain(|id| !doomed_set.contains(id));
                    }
                    if had_recent {
                        other.recent_conversants.retain(|id| id != user_id);
                    }
                    if had_unread || had_recent {
                        effects.upsert_users.push(user_row(other));
                    }
                }
                CommandReply::Ok
            }

            Command::SendMessage {
                sender_id,
                recipient_id,
                content,
                message_id,
                timestamp,
            } => {
                if !self.users.contains_key(sender_id) {
                    return (reject("unknown sender"), effects);
                }
                if !self.users.contains_key(recipient_id) {
                    return (reject("unknown recipient"), effects);
                }
                let message = Message {
                    id: *message_id,
                    sender_id: *sender_id,
                    receiver_id: *recipient_id,
                    content: content.clone(),
                    read_flag: false,
                    timestamp: *timestamp,
                };
                effects.upsert_messages.push(message_row(&message));
                self.conversations
                    .entry(pair(*sender_id, *recipient_id))
                    .or_default()
                    .push(*message_id);
                self.messages.insert(*message_id, message);

                let sender = self.users.get_mut(sender_id).unwrap();
                touch_conversant(sender, *recipient_id);
                let recipient = self.users.get_mut(recipient_id).unwrap();
                touch_conversant(recipient, *sender_id);
                recipient.unread.insert(*message_id);

                effects.upsert_users.push(user_row(&self.users[sender_id]));
                if recipient_id != sender_id {
                    effects
                        .upsert_users
                        .push(user_row(&self.users[recipient_id]));
                }
                CommandReply::Ok
            }

            Command::MarkRead {
                user_id,
                message_id,
            } => {
                let message = match self.messages.get_mut(message_id) {
                    Some(m) => m,
                    None => return (reject("unknown message"), effects),
                };
                if message.receiver_id != *user_id {
                    return (reject("not the recipient"), effects);
                }
                message.read_flag = true;
                effects.upsert_messages.push(message_row(message));
                if let Some(user) = self.users.get_mut(user_id) {
                    user.unread.remove(message_id);
                    effects.upsert_users.push(user_row(user));
                }
                CommandReply::Ok
            }

            Command::ReadN { user_id, n } => {
                let user = match self.users.get_mut(user_id) {
                    Some(u) => u,
                    None => return (reject("unknown user"), effects),
                };
                let ids: Vec<u32> = user.unread.iter().take(*n as usize).copied().collect();
                for id in &ids {
                    user.unread.remove(id);
                }
                effects.upsert_users.push(user_row(user));
                for id in &ids {
                    if let Some(message) = self.messages.get_mut(id) {
                        message.read_flag = true;
                        effects.upsert_messages.push(message_row(message));
                    }
                }
                CommandReply::ReadCount {
                    count: ids.len() as u32,
                }
            }

            Command::DeleteMessage { message_id } => {
                let message = match self.messages.remove(message_id) {
                    Some(m) => m,
                    None => return (reject("unknown message"), effects),
                };
                effects.delete_messages.push(*message_id);
                let key = pair(message.sender_id, message.receiver_id);
                if let Some(ids) = self.conversations.get_mut(&key) {
                    ids.retain(|id| id != message_id);
                    if ids.is_empty() {
                        self.conversations.remove(&key);
                    }
                }
                if let Some(receiver) = self.users.get_mut(&message.receiver_id) {
                    if receiver.unread.remove(message_id) {
                        effects.upsert_users.push(user_row(receiver));
                    }
                }
                CommandReply::Ok
            }
        };
        (reply, effects)
    }

    // --- Read-only queries ---

    pub fn user(&self, id: u32) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn user_by_name(&self, username: &str) -> Option<&User> {
        self.by_username.get(username).and_then(|id| self.users.get(id))
    }

    pub fn username_of(&self, id: u32) -> Option<&str> {
        self.users.get(&id).map(|u| u.username.as_str())
    }

    /// Password check for login. The hash is opaque 32 bytes end to end.
    pub fn verify_password(&self, username: &str, password_hash: &[u8; 32]) -> Option<&User> {
        self.user_by_name(username)
            .filter(|u| &u.password_hash == password_hash)
    }

    pub fn message(&self, id: u32) -> Option<&Message> {
        self.messages.get(&id)
    }

    /// Usernames matching a `*`/`?` wildcard, in ascending user-id order.
    pub fn list_accounts(&self, wildcard: &str) -> Vec<String> {
        self.users
            .values()
            .filter(|u| wildcard_match(wildcard, &u.username))
            .map(|u| u.username.clone())
            .collect()
    }

    /// All messages between the pair, ascending by message id.
    pub fn conversation(&self, a: u32, b: u32) -> Vec<&Message> {
        match self.conversations.get(&pair(a, b)) {
            Some(ids) => ids.iter().filter_map(|id| self.messages.get(id)).collect(),
            None => Vec::new(),
        }
    }

    /// The user's unread messages, ascending by message id.
    pub fn unread_of(&self, user_id: u32) -> Option<Vec<&Message>> {
        let user = self.users.get(&user_id)?;
        Some(
            user.unread
                .iter()
                .filter_map(|id| self.messages.get(id))
                .collect(),
        )
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Highest ids currently in use, for leader-side id assignment.
    pub fn max_ids(&self) -> (u32, u32) {
        let max_user = self.users.keys().next_back().copied().unwrap_or(0);
        let max_message = self.messages.keys().next_back().copied().unwrap_or(0);
        (max_user, max_message)
    }
}

fn reject(reason: &str) -> CommandReply {
    CommandReply::Rejected {
        reason: reason.to_string(),
    }
}

fn user_row(user: &User) -> UserRow {
    UserRow {
        id: user.id,
        username: user.username.clone(),
        password_hash: user.password_hash,
        data: UserData {
            unread: user.unread.iter().copied().collect(),
            recent_conversants: user.recent_conversants.clone(),
        },
    }
}

fn message_row(message: &Message) -> MessageRow {
    MessageRow {
        id: message.id,
        sender: message.sender_id,
        receiver: message.receiver_id,
        content: message.content.clone(),
        read: message.read_flag,
        ts: message.timestamp,
    }
}

/// Case-sensitive wildcard match: `*` is any run of characters, `?` exactly
/// one. Iterative with backtracking over the last `*`.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            // Let the star swallow one more character and retry.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
