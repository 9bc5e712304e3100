use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub mod config;
pub mod raft;
pub mod router;
pub mod session;
pub mod state;
pub mod store;

/// Raft traffic runs on the application port plus this offset.
pub const RAFT_PORT_OFFSET: u16 = 1000;

/// Upper bound for a single wire frame. Anything larger is a corrupt or
/// hostile length prefix.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

// --- REPLICATED COMMANDS ---

/// A single replicated log entry: the unit the leader ships to followers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub term: u64,
    pub command: Command,
}

/// The closed set of commands the state machine understands.
///
/// Every nondeterministic input (assigned ids, session token, timestamp) is
/// filled in by the leader before the entry is appended, so all replicas
/// apply byte-identical commands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Command {
    CreateAccount {
        username: String,
        password_hash: [u8; 32],
        user_id: u32,
        token: [u8; 32],
    },
    DeleteAccount {
        user_id: u32,
    },
    SendMessage {
        sender_id: u32,
        recipient_id: u32,
        content: String,
        message_id: u32,
        timestamp: i64,
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

// --- RAFT MESSAGE TYPES ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: i64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
        voter_id: String,
    },
    AppendEntries {
        term: u64,
        leader_id: String,
        prev_log_index: i64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: i64,
    },
    AppendEntriesResponse {
        term: u64,
        follower_id: String,
        success: bool,
        last_log_index: i64,
    },
}

// --- CLIENT RPC TYPES ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ClientRequest {
    CreateAccount {
        username: String,
        password_hash: [u8; 32],
    },
    Login {
        username: String,
        password_hash: [u8; 32],
    },
    ListAccounts {
        user_id: u32,
        token: [u8; 32],
        wildcard: String,
    },
    DisplayConversation {
        user_id: u32,
        token: [u8; 32],
        conversant_id: u32,
    },
    SendMessage {
        sender_id: u32,
        token: [u8; 32],
        recipient_id: u32,
        content: String,
    },
    ReadMessages {
        user_id: u32,
        token: [u8; 32],
        n: u32,
    },
    DeleteMessage {
        user_id: u32,
        token: [u8; 32],
        message_uid: u32,
    },
    DeleteAccount {
        user_id: u32,
        token: [u8; 32],
    },
    GetUnreadMessages {
        user_id: u32,
        token: [u8; 32],
    },
    GetMessageInformation {
        user_id: u32,
        token: [u8; 32],
        message_uid: u32,
    },
    GetUsernameByID {
        user_id: u32,
    },
    MarkMessageAsRead {
        user_id: u32,
        token: [u8; 32],
        message_uid: u32,
    },
    GetUserByUsername {
        username: String,
    },
}

/// One message as seen inside a conversation listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub message_id: u32,
    /// True when the requesting user is the sender.
    pub sender_flag: bool,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UnreadEntry {
    pub message_uid: u32,
    pub sender_id: u32,
    pub receiver_id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthenticated,
    FailedPrecondition,
    Unavailable,
    Internal,
    DeadlineExceeded,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientResponse {
    /// CreateAccount succeeded; the caller is now logged in on this node.
    Account {
        user_id: u32,
        session_token: [u8; 32],
    },
    LoginOk {
        session_token: [u8; 32],
        unread_count: u32,
    },
    LoginFailed,
    Accounts {
        count: u32,
        usernames: Vec<String>,
    },
    Conversation {
        count: u32,
        messages: Vec<ConversationEntry>,
    },
    Unread {
        count: u32,
        messages: Vec<UnreadEntry>,
    },
    MessageInfo {
        read_flag: bool,
        sender_id: u32,
        content_length: u32,
        content: String,
    },
    Username {
        username: String,
    },
    UserFound {
        user_id: u32,
    },
    UserNotFound,
    Ok,
    Error {
        code: ErrorCode,
        message: String,
        /// Last-known leader address, when the error is a leader redirect.
        leader_hint: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    Follower,
    Candidate,
    Leader,
}

// --- WIRE FRAMING ---

/// Write one length-prefixed JSON frame.
pub async fn write_frame<T: Serialize>(stream: &mut TcpStream, msg: &T) -> Result<()> {
    let body = serde_json::to_vec(msg)?;
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("frame of {} bytes exceeds limit", len);
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}
