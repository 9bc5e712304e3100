//! Client request router: classifies each application RPC as a mutation
//! (proposed through Raft on the leader) or a read (served locally from the
//! applied state), after validating the caller's session.

use crate::config::ClusterConfig;
use crate::raft::{CommandDraft, ProposeError, RaftNode};
use crate::session::SessionTable;
use crate::state::CommandReply;
use crate::{ClientRequest, ClientResponse, ConversationEntry, ErrorCode, UnreadEntry};
use log::info;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Router {
    raft: Arc<RaftNode>,
    cluster: ClusterConfig,
    sessions: Mutex<SessionTable>,
}

impl Router {
    pub fn new(raft: Arc<RaftNode>, cluster: ClusterConfig) -> Router {
        Router {
            raft,
            cluster,
            sessions: Mutex::new(SessionTable::new()),
        }
    }

    /// Serve one application RPC.
    pub async fn handle(&self, request: ClientRequest) -> ClientResponse {
        match request {
            ClientRequest::CreateAccount {
                username,
                password_hash,
            } => self.create_account(username, password_hash).await,

            ClientRequest::Login {
                username,
                password_hash,
            } => self.login(&username, &password_hash).await,

            ClientRequest::ListAccounts {
                user_id,
                token,
                wildcard,
            } => {
                if !self.session_ok(user_id, &token).await {
                    return unauthenticated();
                }
                let state = self.raft.state.lock().await;
                let usernames = state.chat.list_accounts(&wildcard);
                ClientResponse::Accounts {
                    count: usernames.len() as u32,
                    usernames,
                }
            }

            ClientRequest::DisplayConversation {
                user_id,
                token,
                conversant_id,
            } => {
                if !self.session_ok(user_id, &token).await {
                    return unauthenticated();
                }
                let state = self.raft.state.lock().await;
                let messages: Vec<ConversationEntry> = state
                    .chat
                    .conversation(user_id, conversant_id)
                    .into_iter()
                    .map(|m| ConversationEntry {
                        message_id: m.id,
                        sender_flag: m.sender_id == user_id,
                        content: m.content.clone(),
                    })
                    .collect();
                ClientResponse::Conversation {
                    count: messages.len() as u32,
                    messages,
                }
            }

            ClientRequest::SendMessage {
                sender_id,
                token,
                recipient_id,
                content,
            } => {
                if !self.session_ok(sender_id, &token).await {
                    return unauthenticated();
                }
                self.propose_simple(CommandDraft::SendMessage {
                    sender_id,
                    recipient_id,
                    content,
                })
                .await
            }

            ClientRequest::ReadMessages { user_id, token, n } => {
                if !self.session_ok(user_id, &token).await {
                    return unauthenticated();
                }
                self.propose_simple(CommandDraft::ReadN { user_id, n }).await
            }

            ClientRequest::DeleteMessage {
                user_id,
                token,
                message_uid,
            } => {
                if !self.session_ok(user_id, &token).await {
                    return unauthenticated();
                }
                self.propose_simple(CommandDraft::DeleteMessage {
                    message_id: message_uid,
                })
                .await
            }

            ClientRequest::DeleteAccount { user_id, token } => {
                if !self.session_ok(user_id, &token).await {
                    return unauthenticated();
                }
                let response = self.propose_simple(CommandDraft::DeleteAccount { user_id }).await;
                if response == ClientResponse::Ok {
                    self.sessions.lock().await.revoke(user_id);
                }
                response
            }

            ClientRequest::GetUnreadMessages { user_id, token } => {
                if !self.session_ok(user_id, &token).await {
                    return unauthenticated();
                }
                let state = self.raft.state.lock().await;
                match state.chat.unread_of(user_id) {
                    Some(unread) => {
                        let messages: Vec<UnreadEntry> = unread
                            .into_iter()
                            .map(|m| UnreadEntry {
                                message_uid: m.id,
                                sender_id: m.sender_id,
                                receiver_id: m.receiver_id,
                            })
                            .collect();
                        ClientResponse::Unread {
                            count: messages.len() as u32,
                            messages,
                        }
                    }
                    None => internal("unknown user"),
                }
            }

            ClientRequest::GetMessageInformation {
                user_id,
                token,
                message_uid,
            } => {
                if !self.session_ok(user_id, &token).await {
                    return unauthenticated();
                }
                let state = self.raft.state.lock().await;
                match state.chat.message(message_uid) {
                    Some(m) => ClientResponse::MessageInfo {
                        read_flag: m.read_flag,
                        sender_id: m.sender_id,
                        content_length: m.content.len() as u32,
                        content: m.content.clone(),
                    },
                    None => internal("unknown message"),
                }
            }

            ClientRequest::GetUsernameByID { user_id } => {
                let state = self.raft.state.lock().await;
                match state.chat.username_of(user_id) {
                    Some(name) => ClientResponse::Username {
                        username: name.to_string(),
                    },
                    None => internal("unknown user"),
                }
            }

            ClientRequest::MarkMessageAsRead {
                user_id,
                token,
                message_uid,
            } => {
                if !self.session_ok(user_id, &token).await {
                    return unauthenticated();
                }
                self.propose_simple(CommandDraft::MarkRead {
                    user_id,
                    message_id: message_uid,
                })
                .await
            }

            ClientRequest::GetUserByUsername { username } => {
                let state = self.raft.state.lock().await;
                match state.chat.user_by_name(&username) {
                    Some(user) => ClientResponse::UserFound { user_id: user.id },
                    None => ClientResponse::UserNotFound,
                }
            }
        }
    }

    async fn create_account(&self, username: String, password_hash: [u8; 32]) -> ClientResponse {
        match self
            .raft
            .propose(CommandDraft::CreateAccount {
                username,
                password_hash,
            })
            .await
        {
            Ok(CommandReply::AccountCreated { user_id, token }) => {
                // The token rode the replicated command, but only this node
                // installs it; sessions are never cluster state.
                self.sessions.lock().await.install(user_id, token);
                info!("created account {} with a local session", user_id);
                ClientResponse::Account {
                    user_id,
                    session_token: token,
                }
            }
            Ok(CommandReply::UsernameTaken) => internal("username already taken"),
            Ok(_) => internal("unexpected state machine reply"),
            Err(e) => self.propose_failure(e),
        }
    }

    /// Login reads the applied state and mints a token locally; it never
    /// enters the Raft log.
    async fn login(&self, username: &str, password_hash: &[u8; 32]) -> ClientResponse {
        let verified = {
            let state = self.raft.state.lock().await;
            state
                .chat
                .verify_password(username, password_hash)
                .map(|user| (user.id, user.unread.len() as u32))
        };
        match verified {
            Some((user_id, unread_count)) => {
                let token = self.sessions.lock().await.mint(user_id);
                ClientResponse::LoginOk {
                    session_token: token,
                    unread_count,
                }
            }
            None => ClientResponse::LoginFailed,
        }
    }

    /// Propose a mutation whose success maps to an empty reply.
    async fn propose_simple(&self, draft: CommandDraft) -> ClientResponse {
        match self.raft.propose(draft).await {
            Ok(CommandReply::Ok) | Ok(CommandReply::ReadCount { .. }) => ClientResponse::Ok,
            Ok(CommandReply::Rejected { reason }) => internal(&reason),
            Ok(_) => internal("unexpected state machine reply"),
            Err(e) => self.propose_failure(e),
        }
    }

    async fn session_ok(&self, user_id: u32, token: &[u8; 32]) -> bool {
        self.sessions.lock().await.validate(user_id, token)
    }

    fn propose_failure(&self, err: ProposeError) -> ClientResponse {
        match err {
            ProposeError::NotLeader { leader_id } => {
                let hint = leader_id
                    .as_deref()
                    .and_then(|id| self.cluster.addr_of(id))
                    .map(str::to_string);
                ClientResponse::Error {
                    code: ErrorCode::FailedPrecondition,
                    message: format!("Not the leader. Try {}", hint.as_deref().unwrap_or("")),
                    leader_hint: hint,
                }
            }
            ProposeError::Unavailable => ClientResponse::Error {
                code: ErrorCode::Unavailable,
                message: "no reachable leader, retry".to_string(),
                leader_hint: None,
            },
            ProposeError::Timeout => ClientResponse::Error {
                code: ErrorCode::DeadlineExceeded,
                message: "proposal did not commit in time, retry".to_string(),
                leader_hint: None,
            },
        }
    }
}

fn unauthenticated() -> ClientResponse {
    ClientResponse::Error {
        code: ErrorCode::Unauthenticated,
        message: "invalid session".to_string(),
        leader_hint: None,
    }
}

fn internal(reason: &str) -> ClientResponse {
    ClientResponse::Error {
        code: ErrorCode::Internal,
        message: reason.to_string(),
        leader_hint: None,
    }
}
