use anyhow::{bail, Context, Result};
use chat_raft_project::config::ClusterConfig;
use chat_raft_project::{ClientRequest, ClientResponse, ErrorCode};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

const MAX_ATTEMPTS: usize = 5;
const RETRY_DELAY_MS: u64 = 500;

#[derive(Parser)]
#[command(version, about = "Command-line client for the replicated chat cluster", long_about = None)]
struct Cli {
    /// Path to the JSON cluster config
    #[arg(short, long, default_value = "cluster.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account and print the minted session token
    CreateAccount {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// Log in and print the session token and unread count
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// List usernames matching a wildcard (* and ?)
    List {
        #[arg(long)]
        user_id: u32,
        #[arg(long)]
        token: String,
        #[arg(short, long, default_value = "*")]
        wildcard: String,
    },
    /// Show the conversation with another user
    Conversation {
        #[arg(long)]
        user_id: u32,
        #[arg(long)]
        token: String,
        #[arg(long)]
        with: u32,
    },
    /// Send a message
    Send {
        #[arg(long)]
        user_id: u32,
        #[arg(long)]
        token: String,
        #[arg(long)]
        to: u32,
        #[arg(short, long)]
        message: String,
    },
    /// Mark up to N unread messages as read, oldest first
    Read {
        #[arg(long)]
        user_id: u32,
        #[arg(long)]
        token: String,
        #[arg(short, long)]
        count: u32,
    },
    /// List unread messages
    Unread {
        #[arg(long)]
        user_id: u32,
        #[arg(long)]
        token: String,
    },
    /// Show one message in full
    MessageInfo {
        #[arg(long)]
        user_id: u32,
        #[arg(long)]
        token: String,
        #[arg(long)]
        message_id: u32,
    },
    /// Mark one message as read
    MarkRead {
        #[arg(long)]
        user_id: u32,
        #[arg(long)]
        token: String,
        #[arg(long)]
        message_id: u32,
    },
    /// Delete one message
    DeleteMessage {
        #[arg(long)]
        user_id: u32,
        #[arg(long)]
        token: String,
        #[arg(long)]
        message_id: u32,
    },
    /// Delete the account and everything it touched
    DeleteAccount {
        #[arg(long)]
        user_id: u32,
        #[arg(long)]
        token: String,
    },
    /// Look up a user id by username
    Whois {
        #[arg(short, long)]
        username: String,
    },
    /// Look up a username by user id
    UsernameOf {
        #[arg(long)]
        user_id: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cluster = ClusterConfig::load(&cli.config)?;
    let servers = cluster.all_addrs();

    let request = build_request(cli.command)?;
    let response = call_cluster(&servers, &request)?;
    print_response(&response);
    Ok(())
}

fn build_request(command: Commands) -> Result<ClientRequest> {
    Ok(match command {
        Commands::CreateAccount { username, password } => ClientRequest::CreateAccount {
            username,
            password_hash: password_digest(&password),
        },
        Commands::Login { username, password } => ClientRequest::Login {
            username,
            password_hash: password_digest(&password),
        },
        Commands::List {
            user_id,
            token,
            wildcard,
        } => ClientRequest::ListAccounts {
            user_id,
            token: parse_hex_32(&token)?,
            wildcard,
        },
        Commands::Conversation {
            user_id,
            token,
            with,
        } => ClientRequest::DisplayConversation {
            user_id,
            token: parse_hex_32(&token)?,
            conversant_id: with,
        },
        Commands::Send {
            user_id,
            token,
            to,
            message,
        } => ClientRequest::SendMessage {
            sender_id: user_id,
            token: parse_hex_32(&token)?,
            recipient_id: to,
            content: message,
        },
        Commands::Read {
            user_id,
            token,
            count,
        } => ClientRequest::ReadMessages {
            user_id,
            token: parse_hex_32(&token)?,
            n: count,
        },
        Commands::Unread { user_id, token } => ClientRequest::GetUnreadMessages {
            user_id,
            token: parse_hex_32(&token)?,
        },
        Commands::MessageInfo {
            user_id,
            token,
            message_id,
        } => ClientRequest::GetMessageInformation {
            user_id,
            token: parse_hex_32(&token)?,
            message_uid: message_id,
        },
        Commands::MarkRead {
            user_id,
            token,
            message_id,
        } => ClientRequest::MarkMessageAsRead {
            user_id,
            token: parse_hex_32(&token)?,
            message_uid: message_id,
        },
        Commands::DeleteMessage {
            user_id,
            token,
            message_id,
        } => ClientRequest::DeleteMessage {
            user_id,
            token: parse_hex_32(&token)?,
            message_uid: message_id,
        },
        Commands::DeleteAccount { user_id, token } => ClientRequest::DeleteAccount {
            user_id,
            token: parse_hex_32(&token)?,
        },
        Commands::Whois { username } => ClientRequest::GetUserByUsername { username },
        Commands::UsernameOf { user_id } => ClientRequest::GetUsernameByID { user_id },
    })
}

/// Probe the cluster until some node accepts the request. A NOT_LEADER
/// answer redirects us once to the hinted address; we never chain past it.
fn call_cluster(servers: &[String], request: &ClientRequest) -> Result<ClientResponse> {
    let mut hint: Option<String> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        let candidates: Vec<String> = hint
            .take()
            .into_iter()
            .chain(servers.iter().cloned())
            .collect();

        for addr in candidates {
            match send_request(&addr, request) {
                Ok(ClientResponse::Error {
                    code: ErrorCode::FailedPrecondition,
                    leader_hint,
                    ..
                }) => {
                    println!("  {} is not the leader", addr);
                    if let Some(leader) = leader_hint {
                        println!("  redirected to {}", leader);
                        hint = Some(leader);
                        break;
                    }
                }
                Ok(ClientResponse::Error {
                    code: ErrorCode::Unavailable,
                    ..
                }) => {
                    println!("  {} has no leader yet", addr);
                }
                Ok(response) => return Ok(response),
                Err(e) => println!("  connection to {} failed: {}", addr, e),
            }
        }

        if attempt < MAX_ATTEMPTS {
            println!("no leader found, retrying in {}ms...", RETRY_DELAY_MS);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
        }
    }

    bail!("no node accepted the request after {} attempts", MAX_ATTEMPTS)
}

fn send_request(addr: &str, request: &ClientRequest) -> Result<ClientResponse> {
    let mut stream = TcpStream::connect_timeout(&addr.parse()?, Duration::from_secs(5))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    let body = serde_json::to_vec(request)?;
    stream.write_all(&(body.len() as u32).to_be_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;

    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

fn print_response(response: &ClientResponse) {
    match response {
        ClientResponse::Account {
            user_id,
            session_token,
        } => {
            println!("account created: user_id={}", user_id);
            println!("session token: {}", to_hex(session_token));
        }
        ClientResponse::LoginOk {
            session_token,
            unread_count,
        } => {
            println!("login ok, {} unread message(s)", unread_count);
            println!("session token: {}", to_hex(session_token));
        }
        ClientResponse::LoginFailed => println!("login failed"),
        ClientResponse::Accounts { count, usernames } => {
            println!("{} account(s):", count);
            for name in usernames {
                println!("  {}", name);
            }
        }
        ClientResponse::Conversation { count, messages } => {
            println!("{} message(s):", count);
            for m in messages {
                let direction = if m.sender_flag { "->" } else { "<-" };
                println!("  [{}] {} {}", m.message_id, direction, m.content);
            }
        }
        ClientResponse::Unread { count, messages } => {
            println!("{} unread message(s):", count);
            for m in messages {
                println!("  [{}] from user {}", m.message_uid, m.sender_id);
            }
        }
        ClientResponse::MessageInfo {
            read_flag,
            sender_id,
            content_length,
            content,
        } => {
            println!(
                "from user {} ({} bytes, {}):",
                sender_id,
                content_length,
                if *read_flag { "read" } else { "unread" }
            );
            println!("  {}", content);
        }
        ClientResponse::Username { username } => println!("{}", username),
        ClientResponse::UserFound { user_id } => println!("found: user_id={}", user_id),
        ClientResponse::UserNotFound => println!("not found"),
        ClientResponse::Ok => println!("ok"),
        ClientResponse::Error { code, message, .. } => {
            println!("error ({:?}): {}", code, message)
        }
    }
}

/// Fold a password into the opaque 32-byte digest the wire format carries.
fn password_digest(password: &str) -> [u8; 32] {
    let mut digest = [0u8; 32];
    for (i, byte) in password.bytes().enumerate() {
        digest[i % 32] ^= byte.rotate_left((i / 32) as u32);
    }
    digest
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_hex_32(s: &str) -> Result<[u8; 32]> {
    if s.len() != 64 {
        bail!("token must be 64 hex characters, got {}", s.len());
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk)?;
        out[i] = u8::from_str_radix(pair, 16)
            .with_context(|| format!("bad hex pair '{}' in token", pair))?;
    }
    Ok(out)
}
