use chat_raft_project::state::{wildcard_match, ChatState, CommandReply};
use chat_raft_project::Command;

fn hash(seed: u8) -> [u8; 32] {
    [seed; 32]
}

fn create(state: &mut ChatState, username: &str, id: u32) -> CommandReply {
    let (reply, _) = state.apply(&Command::CreateAccount {
        username: username.to_string(),
        password_hash: hash(id as u8),
        user_id: id,
        token: [id as u8; 32],
    });
    reply
}

fn send(state: &mut ChatState, from: u32, to: u32, content: &str, id: u32) -> CommandReply {
    let (reply, _) = state.apply(&Command::SendMessage {
        sender_id: from,
        recipient_id: to,
        content: content.to_string(),
        message_id: id,
        timestamp: id as i64 * 1000,
    });
    reply
}

#[test]
fn create_account_and_verify_password() {
    let mut state = ChatState::new();
    let reply = create(&mut state, "alice", 1);
    assert_eq!(
        reply,
        CommandReply::AccountCreated {
            user_id: 1,
            token: [1u8; 32]
        }
    );

    let user = state.verify_password("alice", &hash(1)).expect("login");
    assert_eq!(user.id, 1);
    assert!(user.unread.is_empty());

    // Wrong password, wrong username.
    assert!(state.verify_password("alice", &hash(2)).is_none());
    assert!(state.verify_password("bob", &hash(1)).is_none());
}

#[test]
fn duplicate_username_is_rejected() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    let reply = create(&mut state, "alice", 2);
    assert_eq!(reply, CommandReply::UsernameTaken);
    assert_eq!(state.user_count(), 1);
    assert!(state.user(2).is_none());
}

#[test]
fn send_message_flows_into_unread() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    create(&mut state, "bob", 2);

    assert_eq!(send(&mut state, 1, 2, "hi", 1), CommandReply::Ok);

    let unread = state.unread_of(2).expect("bob exists");
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].id, 1);
    assert_eq!(unread[0].content, "hi");
    assert!(!unread[0].read_flag);

    // Sender has nothing unread.
    assert!(state.unread_of(1).expect("alice exists").is_empty());
}

#[test]
fn mark_read_only_for_recipient() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    create(&mut state, "bob", 2);
    send(&mut state, 1, 2, "hi", 1);

    // Alice sent it; she cannot mark it read.
    let (reply, _) = state.apply(&Command::MarkRead {
        user_id: 1,
        message_id: 1,
    });
    assert!(matches!(reply, CommandReply::Rejected { .. }));

    let (reply, _) = state.apply(&Command::MarkRead {
        user_id: 2,
        message_id: 1,
    });
    assert_eq!(reply, CommandReply::Ok);
    assert!(state.message(1).expect("message").read_flag);
    assert!(state.unread_of(2).expect("bob").is_empty());
}

#[test]
fn read_n_pops_oldest_ids_first() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    create(&mut state, "bob", 2);
    send(&mut state, 1, 2, "m1", 1);
    send(&mut state, 1, 2, "m2", 2);
    send(&mut state, 1, 2, "m3", 3);

    let (reply, _) = state.apply(&Command::ReadN { user_id: 2, n: 2 });
    assert_eq!(reply, CommandReply::ReadCount { count: 2 });

    let unread: Vec<u32> = state
        .unread_of(2)
        .expect("bob")
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(unread, vec![3]);
    assert!(state.message(1).expect("m1").read_flag);
    assert!(state.message(2).expect("m2").read_flag);
    assert!(!state.message(3).expect("m3").read_flag);

    // Asking for more than remain acknowledges what was there.
    let (reply, _) = state.apply(&Command::ReadN { user_id: 2, n: 10 });
    assert_eq!(reply, CommandReply::ReadCount { count: 1 });
}

#[test]
fn conversation_is_ordered_by_message_id() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    create(&mut state, "bob", 2);
    send(&mut state, 1, 2, "m1", 1);
    send(&mut state, 2, 1, "m2", 2);
    send(&mut state, 1, 2, "m3", 3);

    let conv = state.conversation(1, 2);
    let ids: Vec<u32> = conv.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    let contents: Vec<&str> = conv.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m1", "m2", "m3"]);

    // Same conversation regardless of who asks.
    let flipped: Vec<u32> = state.conversation(2, 1).iter().map(|m| m.id).collect();
    assert_eq!(flipped, vec![1, 2, 3]);
}

#[test]
fn recent_conversants_move_to_front_without_duplicates() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    create(&mut state, "bob", 2);
    create(&mut state, "carol", 3);

    send(&mut state, 1, 2, "to bob", 1);
    send(&mut state, 1, 3, "to carol", 2);
    send(&mut state, 1, 2, "to bob again", 3);

    let alice = state.user(1).expect("alice");
    assert_eq!(alice.recent_conversants, vec![2, 3]);

    let bob = state.user(2).expect("bob");
    assert_eq!(bob.recent_conversants, vec![1]);
}

#[test]
fn delete_message_cleans_every_index() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    create(&mut state, "bob", 2);
    send(&mut state, 1, 2, "hi", 1);

    let (reply, effects) = state.apply(&Command::DeleteMessage { message_id: 1 });
    assert_eq!(reply, CommandReply::Ok);
    assert_eq!(effects.delete_messages, vec![1]);

    assert!(state.message(1).is_none());
    assert!(state.conversation(1, 2).is_empty());
    assert!(state.unread_of(2).expect("bob").is_empty());

    let (reply, _) = state.apply(&Command::DeleteMessage { message_id: 1 });
    assert!(matches!(reply, CommandReply::Rejected { .. }));
}

#[test]
fn delete_account_cascades() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    create(&mut state, "bob", 2);
    create(&mut state, "carol", 3);
    send(&mut state, 1, 2, "a to b", 1);
    send(&mut state, 2, 1, "b to a", 2);
    send(&mut state, 3, 2, "c to b", 3);

    let (reply, effects) = state.apply(&Command::DeleteAccount { user_id: 1 });
    assert_eq!(reply, CommandReply::Ok);
    assert_eq!(effects.delete_users, vec![1]);
    assert_eq!(effects.delete_messages, vec![1, 2]);

    // Alice is gone, along with every message that touched her.
    assert!(state.user(1).is_none());
    assert!(state.verify_password("alice", &hash(1)).is_none());
    assert!(state.message(1).is_none());
    assert!(state.message(2).is_none());
    assert!(state.conversation(2, 1).is_empty());

    // Bob keeps carol's message and loses alice from his indices.
    let bob = state.user(2).expect("bob");
    assert_eq!(bob.unread.iter().copied().collect::<Vec<u32>>(), vec![3]);
    assert!(!bob.recent_conversants.contains(&1));
}

#[test]
fn send_to_unknown_user_is_rejected() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    let reply = send(&mut state, 1, 9, "hello?", 1);
    assert!(matches!(reply, CommandReply::Rejected { .. }));
    assert_eq!(state.message_count(), 0);

    let reply = send(&mut state, 9, 1, "hello?", 1);
    assert!(matches!(reply, CommandReply::Rejected { .. }));
}

#[test]
fn identical_logs_produce_identical_state() {
    let commands = vec![
        Command::CreateAccount {
            username: "alice".to_string(),
            password_hash: hash(1),
            user_id: 1,
            token: [1u8; 32],
        },
        Command::CreateAccount {
            username: "bob".to_string(),
            password_hash: hash(2),
            user_id: 2,
            token: [2u8; 32],
        },
        Command::SendMessage {
            sender_id: 1,
            recipient_id: 2,
            content: "hi".to_string(),
            message_id: 1,
            timestamp: 42,
        },
        Command::ReadN { user_id: 2, n: 1 },
        Command::SendMessage {
            sender_id: 2,
            recipient_id: 1,
            content: "hey".to_string(),
            message_id: 2,
            timestamp: 43,
        },
        Command::DeleteMessage { message_id: 1 },
        Command::DeleteAccount { user_id: 2 },
    ];

    let mut a = ChatState::new();
    let mut b = ChatState::new();
    for cmd in &commands {
        let (reply_a, _) = a.apply(cmd);
        let (reply_b, _) = b.apply(cmd);
        assert_eq!(reply_a, reply_b);
    }
    assert_eq!(a, b);
}

#[test]
fn list_accounts_respects_wildcards() {
    let mut state = ChatState::new();
    create(&mut state, "alice", 1);
    create(&mut state, "bob", 2);
    create(&mut state, "alfred", 3);
    create(&mut state, "Alice", 4);

    assert_eq!(state.list_accounts("*"), vec!["alice", "bob", "alfred", "Alice"]);
    assert_eq!(state.list_accounts("al*"), vec!["alice", "alfred"]);
    assert_eq!(state.list_accounts("?ob"), vec!["bob"]);
    assert_eq!(state.list_accounts("Alice"), vec!["Alice"]);
    assert!(state.list_accounts("z*").is_empty());
}

#[test]
fn wildcard_matcher_semantics() {
    assert!(wildcard_match("*", ""));
    assert!(wildcard_match("*", "anything"));
    assert!(wildcard_match("a*e", "alice"));
    assert!(wildcard_match("a*e", "ae"));
    assert!(!wildcard_match("a*e", "alicex"));
    assert!(wildcard_match("?ob", "bob"));
    assert!(!wildcard_match("?ob", "ob"));
    assert!(wildcard_match("a??ce", "alice"));
    assert!(wildcard_match("*li*", "alice"));
    assert!(!wildcard_match("ALICE", "alice"));
    assert!(wildcard_match("a*l*e", "apple"));
    assert!(!wildcard_match("", "x"));
    assert!(wildcard_match("", ""));
}
