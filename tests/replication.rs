use anyhow::Result;
use chat_raft_project::raft::{CommandDraft, RaftConfig, RaftNode};
use chat_raft_project::state::CommandReply;
use chat_raft_project::store::Store;
use chat_raft_project::{read_frame, write_frame, RaftMessage};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

// Helper to start a tiny Raft listener that forwards incoming messages to the RaftNode
async fn start_listener(port: u16, node: Arc<RaftNode>) -> Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        let message: RaftMessage = match read_frame(&mut stream).await {
                            Ok(m) => m,
                            Err(_) => return,
                        };
                        if let Ok(Some(response)) = node.handle_raft_message(message).await {
                            let _ = write_frame(&mut stream, &response).await;
                        }
                    });
                }
                Err(_) => continue,
            }
        }
    });

    Ok(())
}

/// Long election timeouts so the test script, not the timers, decides who
/// leads.
fn test_config(node_id: &str, peers: Vec<(String, String)>) -> RaftConfig {
    RaftConfig {
        node_id: node_id.to_string(),
        peers,
        election_timeout_min: 2000,
        election_timeout_max: 4000,
        heartbeat_interval: 100,
        propose_timeout: 5000,
    }
}

async fn spawn_cluster(ports: &[u16], dirs: &[TempDir]) -> Result<Vec<Arc<RaftNode>>> {
    let ids: Vec<String> = (1..=ports.len()).map(|i| format!("n{}", i)).collect();
    let addrs: Vec<String> = ports.iter().map(|p| format!("127.0.0.1:{}", p)).collect();

    let mut nodes = Vec::new();
    for i in 0..ports.len() {
        let peers: Vec<(String, String)> = (0..ports.len())
            .filter(|&j| j != i)
            .map(|j| (ids[j].clone(), addrs[j].clone()))
            .collect();
        let store = Store::open(dirs[i].path())?;
        let node = Arc::new(RaftNode::new(test_config(&ids[i], peers), store)?);
        nodes.push(node);
    }

    for (i, node) in nodes.iter().enumerate() {
        start_listener(ports[i], Arc::clone(node)).await?;
        Arc::clone(node).start().await;
    }

    Ok(nodes)
}

fn create_account_draft(username: &str) -> CommandDraft {
    CommandDraft::CreateAccount {
        username: username.to_string(),
        password_hash: [7u8; 32],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replication_basic() -> Result<()> {
    let ports = [9301u16, 9302, 9303];
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let nodes = spawn_cluster(&ports, &dirs).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    nodes[0].start_election().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(nodes[0].is_leader().await, "node 1 should be leader");

    // The proposal only returns once the entry is committed and applied.
    let reply = nodes[0]
        .propose(create_account_draft("alice"))
        .await
        .expect("proposal should commit");
    assert!(matches!(
        reply,
        CommandReply::AccountCreated { user_id: 1, .. }
    ));

    // Followers learn the commit on the next heartbeats.
    tokio::time::sleep(Duration::from_millis(800)).await;
    for i in 1..3 {
        let state = nodes[i].state.lock().await;
        assert_eq!(
            state.log.len(),
            1,
            "node {} did not replicate the entry",
            i + 1
        );
        assert_eq!(state.commit_index, 0);
        assert!(
            state.chat.user_by_name("alice").is_some(),
            "node {} did not apply the entry",
            i + 1
        );
    }

    Ok(())
}

/// Multi-entry replication and commit correctness.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replication_multi_node() -> Result<()> {
    let ports = [9311u16, 9312, 9313];
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let nodes = spawn_cluster(&ports, &dirs).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    nodes[0].start_election().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(nodes[0].is_leader().await, "node 1 should be leader");

    let reply = nodes[0]
        .propose(create_account_draft("alice"))
        .await
        .unwrap();
    assert!(matches!(
        reply,
        CommandReply::AccountCreated { user_id: 1, .. }
    ));
    let reply = nodes[0].propose(create_account_draft("bob")).await.unwrap();
    assert!(matches!(
        reply,
        CommandReply::AccountCreated { user_id: 2, .. }
    ));

    {
        let state = nodes[0].state.lock().await;
        assert_eq!(state.commit_index, 1);
        assert_eq!(state.last_applied, 1);
    }

    // Every replica converges to the same applied chat state.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let reference = nodes[0].state.lock().await.chat.clone();
    for i in 1..3 {
        let state = nodes[i].state.lock().await;
        assert_eq!(state.log.len(), 2, "node {} log incomplete", i + 1);
        assert_eq!(
            state.chat, reference,
            "node {} diverged from the leader's applied state",
            i + 1
        );
    }

    Ok(())
}

/// A new leader picks up id assignment where the old log left off.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_change_preserves_id_assignment() -> Result<()> {
    let ports = [9331u16, 9332, 9333];
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let nodes = spawn_cluster(&ports, &dirs).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    nodes[0].start_election().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(nodes[0].is_leader().await);

    let reply = nodes[0]
        .propose(create_account_draft("alice"))
        .await
        .unwrap();
    assert!(matches!(
        reply,
        CommandReply::AccountCreated { user_id: 1, .. }
    ));
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Force a leader change; the higher term demotes node 1.
    nodes[1].start_election().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(nodes[1].is_leader().await, "node 2 should take over");
    assert!(
        !nodes[0].is_leader().await,
        "node 1 should have stepped down"
    );

    let reply = nodes[1].propose(create_account_draft("bob")).await.unwrap();
    assert!(matches!(
        reply,
        CommandReply::AccountCreated { user_id: 2, .. }
    ));

    tokio::time::sleep(Duration::from_millis(800)).await;
    for node in &nodes {
        let state = node.state.lock().await;
        assert!(state.chat.user_by_name("alice").is_some());
        assert!(state.chat.user_by_name("bob").is_some());
    }

    Ok(())
}

/// Term, vote, log, and applied tables all survive a restart.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persistence_restart() -> Result<()> {
    let dir = TempDir::new()?;

    let node = Arc::new(RaftNode::new(
        test_config("p1", vec![]),
        Store::open(dir.path())?,
    )?);
    Arc::clone(&node).start().await;

    // A single-node cluster elects itself and commits alone.
    node.start_election().await;
    assert!(node.is_leader().await);

    for name in ["alice", "bob", "carol"] {
        let reply = node.propose(create_account_draft(name)).await.unwrap();
        assert!(matches!(reply, CommandReply::AccountCreated { .. }));
    }

    {
        let state = node.state.lock().await;
        assert_eq!(state.log.len(), 3);
        assert_eq!(state.commit_index, 2);
        assert_eq!(state.last_applied, 2);
    }

    // Drop the node (simulates process exit) and recover from the same dir.
    drop(node);
    let restarted = RaftNode::new(test_config("p1", vec![]), Store::open(dir.path())?)?;

    let state = restarted.state.lock().await;
    assert_eq!(state.current_term, 1);
    assert_eq!(state.voted_for, Some("p1".to_string()));
    assert_eq!(state.log.len(), 3);
    assert_eq!(state.commit_index, 2);
    assert_eq!(state.last_applied, 2);
    assert_eq!(state.chat.user_count(), 3);
    assert!(state.chat.user_by_name("alice").is_some());
    assert!(state.chat.user_by_name("carol").is_some());
    assert_eq!(state.next_user_id, 4);

    Ok(())
}
