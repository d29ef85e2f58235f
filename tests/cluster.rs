//! Multi-node integration scenarios driven through in-process agents. The
//! harness plays the role of the external election: it spawns proposers,
//! announces term ends, and flips peer liveness.

use std::collections::{HashMap, HashSet};

use conclave::{
    spawn_agent, spawn_server, AgentCore, AgentHub, Branch, BranchStatus,
    Config, ConclaveError, EventBus, KvCommand, KvMachine, KvQuery,
    KvResult, Liveness, LocalAgent, MachineSpec, NodeId, Proposer,
    ProposerClient, ProposerExit, ProposerReply, ReadKind, RsmError,
    RsmHandle, RsmRuntime, Seqno, ServerHandle, Term,
};

use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

const KV: &str = "kv";

struct TestNode {
    agent: LocalAgent,
    server: ServerHandle,
    kv: RsmHandle,
}

struct TestCluster {
    nodes: HashMap<NodeId, TestNode>,
    agents: HashMap<NodeId, LocalAgent>,
    liveness: Liveness,
}

fn cluster_config(voters: &[NodeId]) -> Config {
    Config {
        voters: voters.iter().copied().collect(),
        machines: HashMap::from([(
            KV.to_string(),
            MachineSpec {
                module: KV.to_string(),
            },
        )]),
    }
}

/// Builds a cluster of `ids` nodes, every agent provisioned with the same
/// initial voter set, every node running a server and a kv runtime.
async fn make_cluster(
    ids: &[NodeId],
    voters: &[NodeId],
    history: &str,
) -> Result<TestCluster, ConclaveError> {
    let _ = env_logger::builder().is_test(true).try_init();

    let liveness = Liveness::new(ids.iter().copied().collect());
    let mut nodes = HashMap::new();
    let mut agents = HashMap::new();

    for &id in ids {
        let events = EventBus::new();
        let core = AgentCore::provision(
            id,
            history.to_string(),
            cluster_config(voters),
            events.clone(),
            None,
        )
        .await?;
        let agent = spawn_agent(core);
        let server = spawn_server(id, events.clone());

        let (mut runtime, kv) = RsmRuntime::new_and_setup(
            KV.to_string(),
            KvMachine::new(),
            server.clone(),
            agent.clone(),
            &events,
            None,
        )
        .await?;
        tokio::spawn(async move {
            let _ = runtime.run().await;
        });

        agents.insert(id, agent.clone());
        nodes.insert(id, TestNode { agent, server, kv });
    }

    Ok(TestCluster {
        nodes,
        agents,
        liveness,
    })
}

impl TestCluster {
    fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[&id]
    }

    /// Spawns a proposer for `(history, term)` on the given node, playing
    /// the part of the election service.
    fn elect(
        &self,
        leader: NodeId,
        term: Term,
        history: &str,
    ) -> (
        ProposerClient,
        JoinHandle<Result<ProposerExit, ConclaveError>>,
    ) {
        let node = self.node(leader);
        let hub = AgentHub::new(leader, &self.agents);
        let (mut proposer, client) = Proposer::new_and_setup(
            leader,
            history.to_string(),
            term,
            node.server.clone(),
            node.agent.clone(),
            hub,
            self.liveness.clone(),
            None,
        )
        .expect("proposer setup failed");
        node.server.register_proposer(client.clone());
        let handle = tokio::spawn(async move { proposer.run().await });
        (client, handle)
    }

    /// Waits until the kv runtime on the given node acts as leader.
    async fn wait_leader(&self, id: NodeId) -> (String, Seqno) {
        for _ in 0..200 {
            match self.node(id).kv.applied_revision(ReadKind::Leader).await
            {
                Ok(revision) => return revision,
                Err(RsmError::NotLeader) => {
                    time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => panic!("applied_revision failed: {}", e),
            }
        }
        panic!("node {} never became leader", id);
    }

    async fn put(
        &self,
        id: NodeId,
        key: &str,
        value: &str,
    ) -> Result<KvResult, RsmError> {
        let payload = KvCommand::Put {
            key: key.into(),
            value: value.into(),
        }
        .encode()
        .map_err(|e| RsmError::Internal(e.0))?;
        let reply = self.node(id).kv.command(payload).await?;
        KvResult::decode(&reply).map_err(|e| RsmError::Internal(e.0))
    }

    async fn get(&self, id: NodeId, key: &str) -> Option<String> {
        let payload = KvQuery::Get { key: key.into() }.encode().unwrap();
        let reply = self.node(id).kv.query(payload).await.unwrap();
        match KvResult::decode(&reply).unwrap() {
            KvResult::Get { value } => value,
            other => panic!("unexpected query result {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_append_commit() -> Result<(), ConclaveError> {
    let cluster = make_cluster(&[0, 1, 2], &[0, 1, 2], "h0").await?;
    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;

    assert_eq!(
        cluster.put(0, "x", "ex").await.unwrap(),
        KvResult::Put { old_value: None }
    );
    assert_eq!(
        cluster.put(0, "y", "why").await.unwrap(),
        KvResult::Put { old_value: None }
    );

    // both entries applied in order at seqnos 1 and 2
    let (history, seqno) = cluster
        .node(0)
        .kv
        .applied_revision(ReadKind::Leader)
        .await
        .unwrap();
    assert_eq!(history, "h0");
    assert_eq!(seqno, 2);

    // quorum-synced read confirms leadership still stands
    let (_, seqno) = cluster
        .node(0)
        .kv
        .applied_revision(ReadKind::Quorum)
        .await
        .unwrap();
    assert!(seqno >= 2);

    // followers eventually apply the same entries
    for id in [1, 2] {
        cluster
            .node(id)
            .kv
            .sync_revision("h0".into(), 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cluster.get(id, "x").await, Some("ex".into()));
        assert_eq!(cluster.get(id, "y").await, Some("why".into()));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_applies_in_order() -> Result<(), ConclaveError> {
    let cluster = make_cluster(&[0], &[0], "h0").await?;
    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;

    // pipeline several writes to one key; replies must reflect submission
    // order exactly
    let mut pending = Vec::new();
    for i in 0..10u32 {
        let payload = KvCommand::Put {
            key: "k".into(),
            value: format!("v{}", i),
        }
        .encode()?;
        let kv = cluster.node(0).kv.clone();
        pending.push((i, kv, payload));
    }
    let mut replies = Vec::new();
    for (i, kv, payload) in pending {
        replies.push((i, kv.command(payload).await.unwrap()));
    }
    for (i, reply) in replies {
        let expected = if i == 0 {
            KvResult::Put { old_value: None }
        } else {
            KvResult::Put {
                old_value: Some(format!("v{}", i - 1)),
            }
        };
        assert_eq!(KvResult::decode(&reply).unwrap(), expected);
    }

    let (_, seqno) = cluster
        .node(0)
        .kv
        .applied_revision(ReadKind::Leader)
        .await
        .unwrap();
    assert_eq!(seqno, 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_submission_gets_distinct_slots(
) -> Result<(), ConclaveError> {
    let cluster = make_cluster(&[0], &[0], "h0").await?;
    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;

    // the same command object twice: two log entries, two replies
    assert_eq!(
        cluster.put(0, "k", "same").await.unwrap(),
        KvResult::Put { old_value: None }
    );
    assert_eq!(
        cluster.put(0, "k", "same").await.unwrap(),
        KvResult::Put {
            old_value: Some("same".into())
        }
    );
    let (_, seqno) = cluster
        .node(0)
        .kv
        .applied_revision(ReadKind::Leader)
        .await
        .unwrap();
    assert_eq!(seqno, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cas_config_revision_mismatch() -> Result<(), ConclaveError> {
    let cluster = make_cluster(&[0, 1, 2], &[0, 1, 2], "h0").await?;
    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;

    let meta = cluster.node(0).agent.get_metadata().await?;
    let current = meta.member_config.revision.clone();
    let high_before = meta.high_seqno;

    // expected revision is stale (wrong seqno)
    let mut stale = current.clone();
    stale.seqno += 7;
    let reply = cluster
        .node(0)
        .server
        .cas_config(stale, cluster_config(&[0, 1]))
        .await?;
    assert_eq!(reply, ProposerReply::CasFailed(current));

    // no log entry was appended for the failed request
    let meta = cluster.node(0).agent.get_metadata().await?;
    assert_eq!(meta.high_seqno, high_before);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joint_transition_swaps_voter() -> Result<(), ConclaveError> {
    // four agents share the history; node 3 starts outside the voter set
    let cluster = make_cluster(&[0, 1, 2, 3], &[0, 1, 2], "h0").await?;
    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;

    let expected = cluster
        .node(0)
        .agent
        .get_metadata()
        .await?
        .member_config
        .revision;
    let reply = cluster
        .node(0)
        .server
        .cas_config(expected, cluster_config(&[0, 1, 3]))
        .await?;
    // transition entry at seqno 1, stable config at seqno 2
    match reply {
        ProposerReply::ConfigOk(revision) => {
            assert_eq!(revision.history, "h0");
            assert_eq!(revision.seqno, 2);
        }
        other => panic!("unexpected cas reply {:?}", other),
    }

    // the leader's own agent learns the commit through its next append;
    // poll briefly for it
    let mut committed = 0;
    for _ in 0..100 {
        let meta = cluster.node(0).agent.get_metadata().await?;
        committed = meta.committed_seqno;
        if committed >= 2 {
            assert_eq!(
                meta.member_config.current().voters,
                HashSet::from([0, 1, 3])
            );
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(committed, 2);

    // the cluster still commits under the new voter set
    assert_eq!(
        cluster.put(0, "post", "transition").await.unwrap(),
        KvResult::Put { old_value: None }
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_revision_times_out() -> Result<(), ConclaveError> {
    let cluster = make_cluster(&[0, 1, 2], &[0, 1, 2], "h0").await?;
    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;
    cluster.put(0, "a", "1").await.unwrap();

    // seqno 9 will not apply within the timeout
    let result = cluster
        .node(1)
        .kv
        .sync_revision("h0".into(), 9, Duration::from_millis(50))
        .await;
    assert_eq!(result, Err(RsmError::Timeout));

    // wrong history is refused outright
    let result = cluster
        .node(1)
        .kv
        .sync_revision("h9".into(), 1, Duration::from_millis(50))
        .await;
    assert_eq!(result, Err(RsmError::HistoryMismatch));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn establish_with_minority_down() -> Result<(), ConclaveError> {
    let cluster =
        make_cluster(&[0, 1, 2, 3, 4], &[0, 1, 2, 3, 4], "h0").await?;
    // two of five unreachable: {0, 3, 4} can still form a majority
    cluster.liveness.mark_down(1);
    cluster.liveness.mark_down(2);

    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;
    assert_eq!(
        cluster.put(0, "k", "v").await.unwrap(),
        KvResult::Put { old_value: None }
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn establish_without_quorum_stops() -> Result<(), ConclaveError> {
    let cluster =
        make_cluster(&[0, 1, 2, 3, 4], &[0, 1, 2, 3, 4], "h0").await?;
    // three of five unreachable: {0, 3} cannot reach a majority
    cluster.liveness.mark_down(1);
    cluster.liveness.mark_down(2);
    cluster.liveness.mark_down(4);

    let (_, handle) = cluster.elect(0, Term::new(1, 0), "h0");
    let exit = handle.await.unwrap()?;
    assert_eq!(exit, ProposerExit::NoQuorum);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn branch_failover_to_survivors() -> Result<(), ConclaveError> {
    let cluster = make_cluster(&[0, 1, 2], &[0, 1, 2], "h0").await?;
    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;
    cluster.put(0, "pre", "branch").await.unwrap();
    let committed_before =
        cluster.node(0).agent.get_metadata().await?.committed_seqno;

    // node 2 is lost for good; the old term ends
    cluster.liveness.mark_down(2);
    cluster
        .node(0)
        .server
        .term_finished("h0".into(), Term::new(1, 0));

    // failover tooling installs the branch on the unanimous survivors
    let branch = Branch {
        history: "h1".into(),
        coordinator: 0,
        peers: HashSet::from([0, 1]),
        status: BranchStatus::Pending,
        opaque: vec![],
    };
    for id in [0, 1] {
        cluster
            .node(id)
            .agent
            .set_pending_branch(Some(branch.clone()))
            .await?;
    }

    cluster.elect(0, Term::new(2, 0), "h1");
    cluster.wait_leader(0).await;

    // the surviving pair keeps committing; this put also forces the forced
    // config entry (one slot below it) to be fully committed and applied
    assert_eq!(
        cluster.put(0, "post", "branch").await.unwrap(),
        KvResult::Put { old_value: None }
    );

    // the forced config landed right above the unanimous commit and the
    // branch is gone
    let meta = cluster.node(0).agent.get_metadata().await?;
    assert_eq!(meta.history, "h1");
    assert_eq!(meta.pending_branch, None);
    assert_eq!(meta.member_config.current().voters, HashSet::from([0, 1]));
    assert_eq!(meta.member_config.revision.seqno, committed_before + 1);
    // node 1 reports a history mismatch until it applies the forced config
    // entry that opens h1; retry until it has crossed over
    let mut synced = false;
    for _ in 0..100 {
        match cluster
            .node(1)
            .kv
            .sync_revision(
                "h1".into(),
                committed_before + 2,
                Duration::from_secs(1),
            )
            .await
        {
            Ok(()) => {
                synced = true;
                break;
            }
            Err(RsmError::HistoryMismatch) => {
                time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("sync_revision failed: {}", e),
        }
    }
    assert!(synced);
    assert_eq!(cluster.get(1, "pre").await, Some("branch".into()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_rejects_commands() -> Result<(), ConclaveError> {
    let cluster = make_cluster(&[0, 1, 2], &[0, 1, 2], "h0").await?;
    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;

    let result = cluster.put(1, "k", "v").await;
    assert_eq!(result, Err(RsmError::NotLeader));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn term_end_flushes_pending_commands() -> Result<(), ConclaveError> {
    let cluster = make_cluster(&[0, 1, 2], &[0, 1, 2], "h0").await?;
    cluster.elect(0, Term::new(1, 0), "h0");
    cluster.wait_leader(0).await;

    // cut both followers off so the next command cannot commit; the entry
    // lands in the leader's log but never reaches a majority
    cluster.liveness.mark_down(1);
    cluster.liveness.mark_down(2);

    let kv = cluster.node(0).kv.clone();
    let payload = KvCommand::Put {
        key: "stuck".into(),
        value: "never".into(),
    }
    .encode()?;
    let pending = tokio::spawn(async move { kv.command(payload).await });

    // the command stays pending until the election declares the term over
    time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());
    cluster
        .node(0)
        .server
        .term_finished("h0".into(), Term::new(1, 0));

    let result = pending.await.unwrap();
    assert_eq!(result, Err(RsmError::LeaderGone));
    Ok(())
}
