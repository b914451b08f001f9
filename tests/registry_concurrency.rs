//! Registry and machine directory behavior under concurrent connection
//! traffic.
//!
//! Each test drives the shared tables from several OS threads with randomized
//! operation orders, then checks the tables agree with each other once every
//! thread has finished.

mod common;

use common::RecordingTransport;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Barrier};
use std::thread;

use relayhub::machine::MachineDirectory;
use relayhub::protocol::CommandKind;
use relayhub::registry::Registry;
use relayhub::session::Session;
use relayhub::transport::ConnId;

const ACTIONS: [&str; 3] = ["build", "test", "deploy"];

fn registry() -> (Registry, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    (Registry::new(transport.clone()), transport)
}

/// Every session is either live and tracked everywhere, or cancelled and
/// tracked nowhere.
fn assert_consistent(registry: &Registry, sessions: &[Session]) {
    for session in sessions {
        let in_client = registry
            .client(session.connection)
            .is_some_and(|c| c.contains(session.id));
        let in_index = registry
            .actions()
            .snapshot(&session.action)
            .iter()
            .any(|s| s.id == session.id);
        let routable = registry.find_session(session.id).is_some();

        if session.is_cancelled() {
            assert!(!in_client, "cancelled session {} still owned", session.id);
            assert!(!in_index, "cancelled session {} still indexed", session.id);
            assert!(!routable, "cancelled session {} still routable", session.id);
        } else {
            assert!(in_client, "live session {} lost by its client", session.id);
            assert!(in_index, "live session {} missing from index", session.id);
            assert!(routable, "live session {} not routable", session.id);
        }
    }
}

#[test]
fn interleaved_begin_end_cancel_on_one_client() {
    let (registry, _transport) = registry();
    let client = registry.on_frontend_connect(ConnId(1));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|seed| {
            let registry = registry.clone();
            let client = client.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                let mut mine: Vec<Session> = Vec::new();
                let mut all = Vec::new();
                barrier.wait();
                for _ in 0..500 {
                    match rng.gen_range(0..4) {
                        0 | 1 => {
                            let action = ACTIONS[rng.gen_range(0..ACTIONS.len())];
                            let session = registry.begin_action(&client, action);
                            mine.push(session.clone());
                            all.push(session);
                        }
                        2 if !mine.is_empty() => {
                            let session = mine.swap_remove(rng.gen_range(0..mine.len()));
                            assert!(registry.end_action(&session));
                            assert!(!registry.end_action(&session), "second end must be a no-op");
                        }
                        3 if !mine.is_empty() => {
                            let session = mine.swap_remove(rng.gen_range(0..mine.len()));
                            assert!(registry.cancel_session(&client, session.id));
                            assert!(!registry.cancel_session(&client, session.id));
                        }
                        _ => {}
                    }
                }
                (mine, all)
            })
        })
        .collect();

    let mut live = Vec::new();
    let mut all = Vec::new();
    for handle in handles {
        let (mine, sessions) = handle.join().unwrap();
        live.extend(mine);
        all.extend(sessions);
    }

    assert_eq!(client.len(), live.len());
    for session in &live {
        assert!(!session.is_cancelled());
    }
    for action in ACTIONS {
        let expected = live.iter().filter(|s| &*s.action == action).count();
        assert_eq!(registry.active_count(action), expected, "active count for {action}");
    }
    assert_eq!(registry.tracked_sessions(), live.len());
    assert_consistent(&registry, &all);
}

#[test]
fn cancel_action_races_begin_action() {
    for round in 0..20u64 {
        let (registry, transport) = registry();
        let clients: Vec<_> = (1..=4)
            .map(|n| registry.on_frontend_connect(ConnId(n)))
            .collect();
        let barrier = Arc::new(Barrier::new(clients.len() + 1));

        let starters: Vec<_> = clients
            .iter()
            .cloned()
            .map(|client| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (0..100)
                        .map(|_| registry.begin_action(&client, "build"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let canceller = {
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(round);
                barrier.wait();
                let mut cancelled = 0;
                for _ in 0..50 {
                    cancelled += registry.cancel_action("build");
                    if rng.gen_bool(0.5) {
                        thread::yield_now();
                    }
                }
                cancelled
            })
        };

        let sessions: Vec<Session> = starters
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let cancelled = canceller.join().unwrap();

        let still_running = sessions.iter().filter(|s| !s.is_cancelled()).count();
        assert_eq!(cancelled + still_running, sessions.len(), "round {round}");
        assert_eq!(registry.active_count("build"), still_running);
        assert_consistent(&registry, &sessions);

        // One notice per cancelled session.
        let notices = transport
            .sent()
            .iter()
            .filter(|(_, kind, _)| *kind == CommandKind::CancelRequest)
            .count();
        assert!(notices >= cancelled);
    }
}

#[test]
fn disconnect_races_cancellation_traffic() {
    for round in 0..20u64 {
        let (registry, _transport) = registry();
        let client = registry.on_frontend_connect(ConnId(7));
        let sessions: Vec<Session> = (0..200)
            .map(|i| registry.begin_action(&client, ACTIONS[i % ACTIONS.len()]))
            .collect();
        let barrier = Arc::new(Barrier::new(3));

        let canceller = {
            let registry = registry.clone();
            let client = client.clone();
            let ids: Vec<_> = sessions.iter().map(|s| s.id).collect();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(round);
                barrier.wait();
                for id in ids {
                    if rng.gen_bool(0.3) {
                        registry.cancel_action(ACTIONS[rng.gen_range(0..ACTIONS.len())]);
                    } else {
                        registry.cancel_session(&client, id);
                    }
                }
            })
        };
        let late_starter = {
            let registry = registry.clone();
            let client = client.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..50)
                    .map(|_| registry.begin_action(&client, "build"))
                    .collect::<Vec<_>>()
            })
        };

        barrier.wait();
        registry.on_frontend_disconnect(ConnId(7));

        canceller.join().unwrap();
        let late = late_starter.join().unwrap();

        // Everything begun before the disconnect is gone; anything begun
        // after it is cancelled and never tracked.
        let all: Vec<Session> = sessions.into_iter().chain(late).collect();
        for session in &all {
            assert!(session.is_cancelled(), "round {round}: session {} survived", session.id);
        }
        assert_consistent(&registry, &all);
        assert_eq!(registry.tracked_sessions(), 0);
        assert!(registry.actions().is_empty());
        assert!(registry.client(ConnId(7)).is_none());
    }
}

#[test]
fn cancel_action_across_clients_then_zero_active() {
    let (registry, transport) = registry();
    let c1 = registry.on_frontend_connect(ConnId(1));
    let c2 = registry.on_frontend_connect(ConnId(2));
    let s1 = registry.begin_action(&c1, "build");
    let s2 = registry.begin_action(&c2, "build");

    assert_eq!(registry.cancel_action("build"), 2);

    assert!(!c1.contains(s1.id));
    assert!(!c2.contains(s2.id));
    assert_eq!(registry.active_count("build"), 0);
    assert_eq!(transport.sent_to(ConnId(1)), vec![CommandKind::CancelRequest]);
    assert_eq!(transport.sent_to(ConnId(2)), vec![CommandKind::CancelRequest]);
}

#[test]
fn broadcast_survives_one_failing_client() {
    let (registry, transport) = registry();
    for n in 1..=3 {
        registry.on_frontend_connect(ConnId(n));
    }
    transport.fail_for(ConnId(2));

    let report = registry.broadcast_to_frontends("notice", b"maintenance at noon");

    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, ConnId(2));
    assert_eq!(transport.sent_to(ConnId(1)), vec![CommandKind::Broadcast]);
    assert_eq!(transport.sent_to(ConnId(3)), vec![CommandKind::Broadcast]);
    assert_eq!(registry.clients().len(), 3);
}

#[test]
fn concurrent_worker_churn_keeps_directory_consistent() {
    let directory = MachineDirectory::new();
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let directory = directory.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + t as u64);
                barrier.wait();
                for i in 0..300u64 {
                    let conn = ConnId(t as u64 * 10_000 + i);
                    let group = format!("g{}", rng.gen_range(0..3));
                    let nickname = format!("w{}", rng.gen_range(0..4));
                    directory.register(&group, &nickname, conn);
                    if rng.gen_bool(0.6) {
                        directory.unregister(conn);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Forward and reverse views agree, and no empty group lingers.
    let overview = directory.overview();
    let mut forward = 0;
    for (group, nicknames) in &overview {
        assert!(!nicknames.is_empty(), "empty group {group} not pruned");
        for nickname in nicknames {
            let machine = directory.lookup(group, nickname).unwrap();
            assert!(machine.is_connected());
            let back = directory
                .lookup_by_connection(machine.connection)
                .expect("reverse entry for live machine");
            assert_eq!(&back.group, group);
            assert_eq!(&back.nickname, nickname);
            forward += 1;
        }
    }
    assert_eq!(forward, directory.len());
}

#[test]
fn group_pruned_only_when_last_member_leaves() {
    let directory = MachineDirectory::new();
    directory.register("groupA", "w1", ConnId(1));
    directory.unregister(ConnId(1));
    assert!(!directory.has_group("groupA"));

    directory.register("groupA", "w1", ConnId(2));
    directory.register("groupA", "w2", ConnId(3));
    directory.unregister(ConnId(2));
    assert!(directory.has_group("groupA"));
    assert_eq!(directory.lookup_group("groupA").len(), 1);
}
