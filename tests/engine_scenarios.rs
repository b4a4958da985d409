//! End-to-end dispatch scenarios against scripted collaborators
//!
//! Each test runs the real engine under tokio's paused clock; the mock
//! transport delivers frames at scripted instants, so ring races, caller
//! hangups, and penalty-rule timing are deterministic.

mod common;

use std::sync::Arc;
use std::time::Duration;

use acd_engine::api::Admin;
use acd_engine::prelude::*;

use common::{engine_with_mocks, Behavior, MockDialplan};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[tokio::test(start_paused = true)]
async fn ringall_two_members_first_answer_wins() {
    let (transport, _prompts, sink, engine) = engine_with_mocks();

    let mut config = QueueConfig::default();
    config.strategy = Strategy::RingAll;
    config.ring_timeout_secs = 10;
    config.retry_secs = 1;
    config.service_level_secs = 5;
    engine.queues().create("q", config).unwrap();

    let admin = Admin::new(engine.clone());
    admin.add_member("q", MemberSpec::dynamic("PJSIP/a")).await.unwrap();
    admin.add_member("q", MemberSpec::dynamic("PJSIP/b")).await.unwrap();

    transport.behavior("PJSIP/a", Behavior::AnswerAfter(secs(2)));
    transport.behavior("PJSIP/b", Behavior::NeverAnswer);
    transport.bridge_outcome("PJSIP/a", secs(30), BridgeEnd::CallerHungUp);

    let caller = transport.make_caller("caller-s1");
    let mut request = DispatchRequest::new(caller.clone(), "q");
    request.caller_uid = Some("c1".to_string());
    request.options.mark_answered_elsewhere = true;

    let outcome = engine.run(request).await.unwrap();
    assert!(
        matches!(outcome, DispatchOutcome::Bridged { ref interface, talk_secs: 30 } if interface == "PJSIP/a"),
        "unexpected outcome: {:?}",
        outcome
    );

    // Both members were rung in parallel.
    assert_eq!(transport.request_count("PJSIP/a"), 1);
    assert_eq!(transport.request_count("PJSIP/b"), 1);

    // The loser was hung up answered-elsewhere.
    let b_hangups = transport.hangups_matching("PJSIP/b");
    assert_eq!(b_hangups.len(), 1);
    assert!(b_hangups[0].1, "loser must be marked answered elsewhere");

    let connects = sink.lines_with_tag("CONNECT");
    assert_eq!(connects.len(), 1);
    assert!(connects[0].contains("PJSIP/a"));
    assert_eq!(sink.lines_with_tag("COMPLETECALLER").len(), 1);

    let summary = admin.summary("q").await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.completed_in_sl, 1);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(summary.waiting, 0);

    // Reservation balance: nothing stays committed after the call.
    assert!(engine.devices().committed_snapshot().is_empty());

    let stats = engine.stats().await;
    assert_eq!(stats.queues, 1);
    assert_eq!(stats.waiting_callers, 0);
    assert_eq!(stats.members, 2);
}

#[tokio::test(start_paused = true)]
async fn linear_skips_paused_and_busy_members() {
    let (transport, _prompts, _sink, engine) = engine_with_mocks();

    let mut config = QueueConfig::default();
    config.strategy = Strategy::Linear;
    config.ring_in_use = false;
    config.ring_timeout_secs = 5;
    config.retry_secs = 1;
    engine.queues().create("q", config).unwrap();

    let admin = Admin::new(engine.clone());
    let mut paused = MemberSpec::dynamic("PJSIP/a");
    paused.paused = true;
    admin.add_member("q", paused).await.unwrap();
    admin.add_member("q", MemberSpec::dynamic("PJSIP/b")).await.unwrap();
    admin.add_member("q", MemberSpec::dynamic("PJSIP/c")).await.unwrap();

    engine.devices().set_status("PJSIP/a", DeviceStatus::NotInUse);
    engine.devices().set_status("PJSIP/b", DeviceStatus::InUse);
    engine.devices().set_status("PJSIP/c", DeviceStatus::NotInUse);

    transport.behavior("PJSIP/c", Behavior::AnswerAfter(secs(1)));

    let caller = transport.make_caller("caller-s2");
    let outcome = engine.run(DispatchRequest::new(caller, "q")).await.unwrap();

    assert!(
        matches!(outcome, DispatchOutcome::Bridged { ref interface, .. } if interface == "PJSIP/c")
    );
    // The paused and in-use members never reached the transport.
    assert_eq!(transport.requested(), vec!["PJSIP/c".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn penalty_rule_widens_window_over_wait() {
    let (transport, _prompts, _sink, engine) = engine_with_mocks();

    let mut set = RuleSet::new("widen");
    set.add_rule(PenaltyRule {
        time_secs: 10,
        max_value: 5,
        min_value: 0,
        max_relative: true,
        min_relative: true,
    });
    engine.rules().insert(set);

    let mut config = QueueConfig::default();
    config.strategy = Strategy::RingAll;
    config.ring_timeout_secs = 4;
    config.retry_secs = 2;
    config.penalty_members_limit = 1;
    config.default_rule = Some("widen".to_string());
    engine.queues().create("q", config).unwrap();

    let admin = Admin::new(engine.clone());
    let mut near = MemberSpec::dynamic("PJSIP/a");
    near.penalty = 3;
    admin.add_member("q", near).await.unwrap();
    let mut far = MemberSpec::dynamic("PJSIP/b");
    far.penalty = 9;
    admin.add_member("q", far).await.unwrap();

    transport.behavior("PJSIP/a", Behavior::AnswerAfter(secs(1)));
    transport.behavior("PJSIP/b", Behavior::NeverAnswer);

    let caller = transport.make_caller("caller-s3");
    let mut request = DispatchRequest::new(caller, "q");
    request.caller_uid = Some("c3".to_string());
    request.timeout = Some(secs(30));
    // The caller starts accepting only penalty-0 members.
    request.min_penalty = Some(0);
    request.max_penalty = Some(0);

    let outcome = engine.run(request).await.unwrap();
    assert!(
        matches!(outcome, DispatchOutcome::Bridged { ref interface, .. } if interface == "PJSIP/a")
    );

    // Nobody was dialable until the rule fired at t=10.
    let admin_summary = admin.summary("q").await.unwrap();
    assert!(
        admin_summary.holdtime_avg_secs >= 2,
        "caller must have waited for the rule to fire, holdtime {}",
        admin_summary.holdtime_avg_secs
    );
    assert_eq!(transport.request_count("PJSIP/a"), 1);
    assert_eq!(transport.request_count("PJSIP/b"), 0);
}

#[tokio::test(start_paused = true)]
async fn caller_hangup_during_ring_counts_abandon() {
    let (transport, _prompts, sink, engine) = engine_with_mocks();

    let mut config = QueueConfig::default();
    config.strategy = Strategy::RingAll;
    config.ring_timeout_secs = 10;
    config.retry_secs = 1;
    engine.queues().create("q", config).unwrap();

    let admin = Admin::new(engine.clone());
    admin.add_member("q", MemberSpec::dynamic("PJSIP/a")).await.unwrap();
    admin.add_member("q", MemberSpec::dynamic("PJSIP/b")).await.unwrap();

    transport.behavior("PJSIP/a", Behavior::NeverAnswer);
    transport.behavior("PJSIP/b", Behavior::NeverAnswer);

    let caller = transport.make_caller("caller-s4");
    transport.schedule_frame(&caller, secs(3), Frame::Control(ControlKind::Hangup { cause: 16 }));

    let mut request = DispatchRequest::new(caller, "q");
    request.caller_uid = Some("c4".to_string());
    request.options.mark_answered_elsewhere = true;

    let outcome = engine.run(request).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Abandoned { cause: 16 });

    // Both outbounds were torn down.
    assert_eq!(transport.hangups_matching("PJSIP/a").len(), 1);
    assert_eq!(transport.hangups_matching("PJSIP/b").len(), 1);

    let summary = admin.summary("q").await.unwrap();
    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.waiting, 0);

    let abandons = sink.lines_with_tag("ABANDON");
    assert_eq!(abandons.len(), 1);
    // pos|opos|holdtime extras.
    let fields: Vec<&str> = abandons[0].split('|').collect();
    assert_eq!(&fields[5..], &["1", "1", "3"]);

    assert!(engine.devices().committed_snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn weight_preemption_blocks_lower_weight_queue() {
    let (transport, _prompts, _sink, engine) = engine_with_mocks();

    let mut high = QueueConfig::default();
    high.weight = 10;
    high.ring_timeout_secs = 10;
    high.retry_secs = 1;
    engine.queues().create("high", high).unwrap();

    let mut low = QueueConfig::default();
    low.weight = 0;
    low.ring_timeout_secs = 2;
    low.retry_secs = 1;
    engine.queues().create("low", low).unwrap();

    let admin = Admin::new(engine.clone());
    admin.add_member("high", MemberSpec::dynamic("PJSIP/m")).await.unwrap();
    admin.add_member("low", MemberSpec::dynamic("PJSIP/m")).await.unwrap();

    transport.behavior("PJSIP/m", Behavior::NeverAnswer);

    let high_caller = transport.make_caller("caller-high");
    let mut high_request = DispatchRequest::new(high_caller, "high");
    high_request.timeout = Some(secs(6));
    let high_engine = engine.clone();
    let high_task = tokio::spawn(async move { high_engine.run(high_request).await });

    // Let the high-weight queue claim the member first.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let low_caller = transport.make_caller("caller-low");
    let mut low_request = DispatchRequest::new(low_caller, "low");
    low_request.timeout = Some(secs(4));
    let low_outcome = engine.run(low_request).await.unwrap();

    assert_eq!(low_outcome, DispatchOutcome::Timeout);
    let high_outcome = high_task.await.unwrap().unwrap();
    assert_eq!(high_outcome, DispatchOutcome::Timeout);

    // Only the high-weight queue ever reached the transport for M.
    assert_eq!(transport.request_count("PJSIP/m"), 1);
}

#[tokio::test]
async fn realtime_reconcile_adds_and_sweeps() {
    let (_transport, _prompts, sink, engine) = engine_with_mocks();
    engine.queues().create("q", QueueConfig::default()).unwrap();
    let admin = Admin::new(engine.clone());

    let spec = |iface: &str, uid: &str| {
        let mut s = MemberSpec::dynamic(iface);
        s.provenance = Provenance::Realtime;
        s.realtime_uid = Some(uid.to_string());
        s
    };

    let first = admin
        .reconcile_realtime(
            "q",
            vec![spec("PJSIP/x", "u1"), spec("PJSIP/y", "u2"), spec("PJSIP/z", "u3")],
        )
        .await
        .unwrap();
    assert_eq!(first.added.len(), 3);

    let mut events = engine.events().subscribe();

    let second = admin
        .reconcile_realtime("q", vec![spec("PJSIP/y", "u2"), spec("PJSIP/w", "u4")])
        .await
        .unwrap();

    assert_eq!(second.added, vec!["PJSIP/w".to_string()]);
    assert_eq!(second.kept, vec!["PJSIP/y".to_string()]);
    let mut removed = second.removed.clone();
    removed.sort();
    assert_eq!(removed, vec!["PJSIP/x".to_string(), "PJSIP/z".to_string()]);

    assert_eq!(sink.lines_with_tag("REMOVEMEMBER").len(), 2);
    assert_eq!(sink.lines_with_tag("ADDMEMBER").len(), 4);

    // No spurious events for the unchanged member.
    let mut saw_y = false;
    while let Ok(event) = events.try_recv() {
        match &event.kind {
            QueueEventKind::MemberAdded { interface, .. }
            | QueueEventKind::MemberRemoved { interface, .. } => {
                if interface == "PJSIP/y" {
                    saw_y = true;
                }
            }
            _ => {}
        }
    }
    assert!(!saw_y, "unchanged realtime member must not emit events");

    let roster_len = {
        let queue = engine.queues().require("q").unwrap();
        let len = queue.data().members().read().await.len();
        len
    };
    assert_eq!(roster_len, 2);
}

#[tokio::test(start_paused = true)]
async fn autopause_all_pauses_member_everywhere() {
    let (transport, _prompts, sink, engine) = engine_with_mocks();

    let mut first = QueueConfig::default();
    first.strategy = Strategy::RingAll;
    first.ring_timeout_secs = 5;
    first.retry_secs = 2;
    first.autopause = AutopausePolicy::All;
    engine.queues().create("q1", first).unwrap();
    engine.queues().create("q2", QueueConfig::default()).unwrap();

    let admin = Admin::new(engine.clone());
    admin.add_member("q1", MemberSpec::dynamic("PJSIP/m")).await.unwrap();
    admin.add_member("q2", MemberSpec::dynamic("PJSIP/m")).await.unwrap();

    transport.behavior("PJSIP/m", Behavior::BusyAfter(secs(1)));

    let caller = transport.make_caller("caller-ap");
    let mut request = DispatchRequest::new(caller, "q1");
    request.timeout = Some(secs(4));
    let outcome = engine.run(request).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Timeout);

    for queue in ["q1", "q2"] {
        let summary = admin.summary(queue).await.unwrap();
        assert!(summary.members[0].paused, "member must be paused in {}", queue);
    }
    assert_eq!(sink.lines_with_tag("PAUSE").len(), 2);
    assert_eq!(sink.lines_with_tag("RINGNOANSWER").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn autopause_yes_pauses_only_originating_queue() {
    let (transport, _prompts, _sink, engine) = engine_with_mocks();

    let mut first = QueueConfig::default();
    first.strategy = Strategy::RingAll;
    first.ring_timeout_secs = 5;
    first.retry_secs = 2;
    first.autopause = AutopausePolicy::Yes;
    engine.queues().create("q1", first).unwrap();
    engine.queues().create("q2", QueueConfig::default()).unwrap();

    let admin = Admin::new(engine.clone());
    admin.add_member("q1", MemberSpec::dynamic("PJSIP/m")).await.unwrap();
    admin.add_member("q2", MemberSpec::dynamic("PJSIP/m")).await.unwrap();

    transport.behavior("PJSIP/m", Behavior::BusyAfter(secs(1)));

    let caller = transport.make_caller("caller-ap2");
    let mut request = DispatchRequest::new(caller, "q1");
    request.timeout = Some(secs(4));
    engine.run(request).await.unwrap();

    assert!(admin.summary("q1").await.unwrap().members[0].paused);
    assert!(!admin.summary("q2").await.unwrap().members[0].paused);
}

#[tokio::test(start_paused = true)]
async fn call_forward_is_honored_and_tracked() {
    let (transport, _prompts, sink, engine) = engine_with_mocks();

    let mut config = QueueConfig::default();
    config.strategy = Strategy::RingAll;
    config.ring_timeout_secs = 10;
    config.retry_secs = 1;
    engine.queues().create("q", config).unwrap();

    let admin = Admin::new(engine.clone());
    admin.add_member("q", MemberSpec::dynamic("PJSIP/a")).await.unwrap();

    transport.behavior("PJSIP/a", Behavior::ForwardAfter(secs(1), "PJSIP/cell".to_string()));
    transport.behavior("PJSIP/cell", Behavior::AnswerAfter(secs(1)));

    let caller = transport.make_caller("caller-fwd");
    let mut request = DispatchRequest::new(caller, "q");
    request.extension = Some("7001".to_string());
    request.caller_id = Some(PartyInfo {
        number: Some("5550001".to_string()),
        name: Some("Ada".to_string()),
    });
    let outcome = engine.run(request).await.unwrap();

    // The member's attempt survives the forward and wins on the new leg.
    assert!(
        matches!(outcome, DispatchOutcome::Bridged { ref interface, .. } if interface == "PJSIP/a")
    );
    assert_eq!(transport.request_count("PJSIP/a"), 1);
    assert_eq!(transport.request_count("PJSIP/cell"), 1);
    assert_eq!(sink.lines_with_tag("CONNECT").len(), 1);

    // The forwarded leg learned the dialed extension and the caller's id.
    let updates = transport.party_updates();
    assert!(updates.iter().any(|(channel, kind, party)| {
        channel.contains("PJSIP/cell")
            && kind == "redirecting"
            && party.number.as_deref() == Some("7001")
    }));
    assert!(updates.iter().any(|(channel, kind, party)| {
        channel.contains("PJSIP/cell")
            && kind == "connected"
            && party.number.as_deref() == Some("5550001")
    }));

    assert!(engine.devices().committed_snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exit_digits_leave_through_the_dialplan() {
    let transport = common::MockTransport::new();
    let sink = Arc::new(MemorySink::new());
    let dialplan = Arc::new(MockDialplan::new());
    dialplan.extension("queue-exits", "0");

    let engine = DispatcherBuilder::new(transport.clone(), Arc::new(common::MockPrompts::new()))
        .dialplan(dialplan)
        .audit_sink(sink.clone())
        .build();

    let mut config = QueueConfig::default();
    config.ring_timeout_secs = 5;
    config.retry_secs = 1;
    engine.queues().create("q", config).unwrap();
    // No members: the caller just waits.

    let caller = transport.make_caller("caller-exit");
    transport.schedule_frame(&caller, secs(2), Frame::Dtmf('0'));

    let mut request = DispatchRequest::new(caller, "q");
    request.timeout = Some(secs(30));
    request.options.exit_context = Some("queue-exits".to_string());

    let outcome = engine.run(request).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::ExitWithDigits("0".to_string()));
    assert_eq!(sink.lines_with_tag("EXITWITHKEY").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_queue_refuses_next_caller() {
    let (transport, _prompts, _sink, engine) = engine_with_mocks();

    let mut config = QueueConfig::default();
    config.maxlen = 1;
    config.ring_timeout_secs = 5;
    config.retry_secs = 1;
    engine.queues().create("q", config).unwrap();
    // No members: the first caller waits, the second bounces.

    let first = transport.make_caller("caller-one");
    let mut first_request = DispatchRequest::new(first, "q");
    first_request.timeout = Some(secs(10));
    let waiting_engine = engine.clone();
    let waiting = tokio::spawn(async move { waiting_engine.run(first_request).await });

    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = transport.make_caller("caller-two");
    let outcome = engine.run(DispatchRequest::new(second, "q")).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Full);

    assert_eq!(waiting.await.unwrap().unwrap(), DispatchOutcome::Timeout);
}

#[tokio::test]
async fn join_empty_policy_refuses_callers() {
    let (transport, _prompts, _sink, engine) = engine_with_mocks();

    let mut config = QueueConfig::default();
    config.join_empty = EmptyCheck::enabled(EmptyConditions::strict());
    engine.queues().create("q", config).unwrap();

    // No members at all: JOINEMPTY.
    let caller = transport.make_caller("caller-je");
    let outcome = engine.run(DispatchRequest::new(caller, "q")).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::JoinEmpty);

    // A member exists but is paused: JOINUNAVAIL under strict conditions.
    let admin = Admin::new(engine.clone());
    let mut paused = MemberSpec::dynamic("PJSIP/a");
    paused.paused = true;
    admin.add_member("q", paused).await.unwrap();

    let caller = transport.make_caller("caller-ju");
    let outcome = engine.run(DispatchRequest::new(caller, "q")).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::JoinUnavail);
}

#[tokio::test]
async fn dynamic_members_persist_round_trip() {
    let transport = common::MockTransport::new();
    let prompts = Arc::new(common::MockPrompts::new());
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    let mut engine_config = EngineConfig::default();
    engine_config.persist_dynamic_members = true;

    let engine = DispatcherBuilder::new(transport.clone(), prompts.clone())
        .config(engine_config.clone())
        .kv_store(kv.clone())
        .build();
    engine.queues().create("q", QueueConfig::default()).unwrap();

    let admin = Admin::new(engine.clone());
    let mut spec = MemberSpec::dynamic("PJSIP/alice");
    spec.penalty = 4;
    admin.add_member("q", spec).await.unwrap();
    admin.pause_member(Some("q"), "PJSIP/alice", true, Some("lunch")).await.unwrap();

    // A fresh engine over the same store restores the member as dumped.
    let transport2 = common::MockTransport::new();
    let restored = DispatcherBuilder::new(transport2, Arc::new(common::MockPrompts::new()))
        .config(engine_config)
        .kv_store(kv)
        .build();
    restored.queues().create("q", QueueConfig::default()).unwrap();
    let restored_admin = Admin::new(restored.clone());
    assert_eq!(restored_admin.load_persisted_members("q").await.unwrap(), 1);

    let summary = restored_admin.summary("q").await.unwrap();
    assert_eq!(summary.members.len(), 1);
    let member = &summary.members[0];
    assert_eq!(member.interface, "PJSIP/alice");
    assert_eq!(member.penalty, 4);
    assert!(member.paused);
    assert_eq!(member.provenance, Provenance::Dynamic);
}
