//! Engine level behaviour: wrap-up, statistics, configuration and shutdown

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pretty_assertions::assert_eq;
use rvoip_hunt_engine::events::MemberChange;
use rvoip_hunt_engine::prelude::*;
use rvoip_hunt_engine::StatisticsAggregator;

#[tokio::test(start_paused = true)]
async fn wrap_up_holds_member_until_it_elapses() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::answering();
    let group = HuntGroup::new("sales", "600", HuntType::Linear).with_wrap_up(30);
    let engine = engine_for(group, vec![Member::new("alice", "1001", 1)], &telephony).await?;
    let alice: MemberId = "alice".into();

    let first = InboundCall::new("sales", "+15550001");
    let first_id = first.call_id.clone();
    engine.handle_inbound_call(first).await?.outcome().await?;
    assert_eq!(engine.connected_call_count(), 1);

    engine.call_ended(&first_id)?;
    let state = engine.member_state(&alice)?.state;
    assert!(state.in_wrap_up());
    assert_eq!(state.current_calls, 1);
    assert_eq!(engine.connected_call_count(), 0);

    let during = engine
        .handle_inbound_call(InboundCall::new("sales", "+15550002"))
        .await?
        .outcome()
        .await?;
    assert!(matches!(during, SessionOutcome::Escalated { reason: EscalationReason::NoCandidateAvailable, .. }));

    tokio::time::sleep(Duration::from_secs(31)).await;
    let state = engine.member_state(&alice)?.state;
    assert!(!state.in_wrap_up());
    assert_eq!(state.current_calls, 0);
    assert_eq!(state.calls_handled_today, 1);

    let after = engine
        .handle_inbound_call(InboundCall::new("sales", "+15550003"))
        .await?
        .outcome()
        .await?;
    assert!(matches!(after, SessionOutcome::Connected { .. }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hang_up_after_answer_ends_the_call() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::answering();
    let group = HuntGroup::new("sales", "600", HuntType::Linear);
    let engine = engine_for(group, three_members(), &telephony).await?;

    let call = InboundCall::new("sales", "+15550001");
    let call_id = call.call_id.clone();
    engine.handle_inbound_call(call).await?.outcome().await?;
    assert_eq!(engine.member_state(&"alice".into())?.state.current_calls, 1);

    engine.cancel_call(&call_id)?;
    assert_eq!(engine.member_state(&"alice".into())?.state.current_calls, 0);
    assert!(engine.call_ended(&call_id).is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn statistics_follow_session_outcomes() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::answering();
    telephony.script("1001", [Script::Busy]);
    telephony.script("1002", [Script::NoAnswer]);

    let group = HuntGroup::new("sales", "600", HuntType::Linear);
    let engine = engine_for(group, three_members(), &telephony).await?;
    let sales: HuntGroupId = "sales".into();

    let answered = InboundCall::new("sales", "+15550001");
    let answered_id = answered.call_id.clone();
    engine.handle_inbound_call(answered).await?.outcome().await?;
    engine.call_ended(&answered_id)?;

    engine.set_member_availability(&"alice".into(), false)?;
    engine.set_member_availability(&"bob".into(), false)?;
    engine.set_member_availability(&"carol".into(), false)?;
    engine
        .handle_inbound_call(InboundCall::new("sales", "+15550002"))
        .await?
        .outcome()
        .await?;
    settle().await;

    let stats = engine.stats(&sales);
    assert_eq!(stats.total_sessions, 2);
    assert_eq!(stats.calls_handled, 1);
    assert_eq!(stats.calls_escalated, 1);
    assert_eq!(stats.ring_attempts, 3);
    assert_eq!(stats.busies, 1);
    assert_eq!(stats.no_answers, 1);
    assert_eq!(stats.members[&MemberId::new("carol")].answered, 1);
    assert_eq!(stats.members[&MemberId::new("alice")].offered, 1);
    assert_eq!(stats.abandon_rate(), 0.0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn replayed_events_do_not_change_statistics() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::answering();
    telephony.script("1001", [Script::NoAnswer]);
    let group = HuntGroup::new("sales", "600", HuntType::Linear);
    let engine = engine_for(group, three_members(), &telephony).await?;
    let mut rx = engine.subscribe_events();

    engine
        .handle_inbound_call(InboundCall::new("sales", "+15550001"))
        .await?
        .outcome()
        .await?;
    let events = drain(&mut rx);
    assert!(!events.is_empty());

    let once = StatisticsAggregator::default();
    let twice = StatisticsAggregator::default();
    for event in &events {
        once.ingest(event);
        twice.ingest(event);
    }
    for event in events.iter().rev() {
        assert!(!twice.ingest(event));
    }

    let sales: HuntGroupId = "sales".into();
    assert_eq!(once.today(&sales), twice.today(&sales));
    assert_eq!(twice.ignored_events(), events.len() as u64);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn engine_from_toml_configuration() -> anyhow::Result<()> {
    let config = HuntEngineConfig::from_toml_str(
        r#"
[general]
telephony_retry_attempts = 0

[[groups]]
id = "sales"
extension = "600"
hunt_type = "circular"
ring_timeout_seconds = 5

[[groups.members]]
member_id = "alice"
extension = "1001"

[[groups.members]]
member_id = "bob"
extension = "1002"
priority = 2
"#,
    )?;
    let telephony = ScriptedTelephony::answering();
    telephony.script("1001", [Script::Fail]);

    let engine = HuntEngine::from_config(config, telephony.clone()).await?;
    let snapshot = engine.group_snapshot(&"sales".into())?;
    assert_eq!(snapshot.members.len(), 2);
    assert_eq!(snapshot.eligible_count(), 2);

    let outcome = engine
        .handle_inbound_call(InboundCall::new("sales", "+15550001"))
        .await?
        .outcome()
        .await?;

    // no retries configured, so the failed ring moves straight on
    assert!(matches!(outcome, SessionOutcome::Connected { ref member_id, .. } if member_id.as_str() == "bob"));
    assert_eq!(telephony.rings(), vec!["1001", "1002"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reload_keeps_runtime_state_of_surviving_members() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::answering();
    let directory = Arc::new(InMemoryGroupDirectory::new());
    let group = HuntGroup::new("sales", "600", HuntType::Linear);
    directory.upsert_group(group.clone(), three_members())?;
    let engine = HuntEngine::new(HuntEngineConfig::default(), directory.clone(), telephony.clone()).await?;

    engine.handle_inbound_call(InboundCall::new("sales", "+15550001")).await?.outcome().await?;
    assert_eq!(engine.member_state(&"alice".into())?.state.current_calls, 1);

    directory.upsert_group(group, vec![Member::new("alice", "1001", 1), Member::new("dave", "1004", 2)])?;
    engine.load_group(&"sales".into()).await?;

    assert_eq!(engine.member_state(&"alice".into())?.state.current_calls, 1);
    assert!(engine.member_state(&"bob".into()).is_err());
    let snapshot = engine.group_snapshot(&"sales".into())?;
    let ids: Vec<&str> = snapshot.members.iter().map(|m| m.member.member_id.as_str()).collect();
    assert_eq!(ids, vec!["alice", "dave"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duplicate_and_unknown_calls_are_rejected() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::with_default(Script::Silent);
    let group = HuntGroup::new("sales", "600", HuntType::Linear);
    let engine = engine_for(group, three_members(), &telephony).await?;

    let call = InboundCall::new("sales", "+15550001").with_call_id("call-1");
    let mut handle = engine.handle_inbound_call(call.clone()).await?;
    handle
        .wait_for_state(|s| matches!(s, SessionState::Ringing { .. }))
        .await?;
    assert!(engine.handle_inbound_call(call).await.is_err());
    assert_eq!(engine.active_session_count(), 1);

    let err = engine
        .handle_inbound_call(InboundCall::new("nowhere", "+15550002"))
        .await
        .err();
    assert!(matches!(err, Some(HuntError::NotFound { .. })));

    engine.cancel_call(&"call-1".into())?;
    assert_eq!(handle.outcome().await?, SessionOutcome::Abandoned);
    assert_eq!(engine.active_session_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_duplicate_call_starts_one_session() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::with_default(Script::Silent);
    let directory = RemoteDirectory::new(HuntGroup::new("sales", "600", HuntType::Linear), three_members());
    let engine = HuntEngine::new(HuntEngineConfig::default(), directory, telephony.clone()).await?;

    let call = InboundCall::new("sales", "+15550001").with_call_id("call-1");
    let (first, second) = tokio::join!(
        engine.handle_inbound_call(call.clone()),
        engine.handle_inbound_call(call)
    );
    let (mut handle, rejected) = match (first, second) {
        (Ok(handle), Err(e)) | (Err(e), Ok(handle)) => (handle, e),
        (Ok(_), Ok(_)) => anyhow::bail!("both duplicates started a session"),
        (Err(a), Err(b)) => anyhow::bail!("no session started: {} / {}", a, b),
    };
    assert!(matches!(rejected, HuntError::InvariantViolation { .. }));
    assert_eq!(engine.active_session_count(), 1);

    handle
        .wait_for_state(|s| matches!(s, SessionState::Ringing { .. }))
        .await?;
    engine.cancel_call(&"call-1".into())?;
    assert_eq!(handle.outcome().await?, SessionOutcome::Abandoned);
    assert_eq!(engine.active_session_count(), 0);
    assert_eq!(telephony.rings(), vec!["1001"]);
    assert_eq!(engine.member_state(&"alice".into())?.state.current_calls, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn oversized_ring_timeout_is_refused_before_reserving() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::answering();
    let group = HuntGroup::new("sales", "600", HuntType::Linear);
    let directory = RemoteDirectory::new(group.clone(), three_members());
    let engine = HuntEngine::new(HuntEngineConfig::default(), directory.clone(), telephony.clone()).await?;
    engine.load_group(&"sales".into()).await?;

    directory.replace_group(group.with_ring_timeout(u64::MAX / 2));
    let err = engine
        .handle_inbound_call(InboundCall::new("sales", "+15550001"))
        .await
        .err();

    assert!(matches!(err, Some(ref e) if e.is_configuration()));
    assert!(telephony.rings().is_empty());
    assert_eq!(engine.active_session_count(), 0);
    assert_eq!(engine.member_state(&"alice".into())?.state.current_calls, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_applies_final_statistics() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::with_default(Script::Silent);
    let group = HuntGroup::new("sales", "600", HuntType::Linear);
    let engine = engine_for(group, three_members(), &telephony).await?;

    let mut handles = Vec::new();
    for n in 0..3 {
        let mut handle = engine
            .handle_inbound_call(InboundCall::new("sales", format!("+1555000{}", n)))
            .await?;
        handle
            .wait_for_state(|s| matches!(s, SessionState::Ringing { .. }))
            .await?;
        handles.push(handle);
    }

    engine.shutdown().await?;

    let stats = engine.stats(&"sales".into());
    assert_eq!(stats.total_sessions, 3);
    assert_eq!(stats.calls_abandoned, 3);
    for handle in handles {
        assert_eq!(handle.outcome().await?, SessionOutcome::Abandoned);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_active_sessions() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::with_default(Script::Silent);
    let group = HuntGroup::new("sales", "600", HuntType::Linear);
    let engine = engine_for(group, three_members(), &telephony).await?;

    let mut handle = engine
        .handle_inbound_call(InboundCall::new("sales", "+15550001"))
        .await?;
    handle
        .wait_for_state(|s| matches!(s, SessionState::Ringing { .. }))
        .await?;

    engine.shutdown().await?;
    assert_eq!(handle.outcome().await?, SessionOutcome::Abandoned);
    assert_eq!(engine.member_state(&"alice".into())?.state.current_calls, 0);
    assert!(engine
        .handle_inbound_call(InboundCall::new("sales", "+15550002"))
        .await
        .is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn daily_reset_zeroes_handled_counters() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::answering();
    let group = HuntGroup::new("sales", "600", HuntType::Linear);
    let engine = engine_for(group, three_members(), &telephony).await?;
    let mut rx = engine.subscribe_events();

    let call = InboundCall::new("sales", "+15550001");
    let call_id = call.call_id.clone();
    engine.handle_inbound_call(call).await?.outcome().await?;
    engine.call_ended(&call_id)?;
    assert_eq!(engine.member_state(&"alice".into())?.state.calls_handled_today, 1);

    engine.reset_daily_counters();
    assert_eq!(engine.member_state(&"alice".into())?.state.calls_handled_today, 0);
    assert_eq!(count_member_changes(&drain(&mut rx), "alice", MemberChange::DailyReset), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_never_exceed_member_capacity() -> anyhow::Result<()> {
    let telephony = ScriptedTelephony::answering();
    let group = HuntGroup::new("sales", "600", HuntType::Uniform);
    let members = vec![
        Member::new("alice", "1001", 1),
        Member::new("bob", "1002", 1).with_max_concurrent_calls(2),
    ];
    let engine = Arc::new(engine_for(group, members, &telephony).await?);
    engine.load_group(&"sales".into()).await?;

    let mut tasks = Vec::new();
    for n in 0..12 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            let handle = engine
                .handle_inbound_call(InboundCall::new("sales", format!("+1555{:04}", n)))
                .await?;
            handle.outcome().await
        }));
    }

    let mut connected = 0;
    let mut escalated = 0;
    for task in tasks {
        match task.await?? {
            SessionOutcome::Connected { .. } => connected += 1,
            SessionOutcome::Escalated { .. } => escalated += 1,
            SessionOutcome::Abandoned => {}
        }
    }

    assert_eq!(connected, 3);
    assert_eq!(escalated, 9);
    assert_eq!(engine.member_state(&"alice".into())?.state.current_calls, 1);
    assert_eq!(engine.member_state(&"bob".into())?.state.current_calls, 2);
    assert_eq!(engine.connected_call_count(), 3);
    Ok(())
}
