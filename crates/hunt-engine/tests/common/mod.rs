//! Shared helpers for hunt engine integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use rvoip_hunt_engine::events::{HuntEvent, HuntEventKind, MemberChange};
use rvoip_hunt_engine::prelude::*;

/// What a scripted extension does when rung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Answer,
    Busy,
    Reject,
    NoAnswer,
    /// Keep ringing until the engine gives up
    Silent,
    /// The provider reports an error
    Fail,
    AnswerAfter(Duration),
}

/// Telephony provider driven by per-extension scripts
pub struct ScriptedTelephony {
    queued: Mutex<HashMap<String, VecDeque<Script>>>,
    always: Mutex<HashMap<String, Script>>,
    default_script: Script,
    rings: Mutex<Vec<(CallId, String)>>,
    redirects: Mutex<Vec<(CallId, RedirectInstruction)>>,
    stopped: Mutex<Vec<String>>,
    stop_delay: Mutex<Option<Duration>>,
    redirect_failures: AtomicU32,
}

impl ScriptedTelephony {
    /// Every extension answers unless scripted otherwise
    pub fn answering() -> Arc<Self> {
        Self::with_default(Script::Answer)
    }

    pub fn with_default(default_script: Script) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(HashMap::new()),
            always: Mutex::new(HashMap::new()),
            default_script,
            rings: Mutex::new(Vec::new()),
            redirects: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            stop_delay: Mutex::new(None),
            redirect_failures: AtomicU32::new(0),
        })
    }

    /// Queue one-shot behaviours for the next rings of `extension`
    pub fn script(&self, extension: &str, steps: impl IntoIterator<Item = Script>) {
        self.queued
            .lock()
            .entry(extension.to_string())
            .or_default()
            .extend(steps);
    }

    /// Behaviour once the queue for `extension` is empty
    pub fn always(&self, extension: &str, script: Script) {
        self.always.lock().insert(extension.to_string(), script);
    }

    /// Make the next `count` redirect requests fail
    pub fn fail_redirects(&self, count: u32) {
        self.redirect_failures.store(count, Ordering::SeqCst);
    }

    /// Make every stop_ringing request take `delay` before it completes
    pub fn slow_stop(&self, delay: Duration) {
        *self.stop_delay.lock() = Some(delay);
    }

    /// Extensions rung so far, in order
    pub fn rings(&self) -> Vec<String> {
        let rings = self.rings.lock();
        rings.iter().map(|(_, ext)| ext.clone()).collect()
    }

    pub fn rings_for(&self, call_id: &CallId) -> Vec<String> {
        let rings = self.rings.lock();
        rings
            .iter()
            .filter(|(c, _)| c == call_id)
            .map(|(_, ext)| ext.clone())
            .collect()
    }

    pub fn redirects(&self) -> Vec<(CallId, RedirectInstruction)> {
        self.redirects.lock().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    fn next_script(&self, extension: &str) -> Script {
        let mut queued = self.queued.lock();
        if let Some(script) = queued.get_mut(extension).and_then(|q| q.pop_front()) {
            return script;
        }
        let always = self.always.lock();
        always.get(extension).copied().unwrap_or(self.default_script)
    }
}

#[async_trait]
impl TelephonyProvider for ScriptedTelephony {
    async fn ring(&self, call_id: &CallId, extension: &str, _timeout: Duration) -> Result<RingOutcome> {
        self.rings.lock().push((call_id.clone(), extension.to_string()));
        match self.next_script(extension) {
            Script::Answer => Ok(RingOutcome::Answered),
            Script::Busy => Ok(RingOutcome::Busy),
            Script::Reject => Ok(RingOutcome::Rejected),
            Script::NoAnswer => Ok(RingOutcome::NoAnswer),
            Script::Silent => std::future::pending::<Result<RingOutcome>>().await,
            Script::Fail => Err(HuntError::telephony(format!("trunk down while ringing {}", extension))),
            Script::AnswerAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(RingOutcome::Answered)
            }
        }
    }

    async fn redirect(&self, call_id: &CallId, instruction: &RedirectInstruction) -> Result<()> {
        let remaining = self.redirect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.redirect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(HuntError::telephony("redirect rejected"));
        }
        self.redirects.lock().push((call_id.clone(), instruction.clone()));
        Ok(())
    }

    async fn stop_ringing(&self, _call_id: &CallId, extension: &str) -> Result<()> {
        let delay = *self.stop_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.stopped.lock().push(extension.to_string());
        Ok(())
    }
}

/// Directory that yields before every answer and performs no validation,
/// standing in for an external configuration store
pub struct RemoteDirectory {
    group: Mutex<HuntGroup>,
    members: Vec<Member>,
}

impl RemoteDirectory {
    pub fn new(group: HuntGroup, members: Vec<Member>) -> Arc<Self> {
        Arc::new(Self {
            group: Mutex::new(group),
            members,
        })
    }

    /// Replace the stored group definition as-is
    pub fn replace_group(&self, group: HuntGroup) {
        *self.group.lock() = group;
    }
}

#[async_trait]
impl GroupDirectory for RemoteDirectory {
    async fn get_hunt_group(&self, group_id: &HuntGroupId) -> Result<HuntGroup> {
        tokio::task::yield_now().await;
        let group = self.group.lock().clone();
        if group.id != *group_id {
            return Err(HuntError::not_found("hunt group", group_id.as_str()));
        }
        Ok(group)
    }

    async fn get_members(&self, group_id: &HuntGroupId) -> Result<Vec<Member>> {
        tokio::task::yield_now().await;
        self.get_hunt_group(group_id).await?;
        Ok(self.members.clone())
    }
}

/// Engine over an in-memory directory holding a single group
pub async fn engine_for(
    group: HuntGroup,
    members: Vec<Member>,
    telephony: &Arc<ScriptedTelephony>,
) -> anyhow::Result<HuntEngine> {
    let directory = Arc::new(InMemoryGroupDirectory::new());
    directory.upsert_group(group, members)?;
    let engine = HuntEngine::new(HuntEngineConfig::default(), directory, telephony.clone()).await?;
    Ok(engine)
}

/// The three-member roster most scenarios use
pub fn three_members() -> Vec<Member> {
    vec![
        Member::new("alice", "1001", 1),
        Member::new("bob", "1002", 2),
        Member::new("carol", "1003", 3),
    ]
}

/// Everything published so far
pub fn drain(rx: &mut mpsc::UnboundedReceiver<HuntEvent>) -> Vec<HuntEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count_member_changes(events: &[HuntEvent], member: &str, wanted: MemberChange) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                &e.kind,
                HuntEventKind::MemberStateChanged { member_id, change, .. }
                    if member_id.as_str() == member && *change == wanted
            )
        })
        .count()
}

pub fn termination<'a>(events: &'a [HuntEvent], call_id: &CallId) -> Option<&'a HuntEventKind> {
    events
        .iter()
        .filter(|e| e.call_id.as_ref() == Some(call_id))
        .map(|e| &e.kind)
        .find(|k| matches!(k, HuntEventKind::SessionTerminated { .. }))
}

/// Let spawned tasks such as the statistics consumer catch up
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
