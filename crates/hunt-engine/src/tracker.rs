//! Member state tracking
//!
//! The tracker owns every piece of mutable per-member state: presence,
//! concurrent call count, wrap-up, last offer time and the daily handled
//! counter. Each member sits behind its own lock so reservations for members
//! of unrelated groups never contend, while a single member's
//! reserve/release pairs are strictly linearized.
//!
//! Every change bumps the member's version and is published as a
//! `MemberStateChanged` event sequenced by that version.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{HuntError, Result};
use crate::events::{EventBus, HuntEvent, HuntEventKind, MemberChange};
use crate::types::{HuntGroupId, Member, MemberId};

/// Live state of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRuntimeState {
    /// Agent-set presence
    pub is_available: bool,
    /// Reservations currently held, including calls in wrap-up
    pub current_calls: u32,
    /// Ended calls still in wrap-up; the member takes no new offers meanwhile
    pub wrap_up_pending: u32,
    pub last_offered_at: Option<DateTime<Utc>>,
    pub calls_handled_today: u64,
    /// Incremented on every change
    pub version: u64,
}

impl MemberRuntimeState {
    fn new(is_available: bool) -> Self {
        Self {
            is_available,
            current_calls: 0,
            wrap_up_pending: 0,
            last_offered_at: None,
            calls_handled_today: 0,
            version: 0,
        }
    }

    pub fn in_wrap_up(&self) -> bool {
        self.wrap_up_pending > 0
    }
}

/// A member together with a copy of its runtime state
#[derive(Debug, Clone, PartialEq)]
pub struct MemberSnapshot {
    pub member: Member,
    pub state: MemberRuntimeState,
}

impl MemberSnapshot {
    /// Whether the member can take a new offer right now
    pub fn is_eligible(&self) -> bool {
        self.state.is_available
            && !self.state.in_wrap_up()
            && self.state.current_calls < self.member.max_concurrent_calls
    }
}

/// Point-in-time view of a group, ordered by priority then extension
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub group_id: HuntGroupId,
    pub members: Vec<MemberSnapshot>,
    /// Round-robin cursor: the member most recently offered a call
    pub last_offered: Option<MemberId>,
    pub taken_at: DateTime<Utc>,
}

impl GroupSnapshot {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, member_id: &MemberId) -> Option<&MemberSnapshot> {
        self.members.iter().find(|m| &m.member.member_id == member_id)
    }

    pub fn eligible_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_eligible()).count()
    }
}

struct MemberSlot {
    member: Member,
    state: MemberRuntimeState,
    /// Removed from its roster while calls were still held
    retired: bool,
}

impl MemberSlot {
    fn snapshot(&self) -> MemberSnapshot {
        MemberSnapshot {
            member: self.member.clone(),
            state: self.state.clone(),
        }
    }
}

/// Tracker of live member availability and call counts
pub struct MemberStateTracker {
    slots: DashMap<MemberId, Arc<Mutex<MemberSlot>>>,
    rosters: DashMap<HuntGroupId, Vec<MemberId>>,
    cursors: DashMap<HuntGroupId, MemberId>,
    /// Event sequence of members dropped from every roster, resumed if they return
    retired_versions: DashMap<MemberId, u64>,
    events: EventBus,
    members_start_available: bool,
}

impl MemberStateTracker {
    pub fn new(events: EventBus) -> Self {
        Self::with_initial_availability(events, true)
    }

    /// Create a tracker whose newly loaded members start with the given presence
    pub fn with_initial_availability(events: EventBus, members_start_available: bool) -> Self {
        Self {
            slots: DashMap::new(),
            rosters: DashMap::new(),
            cursors: DashMap::new(),
            retired_versions: DashMap::new(),
            events,
            members_start_available,
        }
    }

    /// Install or replace a group's roster
    ///
    /// Members that survive a reload keep their runtime state. Members that
    /// disappear are dropped, or retired until their last reservation is
    /// released.
    pub fn load_roster(&self, group_id: &HuntGroupId, members: Vec<Member>) -> Result<()> {
        for member in &members {
            if let Some(slot) = self.slots.get(&member.member_id) {
                let slot = slot.lock();
                if !slot.retired && slot.member.group_id != *group_id {
                    return Err(HuntError::config(format!(
                        "member {} already belongs to hunt group {}",
                        member.member_id, slot.member.group_id
                    )));
                }
            }
        }

        let mut ids: Vec<MemberId> = Vec::with_capacity(members.len());
        for mut member in members {
            member.group_id = group_id.clone();
            let member_id = member.member_id.clone();
            match self.slots.get(&member_id).map(|s| Arc::clone(s.value())) {
                Some(slot) => {
                    let mut slot = slot.lock();
                    slot.member = member;
                    slot.retired = false;
                }
                None => {
                    let mut state = MemberRuntimeState::new(self.members_start_available);
                    if let Some((_, version)) = self.retired_versions.remove(&member_id) {
                        state.version = version;
                    }
                    let slot = MemberSlot {
                        member,
                        state,
                        retired: false,
                    };
                    self.slots.insert(member_id.clone(), Arc::new(Mutex::new(slot)));
                }
            }
            ids.push(member_id);
        }

        let previous = self.rosters.insert(group_id.clone(), ids.clone()).unwrap_or_default();
        for stale in previous.into_iter().filter(|id| !ids.contains(id)) {
            self.retire(&stale);
        }

        info!("📋 Loaded roster for hunt group {} ({} members)", group_id, ids.len());
        Ok(())
    }

    /// Drop a group and its roster
    pub fn remove_group(&self, group_id: &HuntGroupId) {
        if let Some((_, ids)) = self.rosters.remove(group_id) {
            for id in ids {
                self.retire(&id);
            }
        }
        self.cursors.remove(group_id);
    }

    pub fn has_group(&self, group_id: &HuntGroupId) -> bool {
        self.rosters.contains_key(group_id)
    }

    /// Ordered snapshot of a group's members and their state
    ///
    /// Each member is read under its own lock, so every entry is internally
    /// consistent even while other sessions keep reserving.
    pub fn snapshot(&self, group_id: &HuntGroupId) -> Result<GroupSnapshot> {
        let ids = self
            .rosters
            .get(group_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| HuntError::not_found("hunt group", group_id.as_str()))?;

        let mut members: Vec<MemberSnapshot> = ids
            .iter()
            .filter_map(|id| self.slot(id).ok())
            .map(|slot| {
                let slot = slot.lock();
                slot.snapshot()
            })
            .collect();
        members.sort_by(|a, b| {
            a.member
                .priority
                .cmp(&b.member.priority)
                .then_with(|| a.member.extension.cmp(&b.member.extension))
        });

        Ok(GroupSnapshot {
            group_id: group_id.clone(),
            members,
            last_offered: self.last_offered(group_id),
            taken_at: Utc::now(),
        })
    }

    pub fn member_state(&self, member_id: &MemberId) -> Result<MemberSnapshot> {
        let slot = self.slot(member_id)?;
        let slot = slot.lock();
        Ok(slot.snapshot())
    }

    /// Member most recently offered a call in this group
    pub fn last_offered(&self, group_id: &HuntGroupId) -> Option<MemberId> {
        self.cursors.get(group_id).map(|c| c.value().clone())
    }

    /// Try to take one unit of the member's capacity
    ///
    /// Succeeds only while the member is available, out of wrap-up and below
    /// its concurrent call limit. A `false` return is a lost race, not an error.
    pub fn reserve(&self, member_id: &MemberId) -> Result<bool> {
        self.with_slot(member_id, |slot| {
            let eligible = slot.state.is_available
                && !slot.retired
                && !slot.state.in_wrap_up()
                && slot.state.current_calls < slot.member.max_concurrent_calls;
            if !eligible {
                return Ok((false, None));
            }
            slot.state.current_calls += 1;
            Ok((true, Some(MemberChange::Reserved)))
        })
        .map(|reserved| {
            if reserved {
                debug!("Reserved member {}", member_id);
            } else {
                debug!("Reservation refused for member {}", member_id);
            }
            reserved
        })
    }

    /// Give back one unit of the member's capacity
    pub fn release(&self, member_id: &MemberId) -> Result<()> {
        self.with_slot(member_id, |slot| {
            if slot.state.current_calls <= slot.state.wrap_up_pending {
                return Err(HuntError::invariant(format!(
                    "release of member {} without a matching reservation (current_calls={}, wrap_up={})",
                    slot.member.member_id, slot.state.current_calls, slot.state.wrap_up_pending
                )));
            }
            slot.state.current_calls -= 1;
            Ok(((), Some(MemberChange::Released)))
        })
        .map_err(|e| {
            error!("🚨 {}", e);
            e
        })?;
        self.reap_if_retired(member_id);
        Ok(())
    }

    /// Set the agent's presence
    pub fn set_availability(&self, member_id: &MemberId, available: bool) -> Result<()> {
        self.with_slot(member_id, |slot| {
            if slot.state.is_available == available {
                return Ok(((), None));
            }
            slot.state.is_available = available;
            Ok(((), Some(MemberChange::AvailabilityChanged)))
        })?;
        info!("👤 Member {} availability: {}", member_id, available);
        Ok(())
    }

    /// Record that a ring is being offered to the member and advance the group cursor
    pub fn mark_offered(&self, member_id: &MemberId) -> Result<()> {
        let group_id = self.with_slot(member_id, |slot| {
            slot.state.last_offered_at = Some(Utc::now());
            Ok((slot.member.group_id.clone(), Some(MemberChange::Offered)))
        })?;
        self.cursors.insert(group_id, member_id.clone());
        Ok(())
    }

    /// Count an answered call towards the member's daily total
    pub fn record_connected(&self, member_id: &MemberId) -> Result<()> {
        self.with_slot(member_id, |slot| {
            slot.state.calls_handled_today += 1;
            Ok(((), Some(MemberChange::Connected)))
        })
    }

    /// Enter wrap-up for one of the member's held calls
    pub fn begin_wrap_up(&self, member_id: &MemberId) -> Result<()> {
        self.with_slot(member_id, |slot| {
            if slot.state.current_calls <= slot.state.wrap_up_pending {
                return Err(HuntError::invariant(format!(
                    "wrap-up for member {} without a held call",
                    slot.member.member_id
                )));
            }
            slot.state.wrap_up_pending += 1;
            Ok(((), Some(MemberChange::WrapUpStarted)))
        })
    }

    /// Leave wrap-up and release the call's reservation in one step
    pub fn finish_wrap_up(&self, member_id: &MemberId) -> Result<()> {
        self.with_slot(member_id, |slot| {
            if slot.state.wrap_up_pending == 0 || slot.state.current_calls == 0 {
                return Err(HuntError::invariant(format!(
                    "member {} is not in wrap-up",
                    slot.member.member_id
                )));
            }
            slot.state.wrap_up_pending -= 1;
            slot.state.current_calls -= 1;
            Ok(((), Some(MemberChange::WrapUpFinished)))
        })?;
        self.reap_if_retired(member_id);
        Ok(())
    }

    /// Zero every member's daily handled counter
    pub fn reset_daily_counters(&self) {
        let slots: Vec<Arc<Mutex<MemberSlot>>> = self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        for slot in slots {
            let mut slot = slot.lock();
            if slot.state.calls_handled_today == 0 {
                continue;
            }
            slot.state.calls_handled_today = 0;
            self.emit(&mut slot, MemberChange::DailyReset);
        }
        info!("🔄 Daily member counters reset");
    }

    fn slot(&self, member_id: &MemberId) -> Result<Arc<Mutex<MemberSlot>>> {
        self.slots
            .get(member_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| HuntError::not_found("member", member_id.as_str()))
    }

    fn with_slot<R>(
        &self,
        member_id: &MemberId,
        f: impl FnOnce(&mut MemberSlot) -> Result<(R, Option<MemberChange>)>,
    ) -> Result<R> {
        let slot = self.slot(member_id)?;
        let mut slot = slot.lock();
        let (result, change) = f(&mut slot)?;
        if let Some(change) = change {
            self.emit(&mut slot, change);
        }
        Ok(result)
    }

    fn emit(&self, slot: &mut MemberSlot, change: MemberChange) {
        slot.state.version += 1;
        self.events.publish(HuntEvent::new(
            None,
            slot.member.group_id.clone(),
            slot.state.version,
            HuntEventKind::MemberStateChanged {
                member_id: slot.member.member_id.clone(),
                change,
                is_available: slot.state.is_available,
                current_calls: slot.state.current_calls,
                in_wrap_up: slot.state.in_wrap_up(),
            },
        ));
    }

    fn retire(&self, member_id: &MemberId) {
        let Ok(slot) = self.slot(member_id) else {
            return;
        };
        let busy = {
            let mut slot = slot.lock();
            slot.retired = true;
            slot.state.current_calls > 0
        };
        if busy {
            warn!("Member {} removed from roster with calls in progress, retiring", member_id);
        } else {
            self.reap_if_retired(member_id);
        }
    }

    fn reap_if_retired(&self, member_id: &MemberId) {
        self.slots.remove_if(member_id, |id, slot| {
            let slot = slot.lock();
            let reap = slot.retired && slot.state.current_calls == 0;
            if reap {
                self.retired_versions.insert(id.clone(), slot.state.version);
            }
            reap
        });
    }
}
