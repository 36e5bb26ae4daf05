//! Hunt strategy resolution
//!
//! Given a group, a tracker snapshot and the ring session asking, the resolver
//! produces the ordered candidates for the *next* ring attempt. It is pure:
//! no locks, no clocks, no shared state. Everything it needs (including the
//! round-robin anchor and the weighted seed) is carried in its inputs.
//!
//! | Strategy     | Order                                                              |
//! |--------------|--------------------------------------------------------------------|
//! | linear       | priority asc, extension asc                                        |
//! | circular     | linear order rotated to start after the call's rotation anchor     |
//! | uniform      | current calls asc, last offered asc (never offered first)          |
//! | weighted     | weighted draw without replacement, weight = 1 / max(priority, 1)   |
//! | skill-based  | members holding the call's skill, then uniform                     |
//!
//! Members already attempted in the current cycle and members that cannot
//! take an offer (unavailable, in wrap-up, at capacity) are never returned.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::debug;

use crate::session::RingSession;
use crate::tracker::{GroupSnapshot, MemberSnapshot};
use crate::types::{HuntGroup, HuntType, Member, MemberId};

/// Pure candidate selection for all hunt strategies
pub struct HuntStrategyResolver;

impl HuntStrategyResolver {
    /// Ordered candidates for the session's next ring attempt
    ///
    /// An empty result means nobody can be offered right now; the ring
    /// session decides whether that closes a cycle or forces escalation.
    pub fn next_candidates(group: &HuntGroup, snapshot: &GroupSnapshot, session: &RingSession) -> Vec<Member> {
        if snapshot.is_empty() {
            return Vec::new();
        }

        let untried = |m: &&MemberSnapshot| {
            m.is_eligible() && !session.attempted_member_ids.contains(&m.member.member_id)
        };

        let candidates: Vec<Member> = match group.hunt_type {
            HuntType::Linear => snapshot.members.iter().filter(untried).map(|m| m.member.clone()).collect(),
            HuntType::Circular => rotate_after(&snapshot.members, session.rotation_anchor.as_ref())
                .into_iter()
                .filter(untried)
                .map(|m| m.member.clone())
                .collect(),
            HuntType::Uniform => uniform_order(snapshot.members.iter().filter(untried).collect()),
            HuntType::Weighted => weighted_order(
                snapshot.members.iter().filter(untried).collect(),
                weighted_seed(session),
            ),
            HuntType::SkillBased => {
                let pool: Vec<&MemberSnapshot> = match session.required_skill.as_deref() {
                    Some(skill) => snapshot.members.iter().filter(|m| m.member.has_skill(skill)).collect(),
                    None => snapshot.members.iter().collect(),
                };
                if pool.is_empty() {
                    debug!(
                        "No member of hunt group {} has skill {:?}",
                        group.id, session.required_skill
                    );
                    return Vec::new();
                }
                uniform_order(pool.into_iter().filter(|m| untried(m)).collect())
            }
        };

        debug!(
            "Resolved {} candidates for call {} in hunt group {} ({})",
            candidates.len(),
            session.call_id,
            group.id,
            group.hunt_type
        );
        candidates
    }

    /// Weight used by the weighted strategy for a given priority
    pub fn weight(priority: u32) -> f64 {
        1.0 / f64::from(priority.max(1))
    }
}

/// Linear order rotated so the member after `anchor` comes first
fn rotate_after<'a>(members: &'a [MemberSnapshot], anchor: Option<&MemberId>) -> Vec<&'a MemberSnapshot> {
    let start = anchor
        .and_then(|id| members.iter().position(|m| &m.member.member_id == id))
        .map(|i| (i + 1) % members.len())
        .unwrap_or(0);
    members[start..].iter().chain(members[..start].iter()).collect()
}

fn uniform_order(mut pool: Vec<&MemberSnapshot>) -> Vec<Member> {
    pool.sort_by(|a, b| {
        a.state
            .current_calls
            .cmp(&b.state.current_calls)
            .then_with(|| a.state.last_offered_at.cmp(&b.state.last_offered_at))
            .then_with(|| a.member.priority.cmp(&b.member.priority))
            .then_with(|| a.member.extension.cmp(&b.member.extension))
    });
    pool.into_iter().map(|m| m.member.clone()).collect()
}

fn weighted_order(mut remaining: Vec<&MemberSnapshot>, seed: u64) -> Vec<Member> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let weights: Vec<f64> = remaining
            .iter()
            .map(|m| HuntStrategyResolver::weight(m.member.priority))
            .collect();
        let index = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut rng),
            Err(_) => 0,
        };
        ordered.push(remaining.remove(index).member.clone());
    }
    ordered
}

/// Seed tied to the call and its progress so replays pick the same order
fn weighted_seed(session: &RingSession) -> u64 {
    fnv1a(session.call_id.as_str().as_bytes())
        ^ (u64::from(session.cycle_count) << 32)
        ^ u64::from(session.ring_attempts)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}
