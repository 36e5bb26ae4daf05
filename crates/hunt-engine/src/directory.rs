//! Hunt group directory
//!
//! Configuration management owns hunt group definitions and rosters. The
//! engine only reads them through [`GroupDirectory`].

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::config::HuntGroupDefinition;
use crate::error::{HuntError, Result};
use crate::types::{HuntGroup, HuntGroupId, Member};

/// Read access to hunt group configuration
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn get_hunt_group(&self, group_id: &HuntGroupId) -> Result<HuntGroup>;

    async fn get_members(&self, group_id: &HuntGroupId) -> Result<Vec<Member>>;
}

/// Directory kept in memory, seeded from configuration or populated by hand
#[derive(Default)]
pub struct InMemoryGroupDirectory {
    groups: DashMap<HuntGroupId, (HuntGroup, Vec<Member>)>,
}

impl InMemoryGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from static definitions, validating each one
    pub fn from_definitions(definitions: &[HuntGroupDefinition]) -> Result<Self> {
        let directory = Self::new();
        for definition in definitions {
            directory.upsert_group(definition.group.clone(), definition.members.clone())?;
        }
        Ok(directory)
    }

    /// Insert or replace a group and its roster
    pub fn upsert_group(&self, group: HuntGroup, members: Vec<Member>) -> Result<()> {
        group.validate()?;
        group.validate_members(&members)?;

        let members = members
            .into_iter()
            .map(|mut m| {
                m.group_id = group.id.clone();
                m
            })
            .collect::<Vec<_>>();
        info!(
            "🗂️ Hunt group {} ({}, ext {}) with {} members",
            group.id,
            group.hunt_type,
            group.extension,
            members.len()
        );
        self.groups.insert(group.id.clone(), (group, members));
        Ok(())
    }

    pub fn remove_group(&self, group_id: &HuntGroupId) -> bool {
        self.groups.remove(group_id).is_some()
    }

    pub fn group_ids(&self) -> Vec<HuntGroupId> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl GroupDirectory for InMemoryGroupDirectory {
    async fn get_hunt_group(&self, group_id: &HuntGroupId) -> Result<HuntGroup> {
        self.groups
            .get(group_id)
            .map(|e| e.value().0.clone())
            .ok_or_else(|| HuntError::not_found("hunt group", group_id.as_str()))
    }

    async fn get_members(&self, group_id: &HuntGroupId) -> Result<Vec<Member>> {
        self.groups
            .get(group_id)
            .map(|e| e.value().1.clone())
            .ok_or_else(|| HuntError::not_found("hunt group", group_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HuntType, NoAnswerDestination};

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let directory = InMemoryGroupDirectory::new();
        let group = HuntGroup::new("support", "700", HuntType::Circular);
        directory
            .upsert_group(group.clone(), vec![Member::new("alice", "1001", 1)])
            .unwrap();

        assert_eq!(directory.get_hunt_group(&group.id).await.unwrap(), group);
        let members = directory.get_members(&group.id).await.unwrap();
        assert_eq!(members[0].group_id, group.id);
    }

    #[tokio::test]
    async fn test_invalid_group_is_rejected() {
        let directory = InMemoryGroupDirectory::new();
        let group = HuntGroup::new("support", "700", HuntType::Linear)
            .with_no_answer(NoAnswerDestination::Extension, None);
        assert!(directory.upsert_group(group, Vec::new()).is_err());
        assert!(directory.group_ids().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let directory = InMemoryGroupDirectory::new();
        let err = directory.get_hunt_group(&HuntGroupId::new("nope")).await.unwrap_err();
        assert!(matches!(err, HuntError::NotFound { .. }));
    }
}
