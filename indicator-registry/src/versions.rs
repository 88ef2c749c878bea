//! Grouping of versioned definitions into "latest + history" groups.
//!
//! Every published revision of a definition points at its root through
//! `parent_id`; the root itself has none. A group is keyed by that root id.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{Definition, DefinitionId};

pub trait VersionedEntity {
    fn id(&self) -> DefinitionId;
    fn parent_id(&self) -> Option<DefinitionId>;
    fn version(&self) -> u32;
    fn created_at(&self) -> DateTime<Utc>;

    /// A self-referencing parent is a root, not a cycle.
    fn group_id(&self) -> DefinitionId {
        self.parent_id().unwrap_or_else(|| self.id())
    }
}

impl VersionedEntity for Definition {
    fn id(&self) -> DefinitionId {
        self.id
    }

    fn parent_id(&self) -> Option<DefinitionId> {
        self.parent_id
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// All versions of one logical definition, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionGroup<T> {
    pub group_id: DefinitionId,
    versions: Vec<T>,
    pub selected_id: DefinitionId,
}

impl<T: VersionedEntity> VersionGroup<T> {
    pub fn versions(&self) -> &[T] {
        &self.versions
    }

    pub fn latest(&self) -> &T {
        &self.versions[0]
    }

    pub fn selected(&self) -> &T {
        self.versions
            .iter()
            .find(|v| v.id() == self.selected_id)
            .unwrap_or_else(|| self.latest())
    }

    /// A single-version group has nothing to switch between.
    pub fn needs_switcher(&self) -> bool {
        self.versions.len() > 1
    }

    pub fn contains(&self, id: DefinitionId) -> bool {
        self.versions.iter().any(|v| v.id() == id)
    }
}

/// Explicit per-group version choices made by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSelections {
    by_group: HashMap<DefinitionId, DefinitionId>,
}

impl VersionSelections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, group_id: DefinitionId, version_id: DefinitionId) {
        self.by_group.insert(group_id, version_id);
    }

    pub fn clear(&mut self, group_id: DefinitionId) {
        self.by_group.remove(&group_id);
    }

    pub fn get(&self, group_id: DefinitionId) -> Option<DefinitionId> {
        self.by_group.get(&group_id).copied()
    }

    /// The chosen id if it is still one of `versions`, the newest otherwise.
    /// `versions` must be sorted newest first; `None` when it is empty.
    pub fn resolve<T: VersionedEntity>(
        &self,
        group_id: DefinitionId,
        versions: &[T],
    ) -> Option<DefinitionId> {
        match self.get(group_id) {
            Some(chosen) if versions.iter().any(|v| v.id() == chosen) => Some(chosen),
            _ => versions.first().map(|v| v.id()),
        }
    }

    /// Forget choices that no longer point into their group.
    pub fn prune<T: VersionedEntity>(&mut self, groups: &[VersionGroup<T>]) {
        self.by_group.retain(|group_id, chosen| {
            groups
                .iter()
                .find(|g| g.group_id == *group_id)
                .is_some_and(|g| g.contains(*chosen))
        });
    }
}

fn newest_first<T: VersionedEntity>(a: &T, b: &T) -> Ordering {
    b.version()
        .cmp(&a.version())
        .then_with(|| b.created_at().cmp(&a.created_at()))
        .then_with(|| b.id().cmp(&a.id()))
}

/// Group `items` by root id. Groups are ordered by their latest version's
/// creation time, newest first.
pub fn resolve_version_groups<T>(items: &[T], selections: &VersionSelections) -> Vec<VersionGroup<T>>
where
    T: VersionedEntity + Clone,
{
    let mut buckets: HashMap<DefinitionId, Vec<T>> = HashMap::new();
    for item in items {
        buckets.entry(item.group_id()).or_default().push(item.clone());
    }

    let mut groups: Vec<VersionGroup<T>> = buckets
        .into_iter()
        .filter_map(|(group_id, mut versions)| {
            versions.sort_by(newest_first);
            let selected_id = selections.resolve(group_id, &versions)?;
            Some(VersionGroup {
                group_id,
                versions,
                selected_id,
            })
        })
        .collect();

    groups.sort_by(|a, b| {
        b.latest()
            .created_at()
            .cmp(&a.latest().created_at())
            .then_with(|| b.group_id.cmp(&a.group_id))
    });
    groups
}
