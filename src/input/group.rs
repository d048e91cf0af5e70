//! Id spaces for node and relationship endpoint ids.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::{Result, StageError};

/// Id of the implicit global group.
pub const GLOBAL_ID: i32 = 0;

/// Named id space. Two ids are only comparable within the same group.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Group {
    id: i32,
    name: Option<Arc<str>>,
}

impl Group {
    /// The implicit global group.
    pub fn global() -> Self {
        Self {
            id: GLOBAL_ID,
            name: None,
        }
    }

    /// Rebuilds a group seen on the wire.
    pub fn new(id: i32, name: Option<&str>) -> Self {
        Self {
            id,
            name: name.map(Arc::from),
        }
    }

    /// Numeric id, `0` for the global group.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Name, `None` for the global group.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns true for the global group.
    pub fn is_global(&self) -> bool {
        self.id == GLOBAL_ID
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}"),
            None => f.write_str("global id space"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Mode {
    Global,
    Named,
}

struct GroupsInner {
    mode: Option<Mode>,
    by_name: FxHashMap<Arc<str>, Group>,
    by_id: Vec<Group>,
}

/// Run-scoped registry handing out group ids on first reference.
///
/// A run is either entirely in the global id space or entirely in named
/// groups; the first lookup decides and mixing afterwards is rejected.
pub struct Groups {
    inner: Mutex<GroupsInner>,
}

impl Default for Groups {
    fn default() -> Self {
        Self::new()
    }
}

impl Groups {
    /// Creates a registry holding only the global group.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GroupsInner {
                mode: None,
                by_name: FxHashMap::default(),
                by_id: vec![Group::global()],
            }),
        }
    }

    /// Returns the group for `name`, creating it on first use. `None` and
    /// empty names resolve to the global group.
    pub fn get_or_create(&self, name: Option<&str>) -> Result<Group> {
        let name = name.filter(|n| !n.is_empty());
        let mut inner = self.inner.lock();
        let mode = if name.is_some() {
            Mode::Named
        } else {
            Mode::Global
        };
        match inner.mode {
            None => inner.mode = Some(mode),
            Some(existing) if existing != mode => return Err(StageError::MixedGroupModes),
            Some(_) => {}
        }
        let Some(name) = name else {
            return Ok(Group::global());
        };
        if let Some(group) = inner.by_name.get(name) {
            return Ok(group.clone());
        }
        let id = i32::try_from(inner.by_id.len())
            .map_err(|_| StageError::invalid("too many groups"))?;
        let name: Arc<str> = Arc::from(name);
        let group = Group {
            id,
            name: Some(Arc::clone(&name)),
        };
        inner.by_name.insert(name, group.clone());
        inner.by_id.push(group.clone());
        Ok(group)
    }

    /// Looks up an existing group by name.
    pub fn get(&self, name: Option<&str>) -> Result<Group> {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Ok(Group::global());
        };
        self.inner
            .lock()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| StageError::UnknownGroup(format!("'{name}'")))
    }

    /// Looks up an existing group by id.
    pub fn get_by_id(&self, id: i32) -> Result<Group> {
        let inner = self.inner.lock();
        usize::try_from(id)
            .ok()
            .and_then(|idx| inner.by_id.get(idx))
            .cloned()
            .ok_or_else(|| StageError::UnknownGroup(format!("with id {id}")))
    }

    /// Number of groups including the global one.
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    /// Always false; the global group is always present.
    pub fn is_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_same_group() {
        let groups = Groups::new();
        let a = groups.get_or_create(Some("x")).unwrap();
        let b = groups.get_or_create(Some("x")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id(), 1);
        assert_eq!(groups.get(Some("x")).unwrap(), a);
        assert_eq!(groups.get_by_id(1).unwrap(), a);
    }

    #[test]
    fn null_and_empty_are_global() {
        let groups = Groups::new();
        let g = groups.get_or_create(None).unwrap();
        assert!(g.is_global());
        assert_eq!(g.id(), 0);
        assert_eq!(groups.get_or_create(Some("")).unwrap(), g);
        assert_eq!(groups.get_or_create(None).unwrap().id(), 0);
    }

    #[test]
    fn ids_increase_monotonically() {
        let groups = Groups::new();
        let ids: Vec<i32> = ["a", "b", "c"]
            .iter()
            .map(|n| groups.get_or_create(Some(n)).unwrap().id())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(groups.len(), 4);
    }

    #[test]
    fn unknown_lookups_fail() {
        let groups = Groups::new();
        assert!(matches!(
            groups.get(Some("nope")),
            Err(StageError::UnknownGroup(ref m)) if m.contains("nope")
        ));
        assert!(matches!(groups.get_by_id(5), Err(StageError::UnknownGroup(_))));
        assert!(matches!(groups.get_by_id(-1), Err(StageError::UnknownGroup(_))));
    }

    #[test]
    fn mixing_modes_is_rejected() {
        let groups = Groups::new();
        groups.get_or_create(Some("people")).unwrap();
        assert!(matches!(
            groups.get_or_create(None),
            Err(StageError::MixedGroupModes)
        ));

        let global_first = Groups::new();
        global_first.get_or_create(None).unwrap();
        assert!(matches!(
            global_first.get_or_create(Some("people")),
            Err(StageError::MixedGroupModes)
        ));
    }
}
