//! Known projects: a starred list and a most-recent-first list, persisted as one blob.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{info, warn};

use crate::normalize::{normalize_location, Location};
use crate::now_millis;
use crate::store::KvStore;

pub const REGISTRY_KEY: &str = "projectRegistry";
pub const REGISTRY_VERSION: u32 = 1;

/// Name some callers send when they have nothing better than the current directory.
pub const PLACEHOLDER_NAME: &str = ".";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Valid,
    Invalid,
    #[default]
    Unknown,
}

impl Validity {
    fn rank(self) -> u8 {
        match self {
            Validity::Valid => 2,
            Validity::Invalid => 1,
            Validity::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEntry {
    pub id: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_path: Option<Location>,
    #[serde(default)]
    pub validity: Validity,
    /// Unix milliseconds of the last reachability check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<u64>,
}

impl ProjectEntry {
    pub fn new(id: Location) -> Self {
        Self {
            id,
            name: None,
            icon: None,
            color_hex: None,
            session_path: None,
            validity: Validity::Unknown,
            last_checked_at: None,
        }
    }

    pub fn is_session(&self) -> bool {
        self.session_path.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStorage {
    pub version: u32,
    #[serde(default)]
    pub starred: Vec<ProjectEntry>,
    #[serde(default)]
    pub recent: Vec<ProjectEntry>,
}

/// Combines two records for the same project without losing populated data.
///
/// Descriptive fields are only taken from `incoming` where `base` has none.
/// The more favourable validity always wins (valid, then invalid, then
/// unknown) and the latest check time is kept independently of it.
pub fn merge(base: &ProjectEntry, incoming: &ProjectEntry) -> ProjectEntry {
    let validity = if incoming.validity.rank() > base.validity.rank() {
        incoming.validity
    } else {
        base.validity
    };
    let last_checked_at = base.last_checked_at.max(incoming.last_checked_at);

    ProjectEntry {
        id: base.id.clone(),
        name: fill(meaningful_name(&base.name), meaningful_name(&incoming.name)),
        icon: fill(non_empty(&base.icon), non_empty(&incoming.icon)),
        color_hex: fill(non_empty(&base.color_hex), non_empty(&incoming.color_hex)),
        session_path: base.session_path.clone().or_else(|| incoming.session_path.clone()),
        validity,
        last_checked_at,
    }
}

fn fill(base: Option<String>, incoming: Option<String>) -> Option<String> {
    base.or(incoming)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}

fn meaningful_name(value: &Option<String>) -> Option<String> {
    non_empty(value).filter(|name| name.trim() != PLACEHOLDER_NAME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectList {
    Starred,
    Recent,
}

pub struct ProjectRegistry {
    starred: Vec<ProjectEntry>,
    recent: Vec<ProjectEntry>,
    store: KvStore,
}

impl ProjectRegistry {
    /// Loads the registry blob. An undecodable blob is logged and replaced by an
    /// empty registry rather than failing startup.
    pub fn load(store: KvStore) -> Self {
        let storage = match store.get::<RegistryStorage>(REGISTRY_KEY) {
            Ok(Some(storage)) => storage,
            Ok(None) => RegistryStorage {
                version: REGISTRY_VERSION,
                starred: Vec::new(),
                recent: Vec::new(),
            },
            Err(err) => {
                warn!("project registry is unreadable, starting empty: {err:#}");
                RegistryStorage {
                    version: REGISTRY_VERSION,
                    starred: Vec::new(),
                    recent: Vec::new(),
                }
            }
        };

        let mut registry = Self {
            starred: Vec::new(),
            recent: Vec::new(),
            store,
        };
        // Re-inserting through the merge path repairs hand-edited blobs that list
        // an id twice or in both lists.
        for entry in storage.starred {
            registry.absorb(entry, ProjectList::Starred);
        }
        for entry in storage.recent {
            registry.absorb(entry, ProjectList::Recent);
        }
        registry
    }

    pub fn starred(&self) -> &[ProjectEntry] {
        &self.starred
    }

    pub fn recent(&self) -> &[ProjectEntry] {
        &self.recent
    }

    /// Starred entries followed by recent ones, the order menus list them in.
    pub fn entries(&self) -> impl Iterator<Item = &ProjectEntry> {
        self.starred.iter().chain(self.recent.iter())
    }

    pub fn get(&self, id: &Location) -> Option<(&ProjectEntry, ProjectList)> {
        self.position(id).map(|(list, index)| match list {
            ProjectList::Starred => (&self.starred[index], list),
            ProjectList::Recent => (&self.recent[index], list),
        })
    }

    /// Records that `location` was just opened.
    pub fn touch(
        &mut self,
        location: impl AsRef<Path>,
        name: Option<&str>,
        session_path: Option<Location>,
    ) -> Result<()> {
        let mut incoming = ProjectEntry::new(normalize_location(location));
        incoming.name = name.map(str::to_string);
        incoming.session_path = session_path;
        self.upsert_front(incoming, ProjectList::Recent);
        self.persist()
    }

    /// Moves an entry between the starred and recent lists. Returns whether it is
    /// starred afterwards.
    pub fn toggle_star(&mut self, id: &Location) -> Result<bool> {
        let Some((list, index)) = self.position(id) else {
            bail!("project '{id}' is not in the registry");
        };
        let starred = match list {
            ProjectList::Starred => {
                let entry = self.starred.remove(index);
                self.recent.insert(0, entry);
                false
            }
            ProjectList::Recent => {
                let entry = self.recent.remove(index);
                self.starred.insert(0, entry);
                true
            }
        };
        self.persist()?;
        Ok(starred)
    }

    /// Explicit insert from settings. Existing entries are merged in place and
    /// moved to the front of their current list.
    pub fn add_project(&mut self, entry: ProjectEntry, list: ProjectList) -> Result<()> {
        let mut entry = entry;
        entry.id = normalize_location(entry.id.as_str());
        self.upsert_front(entry, list);
        self.persist()
    }

    /// Replaces the entry `original` with `entry`, which may carry a new id.
    ///
    /// Any entry already stored under the new id is folded in and removed so the
    /// id never appears twice.
    pub fn update_entry(&mut self, original: &Location, entry: ProjectEntry) -> Result<()> {
        let mut entry = entry;
        entry.id = normalize_location(entry.id.as_str());
        let Some((list, _)) = self.position(original) else {
            bail!("project '{original}' is not in the registry");
        };

        self.take(original);
        let merged = match self.take(&entry.id) {
            Some((stale, _)) => merge(&entry, &stale),
            None => entry,
        };
        self.list_mut(list).insert(0, merged);
        self.persist()
    }

    pub fn remove(&mut self, id: &Location) -> Result<Option<ProjectEntry>> {
        let removed = self.take(id).map(|(entry, _)| entry);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Stamps every entry with its current reachability. This walks the whole
    /// registry synchronously.
    pub fn refresh_validity(&mut self) -> Result<()> {
        let checked_at = now_millis();
        let mut invalid = 0_usize;
        for entry in self.starred.iter_mut().chain(self.recent.iter_mut()) {
            entry.validity = if is_reachable(entry.id.as_path()) {
                Validity::Valid
            } else {
                invalid += 1;
                Validity::Invalid
            };
            entry.last_checked_at = Some(checked_at);
        }
        info!(
            "refreshed project validity: {} entries, {invalid} unreachable",
            self.starred.len() + self.recent.len()
        );
        self.persist()
    }

    pub fn persist(&self) -> Result<()> {
        let storage = RegistryStorage {
            version: REGISTRY_VERSION,
            starred: self.starred.clone(),
            recent: self.recent.clone(),
        };
        self.store.set(REGISTRY_KEY, &storage)
    }

    fn upsert_front(&mut self, incoming: ProjectEntry, default_list: ProjectList) {
        match self.take(&incoming.id) {
            Some((existing, list)) => {
                let merged = merge(&existing, &incoming);
                self.list_mut(list).insert(0, merged);
            }
            None => {
                let mut entry = incoming;
                entry.name = meaningful_name(&entry.name);
                self.list_mut(default_list).insert(0, entry);
            }
        }
    }

    fn absorb(&mut self, incoming: ProjectEntry, list: ProjectList) {
        match self.position(&incoming.id) {
            Some((existing_list, index)) => {
                let slot = &mut self.list_mut(existing_list)[index];
                *slot = merge(slot, &incoming);
            }
            None => self.list_mut(list).push(incoming),
        }
    }

    fn take(&mut self, id: &Location) -> Option<(ProjectEntry, ProjectList)> {
        let (list, index) = self.position(id)?;
        Some((self.list_mut(list).remove(index), list))
    }

    fn position(&self, id: &Location) -> Option<(ProjectList, usize)> {
        if let Some(index) = self.starred.iter().position(|entry| &entry.id == id) {
            return Some((ProjectList::Starred, index));
        }
        self.recent
            .iter()
            .position(|entry| &entry.id == id)
            .map(|index| (ProjectList::Recent, index))
    }

    fn list_mut(&mut self, list: ProjectList) -> &mut Vec<ProjectEntry> {
        match list {
            ProjectList::Starred => &mut self.starred,
            ProjectList::Recent => &mut self.recent,
        }
    }
}

/// Exists and is readable; directories must also be searchable.
fn is_reachable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mode = if metadata.is_dir() {
        libc::R_OK | libc::X_OK
    } else {
        libc::R_OK
    };
    unsafe { libc::access(c_path.as_ptr(), mode) == 0 }
}
