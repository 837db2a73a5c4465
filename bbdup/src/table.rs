//! The table mapping block tags to their [BlockManager]s.
//!
//! Managers live in an arena and are looked up by tag. Slots in the arena are reused once a
//! manager is removed, so a [ManagerHandle] carries the generation of the slot it was issued for:
//! a stale handle resolves to nothing rather than to some other block's manager.

use crate::{ir::index_usize, manager::BlockManager};
use std::{collections::HashMap, mem};
use typed_index_collections::TiVec;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct ManagerIdx(usize);
index_usize!(ManagerIdx);

/// A reference to a manager that stays safe to hold after the manager has gone away.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ManagerHandle {
    idx: ManagerIdx,
    gen: u32,
}

#[derive(Debug)]
struct Entry {
    gen: u32,
    live: bool,
    manager: BlockManager,
}

#[derive(Debug, Default)]
pub(crate) struct ManagerTable {
    by_tag: HashMap<u64, ManagerIdx>,
    entries: TiVec<ManagerIdx, Entry>,
    free: Vec<ManagerIdx>,
}

impl ManagerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub(crate) fn get(&self, tag: u64) -> Option<&BlockManager> {
        let idx = *self.by_tag.get(&tag)?;
        Some(&self.entries[idx].manager)
    }

    pub(crate) fn get_mut(&mut self, tag: u64) -> Option<&mut BlockManager> {
        let idx = *self.by_tag.get(&tag)?;
        Some(&mut self.entries[idx].manager)
    }

    /// Return the manager for `tag` if there is one and `keep` accepts it; otherwise install the
    /// manager built by `create`.
    pub(crate) fn fetch_or_replace<K, C>(
        &mut self,
        tag: u64,
        keep: K,
        create: C,
    ) -> &mut BlockManager
    where
        K: FnOnce(&mut BlockManager) -> bool,
        C: FnOnce() -> BlockManager,
    {
        let idx = match self.by_tag.get(&tag).copied() {
            Some(idx) if keep(&mut self.entries[idx].manager) => idx,
            _ => self.insert(tag, create()).idx,
        };
        &mut self.entries[idx].manager
    }

    pub(crate) fn handle(&self, tag: u64) -> Option<ManagerHandle> {
        let idx = *self.by_tag.get(&tag)?;
        Some(ManagerHandle {
            idx,
            gen: self.entries[idx].gen,
        })
    }

    pub(crate) fn resolve(&self, h: ManagerHandle) -> Option<&BlockManager> {
        let e = self.entries.get(h.idx)?;
        if e.live && e.gen == h.gen {
            Some(&e.manager)
        } else {
            None
        }
    }

    /// Install `manager` for `tag`, dropping any manager previously installed for it.
    pub(crate) fn insert(&mut self, tag: u64, manager: BlockManager) -> ManagerHandle {
        self.remove(tag);
        let idx = match self.free.pop() {
            Some(idx) => {
                let e = &mut self.entries[idx];
                e.gen = e.gen.wrapping_add(1);
                e.live = true;
                e.manager = manager;
                idx
            }
            None => self.entries.push_and_get_key(Entry {
                gen: 0,
                live: true,
                manager,
            }),
        };
        self.by_tag.insert(tag, idx);
        ManagerHandle {
            idx,
            gen: self.entries[idx].gen,
        }
    }

    pub(crate) fn remove(&mut self, tag: u64) -> Option<BlockManager> {
        let idx = self.by_tag.remove(&tag)?;
        let e = &mut self.entries[idx];
        e.live = false;
        self.free.push(idx);
        // An empty manager owns no case storage.
        Some(mem::replace(&mut e.manager, BlockManager::new(0, 0)))
    }
}
