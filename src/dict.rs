//! Dictionary representation.
//!
//! Entries live in an append-only vector owned by the VM; threaded code and
//! the hot cache refer to them by creation ordinal (`WordId`), never by
//! pointer. A separate probe order, newest first, is what lookup scans and
//! what heat-based reordering permutes; the creation chain itself is
//! immutable except for `FORGET`, which truncates back to a fence.

use std::fmt;

use bitflags::bitflags;

use crate::fixed::Fixed;
use crate::vm::{VAddr, Vm};

/// Creation ordinal of a dictionary entry, starting at 0.
pub type WordId = u32;

/// Longest allowed word name, in bytes.
pub const NAME_MAX: usize = 31;

bitflags! {
    /// Entry state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WordFlags: u8 {
        /// Executes even in compile mode.
        const IMMEDIATE = 1 << 0;
        /// Body is compiled threaded code.
        const COMPILED = 1 << 1;
        /// Definition in progress; invisible to lookup.
        const SMUDGED = 1 << 2;
        /// Administratively hidden from lookup.
        const HIDDEN = 1 << 3;
    }
}

/// Implementation of a word.
#[derive(Clone, Copy)]
pub enum WordFunc {
    /// Native primitive.
    Primitive(fn(&mut Vm)),
    /// Shared colon-body runner; the body vaddr sits in data-field cell 0.
    Colon,
}

impl fmt::Debug for WordFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(_) => f.write_str("Primitive"),
            Self::Colon => f.write_str("Colon"),
        }
    }
}

/// Execution telemetry attached to each entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordPhysics {
    pub temperature_q8: Fixed,
    pub avg_latency_ns: u64,
    pub last_active_ns: u64,
}

/// One dictionary entry. Created by `CREATE`/`:`, destroyed only by
/// `FORGET` back to the boot fence, never relocated.
#[derive(Debug)]
pub struct DictEntry {
    /// Previous entry in creation order.
    pub link: Option<WordId>,
    pub flags: WordFlags,
    name_len: u8,
    name: [u8; NAME_MAX],
    pub word_id: WordId,
    pub acl_default: u8,
    pub func: WordFunc,
    /// Monotonic Q48.16 execution counter.
    pub execution_heat: Fixed,
    pub physics: WordPhysics,
    /// Data-field address in the arena. For colon definitions cell 0 holds
    /// the vaddr of the threaded body.
    pub dfa: VAddr,
    /// HERE at creation; FORGET restores it.
    pub here_at_create: VAddr,
}

impl DictEntry {
    #[must_use]
    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }

    #[must_use]
    pub fn name_str(&self) -> &str {
        std::str::from_utf8(self.name()).unwrap_or("?")
    }

    #[must_use]
    pub fn is_immediate(&self) -> bool {
        self.flags.contains(WordFlags::IMMEDIATE)
    }

    pub(crate) fn visible(&self) -> bool {
        !self.flags.intersects(WordFlags::SMUDGED | WordFlags::HIDDEN)
    }

    pub(crate) fn matches(&self, name: &[u8]) -> bool {
        let len = name.len();
        if self.name_len as usize != len {
            return false;
        }
        // Cheap rejection on the last byte before the full compare.
        if len > 1 && self.name[len - 1] != name[len - 1] {
            return false;
        }
        self.name() == name
    }
}

/// Dictionary errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    NameTooLong(usize),
    /// FORGET target below the boot fence.
    Fenced,
    NotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameTooLong(len) => write!(f, "word name too long ({len} bytes)"),
            Self::Fenced => f.write_str("cannot forget below the boot fence"),
            Self::NotFound => f.write_str("word not found"),
        }
    }
}

impl std::error::Error for Error {}

/// Append-only entry store plus the mutable probe order.
#[derive(Debug, Default)]
pub struct Dictionary {
    entries: Vec<DictEntry>,
    /// Lookup scan order, newest first. Reordering by heat permutes this,
    /// never the entries themselves.
    order: Vec<WordId>,
}

impl Dictionary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recently created entry.
    #[must_use]
    pub fn latest(&self) -> Option<WordId> {
        self.entries.last().map(|e| e.word_id)
    }

    #[must_use]
    pub fn entry(&self, id: WordId) -> &DictEntry {
        &self.entries[id as usize]
    }

    pub fn entry_mut(&mut self, id: WordId) -> &mut DictEntry {
        &mut self.entries[id as usize]
    }

    #[must_use]
    pub fn get(&self, id: WordId) -> Option<&DictEntry> {
        self.entries.get(id as usize)
    }

    /// Probe order, newest first.
    #[must_use]
    pub fn order(&self) -> &[WordId] {
        &self.order
    }

    pub fn create(
        &mut self,
        name: &[u8],
        func: WordFunc,
        dfa: VAddr,
        here_at_create: VAddr,
    ) -> Result<WordId, Error> {
        if name.len() > NAME_MAX {
            return Err(Error::NameTooLong(name.len()));
        }
        let word_id = self.entries.len() as WordId;
        let mut stored = [0u8; NAME_MAX];
        stored[..name.len()].copy_from_slice(name);
        self.entries.push(DictEntry {
            link: word_id.checked_sub(1),
            flags: WordFlags::empty(),
            name_len: name.len() as u8,
            name: stored,
            word_id,
            acl_default: 0,
            func,
            execution_heat: 0,
            physics: WordPhysics::default(),
            dfa,
            here_at_create,
        });
        self.order.insert(0, word_id);
        Ok(word_id)
    }

    /// Scan the probe order for a visible entry named `name`.
    #[must_use]
    pub fn probe(&self, name: &[u8]) -> Option<WordId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.entries[id as usize].visible() && self.entries[id as usize].matches(name))
    }

    /// Find by name including smudged entries (used by FORGET and SEE-style
    /// introspection, not by interpretation).
    #[must_use]
    pub fn probe_any(&self, name: &[u8]) -> Option<WordId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.entries[id as usize].matches(name))
    }

    /// Walk the creation chain from `latest` and report whether `id` is a
    /// live entry. This is the guardrail used by the heat accessor words.
    #[must_use]
    pub fn owns(&self, id: WordId) -> bool {
        let mut cursor = self.latest();
        while let Some(current) = cursor {
            if current == id {
                return true;
            }
            cursor = self.entries[current as usize].link;
        }
        false
    }

    /// Truncate back to `fence_len` entries. Returns the `here_at_create`
    /// of the first removed entry so the caller can roll the arena back.
    pub fn forget_to(&mut self, fence_len: usize) -> Option<VAddr> {
        if fence_len >= self.entries.len() {
            return None;
        }
        let here = self.entries[fence_len].here_at_create;
        self.entries.truncate(fence_len);
        self.order.retain(|&id| (id as usize) < fence_len);
        Some(here)
    }

    /// Stable descending sort of the probe order by execution heat.
    pub fn reorder_by_heat(&mut self) {
        let entries = &self.entries;
        self.order
            .sort_by(|&a, &b| entries[b as usize].execution_heat.cmp(&entries[a as usize].execution_heat));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed;

    fn nop(_: &mut Vm) {}

    fn dict_with(names: &[&str]) -> Dictionary {
        let mut dict = Dictionary::new();
        for name in names {
            dict.create(name.as_bytes(), WordFunc::Primitive(nop), 0, 0)
                .unwrap();
        }
        dict
    }

    #[test]
    fn create_assigns_ordinals_and_links() {
        let dict = dict_with(&["DUP", "DROP", "SWAP"]);
        assert_eq!(3, dict.len());
        assert_eq!(Some(2), dict.latest());
        assert_eq!(b"SWAP", dict.entry(2).name());
        assert_eq!(Some(1), dict.entry(2).link);
        assert_eq!(None, dict.entry(0).link);
    }

    #[test]
    fn probe_prefers_newest() {
        let mut dict = dict_with(&["X"]);
        dict.create(b"X", WordFunc::Colon, 64, 64).unwrap();
        assert_eq!(Some(1), dict.probe(b"X"));
    }

    #[test]
    fn smudged_entries_are_invisible() {
        let mut dict = dict_with(&["HIDDENISH"]);
        dict.entry_mut(0).flags |= WordFlags::SMUDGED;
        assert_eq!(None, dict.probe(b"HIDDENISH"));
        assert_eq!(Some(0), dict.probe_any(b"HIDDENISH"));
        dict.entry_mut(0).flags -= WordFlags::SMUDGED;
        assert_eq!(Some(0), dict.probe(b"HIDDENISH"));
    }

    #[test]
    fn chain_walk_visits_each_entry_once() {
        let dict = dict_with(&["A", "B", "C", "D"]);
        let mut seen = Vec::new();
        let mut cursor = dict.latest();
        while let Some(id) = cursor {
            assert!(!seen.contains(&id));
            seen.push(id);
            cursor = dict.entry(id).link;
        }
        assert_eq!(4, seen.len());
        assert!(dict.owns(0) && dict.owns(3));
        assert!(!dict.owns(4));
    }

    #[test]
    fn forget_truncates_and_reports_here() {
        let mut dict = Dictionary::new();
        dict.create(b"KEEP", WordFunc::Primitive(nop), 0, 0).unwrap();
        dict.create(b"GONE", WordFunc::Primitive(nop), 128, 120).unwrap();
        dict.create(b"GONE2", WordFunc::Primitive(nop), 256, 250).unwrap();

        assert_eq!(Some(120), dict.forget_to(1));
        assert_eq!(1, dict.len());
        assert_eq!(None, dict.probe(b"GONE"));
        assert_eq!(Some(0), dict.probe(b"KEEP"));
        assert_eq!(None, dict.forget_to(5));
    }

    #[test]
    fn reorder_sorts_by_heat_descending() {
        let mut dict = dict_with(&["COLD", "WARM", "HOT"]);
        dict.entry_mut(0).execution_heat = fixed::from_int(1);
        dict.entry_mut(1).execution_heat = fixed::from_int(5);
        dict.entry_mut(2).execution_heat = fixed::from_int(3);
        dict.reorder_by_heat();
        assert_eq!(&[1, 2, 0], dict.order());
    }

    #[test]
    fn name_length_is_bounded() {
        let mut dict = Dictionary::new();
        let long = [b'A'; 32];
        assert_eq!(
            Err(Error::NameTooLong(32)),
            dict.create(&long, WordFunc::Primitive(nop), 0, 0)
        );
        let ok = [b'A'; 31];
        assert!(dict.create(&ok, WordFunc::Primitive(nop), 0, 0).is_ok());
    }
}
