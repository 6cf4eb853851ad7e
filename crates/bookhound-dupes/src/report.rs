//! The result of a duplicate run: numbered groups, navigation and marks.

use std::collections::{BTreeMap, BTreeSet};

use bookhound_core::BookId;
use serde::Serialize;

use crate::error::{DupesError, Result};
use crate::grouping::{ExemptionLookup, partition};
use crate::progress::RunLog;

pub type GroupId = usize;

/// Labels written to the host's marked-ids registry.
pub mod labels {
    use super::GroupId;

    pub const DUPLICATE: &str = "duplicate";
    pub const FIRST_DUPLICATE: &str = "first_duplicate";
    pub const LAST_DUPLICATE: &str = "last_duplicate";
    pub const ENTANGLED_GROUP: &str = "entangled_group";
    pub const ENTANGLED_BOOK: &str = "entangled_book";
    pub const DELETED_BINARY_DUPLICATE: &str = "deleted_binary_duplicate";
    pub const BOOK_EXEMPTION: &str = "book_duplicate_exemption";
    pub const AUTHOR_EXEMPTION: &str = "author_duplicate_exemption";

    /// `duplicate_group0003_sort_0002`: second book of group 3.
    pub fn group_position(group: GroupId, position: usize) -> String {
        format!("duplicate_group{group:04}_sort_{position:04}")
    }

    /// Host search expression selecting books with `label`.
    pub fn search(label: &str) -> String {
        format!("marked:{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    #[default]
    Metadata,
    /// Groups of byte-identical format files; all but the first book of a
    /// group are deletion candidates.
    Binary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DuplicateReport {
    pub kind: ReportKind,
    /// Group id → books in display order. Ids are dense, starting at 1.
    pub books_for_group: BTreeMap<GroupId, Vec<BookId>>,
    pub groups_for_book: BTreeMap<BookId, BTreeSet<GroupId>>,
    pub aborted: bool,
    pub log: RunLog,
    #[serde(skip)]
    current: Option<GroupId>,
}

impl DuplicateReport {
    /// Number groups 1..n in the given order.
    pub fn from_groups(groups: Vec<Vec<BookId>>, kind: ReportKind) -> Self {
        let mut report = Self {
            kind,
            ..Self::default()
        };
        report.rebuild(groups, None);
        report
    }

    /// Empty report for a cancelled run.
    pub fn aborted(kind: ReportKind, log: RunLog) -> Self {
        Self {
            kind,
            aborted: true,
            log,
            ..Self::default()
        }
    }

    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = log;
        self
    }

    pub fn group_count(&self) -> usize {
        self.books_for_group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books_for_group.is_empty()
    }

    pub fn group(&self, id: GroupId) -> Option<&[BookId]> {
        self.books_for_group.get(&id).map(Vec::as_slice)
    }

    /// Every book in any group.
    pub fn books(&self) -> BTreeSet<BookId> {
        self.groups_for_book.keys().copied().collect()
    }

    /// Books that belong to more than one group.
    pub fn entangled_books(&self) -> BTreeSet<BookId> {
        self.groups_for_book
            .iter()
            .filter(|(_, groups)| groups.len() > 1)
            .map(|(&book, _)| book)
            .collect()
    }

    /// Groups holding at least one entangled book.
    pub fn entangled_groups(&self) -> BTreeSet<GroupId> {
        self.groups_for_book
            .values()
            .filter(|groups| groups.len() > 1)
            .flatten()
            .copied()
            .collect()
    }

    // ─── Navigation ────────────────────────────────────────

    pub fn current_group(&self) -> Option<GroupId> {
        self.current
    }

    pub fn select_group(&mut self, id: GroupId) -> Result<()> {
        if !self.books_for_group.contains_key(&id) {
            return Err(DupesError::GroupNotFound(id));
        }
        self.current = Some(id);
        Ok(())
    }

    /// Advance to the next group, wrapping to the first.
    pub fn next_group(&mut self) -> Option<GroupId> {
        let count = self.group_count();
        if count == 0 {
            return None;
        }
        let next = match self.current {
            Some(id) if id < count => id + 1,
            _ => 1,
        };
        self.current = Some(next);
        self.current
    }

    /// Step back to the previous group, wrapping to the last.
    pub fn previous_group(&mut self) -> Option<GroupId> {
        let count = self.group_count();
        if count == 0 {
            return None;
        }
        let previous = match self.current {
            Some(id) if id > 1 && id <= count => id - 1,
            _ => count,
        };
        self.current = Some(previous);
        self.current
    }

    // ─── Edits ─────────────────────────────────────────────

    /// Drop books (for example after the host deleted them). Groups left
    /// with fewer than two books disappear and ids are renumbered.
    pub fn remove_books(&mut self, ids: &BTreeSet<BookId>) {
        let groups = self
            .books_for_group
            .values()
            .map(|books| books.iter().copied().filter(|b| !ids.contains(b)).collect())
            .collect();
        self.rebuild(groups, self.current);
    }

    pub fn remove_group(&mut self, id: GroupId) -> Option<Vec<BookId>> {
        let removed = self.books_for_group.get(&id).cloned()?;
        let groups = self
            .books_for_group
            .iter()
            .filter(|(gid, _)| **gid != id)
            .map(|(_, books)| books.clone())
            .collect();
        self.rebuild(groups, self.current);
        Some(removed)
    }

    /// Re-split every group against updated exemptions, keeping the display
    /// order of the surviving books.
    pub fn apply_exemptions(&mut self, lookup: &dyn ExemptionLookup) {
        let mut groups = Vec::new();
        for books in self.books_for_group.values() {
            let members: BTreeSet<BookId> = books.iter().copied().collect();
            for part in partition(&members, lookup) {
                groups.push(books.iter().copied().filter(|b| part.contains(b)).collect());
            }
        }
        self.rebuild(groups, self.current);
    }

    fn rebuild(&mut self, groups: Vec<Vec<BookId>>, current: Option<GroupId>) {
        self.books_for_group.clear();
        self.groups_for_book.clear();

        let groups: Vec<Vec<BookId>> = groups.into_iter().filter(|b| b.len() >= 2).collect();
        let sets: Vec<BTreeSet<BookId>> = groups
            .iter()
            .map(|books| books.iter().copied().collect())
            .collect();

        let mut seen = BTreeSet::new();
        for (members, books) in sets.iter().zip(groups) {
            let contained = sets
                .iter()
                .any(|other| members.len() < other.len() && members.is_subset(other));
            if contained || !seen.insert(members) {
                continue;
            }
            let id = self.books_for_group.len() + 1;
            for &book in &books {
                self.groups_for_book.entry(book).or_default().insert(id);
            }
            self.books_for_group.insert(id, books);
        }

        let count = self.group_count();
        self.current = match current {
            _ if count == 0 => None,
            Some(id) => Some(id.min(count)),
            None => None,
        };
    }

    // ─── Marks ─────────────────────────────────────────────

    /// Comma-joined labels per book. With `show_all` false only the current
    /// group is marked.
    pub fn marks(&self, show_all: bool) -> BTreeMap<BookId, String> {
        let groups: Vec<GroupId> = if show_all {
            self.books_for_group.keys().copied().collect()
        } else {
            self.current.into_iter().collect()
        };
        let entangled_books = self.entangled_books();
        let entangled_groups = self.entangled_groups();

        let mut marks: BTreeMap<BookId, Vec<String>> = BTreeMap::new();
        for group in groups {
            let Some(books) = self.books_for_group.get(&group) else {
                continue;
            };
            let last = books.len().saturating_sub(1);
            for (position, &book) in books.iter().enumerate() {
                let entry = marks.entry(book).or_default();
                let mut add = |label: &str| {
                    if !entry.iter().any(|l| l == label) {
                        entry.push(label.to_string());
                    }
                };
                add(labels::DUPLICATE);
                add(labels::group_position(group, position + 1).as_str());
                if position == 0 {
                    add(labels::FIRST_DUPLICATE);
                }
                if position == last {
                    add(labels::LAST_DUPLICATE);
                }
                if entangled_groups.contains(&group) {
                    add(labels::ENTANGLED_GROUP);
                }
                if entangled_books.contains(&book) {
                    add(labels::ENTANGLED_BOOK);
                }
                if self.kind == ReportKind::Binary && position > 0 {
                    add(labels::DELETED_BINARY_DUPLICATE);
                }
            }
        }

        marks
            .into_iter()
            .map(|(book, labels)| (book, labels.join(",")))
            .collect()
    }
}
