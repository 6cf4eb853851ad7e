//! Turning a candidate map into duplicate groups.
//!
//! Candidate sets that are subsets of other candidate sets are dropped, then
//! every set is split until no two exempt members share a partition.

use std::collections::{BTreeMap, BTreeSet};

use bookhound_core::BookId;

use crate::exemptions::{AuthorExemptions, BookExemptions};
use crate::hashing::CandidateMap;
use crate::progress::{RunControl, RunLog, Stage};

/// Answers "which members must not share a group with this one".
pub trait ExemptionLookup {
    fn exempt_siblings(&self, member: BookId) -> BTreeSet<BookId>;
}

/// No exemptions at all.
pub struct NoExemptions;

impl ExemptionLookup for NoExemptions {
    fn exempt_siblings(&self, _member: BookId) -> BTreeSet<BookId> {
        BTreeSet::new()
    }
}

impl<T: ExemptionLookup + ?Sized> ExemptionLookup for &T {
    fn exempt_siblings(&self, member: BookId) -> BTreeSet<BookId> {
        (**self).exempt_siblings(member)
    }
}

impl ExemptionLookup for BookExemptions {
    fn exempt_siblings(&self, member: BookId) -> BTreeSet<BookId> {
        self.exempt_from(&member)
    }
}

/// Author-scope exemptions seen from the books: two books are siblings when
/// one carries an author exempt from an author of the other and they share
/// no author.
pub struct AuthorScope<'a> {
    store: &'a AuthorExemptions,
    authors: BTreeMap<BookId, BTreeSet<String>>,
    books_by_author: BTreeMap<String, BTreeSet<BookId>>,
}

impl<'a> AuthorScope<'a> {
    pub fn new(store: &'a AuthorExemptions, authors: BTreeMap<BookId, BTreeSet<String>>) -> Self {
        let mut books_by_author: BTreeMap<String, BTreeSet<BookId>> = BTreeMap::new();
        for (&book, names) in &authors {
            for name in names {
                books_by_author.entry(name.clone()).or_default().insert(book);
            }
        }
        Self {
            store,
            authors,
            books_by_author,
        }
    }
}

impl ExemptionLookup for AuthorScope<'_> {
    fn exempt_siblings(&self, member: BookId) -> BTreeSet<BookId> {
        let Some(own) = self.authors.get(&member) else {
            return BTreeSet::new();
        };
        let mut siblings = BTreeSet::new();
        for author in own {
            for exempt in self.store.exempt_from(author) {
                if let Some(books) = self.books_by_author.get(&exempt) {
                    siblings.extend(books.iter().copied());
                }
            }
        }
        siblings.retain(|book| {
            *book != member
                && self
                    .authors
                    .get(book)
                    .is_none_or(|theirs| theirs.is_disjoint(own))
        });
        siblings
    }
}

/// Drop duplicate sets and sets contained in another set. Output is sorted.
pub fn remove_subsets(mut sets: Vec<BTreeSet<BookId>>) -> Vec<BTreeSet<BookId>> {
    sets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    sets.dedup();

    let mut kept: Vec<BTreeSet<BookId>> = Vec::with_capacity(sets.len());
    for set in sets {
        if !kept.iter().any(|k| set.is_subset(k)) {
            kept.push(set);
        }
    }
    kept.sort();
    kept
}

/// Split `group` so that no partition holds a member together with one of
/// its exempt siblings. For each such member a partition `p` becomes
/// `p - siblings` and `p - {member}`; the member therefore stays grouped
/// with everyone it is not exempt from.
pub fn partition(group: &BTreeSet<BookId>, lookup: &dyn ExemptionLookup) -> Vec<BTreeSet<BookId>> {
    let mut partitions = vec![group.clone()];

    for &member in group {
        let siblings = lookup.exempt_siblings(member);
        if siblings.is_empty() {
            continue;
        }

        let mut next: Vec<BTreeSet<BookId>> = Vec::with_capacity(partitions.len() + 1);
        for p in partitions {
            if p.contains(&member) && !p.is_disjoint(&siblings) {
                next.push(p.difference(&siblings).copied().collect());
                let mut without = p;
                without.remove(&member);
                next.push(without);
            } else {
                next.push(p);
            }
        }
        next.retain(|p| p.len() >= 2);
        partitions = remove_subsets(next);
    }

    partitions
}

/// Candidate map → exemption-respecting groups of two or more members.
/// Returns `None` when aborted.
pub fn assemble_groups(
    candidates: CandidateMap,
    lookup: &dyn ExemptionLookup,
    control: &mut RunControl,
    log: &mut RunLog,
) -> Option<Vec<BTreeSet<BookId>>> {
    let sets: Vec<BTreeSet<BookId>> = candidates
        .into_values()
        .filter(|members| members.len() >= 2)
        .collect();
    let sets = remove_subsets(sets);
    let total = sets.len();

    let mut groups = Vec::new();
    for (done, set) in sets.iter().enumerate() {
        if control.is_aborted() {
            log.note(format!("aborted while grouping, {done} of {total} sets done"));
            return None;
        }
        groups.extend(partition(set, lookup));
        control.report(Stage::Grouping, done + 1, total);
    }

    Some(remove_subsets(groups))
}
