//! Ordering books inside groups and ordering the groups themselves.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet};

use bookhound_core::{BookId, FieldKind, FieldValue, Library};
use chrono::NaiveDate;

use crate::error::Result;
use crate::normalize::{self, Language, TextKind};
use crate::rules::{SortFilter, TypeHint};

/// A comparable field value. Missing or unparseable values become the
/// smallest value of their type.
#[derive(Debug, Clone)]
pub enum SortKey {
    Text(String),
    Number(f64),
    /// Seconds since the epoch.
    Date(i64),
}

impl SortKey {
    pub fn from_value(value: Option<&FieldValue>, hint: TypeHint) -> Self {
        match hint {
            TypeHint::Text => SortKey::Text(
                value
                    .map(|v| v.render(", ").to_lowercase())
                    .unwrap_or_default(),
            ),
            TypeHint::Number => SortKey::Number(
                value
                    .and_then(FieldValue::as_number)
                    .unwrap_or(f64::NEG_INFINITY),
            ),
            TypeHint::Date => SortKey::Date(value.and_then(date_seconds).unwrap_or(i64::MIN)),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortKey::Text(_) => 0,
            SortKey::Number(_) => 1,
            SortKey::Date(_) => 2,
        }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Date(a), SortKey::Date(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

fn date_seconds(value: &FieldValue) -> Option<i64> {
    match value {
        FieldValue::Date(d) => Some(d.timestamp()),
        FieldValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc().timestamp()),
        _ => None,
    }
}

/// Hint from the filter, else from the field's storage kind.
pub fn effective_hint(filter: &SortFilter, library: &dyn Library) -> TypeHint {
    if let Some(hint) = filter.type_hint {
        return hint;
    }
    match library.field_metadata(&filter.field).map(|m| m.kind) {
        Some(FieldKind::Numeric | FieldKind::Rating) => TypeHint::Number,
        Some(FieldKind::Date) => TypeHint::Date,
        _ => TypeHint::Text,
    }
}

/// Sorts the members of groups by a list of filters.
pub struct GroupSorter<'a> {
    library: &'a dyn Library,
    filters: &'a [SortFilter],
    hints: Vec<TypeHint>,
}

impl<'a> GroupSorter<'a> {
    pub fn new(library: &'a dyn Library, filters: &'a [SortFilter]) -> Self {
        let hints = filters
            .iter()
            .map(|f| effective_hint(f, library))
            .collect();
        Self {
            library,
            filters,
            hints,
        }
    }

    /// Ascending id first, then one stable pass per filter from last to
    /// first, so the first filter has the final word.
    pub fn sort(&self, members: &BTreeSet<BookId>) -> Result<Vec<BookId>> {
        let mut books: Vec<BookId> = members.iter().copied().collect();
        if self.filters.is_empty() {
            return Ok(books);
        }

        let mut keys: BTreeMap<(BookId, usize), SortKey> = BTreeMap::new();
        for &book in &books {
            for (i, filter) in self.filters.iter().enumerate() {
                let value = self.library.field(book, &filter.field)?;
                keys.insert((book, i), SortKey::from_value(value.as_ref(), self.hints[i]));
            }
        }

        for (i, filter) in self.filters.iter().enumerate().rev() {
            books.sort_by(|a, b| {
                let ordering = keys[&(*a, i)].cmp(&keys[&(*b, i)]);
                if filter.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        Ok(books)
    }
}

/// Fuzzy form of a book title used to order groups.
pub fn title_key(library: &dyn Library, book: BookId) -> Result<String> {
    let title = library
        .field(book, "title")?
        .map(|v| v.render(", "))
        .unwrap_or_default();
    Ok(normalize::fuzzy(&title, TextKind::Title, Language::English, false))
}

/// Order sorted groups: by the title of each group's first book, or by
/// descending size then title. Ties fall back to the member ids.
pub fn order_groups(
    library: &dyn Library,
    groups: Vec<Vec<BookId>>,
    by_title: bool,
) -> Result<Vec<Vec<BookId>>> {
    let mut keyed = Vec::with_capacity(groups.len());
    for group in groups {
        let title = match group.first() {
            Some(&first) => title_key(library, first)?,
            None => String::new(),
        };
        let mut ids = group.clone();
        ids.sort_unstable();
        let size = if by_title { 0 } else { group.len() };
        keyed.push(((Reverse(size), title, ids), group));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, group)| group).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookhound_core::{BookRecord, MemoryLibrary};
    use chrono::{TimeZone, Utc};

    fn library() -> MemoryLibrary {
        let mut a = BookRecord::new(1, "Zebra Tales").with_series("Zoo", 2.0);
        a.pubdate = Some(Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap());
        let mut b = BookRecord::new(2, "apple pie").with_series("Zoo", 10.0);
        b.pubdate = Some(Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap());
        let c = BookRecord::new(3, "The Middle").with_series("Zoo", 2.0);
        MemoryLibrary::with_books([a, b, c])
    }

    fn members(ids: &[BookId]) -> BTreeSet<BookId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_missing_values_sort_first() {
        assert!(
            SortKey::from_value(None, TypeHint::Number)
                < SortKey::from_value(Some(&FieldValue::Number(-5.0)), TypeHint::Number)
        );
        assert!(
            SortKey::from_value(Some(&FieldValue::Text("soon".into())), TypeHint::Date)
                < SortKey::from_value(Some(&FieldValue::Text("1990-01-01".into())), TypeHint::Date)
        );
        assert_eq!(SortKey::from_value(None, TypeHint::Text), SortKey::Text(String::new()));
    }

    #[test]
    fn test_numeric_hint_from_field_kind() {
        let lib = library();
        let sorter_filters = [SortFilter::ascending("series_index")];
        let sorter = GroupSorter::new(&lib, &sorter_filters);
        assert_eq!(sorter.sort(&members(&[1, 2, 3])).unwrap(), vec![1, 3, 2]);
    }

    #[test]
    fn test_first_filter_wins_and_ids_break_ties() {
        let lib = library();
        let filters = [
            SortFilter::descending("series_index"),
            SortFilter::ascending("title"),
        ];
        let sorter = GroupSorter::new(&lib, &filters);
        assert_eq!(sorter.sort(&members(&[1, 2, 3])).unwrap(), vec![2, 3, 1]);

        let filters = [SortFilter::ascending("series")];
        let sorter = GroupSorter::new(&lib, &filters);
        assert_eq!(sorter.sort(&members(&[3, 1, 2])).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dates_and_missing_dates() {
        let lib = library();
        let filters = [SortFilter::ascending("pubdate")];
        let sorter = GroupSorter::new(&lib, &filters);
        assert_eq!(sorter.sort(&members(&[1, 2, 3])).unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn test_groups_ordered_by_title_or_size() {
        let lib = library();
        let groups = vec![vec![1, 2], vec![3, 1, 2], vec![2, 3]];

        let by_title = order_groups(&lib, groups.clone(), true).unwrap();
        assert_eq!(by_title, vec![vec![2, 3], vec![3, 1, 2], vec![1, 2]]);

        let by_size = order_groups(&lib, groups, false).unwrap();
        assert_eq!(by_size, vec![vec![3, 1, 2], vec![2, 3], vec![1, 2]]);
    }
}
