//! Byte-identical format files.
//!
//! Files are bucketed by size first; only buckets spanning two or more books
//! are hashed. SHA-256 digests are cached in the library's custom book data
//! and reused while a file's size and modification time are unchanged.

use std::collections::{BTreeMap, BTreeSet};

use bookhound_core::{BookId, Library};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hashing::CandidateMap;
use crate::progress::{RunControl, RunLog, Stage};

/// Custom book data namespace holding the digest cache.
pub const HASH_CACHE_NAMESPACE: &str = "find_duplicates";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedHash {
    pub mtime: DateTime<Utc>,
    pub size: u64,
    pub sha: String,
}

/// Format name → cached digest, for one book.
pub type FormatHashes = BTreeMap<String, CachedHash>;

pub struct BinaryComparer<'a> {
    library: &'a dyn Library,
}

impl<'a> BinaryComparer<'a> {
    pub fn new(library: &'a dyn Library) -> Self {
        Self { library }
    }

    pub fn load_cache(&self) -> Result<BTreeMap<BookId, FormatHashes>> {
        let raw = self.library.get_custom_book_data(HASH_CACHE_NAMESPACE)?;
        let mut cache = BTreeMap::new();
        for (book_id, value) in raw {
            match serde_json::from_value::<FormatHashes>(value) {
                Ok(formats) => {
                    cache.insert(book_id, formats);
                }
                Err(e) => tracing::warn!(book_id, "ignoring unreadable hash cache entry: {e}"),
            }
        }
        Ok(cache)
    }

    fn save_cache(&self, cache: &BTreeMap<BookId, FormatHashes>) -> Result<()> {
        let mut raw = BTreeMap::new();
        for (&book_id, formats) in cache {
            raw.insert(book_id, serde_json::to_value(formats)?);
        }
        self.library.set_custom_book_data(HASH_CACHE_NAMESPACE, &raw)?;
        Ok(())
    }

    /// Digest → books holding a file with that digest. Returns `None` when
    /// aborted; digests computed so far are still cached.
    pub fn candidates(
        &self,
        ids: &[BookId],
        control: &mut RunControl,
        log: &mut RunLog,
    ) -> Result<Option<CandidateMap>> {
        let mut by_size: BTreeMap<u64, Vec<(BookId, String)>> = BTreeMap::new();
        for &book_id in ids {
            for format in self.library.formats(book_id)? {
                if let Some(size) = self.library.format_size(book_id, &format)? {
                    by_size.entry(size).or_default().push((book_id, format));
                }
            }
        }

        let to_hash: Vec<(u64, BookId, String)> = by_size
            .into_iter()
            .filter(|(_, files)| {
                files.iter().map(|(id, _)| *id).collect::<BTreeSet<_>>().len() >= 2
            })
            .flat_map(|(size, files)| {
                files
                    .into_iter()
                    .map(move |(book_id, format)| (size, book_id, format))
            })
            .collect();

        let mut cache = self.load_cache()?;
        let mut candidates = CandidateMap::new();
        let (mut reused, mut computed) = (0usize, 0usize);
        let total = to_hash.len();

        for (done, (size, book_id, format)) in to_hash.into_iter().enumerate() {
            if control.is_aborted() {
                log.note(format!("aborted after hashing {done} of {total} files"));
                self.save_cache(&cache)?;
                return Ok(None);
            }

            let mtime = self.library.format_mtime(book_id, &format)?;
            let cached = cache
                .get(&book_id)
                .and_then(|formats| formats.get(&format))
                .filter(|entry| entry.size == size && Some(entry.mtime) == mtime)
                .map(|entry| entry.sha.clone());

            let sha = match cached {
                Some(sha) => {
                    reused += 1;
                    sha
                }
                None => {
                    let Some(sha) = self.library.format_hash(book_id, &format)? else {
                        continue;
                    };
                    computed += 1;
                    if let Some(mtime) = mtime {
                        cache.entry(book_id).or_default().insert(
                            format.clone(),
                            CachedHash {
                                mtime,
                                size,
                                sha: sha.clone(),
                            },
                        );
                    }
                    sha
                }
            };
            candidates.entry(sha).or_default().insert(book_id);
            control.report(Stage::BinaryHashing, done + 1, total);
        }

        self.save_cache(&cache)?;
        tracing::debug!(files = total, reused, computed, "hashed format files");
        Ok(Some(candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookhound_core::{BookRecord, MemoryLibrary};
    use chrono::TimeZone;

    fn library() -> MemoryLibrary {
        let when = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut lib = MemoryLibrary::with_books((1..=4).map(|id| BookRecord::new(id, "Book")));
        lib.add_format(1, "EPUB", b"identical content".to_vec(), when);
        lib.add_format(2, "EPUB", b"identical content".to_vec(), when);
        lib.add_format(3, "EPUB", b"different content".to_vec(), when);
        lib.add_format(4, "PDF", b"a much longer file than the others".to_vec(), when);
        lib
    }

    fn run(lib: &MemoryLibrary) -> CandidateMap {
        BinaryComparer::new(lib)
            .candidates(&[1, 2, 3, 4], &mut RunControl::new(), &mut RunLog::default())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_size_prefilter_skips_unique_sizes() {
        let lib = library();
        let candidates = run(&lib);
        // 1, 2 and 3 share a size; 4 is never hashed
        assert_eq!(lib.hash_requests(), 3);
        let groups: Vec<&BTreeSet<BookId>> =
            candidates.values().filter(|b| b.len() >= 2).collect();
        assert_eq!(groups, vec![&[1, 2].into_iter().collect::<BTreeSet<_>>()]);
    }

    #[test]
    fn test_cache_reused_on_second_run() {
        let lib = library();
        run(&lib);
        let cache = BinaryComparer::new(&lib).load_cache().unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache[&1]["EPUB"].size, 17);

        run(&lib);
        assert_eq!(lib.hash_requests(), 3);
    }

    #[test]
    fn test_changed_file_is_rehashed() {
        let mut lib = library();
        run(&lib);
        let later = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        lib.add_format(2, "EPUB", b"identical content".to_vec(), later);

        let candidates = run(&lib);
        assert_eq!(lib.hash_requests(), 4);
        assert!(candidates.values().any(|b| b.len() == 2));
    }
}
