//! Dependency tags and the reverse index from tags to live fingerprints.

use super::fingerprint::Fingerprint;
use gradebook_core::{SemesterId, StudentId, SubjectCode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A piece of ledger data a cached report was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DependencyTag {
    Student(StudentId),
    Semester(SemesterId),
    Subject(SubjectCode),
    SchoolYear(u16),
    /// Reports that read across every record (listings, global summaries).
    AnyGrade,
    /// Entries stored without declared dependencies.
    Unindexed,
}

impl DependencyTag {
    /// Tags touched by a change to one grade.
    ///
    /// `Unindexed` is always included: an entry that declared nothing may
    /// depend on anything.
    pub fn for_grade_change(
        student_id: StudentId,
        semester_id: SemesterId,
        subject_code: &SubjectCode,
        school_year: Option<u16>,
    ) -> Vec<DependencyTag> {
        let mut tags = vec![
            DependencyTag::Student(student_id),
            DependencyTag::Semester(semester_id),
            DependencyTag::Subject(subject_code.clone()),
            DependencyTag::AnyGrade,
            DependencyTag::Unindexed,
        ];
        if let Some(year) = school_year {
            tags.push(DependencyTag::SchoolYear(year));
        }
        tags
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyTag::Student(id) => write!(f, "student:{}", id),
            DependencyTag::Semester(id) => write!(f, "semester:{}", id),
            DependencyTag::Subject(code) => write!(f, "subject:{}", code),
            DependencyTag::SchoolYear(year) => write!(f, "school_year:{}", year),
            DependencyTag::AnyGrade => f.write_str("any_grade"),
            DependencyTag::Unindexed => f.write_str("unindexed"),
        }
    }
}

/// Reverse index: tag to the fingerprints registered under it.
///
/// Not synchronized; the owning backend guards it with its own lock.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    by_tag: HashMap<DependencyTag, HashSet<Fingerprint>>,
    by_fingerprint: HashMap<Fingerprint, Vec<DependencyTag>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fingerprint` under `tags`, replacing any previous registration.
    /// An empty tag list registers under `Unindexed`.
    pub fn register(&mut self, fingerprint: &Fingerprint, tags: &[DependencyTag]) {
        self.remove(fingerprint);

        let mut tags: Vec<DependencyTag> = tags.to_vec();
        if tags.is_empty() {
            tags.push(DependencyTag::Unindexed);
        }
        tags.sort();
        tags.dedup();

        for tag in &tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(fingerprint.clone());
        }
        self.by_fingerprint.insert(fingerprint.clone(), tags);
    }

    /// Drop a fingerprint from the index. Returns its tags if it was registered.
    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Vec<DependencyTag>> {
        let tags = self.by_fingerprint.remove(fingerprint)?;
        for tag in &tags {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(fingerprint);
                if set.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        Some(tags)
    }

    /// Every fingerprint registered under any of `tags`.
    pub fn matching(&self, tags: &[DependencyTag]) -> HashSet<Fingerprint> {
        tags.iter()
            .filter_map(|tag| self.by_tag.get(tag))
            .flat_map(|set| set.iter().cloned())
            .collect()
    }

    pub fn tags_of(&self, fingerprint: &Fingerprint) -> Option<&[DependencyTag]> {
        self.by_fingerprint.get(fingerprint).map(Vec::as_slice)
    }

    pub fn clear(&mut self) {
        self.by_tag.clear();
        self.by_fingerprint.clear();
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::QueryParams;

    fn fp(endpoint: &str, page: i64) -> Fingerprint {
        Fingerprint::new(endpoint, &QueryParams::new().with("page", page))
    }

    #[test]
    fn test_matching_any_tag() {
        let mut index = DependencyIndex::new();
        let a = fp("a", 1);
        let b = fp("b", 1);
        index.register(&a, &[DependencyTag::Student(StudentId(1))]);
        index.register(&b, &[DependencyTag::Semester(SemesterId(1))]);

        let hit = index.matching(&[DependencyTag::Student(StudentId(1))]);
        assert!(hit.contains(&a));
        assert!(!hit.contains(&b));

        let both = index.matching(&[
            DependencyTag::Student(StudentId(1)),
            DependencyTag::Semester(SemesterId(1)),
        ]);
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn test_empty_tags_register_unindexed() {
        let mut index = DependencyIndex::new();
        let a = fp("a", 1);
        index.register(&a, &[]);
        assert_eq!(index.tags_of(&a), Some(&[DependencyTag::Unindexed][..]));

        let change = DependencyTag::for_grade_change(
            StudentId(9),
            SemesterId(9),
            &SubjectCode::from("X"),
            None,
        );
        assert!(index.matching(&change).contains(&a));
    }

    #[test]
    fn test_reregister_replaces_tags() {
        let mut index = DependencyIndex::new();
        let a = fp("a", 1);
        index.register(&a, &[DependencyTag::Student(StudentId(1))]);
        index.register(&a, &[DependencyTag::Student(StudentId(2))]);

        assert!(index.matching(&[DependencyTag::Student(StudentId(1))]).is_empty());
        assert_eq!(index.matching(&[DependencyTag::Student(StudentId(2))]).len(), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_cleans_reverse_entries() {
        let mut index = DependencyIndex::new();
        let a = fp("a", 1);
        index.register(&a, &[DependencyTag::AnyGrade, DependencyTag::SchoolYear(2023)]);
        assert!(index.remove(&a).is_some());
        assert!(index.is_empty());
        assert!(index.matching(&[DependencyTag::AnyGrade]).is_empty());
        assert!(index.remove(&a).is_none());
    }

    #[test]
    fn test_every_page_of_a_listing_is_matched() {
        let mut index = DependencyIndex::new();
        for page in 1..=250 {
            index.register(&fp("all_students_performance", page), &[DependencyTag::AnyGrade]);
        }
        let change = DependencyTag::for_grade_change(
            StudentId(1),
            SemesterId(1),
            &SubjectCode::from("MATH101"),
            Some(2023),
        );
        assert_eq!(index.matching(&change).len(), 250);
    }
}
