//! Sorted set data structure: dual-indexed by score and member.
//!
//! Each member has a unique name and an associated `f64` score. Members
//! are ordered by (score, member) — ties in score are broken
//! lexicographically, matching Redis semantics.
//!
//! Implementation uses a `BTreeMap<(OrderedFloat<f64>, String), ()>` for
//! ordered iteration and a `HashMap<String, OrderedFloat<f64>>` for O(1)
//! member→score lookups.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::str::FromStr;

use ordered_float::OrderedFloat;
use rand::seq::{IndexedRandom, IteratorRandom};

use crate::error::ScoreError;

/// Flags that control ZADD behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZAddFlags {
    /// Only add new members, don't update existing scores.
    pub nx: bool,
    /// Only update existing members, don't add new ones.
    pub xx: bool,
    /// Only update when new score > current score.
    pub gt: bool,
    /// Only update when new score < current score.
    pub lt: bool,
    /// Return count of changed members (added + updated) instead of just added.
    pub ch: bool,
}

impl ZAddFlags {
    /// Rejects mutually exclusive flag combinations: NX with XX, and NX
    /// with either GT or LT.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.nx && self.xx {
            return Err("XX and NX flags are mutually exclusive");
        }
        if self.nx && (self.gt || self.lt) {
            return Err("GT/LT flags not allowed if NX flag is provided");
        }
        if self.gt && self.lt {
            return Err("GT and LT flags are mutually exclusive");
        }
        Ok(())
    }
}

/// Result of a single ZADD member operation.
#[derive(Debug, Clone, Copy)]
pub struct AddResult {
    /// Whether a new member was added.
    pub added: bool,
    /// Whether an existing member's score was changed.
    pub updated: bool,
}

impl AddResult {
    /// No change: member was neither added nor updated.
    pub const UNCHANGED: Self = Self {
        added: false,
        updated: false,
    };
}

/// How scores are combined across inputs in union/intersection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Aggregate {
    #[default]
    Sum,
    Min,
    Max,
}

impl Aggregate {
    fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            Aggregate::Sum => a + b,
            Aggregate::Min => a.min(b),
            Aggregate::Max => a.max(b),
        }
    }
}

impl FromStr for Aggregate {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(Aggregate::Sum),
            "min" => Ok(Aggregate::Min),
            "max" => Ok(Aggregate::Max),
            _ => Err(()),
        }
    }
}

/// One input to a union or intersection: a set and its score multiplier.
#[derive(Debug, Clone, Copy)]
pub struct WeightedSet<'a> {
    pub set: &'a SortedSet,
    pub weight: f64,
}

/// A sorted set of unique string members, each with a floating-point score.
///
/// Members are ordered by `(score, member_name)`. Rank is determined by
/// position in this ordering (0-based, lowest score first).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSet {
    /// Score→member index for ordered iteration.
    tree: BTreeMap<(OrderedFloat<f64>, String), ()>,
    /// Member→score index for O(1) lookups.
    scores: HashMap<String, OrderedFloat<f64>>,
}

impl SortedSet {
    /// Creates an empty sorted set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a sorted set from (score, member) pairs. Later duplicates
    /// of the same member overwrite earlier scores.
    pub fn from_members(members: impl IntoIterator<Item = (f64, String)>) -> Self {
        let mut ss = Self::new();
        for (score, member) in members {
            ss.add(member, score);
        }
        ss
    }

    /// Adds or updates a member with the given score. Returns whether the
    /// member was newly added and/or updated.
    pub fn add(&mut self, member: String, score: f64) -> AddResult {
        self.add_with_flags(member, score, &ZAddFlags::default())
    }

    /// Adds or updates a member with ZADD flag semantics.
    pub fn add_with_flags(&mut self, member: String, score: f64, flags: &ZAddFlags) -> AddResult {
        let new_score = OrderedFloat(score);

        if let Some(&old_score) = self.scores.get(&member) {
            // member exists — skip if any flag condition prevents the update
            if flags.nx
                || (flags.gt && new_score <= old_score)
                || (flags.lt && new_score >= old_score)
                || new_score == old_score
            {
                return AddResult::UNCHANGED;
            }
            self.tree.remove(&(old_score, member.clone()));
            self.scores.insert(member.clone(), new_score);
            self.tree.insert((new_score, member), ());
            AddResult {
                added: false,
                updated: true,
            }
        } else {
            // new member — XX means only update, so skip
            if flags.xx {
                return AddResult::UNCHANGED;
            }
            self.scores.insert(member.clone(), new_score);
            self.tree.insert((new_score, member), ());
            AddResult {
                added: true,
                updated: false,
            }
        }
    }

    /// Applies a batch of (score, member) pairs under the given flags.
    /// Returns (added, updated) counts.
    pub fn add_or_update(&mut self, members: &[(f64, String)], flags: &ZAddFlags) -> (usize, usize) {
        let mut added = 0;
        let mut updated = 0;
        for (score, member) in members {
            let result = self.add_with_flags(member.clone(), *score, flags);
            if result.added {
                added += 1;
            }
            if result.updated {
                updated += 1;
            }
        }
        (added, updated)
    }

    /// Increments a member's score by `delta`, creating the member when
    /// the flags allow it. `±inf` deltas absorb; a NaN result (e.g.
    /// `+inf` plus `-inf`) is an error.
    ///
    /// Returns `Ok(None)` when a policy flag blocked the operation, else
    /// the resulting score.
    pub fn incr_by(
        &mut self,
        member: &str,
        delta: f64,
        flags: &ZAddFlags,
    ) -> Result<Option<f64>, ScoreError> {
        match self.scores.get(member) {
            Some(&old) => {
                if flags.nx {
                    return Ok(None);
                }
                let new = old.0 + delta;
                if new.is_nan() {
                    return Err(ScoreError::NotANumber);
                }
                if (flags.gt && new <= old.0) || (flags.lt && new >= old.0) {
                    return Ok(None);
                }
                self.tree.remove(&(old, member.to_owned()));
                self.scores.insert(member.to_owned(), OrderedFloat(new));
                self.tree.insert((OrderedFloat(new), member.to_owned()), ());
                Ok(Some(new))
            }
            None => {
                if flags.xx {
                    return Ok(None);
                }
                self.add(member.to_owned(), delta);
                Ok(Some(delta))
            }
        }
    }

    /// Removes a member from the sorted set. Returns `true` if it existed.
    pub fn remove(&mut self, member: &str) -> bool {
        if let Some(score) = self.scores.remove(member) {
            self.tree.remove(&(score, member.to_owned()));
            true
        } else {
            false
        }
    }

    /// Returns the score for a member, or `None` if not present.
    pub fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).map(|s| s.0)
    }

    /// Returns `true` if the member is present.
    pub fn contains(&self, member: &str) -> bool {
        self.scores.contains_key(member)
    }

    /// Returns the 0-based rank of a member (lowest score = rank 0).
    /// Returns `None` if the member is not present.
    ///
    /// O(n) — walks the BTreeMap up to the target entry.
    pub fn rank(&self, member: &str) -> Option<usize> {
        let score = self.scores.get(member)?;
        let key = (*score, member.to_owned());
        Some(self.tree.range(..&key).count())
    }

    /// Rank with the ordering reversed (highest score = rank 0).
    pub fn rev_rank(&self, member: &str) -> Option<usize> {
        self.rank(member).map(|r| self.len() - 1 - r)
    }

    /// Returns members in the given rank range, inclusive on both ends.
    /// Supports negative indices: -1 = last, -2 = second to last, etc.
    pub fn range_by_rank(&self, start: i64, stop: i64) -> Vec<(String, f64)> {
        let len = self.tree.len() as i64;
        let (s, e) = super::normalize_range(start, stop, len);
        if s > e {
            return Vec::new();
        }

        self.tree
            .keys()
            .skip(s as usize)
            .take((e - s + 1) as usize)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    /// Returns members with `min ≤ score ≤ max`, in (score, member) order.
    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<(String, f64)> {
        if min > max {
            return Vec::new();
        }
        self.tree
            .range((
                Bound::Included((OrderedFloat(min), String::new())),
                Bound::Unbounded,
            ))
            .take_while(|((score, _), _)| score.0 <= max)
            .map(|((score, member), _)| (member.clone(), score.0))
            .collect()
    }

    /// Counts members with `min ≤ score ≤ max`.
    pub fn count_in_score_range(&self, min: f64, max: f64) -> usize {
        self.range_by_score(min, max).len()
    }

    /// Returns `true` if every member carries the same score. Lex
    /// operations are only meaningful on uniform-score sets.
    pub fn has_uniform_scores(&self) -> bool {
        let mut scores = self.scores.values();
        match scores.next() {
            None => true,
            Some(first) => scores.all(|s| s == first),
        }
    }

    /// Returns members in the inclusive lexicographic range `[min, max]`.
    /// Requires uniform scores; returns an empty vec otherwise.
    pub fn range_by_lex(&self, min: &str, max: &str) -> Vec<(String, f64)> {
        if !self.has_uniform_scores() {
            return Vec::new();
        }
        // uniform scores: tree order equals lexicographic member order
        self.tree
            .keys()
            .filter(|(_, member)| member.as_str() >= min && member.as_str() <= max)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    /// Counts members in the inclusive lexicographic range. Returns 0 on
    /// non-uniform scores.
    pub fn lex_count(&self, min: &str, max: &str) -> usize {
        self.range_by_lex(min, max).len()
    }

    /// Removes and returns up to `count` members with the lowest scores,
    /// in ascending order.
    pub fn pop_min(&mut self, count: usize) -> Vec<(String, f64)> {
        let victims: Vec<(String, f64)> = self
            .tree
            .keys()
            .take(count)
            .map(|(score, member)| (member.clone(), score.0))
            .collect();
        for (member, _) in &victims {
            self.remove(member);
        }
        victims
    }

    /// Removes and returns up to `count` members with the highest scores,
    /// in descending order.
    pub fn pop_max(&mut self, count: usize) -> Vec<(String, f64)> {
        let victims: Vec<(String, f64)> = self
            .tree
            .keys()
            .rev()
            .take(count)
            .map(|(score, member)| (member.clone(), score.0))
            .collect();
        for (member, _) in &victims {
            self.remove(member);
        }
        victims
    }

    /// Removes members with `min ≤ score ≤ max`. Returns the removal count.
    pub fn remove_range_by_score(&mut self, min: f64, max: f64) -> usize {
        let victims: Vec<String> = self
            .range_by_score(min, max)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        for member in &victims {
            self.remove(member);
        }
        victims.len()
    }

    /// Removes members in the rank range. Negative indices count back
    /// from the tail; the bounds are swapped when reversed. Returns
    /// `None` when a mapped index is still out of range.
    pub fn remove_range_by_rank(&mut self, start: i64, stop: i64) -> Option<usize> {
        let len = self.len() as i64;
        let mut start = if start < 0 { start + len } else { start };
        let mut stop = if stop < 0 { stop + len } else { stop };
        if start < 0 || start > len - 1 || stop < 0 || stop > len - 1 {
            return None;
        }
        if start > stop {
            std::mem::swap(&mut start, &mut stop);
        }

        let victims: Vec<String> = self
            .tree
            .keys()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|(_, member)| member.clone())
            .collect();
        for member in &victims {
            self.remove(member);
        }
        Some(victims.len())
    }

    /// Removes members in the inclusive lexicographic range. A no-op
    /// returning 0 when scores are not uniform.
    pub fn remove_range_by_lex(&mut self, min: &str, max: &str) -> usize {
        let victims: Vec<String> = self
            .range_by_lex(min, max)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        for member in &victims {
            self.remove(member);
        }
        victims.len()
    }

    /// Returns random members. A non-negative `count` yields up to
    /// `count` distinct members; a negative `count` yields `|count|`
    /// members with repeats allowed.
    pub fn random_members(&self, count: i64) -> Vec<(String, f64)> {
        let mut rng = rand::rng();
        if count >= 0 {
            self.tree
                .keys()
                .choose_multiple(&mut rng, count as usize)
                .into_iter()
                .map(|(score, member)| (member.clone(), score.0))
                .collect()
        } else {
            let pool: Vec<&(OrderedFloat<f64>, String)> = self.tree.keys().collect();
            if pool.is_empty() {
                return Vec::new();
            }
            (0..count.unsigned_abs() as usize)
                .filter_map(|_| pool.choose(&mut rng))
                .map(|(score, member)| (member.clone(), score.0))
                .collect()
        }
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Returns `true` if the sorted set has no members.
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Returns an iterator over (member, score) pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.tree
            .keys()
            .map(|(score, member)| (member.as_str(), score.0))
    }

    /// All (score, member) pairs in sorted order. Used by persistence.
    pub fn to_pairs(&self) -> Vec<(f64, String)> {
        self.tree
            .keys()
            .map(|(score, member)| (score.0, member.clone()))
            .collect()
    }

    /// Estimates memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        let per_entry: usize = self
            .scores
            .keys()
            .map(|k| Self::estimated_member_cost(k))
            .sum();
        Self::BASE_OVERHEAD + per_entry
    }

    /// Base overhead of an empty sorted set (BTreeMap + HashMap shells).
    pub const BASE_OVERHEAD: usize = 24 + 48;

    /// Estimates the memory cost of storing a single member: tree entry,
    /// hash entry, the member string held in both, and the score.
    pub fn estimated_member_cost(member: &str) -> usize {
        const BTREE_ENTRY: usize = 64;
        const HASHMAP_ENTRY: usize = 56;
        BTREE_ENTRY + HASHMAP_ENTRY + member.len() * 2 + 8
    }
}

/// Union of the inputs: every distinct member, with its weighted score
/// aggregated across the inputs that contain it.
pub fn union(aggregate: Aggregate, inputs: &[WeightedSet<'_>]) -> SortedSet {
    let mut combined: HashMap<String, f64> = HashMap::new();
    for input in inputs {
        for (member, score) in input.set.iter() {
            let weighted = score * input.weight;
            combined
                .entry(member.to_owned())
                .and_modify(|existing| *existing = aggregate.combine(*existing, weighted))
                .or_insert(weighted);
        }
    }
    SortedSet::from_members(combined.into_iter().map(|(m, s)| (s, m)))
}

/// Intersection of the inputs: members present in every input, with
/// weighted scores aggregated across all of them.
pub fn intersect(aggregate: Aggregate, inputs: &[WeightedSet<'_>]) -> SortedSet {
    let Some((first, rest)) = inputs.split_first() else {
        return SortedSet::new();
    };

    let mut result = SortedSet::new();
    'members: for (member, score) in first.set.iter() {
        let mut combined = score * first.weight;
        for input in rest {
            match input.set.score(member) {
                Some(s) => combined = aggregate.combine(combined, s * input.weight),
                None => continue 'members,
            }
        }
        result.add(member.to_owned(), combined);
    }
    result
}

/// Difference: members of `base` absent from every other set. Scores
/// carry through from the base set unchanged.
pub fn difference(base: &SortedSet, others: &[&SortedSet]) -> SortedSet {
    let mut result = SortedSet::new();
    for (member, score) in base.iter() {
        if others.iter().all(|s| !s.contains(member)) {
            result.add(member.to_owned(), score);
        }
    }
    result
}

/// Parses a score string: decimal floats plus `+inf`/`-inf`/`inf`,
/// case-insensitive. NaN is rejected.
pub fn parse_score(input: &str) -> Result<f64, ScoreError> {
    match input.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" | "+infinity" => Ok(f64::INFINITY),
        "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
        other => {
            let parsed: f64 = other.parse().map_err(|_| ScoreError::NotAFloat)?;
            if parsed.is_nan() {
                return Err(ScoreError::NotAFloat);
            }
            Ok(parsed)
        }
    }
}

/// Formats a score for RESP replies: integers without a decimal point,
/// infinities as `inf`/`-inf`, everything else in shortest form that
/// round-trips.
pub fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        return "inf".into();
    }
    if score == f64::NEG_INFINITY {
        return "-inf".into();
    }
    if score == score.trunc() && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}
