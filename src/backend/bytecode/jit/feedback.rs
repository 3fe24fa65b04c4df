//! Runtime feedback and guard records
//!
//! While a unit runs in the interpreter, instrumented sites report what they
//! see: the truth value feeding a conditional branch, the callee at a call
//! site, the operand types at a binary operator. Each site keeps a
//! [`GuardRecord`] holding the first observation, a hit count and a
//! consistency flag that is cleared for good the first time an observation
//! disagrees.
//!
//! The lowering pass only specializes a site that is still consistent.
//! Everything else is compiled generically.

use std::collections::HashMap;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::backend::object::{TypeTag, Value};

/// Distinct values kept by [`LimitedFeedback`] before it overflows
pub const MAX_FEEDBACK: usize = 3;

/// An instrumented site: instruction index plus the position of the
/// primitive inside a superinstruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId {
    pub ip: u32,
    pub prim: u8,
}

impl SiteId {
    pub fn new(ip: usize, prim: usize) -> Self {
        SiteId {
            ip: ip as u32,
            prim: prim as u8,
        }
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.ip, self.prim)
    }
}

/// Up to [`MAX_FEEDBACK`] distinct observations, then an overflow flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitedFeedback<T> {
    items: SmallVec<[T; MAX_FEEDBACK]>,
    overflowed: bool,
}

impl<T> Default for LimitedFeedback<T> {
    fn default() -> Self {
        LimitedFeedback {
            items: SmallVec::new(),
            overflowed: false,
        }
    }
}

impl<T: Copy + PartialEq> LimitedFeedback<T> {
    pub fn add(&mut self, item: T) {
        if self.items.contains(&item) {
            return;
        }
        if self.items.len() < MAX_FEEDBACK {
            self.items.push(item);
        } else {
            self.overflowed = true;
        }
    }

    pub fn values(&self) -> &[T] {
        &self.items
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// The single value observed, if exactly one was
    pub fn single(&self) -> Option<T> {
        match (self.items.as_slice(), self.overflowed) {
            ([only], false) => Some(*only),
            _ => None,
        }
    }
}

/// Outcome counters of a conditional branch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchCounts {
    pub taken_true: u64,
    pub taken_false: u64,
    /// Tests on values that were not `bool`
    pub non_bool: u64,
}

impl BranchCounts {
    pub fn total(&self) -> u64 {
        self.taken_true + self.taken_false
    }

    /// The only direction ever observed
    pub fn direction(&self) -> Option<bool> {
        match (self.taken_true, self.taken_false) {
            (0, 0) => None,
            (_, 0) => Some(true),
            (0, _) => Some(false),
            _ => None,
        }
    }
}

/// What a site saw on one execution
#[derive(Debug, Clone)]
pub enum Observed {
    /// Truth value feeding a branch
    Truth(bool),
    /// Callee at a call site
    Callee(Value),
    /// Operand types at a binary operator
    Types(TypeTag, TypeTag),
}

impl Observed {
    fn agrees(&self, other: &Observed) -> bool {
        match (self, other) {
            (Observed::Truth(a), Observed::Truth(b)) => a == b,
            (Observed::Callee(a), Observed::Callee(b)) => a.is_same(b),
            (Observed::Types(a, b), Observed::Types(c, d)) => a == c && b == d,
            _ => false,
        }
    }
}

/// Per-site guard record
#[derive(Debug, Clone)]
pub struct GuardRecord {
    /// First observation
    pub stable: Observed,
    /// Cleared once any observation disagrees with `stable`
    pub consistent: bool,
    pub hits: u64,
}

/// Everything recorded for one site
#[derive(Debug, Clone)]
pub struct SiteFeedback {
    pub record: GuardRecord,
    pub branch: BranchCounts,
    pub callees: LimitedFeedback<usize>,
    pub lhs_types: LimitedFeedback<TypeTag>,
    pub rhs_types: LimitedFeedback<TypeTag>,
}

impl SiteFeedback {
    fn new(first: Observed) -> Self {
        SiteFeedback {
            record: GuardRecord {
                stable: first,
                consistent: true,
                hits: 0,
            },
            branch: BranchCounts::default(),
            callees: LimitedFeedback::default(),
            lhs_types: LimitedFeedback::default(),
            rhs_types: LimitedFeedback::default(),
        }
    }
}

/// Feedback for every instrumented site of one code unit
#[derive(Default)]
pub struct FeedbackMap {
    sites: Mutex<HashMap<SiteId, SiteFeedback>>,
}

impl FeedbackMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation at `site`
    pub fn observe(&self, site: SiteId, observed: Observed) {
        let mut sites = self.sites.lock();
        let entry = sites
            .entry(site)
            .or_insert_with(|| SiteFeedback::new(observed.clone()));
        entry.record.hits += 1;
        if entry.record.consistent && !entry.record.stable.agrees(&observed) {
            entry.record.consistent = false;
        }
        match &observed {
            Observed::Truth(true) => entry.branch.taken_true += 1,
            Observed::Truth(false) => entry.branch.taken_false += 1,
            Observed::Callee(callee) => entry.callees.add(callee.identity()),
            Observed::Types(l, r) => {
                entry.lhs_types.add(*l);
                entry.rhs_types.add(*r);
            }
        }
    }

    pub fn record_branch(&self, site: SiteId, tested: &Value) {
        self.observe(site, Observed::Truth(tested.is_true()));
        if !matches!(tested, Value::Bool(_)) {
            if let Some(entry) = self.sites.lock().get_mut(&site) {
                entry.branch.non_bool += 1;
            }
        }
    }

    pub fn record_callee(&self, site: SiteId, callee: &Value) {
        self.observe(site, Observed::Callee(callee.clone()));
    }

    pub fn record_operands(&self, site: SiteId, lhs: &Value, rhs: &Value) {
        self.observe(site, Observed::Types(lhs.type_tag(), rhs.type_tag()));
    }

    /// Whether every observation at `site` agreed
    ///
    /// A site never observed is not consistent.
    pub fn is_consistent(&self, site: SiteId) -> bool {
        self.sites
            .lock()
            .get(&site)
            .is_some_and(|s| s.record.consistent && s.record.hits > 0)
    }

    /// Consistent and observed at least `min_samples` times
    pub fn is_consistent_with(&self, site: SiteId, min_samples: u64) -> bool {
        self.sites
            .lock()
            .get(&site)
            .is_some_and(|s| s.record.consistent && s.record.hits >= min_samples.max(1))
    }

    pub fn get(&self, site: SiteId) -> Option<SiteFeedback> {
        self.sites.lock().get(&site).cloned()
    }

    pub fn branch(&self, site: SiteId) -> Option<BranchCounts> {
        self.sites.lock().get(&site).map(|s| s.branch)
    }

    /// The callee a consistent call site always saw
    pub fn stable_callee(&self, site: SiteId) -> Option<Value> {
        let sites = self.sites.lock();
        let entry = sites.get(&site)?;
        match (&entry.record.stable, entry.record.consistent) {
            (Observed::Callee(v), true) => Some(v.clone()),
            _ => None,
        }
    }

    /// Operand types at a binary operator site
    pub fn operand_types(&self, site: SiteId) -> Option<(LimitedFeedback<TypeTag>, LimitedFeedback<TypeTag>)> {
        self.sites
            .lock()
            .get(&site)
            .map(|s| (s.lhs_types.clone(), s.rhs_types.clone()))
    }

    pub fn len(&self) -> usize {
        self.sites.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.sites.lock().clear();
    }

    /// Sites in instruction order
    pub fn sites(&self) -> Vec<(SiteId, SiteFeedback)> {
        let mut all: Vec<_> = self
            .sites
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        all.sort_by_key(|(k, _)| *k);
        all
    }
}

impl std::fmt::Debug for FeedbackMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackMap")
            .field("sites", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limited_feedback_overflows() {
        let mut fb = LimitedFeedback::default();
        fb.add(TypeTag::Int);
        fb.add(TypeTag::Int);
        assert_eq!(fb.single(), Some(TypeTag::Int));
        fb.add(TypeTag::Float);
        fb.add(TypeTag::Str);
        assert_eq!(fb.values().len(), 3);
        assert!(!fb.overflowed());
        fb.add(TypeTag::List);
        assert!(fb.overflowed());
        assert_eq!(fb.single(), None);
    }

    #[test]
    fn test_branch_consistency_is_sticky() {
        let map = FeedbackMap::new();
        let site = SiteId::new(4, 0);
        assert!(!map.is_consistent(site));
        for _ in 0..10 {
            map.record_branch(site, &Value::Bool(true));
        }
        assert!(map.is_consistent(site));
        assert!(map.is_consistent_with(site, 10));
        assert!(!map.is_consistent_with(site, 11));
        assert_eq!(map.branch(site).unwrap().direction(), Some(true));

        map.record_branch(site, &Value::Bool(false));
        assert!(!map.is_consistent(site));
        for _ in 0..100 {
            map.record_branch(site, &Value::Bool(true));
        }
        assert!(!map.is_consistent(site));
        assert_eq!(map.branch(site).unwrap().direction(), None);
    }

    #[test]
    fn test_non_bool_branches_count_truthiness() {
        let map = FeedbackMap::new();
        let site = SiteId::new(0, 1);
        map.record_branch(site, &Value::Int(3));
        map.record_branch(site, &Value::Bool(true));
        let counts = map.branch(site).unwrap();
        assert_eq!(counts.taken_true, 2);
        assert_eq!(counts.non_bool, 1);
        assert!(map.is_consistent(site));
    }

    #[test]
    fn test_callee_feedback() {
        let map = FeedbackMap::new();
        let site = SiteId::new(9, 0);
        let f = Value::list(vec![]);
        map.record_callee(site, &f);
        map.record_callee(site, &f);
        assert!(map.stable_callee(site).unwrap().is_same(&f));
        map.record_callee(site, &Value::list(vec![]));
        assert!(map.stable_callee(site).is_none());
        assert_eq!(map.get(site).unwrap().callees.values().len(), 2);
    }

    #[test]
    fn test_operand_types() {
        let map = FeedbackMap::new();
        let site = SiteId::new(2, 2);
        map.record_operands(site, &Value::Int(1), &Value::Int(2));
        let (l, r) = map.operand_types(site).unwrap();
        assert_eq!(l.single(), Some(TypeTag::Int));
        assert_eq!(r.single(), Some(TypeTag::Int));
        map.record_operands(site, &Value::Int(1), &Value::Float(2.0));
        let (_, r) = map.operand_types(site).unwrap();
        assert_eq!(r.single(), None);
        assert!(!map.is_consistent(site));
    }
}
