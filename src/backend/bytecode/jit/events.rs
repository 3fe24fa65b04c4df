//! Timing Events
//!
//! Discrete timestamped events emitted at tier-transition boundaries. An
//! [`EventTimer`] keeps the most recent events in a bounded ring; an
//! [`EventAnalyzer`] pairs start/end events per thread and summarizes the
//! latency of each transition.
//!
//! # Pairs
//!
//! ```text
//! COMPILE_START     -> COMPILE_END        compile
//! LOWER_START       -> LOWER_END          lower
//! BAIL_START        -> BAIL_END           bail
//! CALL_START_EVAL   -> CALL_ENTER_EVAL    call_to_eval
//! CALL_START_EVAL   -> CALL_ENTER_NATIVE  call_to_native
//! ```

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use itertools::Itertools;
use parking_lot::Mutex;

/// Event vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    CallStartEval,
    CallEnterEval,
    CallEnterNative,
    CallEndEval,
    CompileStart,
    CompileEnd,
    LowerStart,
    LowerEnd,
    BailStart,
    BailEnd,
    ExceptRaiseEval,
    ExceptRaiseNative,
    ExceptCatchEval,
    ExceptCatchNative,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::CallStartEval => "CALL_START_EVAL",
            EventKind::CallEnterEval => "CALL_ENTER_EVAL",
            EventKind::CallEnterNative => "CALL_ENTER_NATIVE",
            EventKind::CallEndEval => "CALL_END_EVAL",
            EventKind::CompileStart => "COMPILE_START",
            EventKind::CompileEnd => "COMPILE_END",
            EventKind::LowerStart => "LOWER_START",
            EventKind::LowerEnd => "LOWER_END",
            EventKind::BailStart => "BAIL_START",
            EventKind::BailEnd => "BAIL_END",
            EventKind::ExceptRaiseEval => "EXCEPT_RAISE_EVAL",
            EventKind::ExceptRaiseNative => "EXCEPT_RAISE_NATIVE",
            EventKind::ExceptCatchEval => "EXCEPT_CATCH_EVAL",
            EventKind::ExceptCatchNative => "EXCEPT_CATCH_NATIVE",
        }
    }

    /// Event that closes an interval opened by `self`
    fn closers(self) -> &'static [(EventKind, &'static str)] {
        match self {
            EventKind::CompileStart => &[(EventKind::CompileEnd, "compile")],
            EventKind::LowerStart => &[(EventKind::LowerEnd, "lower")],
            EventKind::BailStart => &[(EventKind::BailEnd, "bail")],
            EventKind::CallStartEval => &[
                (EventKind::CallEnterEval, "call_to_eval"),
                (EventKind::CallEnterNative, "call_to_native"),
            ],
            _ => &[],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Nanoseconds since the timer was created
    pub nanos: u64,
    /// Small per-process thread number
    pub thread: u64,
}

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_NUMBER: Cell<u64> = const { Cell::new(0) };
}

fn thread_number() -> u64 {
    THREAD_NUMBER.with(|n| {
        if n.get() == 0 {
            n.set(NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
        }
        n.get()
    })
}

// =============================================================================
// EventTimer
// =============================================================================

/// Bounded ring of recent events
#[derive(Debug)]
pub struct EventTimer {
    enabled: AtomicBool,
    epoch: Instant,
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl EventTimer {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        EventTimer {
            enabled: AtomicBool::new(enabled),
            epoch: Instant::now(),
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    /// Record `kind` now; dropped when disabled
    #[inline]
    pub fn record(&self, kind: EventKind) {
        if !self.is_enabled() {
            return;
        }
        let event = Event {
            kind,
            nanos: self.epoch.elapsed().as_nanos() as u64,
            thread: thread_number(),
        };
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Copy of the buffered events, oldest first
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().iter().copied().collect()
    }

    /// Remove and return the buffered events
    pub fn drain(&self) -> Vec<Event> {
        self.events.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// EventAnalyzer
// =============================================================================

/// Summary of one interval kind, in nanoseconds
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaStats {
    pub count: usize,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
}

impl DeltaStats {
    fn from_deltas(mut deltas: Vec<u64>) -> Option<Self> {
        if deltas.is_empty() {
            return None;
        }
        deltas.sort_unstable();
        let count = deltas.len();
        let mean = deltas.iter().map(|&d| d as f64).sum::<f64>() / count as f64;
        let median = if count % 2 == 1 {
            deltas[count / 2] as f64
        } else {
            (deltas[count / 2 - 1] as f64 + deltas[count / 2] as f64) / 2.0
        };
        let variance = deltas
            .iter()
            .map(|&d| {
                let x = d as f64 - mean;
                x * x
            })
            .sum::<f64>()
            / count as f64;
        Some(DeltaStats {
            count,
            min: deltas[0],
            max: deltas[count - 1],
            mean,
            median,
            stddev: variance.sqrt(),
        })
    }
}

/// Pairs start/end events and summarizes the intervals
#[derive(Debug, Default)]
pub struct EventAnalyzer {
    deltas: HashMap<&'static str, Vec<u64>>,
}

impl EventAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair the events of each thread in timestamp order
    ///
    /// An opener waits for the next event that can close it; a second
    /// opener of the same kind replaces an unclosed one.
    pub fn analyze(events: &[Event]) -> Self {
        let mut analyzer = EventAnalyzer::new();
        let by_thread = events.iter().copied().into_group_map_by(|e| e.thread);
        for (_, thread_events) in by_thread.into_iter().sorted_by_key(|(t, _)| *t) {
            let mut open: HashMap<EventKind, u64> = HashMap::new();
            for event in thread_events.into_iter().sorted_by_key(|e| e.nanos) {
                if !event.kind.closers().is_empty() {
                    open.insert(event.kind, event.nanos);
                    continue;
                }
                let closed = open.iter().find_map(|(opener, start)| {
                    opener
                        .closers()
                        .iter()
                        .find(|(closer, _)| *closer == event.kind)
                        .map(|(_, label)| (*opener, *label, *start))
                });
                if let Some((opener, label, start)) = closed {
                    open.remove(&opener);
                    analyzer
                        .deltas
                        .entry(label)
                        .or_default()
                        .push(event.nanos.saturating_sub(start));
                }
            }
        }
        analyzer
    }

    /// Summary for an interval label such as `"compile"`
    pub fn stats(&self, label: &str) -> Option<DeltaStats> {
        DeltaStats::from_deltas(self.deltas.get(label)?.clone())
    }

    /// Every label with at least one interval, sorted
    pub fn labels(&self) -> Vec<&'static str> {
        self.deltas.keys().copied().sorted().collect()
    }

    /// One line per label
    pub fn report(&self) -> String {
        self.labels()
            .into_iter()
            .filter_map(|label| self.stats(label).map(|s| (label, s)))
            .map(|(label, s)| {
                format!(
                    "{:<16} n={:<6} min={:<8} max={:<8} mean={:<10.1} median={:<10.1} stddev={:.1}",
                    label, s.count, s.min, s.max, s.mean, s.median, s.stddev
                )
            })
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(kind: EventKind, nanos: u64, thread: u64) -> Event {
        Event { kind, nanos, thread }
    }

    #[test]
    fn test_ring_is_bounded() {
        let timer = EventTimer::new(3, true);
        for _ in 0..5 {
            timer.record(EventKind::CompileStart);
        }
        assert_eq!(timer.len(), 3);
        assert_eq!(timer.drain().len(), 3);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_disabled_timer_records_nothing() {
        let timer = EventTimer::new(8, false);
        timer.record(EventKind::BailStart);
        assert!(timer.is_empty());
        timer.set_enabled(true);
        timer.record(EventKind::BailStart);
        assert_eq!(timer.len(), 1);
    }

    #[test]
    fn test_pairs_per_thread() {
        let events = [
            ev(EventKind::CompileStart, 100, 1),
            ev(EventKind::CompileStart, 150, 2),
            ev(EventKind::CompileEnd, 400, 1),
            ev(EventKind::CompileEnd, 160, 2),
            ev(EventKind::CallStartEval, 500, 1),
            ev(EventKind::CallEnterNative, 530, 1),
            ev(EventKind::CallStartEval, 600, 1),
            ev(EventKind::CallEnterEval, 610, 1),
        ];
        let analyzer = EventAnalyzer::analyze(&events);

        let compile = analyzer.stats("compile").unwrap();
        assert_eq!(compile.count, 2);
        assert_eq!(compile.min, 10);
        assert_eq!(compile.max, 300);
        assert_eq!(compile.mean, 155.0);

        assert_eq!(analyzer.stats("call_to_native").unwrap().count, 1);
        assert_eq!(analyzer.stats("call_to_eval").unwrap().min, 10);
        assert!(analyzer.stats("bail").is_none());
        assert_eq!(
            analyzer.labels(),
            vec!["call_to_eval", "call_to_native", "compile"]
        );
    }

    #[test]
    fn test_unmatched_end_is_ignored() {
        let events = [
            ev(EventKind::BailEnd, 10, 1),
            ev(EventKind::BailStart, 20, 1),
            ev(EventKind::BailEnd, 25, 1),
        ];
        let analyzer = EventAnalyzer::analyze(&events);
        let bail = analyzer.stats("bail").unwrap();
        assert_eq!(bail.count, 1);
        assert_eq!(bail.median, 5.0);
        assert_eq!(bail.stddev, 0.0);
    }
}
