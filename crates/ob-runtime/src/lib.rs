#![forbid(unsafe_code)]

use std::collections::{VecDeque, vec_deque};
use std::fmt;

use ob_core::ExecutionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvidenceKind {
    Construction,
    Forward,
    Adjoint,
    Policy,
    Failure,
}

impl EvidenceKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Construction => "construction",
            Self::Forward => "forward",
            Self::Adjoint => "adjoint",
            Self::Policy => "policy",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

pub const DEFAULT_LEDGER_CAPACITY: usize = 4096;

/// Bounded evidence trail. Once `capacity` entries are held, each new
/// entry evicts the oldest one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: VecDeque<EvidenceEntry>,
    capacity: usize,
    dropped: u64,
}

impl Default for EvidenceLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A capacity of 0 is raised to 1 so the latest entry is always kept.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> vec_deque::Iter<'_, EvidenceEntry> {
        self.entries.iter()
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    /// Removes and returns every retained entry, oldest first.
    pub fn take_entries(&mut self) -> Vec<EvidenceEntry> {
        self.entries.drain(..).collect()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted so far to stay within capacity.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Execution policy plus the ledger of everything done under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_ledger_capacity(mode, DEFAULT_LEDGER_CAPACITY)
    }

    #[must_use]
    pub fn with_ledger_capacity(mode: ExecutionMode, capacity: usize) -> Self {
        let mut ledger = EvidenceLedger::with_capacity(capacity);
        ledger.record(
            EvidenceKind::Policy,
            format!("mode initialized to {}", mode.label()),
        );
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger.record(
            EvidenceKind::Policy,
            format!("mode switched to {}", mode.label()),
        );
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_failure<E>(&mut self, context: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger
            .record(EvidenceKind::Failure, format!("{context}: {error}"));
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use ob_core::ExecutionMode;

    use super::{EvidenceKind, EvidenceLedger, RuntimeContext};

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Serial);
        ctx.ledger_mut()
            .record(EvidenceKind::Forward, "pad2d forward");

        assert_eq!(ctx.ledger().len(), 2);
        let kinds = ctx.ledger().entries().map(|entry| entry.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EvidenceKind::Policy, EvidenceKind::Forward]);
    }

    #[test]
    fn mode_switch_records_event() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Parallel);
        ctx.set_mode(ExecutionMode::Serial);

        assert_eq!(ctx.mode(), ExecutionMode::Serial);
        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(
            ctx.ledger().entries().nth(1).map(|entry| entry.summary.as_str()),
            Some("mode switched to serial")
        );
    }

    #[test]
    fn failures_keep_the_diagnostic() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Serial);
        ctx.record_failure("pad2d forward", "expects 1 inputs, got 0");

        let failure = ctx
            .ledger()
            .entries_of(EvidenceKind::Failure)
            .next()
            .expect("failure entry should be present");
        assert_eq!(failure.summary, "pad2d forward: expects 1 inputs, got 0");
        assert_eq!(EvidenceKind::Failure.label(), "failure");
    }

    #[test]
    fn empty_ledger_reports_empty() {
        let ledger = EvidenceLedger::new();
        assert!(ledger.is_empty());
        assert_eq!(ledger.capacity(), super::DEFAULT_LEDGER_CAPACITY);
        assert_eq!(ledger.entries_of(EvidenceKind::Adjoint).count(), 0);
    }

    #[test]
    fn ledger_evicts_oldest_entries_past_capacity() {
        let mut ledger = EvidenceLedger::with_capacity(3);
        for call in 0..10 {
            ledger.record(EvidenceKind::Forward, format!("call {call}"));
        }

        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.dropped(), 7);
        let summaries = ledger
            .entries()
            .map(|entry| entry.summary.as_str())
            .collect::<Vec<_>>();
        assert_eq!(summaries, vec!["call 7", "call 8", "call 9"]);
    }

    #[test]
    fn take_entries_empties_the_ledger() {
        let mut ctx = RuntimeContext::with_ledger_capacity(ExecutionMode::Serial, 0);
        assert_eq!(ctx.ledger().capacity(), 1);
        ctx.ledger_mut().record(EvidenceKind::Adjoint, "pad2d adjoint");

        let taken = ctx.ledger_mut().take_entries();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].kind, EvidenceKind::Adjoint);
        assert!(ctx.ledger().is_empty());
        assert_eq!(ctx.ledger().dropped(), 1);
    }
}
