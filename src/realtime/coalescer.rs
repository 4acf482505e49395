//! # Debounce Coalescer
//!
//! Per-key state machine behind the registry's delivery path.
//!
//! ```text
//!            on_event(e)                 on_event(e')
//!   Idle ───────────────▶ Pending(P, g) ─────────────▶ Pending(P + e', g+1)
//!    ▲                        │
//!    └──── on_timer(g) ───────┘   (on_timer with a stale generation is ignored)
//! ```
//!
//! `P` holds the latest event of each [`ChangeKind`], so at most three. A
//! listener interested only in deletions still sees the deletion when an
//! update lands after it in the same window.
//!
//! The coalescer owns no timer. The caller arms one for each generation
//! returned by [`Coalescer::on_event`] and reports it back through
//! [`Coalescer::on_timer`]; a timer for an older generation yields nothing,
//! so replacing a timer is safe even if the old one already fired.

use super::event::{ChangeEvent, ChangeKind, ChangeKinds};

/// Latest event per kind, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingEvents {
    events: Vec<ChangeEvent>,
}

impl PendingEvents {
    fn push(&mut self, event: ChangeEvent) {
        self.events.retain(|e| e.kind != event.kind);
        self.events.push(event);
    }

    /// Newest event of any kind
    pub fn latest(&self) -> Option<&ChangeEvent> {
        self.events.last()
    }

    /// Newest event whose kind is in `kinds`
    pub fn latest_for(&self, kinds: ChangeKinds) -> Option<&ChangeEvent> {
        self.events.iter().rev().find(|e| kinds.contains(e.kind))
    }

    /// Pending event of exactly `kind`
    pub fn get(&self, kind: ChangeKind) -> Option<&ChangeEvent> {
        self.events.iter().find(|e| e.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Coalescing state for one key
#[derive(Debug, Clone, PartialEq)]
pub enum CoalescerState {
    /// Nothing waiting
    Idle,
    /// Events waiting for the timer of `generation`
    Pending { latest: PendingEvents, generation: u64 },
}

/// Last-write-wins coalescer, per change kind
#[derive(Debug)]
pub struct Coalescer {
    state: CoalescerState,
    next_generation: u64,
    coalesced: u64,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self {
            state: CoalescerState::Idle,
            next_generation: 1,
            coalesced: 0,
        }
    }

    /// Record an incoming event. Returns the generation the caller must arm
    /// a timer for. An earlier pending event of the same kind is discarded.
    pub fn on_event(&mut self, event: ChangeEvent) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;

        let mut latest = match std::mem::replace(&mut self.state, CoalescerState::Idle) {
            CoalescerState::Pending { latest, .. } => {
                self.coalesced += 1;
                latest
            }
            CoalescerState::Idle => PendingEvents::default(),
        };
        latest.push(event);

        self.state = CoalescerState::Pending { latest, generation };
        generation
    }

    /// Timer for `generation` fired. Returns the events to deliver if that
    /// timer is still the current one.
    pub fn on_timer(&mut self, generation: u64) -> Option<PendingEvents> {
        match &self.state {
            CoalescerState::Pending { generation: current, .. } if *current == generation => {
                match std::mem::replace(&mut self.state, CoalescerState::Idle) {
                    CoalescerState::Pending { latest, .. } => Some(latest),
                    CoalescerState::Idle => None,
                }
            }
            _ => None,
        }
    }

    /// Drop any pending events
    pub fn cancel(&mut self) {
        self.state = CoalescerState::Idle;
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, CoalescerState::Pending { .. })
    }

    pub fn state(&self) -> &CoalescerState {
        &self.state
    }

    /// Events that arrived while a delivery was already pending
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}
