use chrono::{DateTime, Duration, Utc};

use crate::config::ConsolidationConfig;
use crate::graph::types::AtomicNote;

/// Relevance math: lazy exponential decay, reinforcement on access, and the
/// below-threshold bookkeeping that drives pruning.
#[derive(Debug, Clone)]
pub struct RelevancePolicy {
    pub decay_rate: f64,
    pub half_life: Duration,
    pub reinforce_boost: f64,
    pub prune_threshold: f64,
    pub grace_window: Duration,
    pub review_interval: Duration,
}

impl RelevancePolicy {
    pub fn from_config(config: &ConsolidationConfig) -> Self {
        Self {
            decay_rate: config.decay_rate,
            half_life: config.half_life(),
            reinforce_boost: config.reinforce_boost,
            prune_threshold: config.prune_threshold,
            grace_window: config.grace_window(),
            review_interval: config.review_interval(),
        }
    }

    /// `relevance * decay_rate ^ (elapsed / half_life)`, clamped to `[0, 1]`.
    pub fn decayed(&self, relevance: f64, elapsed: Duration) -> f64 {
        if elapsed <= Duration::zero() {
            return relevance.clamp(0.0, 1.0);
        }
        let periods = seconds(elapsed) / seconds(self.half_life);
        (relevance * self.decay_rate.powf(periods)).clamp(0.0, 1.0)
    }

    /// `min(1, r + boost * (1 - r))`.
    pub fn reinforced(&self, relevance: f64) -> f64 {
        (relevance + self.reinforce_boost * (1.0 - relevance)).clamp(0.0, 1.0)
    }

    /// Relevance of `note` evaluated at `now` without mutating it.
    pub fn relevance_at(&self, note: &AtomicNote, now: DateTime<Utc>) -> f64 {
        self.decayed(note.relevance, now - note.last_decayed_at)
    }

    /// The instant a curve starting at `(relevance, from)` drops under the
    /// prune threshold. Already-below curves crossed at `from`.
    pub fn threshold_crossing(&self, relevance: f64, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if relevance < self.prune_threshold {
            return Some(from);
        }
        if self.prune_threshold <= 0.0 {
            return None;
        }
        // r0 * rate^(t/h) = threshold  =>  t = h * ln(threshold / r0) / ln(rate)
        let periods = (self.prune_threshold / relevance).ln() / self.decay_rate.ln();
        let offset_ms = (periods * seconds(self.half_life) * 1000.0).ceil();
        if !offset_ms.is_finite() || offset_ms > i64::MAX as f64 / 2.0 {
            return None;
        }
        Some(from + Duration::milliseconds(offset_ms as i64))
    }

    /// Bring `note` up to `now`. Returns `true` if its stored state changed.
    pub fn apply_decay(&self, note: &mut AtomicNote, now: DateTime<Utc>) -> bool {
        if now <= note.last_decayed_at {
            return false;
        }
        let next = self.relevance_at(note, now);
        let mut changed = false;
        if next < self.prune_threshold && note.below_threshold_since.is_none() {
            note.below_threshold_since = self.threshold_crossing(note.relevance, note.last_decayed_at);
            changed = true;
        }
        if next != note.relevance {
            note.relevance = next;
            note.last_decayed_at = now;
            changed = true;
        }
        changed
    }

    /// Decay to `now`, then boost and push the next review out by a half-life.
    pub fn reinforce(&self, note: &mut AtomicNote, now: DateTime<Utc>) {
        self.apply_decay(note, now);
        note.relevance = self.reinforced(note.relevance);
        note.last_decayed_at = now.max(note.last_decayed_at);
        note.last_accessed_at = now;
        if note.relevance >= self.prune_threshold {
            note.below_threshold_since = None;
        }
        note.next_review_at = note.next_review_at.max(now + self.half_life);
    }

    /// Below the threshold, as of `now`, for longer than the grace window.
    /// Roots and summaries fade like any other note; `is_root` only exempts a
    /// note from the orphan check.
    pub fn is_prune_candidate(&self, note: &AtomicNote, now: DateTime<Utc>) -> bool {
        if !note.is_active() {
            return false;
        }
        let mut decayed = note.clone();
        self.apply_decay(&mut decayed, now);
        decayed.relevance < self.prune_threshold
            && decayed
                .below_threshold_since
                .is_some_and(|since| now - since > self.grace_window)
    }

    /// Stored relevance the rest of the math cannot work with.
    pub fn is_corrupt(note: &AtomicNote) -> bool {
        !note.relevance.is_finite() || !(0.0..=1.0).contains(&note.relevance)
    }
}

fn seconds(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}
