//! Two-hit play confirmation
//!
//! Suppresses one-off misidentifications by requiring the confirming
//! provider to report the same track identity twice within a bounded number
//! of hops. Holds at most one pending hit per stream, so state never grows
//! with history.
//!
//! A miss (no match, provider failure) does not immediately discard a
//! pending hit: the pending survives while a future hit could still land
//! inside the tolerance window, and is evicted the moment confirmation
//! becomes unreachable.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::recognizer::RecognitionMatch;

/// A confirmed play, ready for persistence.
#[derive(Debug, Clone)]
pub struct ConfirmedPlay {
    /// The second hit's match carries the track attributes.
    pub matched: RecognitionMatch,
    /// The second hit's window end.
    pub recognized_at: DateTime<Utc>,
    /// Max of the two hits' confidences.
    pub confidence: f64,
}

#[derive(Debug, Clone)]
struct PendingHit {
    provider_track_id: String,
    hop_index: i64,
    confidence: f64,
}

/// Per-stream confirmation state machine for the designated provider.
pub struct TwoHitAggregator {
    /// Max hop gap between the two hits is `1 + hop_tolerance`.
    hop_tolerance: u32,
    pending: Option<PendingHit>,
}

impl TwoHitAggregator {
    pub fn new(hop_tolerance: u32) -> Self {
        Self { hop_tolerance, pending: None }
    }

    fn max_gap(&self) -> i64 {
        1 + self.hop_tolerance as i64
    }

    /// Observe a positive match at `hop_index`.
    ///
    /// Returns a confirmed play when this hit corroborates a pending one
    /// within tolerance; otherwise the hit becomes (or replaces) the
    /// pending state.
    pub fn observe_match(
        &mut self,
        hop_index: i64,
        window_end: DateTime<Utc>,
        matched: RecognitionMatch,
    ) -> Option<ConfirmedPlay> {
        if let Some(pending) = &self.pending {
            let gap = hop_index - pending.hop_index;

            if gap <= 0 {
                // Out-of-order observation; the worker feeds hops in order,
                // so this is unreachable by design.
                warn!(hop_index, pending_hop = pending.hop_index, "non-monotonic hop observation, clearing state");
                self.pending = None;
            } else if pending.provider_track_id == matched.provider_track_id {
                if gap <= self.max_gap() {
                    let confidence = matched.confidence.max(pending.confidence);
                    debug!(
                        track = %matched.title,
                        first_hop = pending.hop_index,
                        second_hop = hop_index,
                        "two-hit confirmation"
                    );
                    self.pending = None;
                    return Some(ConfirmedPlay { matched, recognized_at: window_end, confidence });
                }
                // Same identity but too far apart: this hit starts over.
                self.pending = None;
            } else {
                // Different identity replaces the pending hit.
                self.pending = None;
            }
        }

        self.pending = Some(PendingHit {
            provider_track_id: matched.provider_track_id.clone(),
            hop_index,
            confidence: matched.confidence,
        });
        None
    }

    /// Observe a miss (no match or provider failure) at `hop_index`.
    ///
    /// Evicts the pending hit once no future hit can confirm it.
    pub fn observe_miss(&mut self, hop_index: i64) {
        let Some(pending) = &self.pending else {
            return;
        };
        if hop_index - pending.hop_index >= self.max_gap() {
            debug!(
                pending_hop = pending.hop_index,
                hop_index, "pending hit expired unconfirmed"
            );
            self.pending = None;
        }
    }

    /// Track id of the pending hit, if any.
    pub fn pending_track(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.provider_track_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::ScriptedRecognizer;
    use crate::recognizer::Recognition;
    use chrono::TimeZone;

    fn hit(track_id: &str, confidence: f64) -> RecognitionMatch {
        match ScriptedRecognizer::hit("shazam", track_id, "Song", confidence) {
            Recognition::Match(m) => m,
            _ => unreachable!(),
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn test_single_hit_never_confirms() {
        let mut agg = TwoHitAggregator::new(1);
        assert!(agg.observe_match(0, at(132), hit("T", 0.9)).is_none());
        assert_eq!(agg.pending_track(), Some("T"));
    }

    #[test]
    fn test_consecutive_hits_confirm() {
        let mut agg = TwoHitAggregator::new(1);
        assert!(agg.observe_match(0, at(12), hit("T", 0.8)).is_none());
        let play = agg.observe_match(1, at(132), hit("T", 0.7)).expect("confirmed");
        assert_eq!(play.matched.provider_track_id, "T");
        assert_eq!(play.recognized_at, at(132));
        assert_eq!(play.confidence, 0.8, "max of the two hits");
        assert!(agg.pending_track().is_none());
    }

    #[test]
    fn test_confirms_across_one_missed_hop() {
        // Hit at hop 0, miss at hop 1, hit at hop 2: gap 2 = 1 + tolerance.
        let mut agg = TwoHitAggregator::new(1);
        assert!(agg.observe_match(0, at(12), hit("T", 0.9)).is_none());
        agg.observe_miss(1);
        assert_eq!(agg.pending_track(), Some("T"), "miss inside tolerance keeps pending");
        let play = agg.observe_match(2, at(252), hit("T", 0.9)).expect("confirmed");
        assert_eq!(play.recognized_at, at(252));
    }

    #[test]
    fn test_no_confirmation_past_tolerance() {
        // Hit at hop 0, misses at hops 1 and 2, hit at hop 3: never confirms.
        let mut agg = TwoHitAggregator::new(1);
        assert!(agg.observe_match(0, at(12), hit("T", 0.9)).is_none());
        agg.observe_miss(1);
        agg.observe_miss(2);
        assert!(agg.pending_track().is_none(), "pending evicted once unconfirmable");

        assert!(agg.observe_match(3, at(372), hit("T", 0.9)).is_none());
        assert_eq!(agg.pending_track(), Some("T"), "late hit starts a fresh pending");
    }

    #[test]
    fn test_different_identity_resets_pending() {
        // T at hop 0, U at hop 1, U at hop 2: one play for U, none for T.
        let mut agg = TwoHitAggregator::new(1);
        assert!(agg.observe_match(0, at(12), hit("T", 0.9)).is_none());
        assert!(agg.observe_match(1, at(132), hit("U", 0.9)).is_none());
        assert_eq!(agg.pending_track(), Some("U"));
        let play = agg.observe_match(2, at(252), hit("U", 0.9)).expect("confirmed");
        assert_eq!(play.matched.provider_track_id, "U");
    }

    #[test]
    fn test_same_identity_past_gap_restarts() {
        let mut agg = TwoHitAggregator::new(1);
        assert!(agg.observe_match(0, at(12), hit("T", 0.9)).is_none());
        // Gap of 3 hops exceeds 1 + tolerance.
        assert!(agg.observe_match(3, at(372), hit("T", 0.9)).is_none());
        assert_eq!(agg.pending_track(), Some("T"));
        // And the restarted pending can confirm normally.
        assert!(agg.observe_match(4, at(492), hit("T", 0.9)).is_some());
    }

    #[test]
    fn test_zero_tolerance_requires_adjacent_hops() {
        let mut agg = TwoHitAggregator::new(0);
        assert!(agg.observe_match(0, at(12), hit("T", 0.9)).is_none());
        agg.observe_miss(1);
        assert!(agg.pending_track().is_none());
        assert!(agg.observe_match(2, at(252), hit("T", 0.9)).is_none());
        assert!(agg.observe_match(3, at(372), hit("T", 0.9)).is_some());
    }

    #[test]
    fn test_miss_without_pending_is_noop() {
        let mut agg = TwoHitAggregator::new(1);
        agg.observe_miss(5);
        assert!(agg.pending_track().is_none());
    }

    #[test]
    fn test_state_stays_bounded() {
        let mut agg = TwoHitAggregator::new(1);
        for hop in 0..1_000 {
            agg.observe_match(hop * 10, at(hop * 1200), hit(&format!("T{hop}"), 0.5));
        }
        // Only the latest identity is ever held.
        assert_eq!(agg.pending_track(), Some("T999"));
    }
}
