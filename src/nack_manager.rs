use std::cmp::{max, min};
use std::collections::BTreeMap;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::range_set::RangeSet;
use crate::sequence::{FrameSeq, SessionId};

/// Suppression windows per sender are pruned when they expire; this bounds them when other
///  receivers' NACKs arrive faster than that
const MAX_SUPPRESSION_WINDOWS: usize = 64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct NackEntry {
    due: Instant,
    /// number of times this frame was requested so far
    attempts: u32,
}

/// Keeps track of outstanding retransmission requests per remote sender, and decides when
///  they are (re-)sent.
///
/// A missing frame is requested as soon as it is registered, and then re-requested with
///  exponential backoff until it is either received or falls below the sender's oldest
///  recoverable frame. Observing another receiver's NACK for the same frames postpones this
///  node's own request, so that a lost multicast packet does not cause a NACK storm. This
///  includes frames that are registered only while the other receiver's NACK is still fresh.
pub struct NackManager {
    retry_initial: Duration,
    retry_max: Duration,
    suppression_window: Duration,
    max_outstanding_frames: usize,

    outstanding: FxHashMap<SessionId, BTreeMap<FrameSeq, NackEntry>>,
    /// frames other receivers requested recently, and until when they are suppressed
    suppressed: FxHashMap<SessionId, Vec<(RangeSet, Instant)>>,
}

impl NackManager {
    pub fn new(config: &TransportConfig) -> NackManager {
        NackManager {
            retry_initial: config.nack_retry_initial,
            retry_max: config.nack_retry_max,
            suppression_window: config.nack_suppression_window,
            max_outstanding_frames: config.max_outstanding_nack_frames_per_sender,
            outstanding: FxHashMap::default(),
            suppressed: FxHashMap::default(),
        }
    }

    /// Registers missing frames for a sender. Frames that are outstanding already keep their
    ///  schedule, new frames are due immediately unless another receiver requested them
    ///  recently.
    pub fn nack(&mut self, sender: SessionId, missing: &RangeSet, now: Instant) {
        let windows = self.suppressed.get(&sender);
        let entries = self.outstanding.entry(sender).or_default();
        for raw in missing.values() {
            let frame = FrameSeq::from_raw(raw);
            if entries.contains_key(&frame) {
                continue;
            }
            if entries.len() >= self.max_outstanding_frames {
                debug!("too many outstanding NACK frames for {} - not requesting #{} and above", sender, frame);
                break;
            }

            let due = windows.into_iter()
                .flatten()
                .filter(|(frames, _)| frames.contains(raw))
                .map(|&(_, until)| until)
                .fold(now, max);
            if due > now {
                trace!("frame #{} from {} was requested by another receiver - postponing", frame, sender);
            }
            entries.insert(frame, NackEntry { due, attempts: 0 });
        }
        if entries.is_empty() {
            self.outstanding.remove(&sender);
        }
    }

    /// Cancels requests for frames in `first..=last`, typically because a frame was received
    pub fn discard(&mut self, sender: SessionId, first: FrameSeq, last: FrameSeq) {
        let Some(entries) = self.outstanding.get_mut(&sender) else {
            return;
        };

        let discarded = entries.range(first..=last)
            .map(|(&frame, _)| frame)
            .collect::<Vec<_>>();
        for frame in discarded {
            trace!("frame #{} from {} is no longer missing", frame, sender);
            entries.remove(&frame);
        }
        if entries.is_empty() {
            self.outstanding.remove(&sender);
        }
    }

    /// Postpones requests because another receiver's NACK for the same frames was observed.
    ///  This applies both to frames that are outstanding now, and to frames that are
    ///  registered before the suppression window ends.
    pub fn delay(&mut self, sender: SessionId, frames: &RangeSet, now: Instant) {
        let suppressed_until = now + self.suppression_window;

        if let Some(entries) = self.outstanding.get_mut(&sender) {
            for (start, end) in frames.iter() {
                for (frame, entry) in entries.range_mut(FrameSeq::from_raw(start)..=FrameSeq::from_raw(end)) {
                    trace!("postponing NACK for frame #{} from {}", frame, sender);
                    entry.due = max(entry.due, suppressed_until);
                }
            }
        }

        let windows = self.suppressed.entry(sender).or_default();
        windows.retain(|&(_, until)| until > now);
        if windows.len() >= MAX_SUPPRESSION_WINDOWS {
            windows.remove(0);
        }
        windows.push((frames.clone(), suppressed_until));
    }

    /// Gives up on frames below a sender's oldest recoverable frame, returning the frames that
    ///  were given up
    pub fn advance_watermark(&mut self, sender: SessionId, oldest_recoverable_frame: FrameSeq) -> RangeSet {
        let Some(entries) = self.outstanding.get_mut(&sender) else {
            return RangeSet::new();
        };

        let recoverable = entries.split_off(&oldest_recoverable_frame);
        let exhausted = std::mem::replace(entries, recoverable);
        if entries.is_empty() {
            self.outstanding.remove(&sender);
        }

        let result = exhausted.keys()
            .map(|f| f.to_raw())
            .collect::<RangeSet>();
        if let (Some(first), Some(last)) = (result.first(), result.last()) {
            // this is expected under loss, so it is no error from the application's perspective
            debug!("{}", TransportError::RetransmissionExhausted { sender, first, last });
        }
        result
    }

    /// Returns the frames that are due for (re-)requesting per sender, and reschedules them
    pub fn poll(&mut self, now: Instant) -> Vec<(SessionId, RangeSet)> {
        self.suppressed.retain(|_, windows| {
            windows.retain(|&(_, until)| until > now);
            !windows.is_empty()
        });

        let mut result = Vec::new();

        for (&sender, entries) in self.outstanding.iter_mut() {
            let mut due = RangeSet::new();
            for (frame, entry) in entries.iter_mut() {
                if entry.due > now {
                    continue;
                }
                entry.attempts = entry.attempts.saturating_add(1);
                entry.due = now + Self::backoff(self.retry_initial, self.retry_max, entry.attempts);
                due.insert_one(frame.to_raw());
            }
            if !due.is_empty() {
                result.push((sender, due));
            }
        }

        result.sort_by_key(|(sender, _)| *sender);
        result
    }

    /// the delay after the n-th request before the next request
    fn backoff(initial: Duration, max_delay: Duration, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        min(initial.saturating_mul(factor), max_delay)
    }

    pub fn num_outstanding(&self, sender: SessionId) -> usize {
        self.outstanding.get(&sender)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    /// Forgets all state for a sender that went away
    pub fn remove_sender(&mut self, sender: SessionId) {
        self.outstanding.remove(&sender);
        self.suppressed.remove(&sender);
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.suppressed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SENDER: SessionId = SessionId::from_raw(1);
    const OTHER: SessionId = SessionId::from_raw(2);

    fn manager() -> NackManager {
        let mut config = TransportConfig::default_ipv4();
        config.nack_retry_initial = Duration::from_millis(100);
        config.nack_retry_max = Duration::from_millis(350);
        config.nack_suppression_window = Duration::from_millis(50);
        config.max_outstanding_nack_frames_per_sender = 10;
        NackManager::new(&config)
    }

    fn set(values: &[u64]) -> RangeSet {
        values.iter().cloned().collect()
    }

    fn nothing() -> Vec<(SessionId, RangeSet)> {
        Vec::new()
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_nack_is_idempotent() {
        let now = Instant::now();
        let mut manager = manager();

        manager.nack(SENDER, &set(&[3, 4, 5]), now);
        manager.nack(SENDER, &set(&[4, 5]), now);
        manager.nack(SENDER, &set(&[5, 6]), now);
        assert_eq!(manager.num_outstanding(SENDER), 4);

        assert_eq!(manager.poll(now), vec![(SENDER, set(&[3, 4, 5, 6]))]);
        // each frame is requested once only
        assert_eq!(manager.poll(now), nothing());

        // registering again does not reschedule
        manager.nack(SENDER, &set(&[3]), now);
        assert_eq!(manager.poll(now), nothing());
    }

    #[test]
    fn test_discard_cancels() {
        let now = Instant::now();
        let mut manager = manager();

        manager.nack(SENDER, &set(&[3, 4, 5, 8]), now);
        manager.discard(SENDER, FrameSeq::from_raw(4), FrameSeq::from_raw(5));
        assert_eq!(manager.poll(now), vec![(SENDER, set(&[3, 8]))]);

        manager.discard(SENDER, FrameSeq::from_raw(1), FrameSeq::from_raw(10));
        assert_eq!(manager.num_outstanding(SENDER), 0);
        assert_eq!(manager.poll(now + ms(10_000)), nothing());
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 350)]
    #[case(10, 350)]
    #[case(100, 350)]
    fn test_backoff(#[case] attempts: u32, #[case] expected_millis: u64) {
        assert_eq!(NackManager::backoff(ms(100), ms(350), attempts), ms(expected_millis));
    }

    #[test]
    fn test_re_request_with_backoff() {
        let start = Instant::now();
        let mut manager = manager();
        manager.nack(SENDER, &set(&[7]), start);

        let mut requested_at = Vec::new();
        for t in (0..=1000).step_by(10) {
            if !manager.poll(start + ms(t)).is_empty() {
                requested_at.push(t);
            }
        }
        assert_eq!(requested_at, vec![0, 100, 300, 650, 1000]);
    }

    #[test]
    fn test_delay() {
        let now = Instant::now();
        let mut manager = manager();

        manager.nack(SENDER, &set(&[3, 4]), now);
        manager.nack(OTHER, &set(&[3, 4]), now);
        manager.delay(SENDER, &set(&[4]), now);

        assert_eq!(manager.poll(now), vec![(SENDER, set(&[3])), (OTHER, set(&[3, 4]))]);
        assert_eq!(manager.poll(now + ms(49)), nothing());
        assert_eq!(manager.poll(now + ms(50)), vec![(SENDER, set(&[4]))]);
    }

    #[test]
    fn test_delay_before_registration() {
        let now = Instant::now();
        let mut manager = manager();

        // another receiver's NACK is observed while this node's gap is still in its grace period
        manager.delay(SENDER, &set(&[5]), now);
        manager.nack(SENDER, &set(&[5, 6]), now + ms(20));
        manager.nack(OTHER, &set(&[5]), now + ms(20));

        assert_eq!(manager.poll(now + ms(20)), vec![(SENDER, set(&[6])), (OTHER, set(&[5]))]);
        assert_eq!(manager.poll(now + ms(49)), nothing());
        assert_eq!(manager.poll(now + ms(50)), vec![(SENDER, set(&[5]))]);

        // expired windows do not affect frames registered later
        manager.nack(SENDER, &set(&[9]), now + ms(60));
        assert_eq!(manager.poll(now + ms(60)), vec![(SENDER, set(&[9]))]);
    }

    #[test]
    fn test_remove_sender() {
        let now = Instant::now();
        let mut manager = manager();

        manager.nack(SENDER, &set(&[3]), now);
        manager.delay(SENDER, &set(&[4]), now);
        manager.remove_sender(SENDER);
        assert_eq!(manager.num_outstanding(SENDER), 0);

        // the suppression window is gone as well
        manager.nack(SENDER, &set(&[4]), now);
        assert_eq!(manager.poll(now), vec![(SENDER, set(&[4]))]);
    }

    #[test]
    fn test_advance_watermark() {
        let now = Instant::now();
        let mut manager = manager();

        manager.nack(SENDER, &set(&[3, 4, 8]), now);
        assert_eq!(manager.advance_watermark(SENDER, FrameSeq::from_raw(5)), set(&[3, 4]));
        assert_eq!(manager.advance_watermark(SENDER, FrameSeq::from_raw(5)), set(&[]));
        assert_eq!(manager.advance_watermark(OTHER, FrameSeq::from_raw(5)), set(&[]));
        assert_eq!(manager.poll(now), vec![(SENDER, set(&[8]))]);

        assert_eq!(manager.advance_watermark(SENDER, FrameSeq::from_raw(100)), set(&[8]));
        assert_eq!(manager.num_outstanding(SENDER), 0);
    }

    #[test]
    fn test_max_outstanding() {
        let now = Instant::now();
        let mut manager = manager();
        manager.nack(SENDER, &(1..=20).collect::<RangeSet>(), now);
        assert_eq!(manager.poll(now), vec![(SENDER, (1..=10).collect::<RangeSet>())]);
    }
}
