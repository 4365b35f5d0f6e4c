//! Request Tracker (spec §4.3): sequence allocation, ack/result matching, and
//! timeout detection. Retries are driven by the client (the tracker only
//! says "this one's due" and hands back the bytes to resend); the tracker
//! itself never touches the transport.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Why a pending request ended without a normal ack/result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Canceled,
    TimedOut,
}

pub type AckOutcome = Result<u8, Terminal>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub success: bool,
}

pub type ResultOutcome = Result<TxOutcome, Terminal>;

/// Handed to the caller of [`RequestTracker::register`]; the two completions
/// fire independently, `acked` before `result` for any well-behaved peer
/// (spec §5 ordering guarantee — the tracker does not enforce the ordering
/// itself, it is a property of when the peer sends each frame).
pub struct RequestHandle {
    pub seq: u16,
    pub acked: oneshot::Receiver<AckOutcome>,
    pub result: oneshot::Receiver<ResultOutcome>,
}

struct Pending {
    ack_timeout: Duration,
    max_retries: u32,
    retries_used: u32,
    last_send_at: Instant,
    is_acked: bool,
    original_frame: Vec<u8>,
    acked_tx: Option<oneshot::Sender<AckOutcome>>,
    result_tx: Option<oneshot::Sender<ResultOutcome>>,
}

pub enum RetryOutcome {
    /// Re-send this frame, `last_send_at` has already been bumped.
    Resend(Vec<u8>),
    /// Retries exhausted; the request has been completed with `Terminal::TimedOut`.
    Expired,
}

#[derive(Default)]
pub struct RequestTracker {
    next_seq: u16,
    pending: HashMap<u16, Pending>,
    /// FIFO order of seqs still awaiting a `result`, for `handle_result`'s
    /// "oldest pending request" rule (devices don't correlate tx-results by seq).
    result_order: VecDeque<u16>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            pending: HashMap::new(),
            result_order: VecDeque::new(),
        }
    }

    /// Monotonically increasing 16-bit counter; `seq` is never 0, and wraps
    /// from `0xFFFF` straight to `1`.
    pub fn next_seq(&mut self) -> u16 {
        self.next_seq = match self.next_seq {
            0xFFFF => 1,
            n => n + 1,
        };
        self.next_seq
    }

    /// Allocates a seq and registers bookkeeping for `original_frame` (the
    /// already-encoded bytes, kept so a retry can re-send verbatim without
    /// re-encoding).
    pub fn register(
        &mut self,
        ack_timeout: Duration,
        max_retries: u32,
        original_frame: Vec<u8>,
        now: Instant,
    ) -> (u16, RequestHandle) {
        let seq = self.next_seq();
        self.register_at(seq, ack_timeout, max_retries, original_frame, now)
    }

    /// Like [`register`](Self::register) but for a seq already allocated by a
    /// prior [`next_seq`](Self::next_seq) call. Needed when the caller must
    /// encode the seq into the frame bytes before registering the bookkeeping
    /// (the seq is part of the wire header, so it has to be known up front).
    pub fn register_at(
        &mut self,
        seq: u16,
        ack_timeout: Duration,
        max_retries: u32,
        original_frame: Vec<u8>,
        now: Instant,
    ) -> (u16, RequestHandle) {
        let (acked_tx, acked_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.pending.insert(
            seq,
            Pending {
                ack_timeout,
                max_retries,
                retries_used: 0,
                last_send_at: now,
                is_acked: false,
                original_frame,
                acked_tx: Some(acked_tx),
                result_tx: Some(result_tx),
            },
        );
        self.result_order.push_back(seq);
        (
            seq,
            RequestHandle {
                seq,
                acked: acked_rx,
                result: result_rx,
            },
        )
    }

    /// Marks `seq` acknowledged. A second ack for the same seq, or an ack for
    /// an unknown seq, is a no-op (late/duplicate acks are dropped per spec §3).
    pub fn handle_ack(&mut self, seq: u16, error_code: u8) {
        if let Some(p) = self.pending.get_mut(&seq) {
            if p.is_acked {
                return;
            }
            p.is_acked = true;
            if let Some(tx) = p.acked_tx.take() {
                let _ = tx.send(Ok(error_code));
            }
        }
    }

    /// Fulfills the oldest request still awaiting a result (tx-results carry
    /// no seq correlation, spec §4.3/§4.5).
    pub fn handle_result(&mut self, outcome: TxOutcome) {
        while let Some(seq) = self.result_order.pop_front() {
            if let Some(p) = self.pending.get_mut(&seq) {
                if let Some(tx) = p.result_tx.take() {
                    let _ = tx.send(Ok(outcome));
                    return;
                }
            }
        }
    }

    /// Returns every pending, non-acked request whose ack timeout has
    /// elapsed, ordered ascending by `last_send_at` then by `seq` (spec §4.3
    /// tie-break).
    pub fn time_out(&self, now: Instant) -> Vec<u16> {
        let mut due: Vec<(Instant, u16)> = self
            .pending
            .iter()
            .filter(|(_, p)| !p.is_acked && now.duration_since(p.last_send_at) >= p.ack_timeout)
            .map(|(&seq, p)| (p.last_send_at, seq))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        due.into_iter().map(|(_, seq)| seq).collect()
    }

    /// Applies the retry policy to a timed-out `seq`: re-send if retries
    /// remain, otherwise complete the request with `Terminal::TimedOut`.
    pub fn retry_or_expire(&mut self, seq: u16, now: Instant) -> Option<RetryOutcome> {
        let p = self.pending.get_mut(&seq)?;
        if p.retries_used < p.max_retries {
            p.retries_used += 1;
            p.last_send_at = now;
            Some(RetryOutcome::Resend(p.original_frame.clone()))
        } else {
            self.fail_terminal(seq, Terminal::TimedOut);
            Some(RetryOutcome::Expired)
        }
    }

    /// Removes the bookkeeping for `seq`. Call once both completions have
    /// fired (or after a terminal failure already fulfilled them).
    pub fn complete(&mut self, seq: u16) {
        self.pending.remove(&seq);
    }

    /// Fails every still-pending request with `Terminal::Canceled` and clears
    /// all bookkeeping (spec §5 `disconnect()` contract).
    pub fn cancel_all(&mut self) {
        let seqs: Vec<u16> = self.pending.keys().copied().collect();
        for seq in seqs {
            self.fail_terminal(seq, Terminal::Canceled);
        }
        self.pending.clear();
        self.result_order.clear();
    }

    fn fail_terminal(&mut self, seq: u16, reason: Terminal) {
        if let Some(p) = self.pending.get_mut(&seq) {
            if let Some(tx) = p.acked_tx.take() {
                let _ = tx.send(Err(reason));
            }
            if let Some(tx) = p.result_tx.take() {
                let _ = tx.send(Err(reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_seq_never_returns_zero_and_wraps_to_one() {
        let mut t = RequestTracker::new();
        t.next_seq = 0xFFFE;
        assert_eq!(t.next_seq(), 0xFFFF);
        assert_eq!(t.next_seq(), 1);
        assert_eq!(t.next_seq(), 2);
    }

    #[test]
    fn next_seq_has_full_period() {
        let mut t = RequestTracker::new();
        let first = t.next_seq();
        let mut seen = std::collections::HashSet::new();
        seen.insert(first);
        for _ in 0..(u16::MAX as u32 - 1) {
            let s = t.next_seq();
            assert_ne!(s, 0);
            seen.insert(s);
        }
        assert_eq!(seen.len(), u16::MAX as usize);
    }

    #[tokio::test]
    async fn ack_then_result_fulfills_handle() {
        let mut t = RequestTracker::new();
        let now = Instant::now();
        let (seq, mut handle) = t.register(Duration::from_millis(100), 2, vec![1, 2, 3], now);
        t.handle_ack(seq, 0);
        assert_eq!(handle.acked.try_recv().unwrap(), Ok(0));
        t.handle_result(TxOutcome { success: true });
        assert_eq!(
            handle.result.try_recv().unwrap(),
            Ok(TxOutcome { success: true })
        );
    }

    #[test]
    fn late_ack_for_already_acked_seq_is_dropped() {
        let mut t = RequestTracker::new();
        let now = Instant::now();
        let (seq, _handle) = t.register(Duration::from_millis(100), 2, vec![], now);
        t.handle_ack(seq, 0);
        // Second ack must not panic or overwrite; no observable effect since
        // the oneshot sender was already consumed.
        t.handle_ack(seq, 5);
    }

    #[test]
    fn unknown_seq_ack_is_noop() {
        let mut t = RequestTracker::new();
        t.handle_ack(999, 0);
    }

    #[test]
    fn timeouts_ordered_by_last_send_then_seq() {
        let mut t = RequestTracker::new();
        let base = Instant::now() - Duration::from_secs(1);
        let (seq_a, _) = t.register(Duration::from_millis(10), 1, vec![], base);
        let (seq_b, _) = t.register(
            Duration::from_millis(10),
            1,
            vec![],
            base + Duration::from_millis(5),
        );
        let now = base + Duration::from_secs(1);
        let due = t.time_out(now);
        assert_eq!(due, vec![seq_a, seq_b]);
    }

    #[tokio::test]
    async fn retry_resends_until_retries_exhausted_then_times_out() {
        let mut t = RequestTracker::new();
        let now = Instant::now();
        let (seq, mut handle) = t.register(Duration::from_millis(1), 1, vec![9, 9], now);

        match t.retry_or_expire(seq, now).unwrap() {
            RetryOutcome::Resend(bytes) => assert_eq!(bytes, vec![9, 9]),
            RetryOutcome::Expired => panic!("expected resend"),
        }
        assert!(handle.acked.try_recv().is_err());

        match t.retry_or_expire(seq, now).unwrap() {
            RetryOutcome::Expired => {}
            RetryOutcome::Resend(_) => panic!("expected expiry"),
        }
        assert_eq!(handle.acked.try_recv().unwrap(), Err(Terminal::TimedOut));
        assert_eq!(handle.result.try_recv().unwrap(), Err(Terminal::TimedOut));
    }

    #[tokio::test]
    async fn cancel_all_completes_every_pending_request_exactly_once() {
        let mut t = RequestTracker::new();
        let now = Instant::now();
        let (_s1, mut h1) = t.register(Duration::from_millis(100), 1, vec![], now);
        let (_s2, mut h2) = t.register(Duration::from_millis(100), 1, vec![], now);
        t.cancel_all();
        assert_eq!(h1.acked.try_recv().unwrap(), Err(Terminal::Canceled));
        assert_eq!(h2.acked.try_recv().unwrap(), Err(Terminal::Canceled));
        assert_eq!(h1.result.try_recv().unwrap(), Err(Terminal::Canceled));
        assert_eq!(h2.result.try_recv().unwrap(), Err(Terminal::Canceled));
    }
}
