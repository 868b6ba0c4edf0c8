//! Sequencing, acknowledgment and retransmission over the unreliable
//! transport.
//!
//! Two streams run per connection:
//!
//! * every datagram gets a header sequence number, tracked by
//!   [`AckTracker`]/[`ReceiveTracker`] so the peer's acks tell us which
//!   datagrams arrived (and give us an RTT estimate);
//! * messages flagged reliable additionally carry a reliable-stream
//!   sequence, buffered in [`ReliableOutbound`] until acknowledged and
//!   reordered by [`ReliableInbound`] so the application sees them exactly
//!   once, in order.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::message::Message;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

/// Wrap-aware sequence comparison: true when `s1` is logically after `s2`.
#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone)]
struct SentDatagram {
    sequence: u32,
    send_time: Instant,
    acked: bool,
}

/// Tracks outbound datagram sequences until the peer acknowledges them.
///
/// `process_ack` consumes the `(ack, bitfield)` pair from an inbound header:
/// `ack` is the highest sequence the peer has seen, bit `i` of the bitfield
/// covers `ack - 1 - i`. Returns the sequences newly acknowledged so the
/// caller can release retransmission state and advance replication cursors.
#[derive(Debug)]
pub struct AckTracker {
    sent: VecDeque<SentDatagram>,
    max_tracked: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_tracked: usize) -> Self {
        Self {
            sent: VecDeque::with_capacity(max_tracked),
            max_tracked,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track(&mut self, sequence: u32) {
        while self.sent.len() >= self.max_tracked {
            self.sent.pop_front();
        }
        self.sent.push_back(SentDatagram {
            sequence,
            send_time: Instant::now(),
            acked: false,
        });
    }

    pub fn process_ack(&mut self, ack: u32, ack_bits: u32) -> Vec<u32> {
        let mut acked = Vec::new();
        let now = Instant::now();
        let mut rtt_samples = Vec::new();

        for entry in &mut self.sent {
            if entry.acked {
                continue;
            }

            let covered = if entry.sequence == ack {
                true
            } else if sequence_greater_than(ack, entry.sequence) {
                let diff = ack.wrapping_sub(entry.sequence);
                diff <= 32 && (ack_bits & (1 << (diff - 1))) != 0
            } else {
                false
            };

            if covered {
                entry.acked = true;
                acked.push(entry.sequence);
                rtt_samples.push(now.duration_since(entry.send_time).as_secs_f32() * 1000.0);
            }
        }

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        while self.sent.front().is_some_and(|e| e.acked) {
            self.sent.pop_front();
        }

        acked
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn unacked_count(&self) -> usize {
        self.sent.iter().filter(|e| !e.acked).count()
    }
}

/// Tracks inbound datagram sequences: duplicate suppression plus the
/// `(ack, bitfield)` pair stamped onto every outbound header.
#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bits: u32,
    recent: VecDeque<u32>,
    max_recent: usize,
    any_received: bool,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: 0,
            received_bits: 0,
            recent: VecDeque::with_capacity(128),
            max_recent: 128,
            any_received: false,
        }
    }

    /// Record a received datagram sequence. Returns false for duplicates.
    pub fn record(&mut self, sequence: u32) -> bool {
        if self.recent.contains(&sequence) {
            return false;
        }

        if self.recent.len() >= self.max_recent {
            self.recent.pop_front();
        }
        self.recent.push_back(sequence);

        if !self.any_received {
            self.any_received = true;
            self.last_received = sequence;
            self.received_bits = 0;
            return true;
        }

        if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            if diff <= 32 {
                self.received_bits = (self.received_bits << diff) | (1 << (diff - 1));
            } else {
                self.received_bits = 0;
            }
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bits |= 1 << (diff - 1);
            }
        }

        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bits)
    }
}

#[derive(Debug, Clone)]
pub struct PendingReliable {
    pub sequence: u32,
    pub message: Message,
    pub first_send: Instant,
    pub last_send: Option<Instant>,
    pub send_count: u32,
}

/// Outbound reliable messages held until acknowledged.
///
/// A message is (re)sent whenever `take_due` finds it unsent or past the
/// resend interval; it leaves the buffer only on `ack`. Exhausting the retry
/// budget marks the whole connection as failed, which the registry turns
/// into a timeout disconnect.
#[derive(Debug)]
pub struct ReliableOutbound {
    pending: VecDeque<PendingReliable>,
    next_sequence: u32,
}

impl Default for ReliableOutbound {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableOutbound {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            // 0 means "nothing processed yet" on the receiving side.
            next_sequence: 1,
        }
    }

    pub fn push(&mut self, message: Message, now: Instant) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.pending.push_back(PendingReliable {
            sequence,
            message,
            first_send: now,
            last_send: None,
            send_count: 0,
        });
        sequence
    }

    /// Collect every message due for a (re)send and stamp its attempt.
    /// Returns `(sequence, message, is_resend)` triples.
    pub fn take_due(
        &mut self,
        now: Instant,
        resend_interval: Duration,
    ) -> Vec<(u32, Message, bool)> {
        let mut due = Vec::new();
        for entry in &mut self.pending {
            let ready = match entry.last_send {
                None => true,
                Some(last) => now.duration_since(last) >= resend_interval,
            };
            if ready {
                entry.last_send = Some(now);
                entry.send_count += 1;
                due.push((entry.sequence, entry.message.clone(), entry.send_count > 1));
            }
        }
        due
    }

    pub fn ack(&mut self, sequence: u32) -> bool {
        if let Some(pos) = self.pending.iter().position(|e| e.sequence == sequence) {
            self.pending.remove(pos);
            true
        } else {
            false
        }
    }

    /// True once any pending message has exceeded the retry or age budget.
    pub fn exhausted(&self, now: Instant, max_sends: u32, max_age: Duration) -> bool {
        self.pending.iter().any(|e| {
            e.send_count >= max_sends || now.duration_since(e.first_send) > max_age
        })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Reorders the inbound reliable stream into strict sequence order.
#[derive(Debug)]
pub struct ReliableInbound {
    next_expected: u32,
    held: BTreeMap<u32, Message>,
    max_held: usize,
}

impl Default for ReliableInbound {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableInbound {
    pub fn new() -> Self {
        Self {
            next_expected: 1,
            held: BTreeMap::new(),
            max_held: 256,
        }
    }

    /// Accept a reliable message; returns the run of messages now
    /// deliverable in order. Sequences already processed are dropped
    /// (redelivery is idempotent), gaps are held until filled.
    pub fn accept(&mut self, sequence: u32, message: Message) -> Vec<Message> {
        if !sequence_greater_than(sequence, self.next_expected.wrapping_sub(1)) {
            log::trace!("duplicate reliable message {sequence}, already processed");
            return Vec::new();
        }

        if sequence != self.next_expected {
            if self.held.len() < self.max_held {
                self.held.insert(sequence, message);
            } else {
                log::warn!("reliable hold-back buffer full, dropping {sequence}");
            }
            return Vec::new();
        }

        let mut out = vec![message];
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(next) = self.held.remove(&self.next_expected) {
            out.push(next);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        out
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}
