//! Request tracker model.
//! Not for production use.
//!
//! A deliberately naive reimplementation of the tracker: a dense
//! item-by-peer table with only three announcement states, rescanned from
//! scratch on every query. Every public call is mirrored to the naive
//! table and to the real tracker, and the outputs of `get_requestable`,
//! all counters, and the internal consistency checks must agree after
//! every step.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bitcoin_hashes::{sha256, Hash};
use quickcheck_macros::quickcheck;

use crate::collections::RandomState;
use crate::{ItemId, LocalDuration, LocalTime, PeerId, RequestTracker};

const MAX_ITEMS: usize = 16;
const MAX_PEERS: usize = 16;

/// The fixed set of items driven through both implementations: item `k` is
/// the SHA-256 digest of the single byte `k`.
fn items() -> Vec<ItemId> {
    (0..MAX_ITEMS as u8)
        .map(|k| ItemId::from(sha256::Hash::hash(&[k]).into_inner()))
        .collect()
}

/// Precomputed time deltas. Entries 0..16 are zero to fifteen microseconds,
/// entries 16..128 grow roughly exponentially up to a few minutes, and
/// entries 128..256 mirror the first half negated, so that time also moves
/// backward.
fn delays() -> [LocalDuration; 256] {
    let mut delays = [LocalDuration::from_micros(0); 256];
    let state = RandomState::default();

    for i in 0..16 {
        delays[i] = LocalDuration::from_micros(i as i64);
    }
    for i in 16..128 {
        let bits = ((i - 10) * 2) / 9;
        let hash = state.hash(&(i as u64).to_le_bytes());
        let diff = 1 + (hash >> (64 - bits));

        delays[i] = delays[i - 1] + LocalDuration::from_micros(diff as i64);
    }
    for i in 128..256 {
        delays[i] = -delays[255 - i];
    }
    delays
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No announcement for this item/peer combination.
    #[default]
    Nothing,
    /// Candidate, with no distinction between delayed, ready and best.
    Candidate,
    Requested,
    Completed,
}

#[derive(Debug, Default, Clone, Copy)]
struct Announcement {
    state: State,
    time: LocalTime,
    sequence: u64,
    priority: u64,
    /// Whether a query has already seen this candidate's request time as
    /// due. Promotion is one-way: it sticks even if time moves backward.
    promoted: bool,
}

/// Drives the naive table and the real tracker in lockstep.
struct Tester {
    tracker: RequestTracker,
    table: [[Announcement; MAX_PEERS]; MAX_ITEMS],
    items: Vec<ItemId>,
    sequence: u64,
    /// The current time. Can move forward and backward.
    now: LocalTime,
    /// Future request and expiry times, so that the driver can jump
    /// straight to the next point where anything happens.
    events: BinaryHeap<Reverse<LocalTime>>,
}

impl Tester {
    fn new() -> Self {
        Self {
            tracker: RequestTracker::new(true),
            table: [[Announcement::default(); MAX_PEERS]; MAX_ITEMS],
            items: items(),
            sequence: 0,
            now: LocalTime::from_micros(244_466_666),
            events: BinaryHeap::new(),
        }
    }

    /// Drop an item once only completed announcements are left for it.
    fn cleanup(&mut self, item: usize) {
        let mut any = false;
        for peer in 0..MAX_PEERS {
            match self.table[item][peer].state {
                State::Nothing => {}
                State::Completed => any = true,
                _ => return,
            }
        }
        if any {
            for peer in 0..MAX_PEERS {
                self.table[item][peer].state = State::Nothing;
            }
        }
    }

    /// The peer a request for this item should go to, if any: none while a
    /// request is in flight, otherwise the eligible candidate with the
    /// highest priority.
    fn selected(&self, item: usize) -> Option<usize> {
        let mut ret: Option<(u64, usize)> = None;

        for peer in 0..MAX_PEERS {
            let ann = &self.table[item][peer];
            if ann.state == State::Requested {
                return None;
            }
            if ann.state == State::Candidate && ann.promoted {
                if ret.map_or(true, |(priority, _)| ann.priority > priority) {
                    ret = Some((ann.priority, peer));
                }
            }
        }
        ret.map(|(_, peer)| peer)
    }

    fn advance_time(&mut self, delta: LocalDuration) {
        self.now.elapse(delta);
        while let Some(&Reverse(event)) = self.events.peek() {
            if event > self.now {
                break;
            }
            self.events.pop();
        }
    }

    /// Jump to the next future request or expiry time, if there is one.
    fn advance_to_event(&mut self) {
        while let Some(&Reverse(event)) = self.events.peek() {
            if event > self.now {
                break;
            }
            self.events.pop();
        }
        if let Some(Reverse(event)) = self.events.pop() {
            self.now = event;
        }
    }

    fn received_inv(&mut self, peer: usize, item: usize, preferred: bool, reqtime: LocalTime) {
        let promoted = reqtime <= self.now;
        let priority = self
            .tracker
            .compute_priority(&self.items[item], peer as PeerId, preferred);

        let ann = &mut self.table[item][peer];
        if ann.state == State::Nothing {
            ann.state = State::Candidate;
            ann.time = reqtime;
            ann.sequence = self.sequence;
            ann.priority = priority;
            ann.promoted = promoted;
            self.sequence += 1;

            if reqtime > self.now {
                self.events.push(Reverse(reqtime));
            }
        }

        self.tracker
            .received_inv(peer as PeerId, self.items[item], preferred, reqtime, self.now);
    }

    fn requested_tx(&mut self, peer: usize, item: usize, exptime: LocalTime) {
        if self.table[item][peer].state == State::Candidate {
            for other in 0..MAX_PEERS {
                if self.table[item][other].state == State::Requested {
                    self.table[item][other].state = State::Completed;
                }
            }
            self.table[item][peer].state = State::Requested;
            self.table[item][peer].time = exptime;
        }
        if exptime > self.now {
            self.events.push(Reverse(exptime));
        }

        self.tracker
            .requested_tx(peer as PeerId, self.items[item], exptime);
    }

    fn received_response(&mut self, peer: usize, item: usize) {
        if self.table[item][peer].state != State::Nothing {
            // The data is in hand: the other candidates for the item will
            // never be asked, only an in-flight request from another peer
            // keeps its slot.
            for other in 0..MAX_PEERS {
                if other != peer && self.table[item][other].state == State::Candidate {
                    self.table[item][other].state = State::Nothing;
                }
            }
            self.table[item][peer].state = State::Completed;
            self.cleanup(item);
        }

        self.tracker
            .received_response(peer as PeerId, self.items[item]);
    }

    fn forget_item(&mut self, item: usize) {
        for peer in 0..MAX_PEERS {
            self.table[item][peer].state = State::Nothing;
        }
        self.cleanup(item);

        self.tracker.forget_item(self.items[item]);
    }

    fn disconnected_peer(&mut self, peer: usize) {
        for item in 0..MAX_ITEMS {
            if self.table[item][peer].state != State::Nothing {
                self.table[item][peer].state = State::Nothing;
                self.cleanup(item);
            }
        }

        self.tracker.disconnected_peer(peer as PeerId);
    }

    fn get_requestable(&mut self, peer: usize) {
        let mut expected: Vec<(u64, usize)> = Vec::new();
        let mut expected_expired: Vec<(PeerId, ItemId)> = Vec::new();

        for item in 0..MAX_ITEMS {
            // Expire the overdue request, if the item has one.
            for other in 0..MAX_PEERS {
                let ann = &mut self.table[item][other];
                if ann.state == State::Requested && ann.time <= self.now {
                    expected_expired.push((other as PeerId, self.items[item]));
                    ann.state = State::Completed;
                    break;
                }
            }
            self.cleanup(item);

            // Candidates whose request time a query has seen pass stay
            // eligible for good, even if time has moved backward since.
            for other in 0..MAX_PEERS {
                let ann = &mut self.table[item][other];
                if ann.state == State::Candidate && ann.time <= self.now {
                    ann.promoted = true;
                }
            }

            let ann = &self.table[item][peer];
            if ann.state == State::Candidate
                && ann.promoted
                && self.selected(item) == Some(peer)
            {
                expected.push((ann.sequence, item));
            }
        }
        expected.sort_unstable();
        expected_expired.sort_unstable();

        let (actual, mut expired) = self.tracker.get_requestable(peer as PeerId, self.now);
        expired.sort_unstable();

        assert_eq!(expired, expected_expired);
        assert_eq!(
            actual,
            expected
                .into_iter()
                .map(|(_, item)| self.items[item])
                .collect::<Vec<_>>()
        );
        self.tracker.post_get_requestable_sanity_check(self.now);
    }

    /// Compare every counter against the naive table and run the real
    /// tracker's own consistency check.
    fn check(&self) {
        let mut total = 0;

        for peer in 0..MAX_PEERS {
            let mut tracked = 0;
            let mut in_flight = 0;
            let mut candidates = 0;

            for item in 0..MAX_ITEMS {
                match self.table[item][peer].state {
                    State::Nothing => {}
                    State::Candidate => {
                        tracked += 1;
                        candidates += 1;
                    }
                    State::Requested => {
                        tracked += 1;
                        in_flight += 1;
                    }
                    State::Completed => tracked += 1,
                }
            }
            assert_eq!(self.tracker.count(peer as PeerId), tracked);
            assert_eq!(self.tracker.count_in_flight(peer as PeerId), in_flight);
            assert_eq!(self.tracker.count_candidates(peer as PeerId), candidates);

            total += tracked;
        }
        assert_eq!(self.tracker.size(), total);

        self.tracker.sanity_check();
    }
}

/// Run a random call sequence through both implementations.
fn run(seed: u64, steps: usize) {
    let rng = fastrand::Rng::with_seed(seed);
    let delays = delays();
    let mut tester = Tester::new();

    for step in 0..steps {
        let peer = rng.usize(..MAX_PEERS);
        let item = rng.usize(..MAX_ITEMS);
        let delay = delays[rng.usize(..delays.len())];

        match rng.u8(..11) {
            0 => tester.advance_to_event(),
            1 => tester.advance_time(delay),
            2 => tester.get_requestable(peer),
            3 => tester.disconnected_peer(peer),
            4 => tester.forget_item(item),
            // Immediately requestable announcement, preferred or not.
            5 => tester.received_inv(peer, item, true, LocalTime::MIN),
            6 => tester.received_inv(peer, item, false, LocalTime::MIN),
            // Delayed announcement; the delay may be negative.
            7 => tester.received_inv(peer, item, true, tester.now + delay),
            8 => tester.received_inv(peer, item, false, tester.now + delay),
            9 => tester.requested_tx(peer, item, tester.now + delay),
            10 => tester.received_response(peer, item),
            _ => unreachable!(),
        }

        if step % 16 == 0 {
            tester.check();
        }
    }
    tester.check();
}

#[quickcheck]
fn prop_matches_naive_model(seed: u64) {
    run(seed, 400);
}

#[test]
fn test_model_soak() {
    for seed in 0..64 {
        run(seed, 2000);
    }
}
