//! Announcement tracker.
//! Decides which peer to request each announced inventory item from, and when.
//!
//! Remote peers flood short "I have X" announcements. For every announced
//! item we want the full data exactly once, so the tracker keeps one record
//! per `(peer, item)` pair and selects, per item, a single *best* candidate
//! to ask next. Preferred peers outrank the rest; among equals the order is
//! decided by a keyed hash (see [`crate::priority`]) so that peers cannot
//! game it. If a request is not answered in time, the tracker falls back to
//! the next candidate.
//!
//! ## Announcement lifecycle
//!
//! An announcement starts as a candidate: *delayed* until its request time
//! passes and *ready* afterwards, with the one ready candidate that would
//! be handed out for its item holding the *best* slot. When the caller
//! issues the request it
//! becomes *requested*, and when a response arrives, the request times out,
//! or another peer is asked instead, it becomes *completed*. Completed
//! records are kept only to ignore re-announcements while the item is still
//! being worked on; when nothing but completed records remain, the item is
//! forgotten entirely.
//!
//! ## Time
//!
//! The tracker holds no timers. Callers pass the current time into events,
//! and [`RequestTracker::get_requestable`] is the single place where due
//! request times promote candidates and overdue requests expire. Time may
//! move backward between calls; promotions are never undone by it.
use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;

use crate::collections::HashMap;
use crate::priority::{Priority, PriorityOracle};
use crate::time::LocalTime;

/// Identifies a peer.
pub type PeerId = i64;

/// Identifies an inventory item.
///
/// Opaque to the tracker: 32 bytes with equality, ordering and hashing,
/// and nothing else.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId([u8; 32]);

impl ItemId {
    const MIN: ItemId = ItemId([0x00; 32]);
    const MAX: ItemId = ItemId([0xff; 32]);
}

impl From<[u8; 32]> for ItemId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ItemId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Announcement state.
///
/// The variant order is meaningful: the by-item index sorts on it, keeping
/// each state's announcements contiguous within an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    /// Candidate whose request time has not passed yet.
    CandidateDelayed,
    /// Candidate eligible for selection.
    CandidateReady,
    /// The candidate that will be handed out for its item.
    CandidateBest,
    /// Request outstanding with the peer.
    Requested,
    /// Slot held until the item is resolved.
    Completed,
}

impl State {
    fn is_candidate(&self) -> bool {
        matches!(
            self,
            State::CandidateDelayed | State::CandidateReady | State::CandidateBest
        )
    }

    /// Whether `Announcement::time` is a pending event for this state:
    /// a request time for delayed candidates, an expiry for requests.
    fn has_timed_event(&self) -> bool {
        matches!(self, State::CandidateDelayed | State::Requested)
    }
}

/// The record of a peer having offered an item.
#[derive(Debug, Clone, Copy)]
struct Announcement {
    state: State,
    /// Whether the announcing peer is preferred. Frozen at creation.
    preferred: bool,
    /// Request time while a candidate, expiry time while requested.
    time: LocalTime,
    /// Creation-order counter. Breaks ties and orders request batches.
    sequence: u64,
    priority: Priority,
}

/// Per-peer announcement counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PeerStats {
    total: usize,
    requested: usize,
    candidates: usize,
}

/// Tracks inventory announcements and schedules requests.
///
/// See the [module documentation](self) for the overall behavior. All
/// methods run to completion synchronously; wrap the tracker in a mutex to
/// share it between threads.
#[derive(Debug)]
pub struct RequestTracker {
    /// All announcements, by announcing peer and item.
    announcements: HashMap<(PeerId, ItemId), Announcement>,
    /// Announcements of a peer, with the best candidates grouped last.
    by_peer: BTreeSet<(PeerId, bool, ItemId)>,
    /// Announcements of an item, grouped by state and ordered by priority.
    by_item: BTreeSet<(ItemId, State, Priority, PeerId)>,
    /// Pending timed events: request times of delayed candidates and
    /// expiry times of outstanding requests.
    by_time: BTreeSet<(LocalTime, PeerId, ItemId)>,
    /// Per-peer counts, kept in sync with `announcements`.
    peers: HashMap<PeerId, PeerStats>,
    oracle: PriorityOracle,
    /// Next sequence number to assign.
    sequence: u64,
}

impl RequestTracker {
    /// Create a new request tracker.
    ///
    /// With `deterministic` set, the priority key and hash seeds are fixed
    /// and selection order is reproducible across runs; meant for tests.
    /// Otherwise key material is drawn from the system's cryptographic RNG.
    pub fn new(deterministic: bool) -> Self {
        let rng = if deterministic {
            fastrand::Rng::with_seed(0)
        } else {
            fastrand::Rng::new()
        };
        let oracle = if deterministic {
            PriorityOracle::fixed()
        } else {
            PriorityOracle::random()
        };

        Self {
            announcements: HashMap::with_hasher(rng.clone().into()),
            by_peer: BTreeSet::new(),
            by_item: BTreeSet::new(),
            by_time: BTreeSet::new(),
            peers: HashMap::with_hasher(rng.into()),
            oracle,
            sequence: 0,
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Events
    ////////////////////////////////////////////////////////////////////////

    /// Called when a peer announces an item.
    ///
    /// The first announcement per `(peer, item)` pair wins: repeats are
    /// ignored, even if they carry a different preference or request time,
    /// and even if the pair has already been requested or completed. The
    /// announcement is not selectable before `reqtime` passes.
    pub fn received_inv(
        &mut self,
        peer: PeerId,
        item: ItemId,
        preferred: bool,
        reqtime: LocalTime,
        now: LocalTime,
    ) {
        if self.announcements.contains_key(&(peer, item)) {
            return;
        }
        let sequence = self.sequence;
        self.sequence += 1;

        let priority = self.oracle.priority(&item, peer, preferred);
        let state = if reqtime > now {
            State::CandidateDelayed
        } else {
            State::CandidateReady
        };
        log::trace!("{}: Announced {}", peer, item);

        self.insert(
            peer,
            item,
            Announcement {
                state,
                preferred,
                time: reqtime,
                sequence,
                priority,
            },
        );
        if state == State::CandidateReady {
            self.select_best(item);
        }
    }

    /// Called when the item has been requested from a peer.
    ///
    /// Meant to be called for pairs that [`RequestTracker::get_requestable`]
    /// just returned, but tolerates any input: only an existing candidate
    /// announcement transitions. The request is considered failed once
    /// `exptime` passes. A request outstanding with another peer for the
    /// same item is superseded, and that peer will not be asked again.
    pub fn requested_tx(&mut self, peer: PeerId, item: ItemId, exptime: LocalTime) {
        match self.announcements.get(&(peer, item)) {
            Some(ann) if ann.state.is_candidate() => {}
            _ => return,
        }
        log::trace!("{}: Requested {}, expires at {}", peer, item, exptime);

        // A new request supersedes any outstanding one for the same item.
        if let Some(requested) = self.requested(item) {
            self.transition(requested, item, State::Completed, None);
        }
        // The caller may request a candidate other than the current best;
        // the displaced best becomes an ordinary ready candidate again.
        if let Some((best, _)) = self.best(item) {
            if best != peer {
                self.transition(best, item, State::CandidateReady, None);
            }
        }
        self.transition(peer, item, State::Requested, Some(exptime));
    }

    /// Called when a peer responded to a request for an item, whether with
    /// the data or with a refusal.
    ///
    /// The remaining candidates for the item are dropped: now that an
    /// answer is in hand, nobody else will be asked. The item is forgotten
    /// outright unless a different peer still has a request in flight.
    /// Unknown pairs are ignored. Re-announcements of a forgotten item
    /// start from a clean slate.
    pub fn received_response(&mut self, peer: PeerId, item: ItemId) {
        if !self.announcements.contains_key(&(peer, item)) {
            return;
        }
        log::trace!("{}: Received response for {}", peer, item);

        let candidates: Vec<PeerId> = self
            .by_item
            .range(Self::item_span(item))
            .filter(|&&(_, state, _, p)| state.is_candidate() && p != peer)
            .map(|&(_, _, _, p)| p)
            .collect();
        for p in candidates {
            self.remove(p, item);
        }
        self.transition(peer, item, State::Completed, None);
        self.cleanup(item);
    }

    /// Called when an item is no longer wanted, e.g. because it was
    /// obtained through other means. Erases every announcement for it.
    pub fn forget_item(&mut self, item: ItemId) {
        let peers: Vec<PeerId> = self
            .by_item
            .range(Self::item_span(item))
            .map(|&(_, _, _, p)| p)
            .collect();
        for peer in peers {
            self.remove(peer, item);
        }
    }

    /// Called when a peer disconnected. Erases every announcement from it;
    /// items it was the selected or requested peer for fall back to the
    /// remaining candidates.
    pub fn disconnected_peer(&mut self, peer: PeerId) {
        let items: Vec<ItemId> = self
            .by_peer
            .range((peer, false, ItemId::MIN)..=(peer, true, ItemId::MAX))
            .map(|&(_, _, item)| item)
            .collect();
        if !items.is_empty() {
            log::debug!("{}: Disconnected, dropping {} announcement(s)", peer, items.len());
        }
        for item in items {
            self.remove(peer, item);
            self.cleanup(item);
            self.select_best(item);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Queries
    ////////////////////////////////////////////////////////////////////////

    /// Return the items that should now be requested from a peer, in the
    /// order the announcements were first received, along with the requests
    /// that expired since the last call.
    ///
    /// This is the only place where time acts on the tracker: every due
    /// request time promotes its delayed candidate, and every overdue
    /// request expires and falls back to the next candidate. Callers need
    /// no timers of their own; calling this whenever they are ready to send
    /// requests is enough.
    pub fn get_requestable(
        &mut self,
        peer: PeerId,
        now: LocalTime,
    ) -> (Vec<ItemId>, Vec<(PeerId, ItemId)>) {
        let mut expired = Vec::new();

        // Drain due timed events, oldest first. Transitions remove the
        // drained entry from the time index, and never add new ones.
        while let Some(&(time, p, item)) = self.by_time.iter().next() {
            if time > now {
                break;
            }
            let ann = self.announcements[&(p, item)];
            match ann.state {
                State::CandidateDelayed => {
                    self.transition(p, item, State::CandidateReady, None);
                    self.select_best(item);
                }
                State::Requested => {
                    log::debug!("{}: Request for {} expired at {}", p, item, time);

                    expired.push((p, item));
                    self.transition(p, item, State::Completed, None);
                    self.cleanup(item);
                    self.select_best(item);
                }
                // Only delayed candidates and outstanding requests carry
                // timed events.
                state => unreachable!("{:?} in time index", state),
            }
        }

        let mut selected: Vec<(u64, ItemId)> = self
            .by_peer
            .range((peer, true, ItemId::MIN)..=(peer, true, ItemId::MAX))
            .map(|&(_, _, item)| (self.announcements[&(peer, item)].sequence, item))
            .collect();
        selected.sort_unstable();

        (
            selected.into_iter().map(|(_, item)| item).collect(),
            expired,
        )
    }

    /// Total number of announcements across all peers.
    pub fn size(&self) -> usize {
        self.announcements.len()
    }

    /// Number of announcements from a peer, in any state.
    pub fn count(&self, peer: PeerId) -> usize {
        self.peers.get(&peer).map_or(0, |stats| stats.total)
    }

    /// Number of requests outstanding with a peer.
    pub fn count_in_flight(&self, peer: PeerId) -> usize {
        self.peers.get(&peer).map_or(0, |stats| stats.requested)
    }

    /// Number of candidate announcements from a peer.
    pub fn count_candidates(&self, peer: PeerId) -> usize {
        self.peers.get(&peer).map_or(0, |stats| stats.candidates)
    }

    /// The priority this tracker assigns to an announcement.
    pub fn compute_priority(&self, item: &ItemId, peer: PeerId, preferred: bool) -> Priority {
        self.oracle.priority(item, peer, preferred)
    }

    ////////////////////////////////////////////////////////////////////////
    // Consistency checks
    ////////////////////////////////////////////////////////////////////////

    /// Verify all internal invariants, aborting on violation. Cheap enough
    /// for tests, too slow for per-call use in production.
    pub fn sanity_check(&self) {
        use std::collections::BTreeMap;

        #[derive(Default)]
        struct ItemTally {
            delayed: usize,
            ready: usize,
            best: usize,
            requested: usize,
            best_priority: Option<Priority>,
            max_ready_priority: Option<Priority>,
        }

        let mut peer_tally: BTreeMap<PeerId, PeerStats> = BTreeMap::new();
        let mut item_tally: BTreeMap<ItemId, ItemTally> = BTreeMap::new();
        let mut sequences: BTreeSet<u64> = BTreeSet::new();
        let mut timed = 0;

        for (&(peer, item), ann) in self.announcements.iter() {
            assert!(
                ann.sequence < self.sequence,
                "sequence numbers stay below the counter"
            );
            assert!(sequences.insert(ann.sequence), "sequence numbers are unique");
            assert_eq!(
                ann.priority,
                self.oracle.priority(&item, peer, ann.preferred),
                "cached priorities match the oracle"
            );

            assert!(
                self.by_peer
                    .contains(&(peer, ann.state == State::CandidateBest, item)),
                "every announcement is indexed by peer"
            );
            assert!(
                self.by_item
                    .contains(&(item, ann.state, ann.priority, peer)),
                "every announcement is indexed by item"
            );
            if ann.state.has_timed_event() {
                assert!(
                    self.by_time.contains(&(ann.time, peer, item)),
                    "timed announcements are indexed by time"
                );
                timed += 1;
            }

            let stats = peer_tally.entry(peer).or_default();
            stats.total += 1;
            if ann.state.is_candidate() {
                stats.candidates += 1;
            }
            if ann.state == State::Requested {
                stats.requested += 1;
            }

            let tally = item_tally.entry(item).or_default();
            match ann.state {
                State::CandidateDelayed => tally.delayed += 1,
                State::CandidateReady => {
                    tally.ready += 1;
                    tally.max_ready_priority =
                        Some(tally.max_ready_priority.unwrap_or(0).max(ann.priority));
                }
                State::CandidateBest => {
                    tally.best += 1;
                    tally.best_priority = Some(ann.priority);
                }
                State::Requested => tally.requested += 1,
                State::Completed => {}
            }
        }

        // No stale index entries.
        assert_eq!(self.by_peer.len(), self.announcements.len());
        assert_eq!(self.by_item.len(), self.announcements.len());
        assert_eq!(self.by_time.len(), timed);

        for (_, tally) in item_tally {
            assert!(
                tally.requested <= 1,
                "at most one request in flight per item"
            );
            assert!(tally.best <= 1, "at most one best candidate per item");
            if tally.requested > 0 {
                assert_eq!(
                    tally.best, 0,
                    "no best candidate while a request is in flight"
                );
            } else if tally.ready > 0 || tally.best > 0 {
                assert_eq!(
                    tally.best, 1,
                    "a best candidate is selected whenever the item has ready \
                     candidates and no request in flight"
                );
            }
            if let (Some(best), Some(ready)) = (tally.best_priority, tally.max_ready_priority) {
                assert!(
                    best >= ready,
                    "the best candidate has the highest ready priority"
                );
            }
            assert!(
                tally.delayed + tally.ready + tally.best + tally.requested > 0,
                "items with only completed announcements are purged"
            );
        }

        assert_eq!(
            self.peers.len(),
            peer_tally.len(),
            "per-peer statistics track exactly the announcing peers"
        );
        for (peer, expected) in peer_tally {
            assert_eq!(self.peers.get(&peer), Some(&expected));
        }
    }

    /// Additional invariants that hold right after
    /// [`RequestTracker::get_requestable`] ran at `now`: no delayed
    /// candidate or outstanding request has a due time.
    pub fn post_get_requestable_sanity_check(&self, now: LocalTime) {
        for ann in self.announcements.values() {
            if ann.state.has_timed_event() {
                assert!(
                    ann.time > now,
                    "due timed events are processed by get_requestable"
                );
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////

    /// The by-item index range spanning every announcement of an item.
    fn item_span(item: ItemId) -> RangeInclusive<(ItemId, State, Priority, PeerId)> {
        (item, State::CandidateDelayed, u64::MIN, i64::MIN)
            ..=(item, State::Completed, u64::MAX, i64::MAX)
    }

    /// The by-item index range spanning one state of an item.
    fn state_span(
        item: ItemId,
        state: State,
    ) -> RangeInclusive<(ItemId, State, Priority, PeerId)> {
        (item, state, u64::MIN, i64::MIN)..=(item, state, u64::MAX, i64::MAX)
    }

    /// The peer holding the outstanding request for an item, if any.
    fn requested(&self, item: ItemId) -> Option<PeerId> {
        self.by_item
            .range(Self::state_span(item, State::Requested))
            .next()
            .map(|&(_, _, _, peer)| peer)
    }

    /// The current best candidate for an item, if any.
    fn best(&self, item: ItemId) -> Option<(PeerId, Priority)> {
        self.by_item
            .range(Self::state_span(item, State::CandidateBest))
            .next()
            .map(|&(_, _, priority, peer)| (peer, priority))
    }

    /// The highest-priority ready candidate for an item, if any.
    fn top_ready(&self, item: ItemId) -> Option<(PeerId, Priority)> {
        self.by_item
            .range(Self::state_span(item, State::CandidateReady))
            .next_back()
            .map(|&(_, _, priority, peer)| (peer, priority))
    }

    /// Re-establish the best-candidate invariant for an item: unless a
    /// request is in flight, the highest-priority ready candidate holds the
    /// `CandidateBest` slot. The incumbent keeps the slot on a priority tie.
    fn select_best(&mut self, item: ItemId) {
        if self.requested(item).is_some() {
            return;
        }
        if let Some((ready, priority)) = self.top_ready(item) {
            match self.best(item) {
                Some((_, incumbent)) if incumbent >= priority => {}
                Some((best, _)) => {
                    self.transition(best, item, State::CandidateReady, None);
                    self.transition(ready, item, State::CandidateBest, None);
                }
                None => {
                    self.transition(ready, item, State::CandidateBest, None);
                }
            }
        }
    }

    /// Forget an item once only completed announcements remain for it.
    fn cleanup(&mut self, item: ItemId) {
        let mut peers = Vec::new();
        for &(_, state, _, peer) in self.by_item.range(Self::item_span(item)) {
            if state != State::Completed {
                return;
            }
            peers.push(peer);
        }
        for peer in peers {
            self.remove(peer, item);
        }
    }

    /// Add a new announcement to the primary table and every index.
    fn insert(&mut self, peer: PeerId, item: ItemId, ann: Announcement) {
        self.index_insert(peer, item, &ann);

        let stats = self.peers.entry(peer).or_default();
        stats.total += 1;
        if ann.state.is_candidate() {
            stats.candidates += 1;
        }
        if ann.state == State::Requested {
            stats.requested += 1;
        }
        self.announcements.insert((peer, item), ann);
    }

    /// Erase an announcement from the primary table and every index.
    fn remove(&mut self, peer: PeerId, item: ItemId) {
        if let Some(ann) = self.announcements.remove(&(peer, item)) {
            self.index_remove(peer, item, &ann);

            if let Some(stats) = self.peers.get_mut(&peer) {
                stats.total -= 1;
                if ann.state.is_candidate() {
                    stats.candidates -= 1;
                }
                if ann.state == State::Requested {
                    stats.requested -= 1;
                }
                if stats.total == 0 {
                    self.peers.remove(&peer);
                }
            }
        }
    }

    /// Move an announcement to a new state, re-indexing it and keeping the
    /// per-peer counts current. `time` replaces the timed event, if given.
    fn transition(&mut self, peer: PeerId, item: ItemId, state: State, time: Option<LocalTime>) {
        if let Some(&prev) = self.announcements.get(&(peer, item)) {
            self.index_remove(peer, item, &prev);

            let mut ann = prev;
            ann.state = state;
            if let Some(time) = time {
                ann.time = time;
            }
            self.index_insert(peer, item, &ann);

            if let Some(stats) = self.peers.get_mut(&peer) {
                if prev.state.is_candidate() {
                    stats.candidates -= 1;
                }
                if prev.state == State::Requested {
                    stats.requested -= 1;
                }
                if ann.state.is_candidate() {
                    stats.candidates += 1;
                }
                if ann.state == State::Requested {
                    stats.requested += 1;
                }
            }
            self.announcements.insert((peer, item), ann);
        }
    }

    fn index_insert(&mut self, peer: PeerId, item: ItemId, ann: &Announcement) {
        self.by_peer
            .insert((peer, ann.state == State::CandidateBest, item));
        self.by_item.insert((item, ann.state, ann.priority, peer));
        if ann.state.has_timed_event() {
            self.by_time.insert((ann.time, peer, item));
        }
    }

    fn index_remove(&mut self, peer: PeerId, item: ItemId, ann: &Announcement) {
        self.by_peer
            .remove(&(peer, ann.state == State::CandidateBest, item));
        self.by_item.remove(&(item, ann.state, ann.priority, peer));
        if ann.state.has_timed_event() {
            self.by_time.remove(&(ann.time, peer, item));
        }
    }
}
