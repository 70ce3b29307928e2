//! Announcement priority oracle.
//!
//! For a fixed item, the order in which announcing peers are tried is a
//! keyed pseudo-random function of the announcement. The key is drawn per
//! tracker, so remote peers cannot predict the ordering, nor grind item
//! identifiers that would always win selection and monopolize requests.
use crate::collections::RandomState;
use crate::tracker::{ItemId, PeerId};

/// A total order over the announcements of one item. Higher values win.
pub type Priority = u64;

/// Computes announcement priorities under a per-tracker SipHash key.
#[derive(Debug, Clone)]
pub struct PriorityOracle {
    state: RandomState,
}

impl PriorityOracle {
    /// An oracle keyed from the operating system's cryptographic RNG.
    pub fn random() -> Self {
        Self {
            state: RandomState::random(),
        }
    }

    /// An oracle with a fixed all-zero key. Selection order becomes
    /// reproducible across runs; meant for tests.
    pub fn fixed() -> Self {
        Self {
            state: RandomState::default(),
        }
    }

    /// Compute the priority of an announcement.
    ///
    /// The low 63 bits are a keyed hash of the item and peer; the top bit
    /// carries the preference flag, so preferred announcements strictly
    /// outrank non-preferred ones for the same item.
    pub fn priority(&self, item: &ItemId, peer: PeerId, preferred: bool) -> Priority {
        let mut data = [0u8; 40];
        data[..32].copy_from_slice(item.as_ref());
        data[32..].copy_from_slice(&peer.to_le_bytes());

        (self.state.hash(&data) >> 1) | ((preferred as u64) << 63)
    }
}
