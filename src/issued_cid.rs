use std::sync::Arc;

use tracing::{debug, trace};

use crate::cid_encryptor::{CidEncryptor, CidPlaintext};
use crate::shared::ConnectionId;
use crate::token::ResetToken;
use crate::{LOC_CID_COUNT, RESET_TOKEN_SIZE};

/// Where a locally issued CID stands between issuance and retirement
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IssuedCidState {
    /// The slot holds no CID
    Unused,
    /// Issued, but not yet carried in any outgoing flight
    Pending,
    /// Carried in an outgoing NEW_CONNECTION_ID frame that is neither acked nor declared lost
    InFlight,
    /// The peer has the CID, either by acknowledgment or implicitly from the handshake
    Delivered,
}

/// One locally issued connection ID, tracked from issuance until retirement
#[derive(Debug, Copy, Clone)]
pub struct IssuedCid {
    /// Unique for the lifetime of the connection; never reused
    sequence: u64,
    state: IssuedCidState,
    /// Wire bytes; immutable once computed by the encryptor
    cid: ConnectionId,
    /// Issued alongside `cid`; immutable
    reset_token: ResetToken,
}

impl IssuedCid {
    fn unused() -> Self {
        Self {
            sequence: 0,
            state: IssuedCidState::Unused,
            cid: ConnectionId::new(&[]),
            reset_token: [0; RESET_TOKEN_SIZE].into(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> IssuedCidState {
        self.state
    }

    pub fn cid(&self) -> &ConnectionId {
        &self.cid
    }

    pub fn reset_token(&self) -> &ResetToken {
        &self.reset_token
    }
}

/// What a sequence-addressed operation did
///
/// Signals from the network are inherently racy. Duplicate acks, late acks and stale loss
/// verdicts are expected in normal operation, so none of these outcomes is an error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CidOutcome {
    /// No active entry carries the sequence; it was never issued or has been retired
    NotFound,
    /// The entry exists but the signal had no effect on it
    NoOp,
    /// The entry changed state
    Performed,
}

impl CidOutcome {
    /// Shorthand for `self == Self::Performed`
    pub fn performed(self) -> bool {
        self == Self::Performed
    }
}

/// The set of CIDs this endpoint has issued to its peer
///
/// Entries live in a fixed arena whose active region starts at index 0. Within the active
/// region, `Pending` entries always form a contiguous prefix, so a transmit pass picks the next
/// flight by walking from the front. Every mutation restores that ordering before returning.
///
/// The set is owned by the connection's serialized processing context; operations are
/// synchronous and never block.
pub struct IssuedCidSet {
    /// Fixed arena of CID slots; `Unused` slots only ever follow the active region
    cids: [IssuedCid; LOC_CID_COUNT],
    /// Number of leading slots holding a live entry
    active: usize,
    /// Number of active entries the set maintains; retirement refills up to this
    size: usize,
    /// Sequence number for the next CID to be issued
    next_sequence: u64,
    /// Absent on connections that issue no local CIDs; such a set stays permanently empty
    encryptor: Option<Arc<dyn CidEncryptor>>,
    /// Template descriptor; `path_id` is restamped with each entry's sequence
    plaintext: CidPlaintext,
}

impl IssuedCidSet {
    /// The maximum number of CIDs we bother to issue per connection
    pub const CAPACITY: usize = LOC_CID_COUNT;

    /// Create a set, issuing the handshake CID eagerly when an encryptor is present
    ///
    /// The CID handed to the peer during the handshake needs no NEW_CONNECTION_ID exchange, so
    /// it is born at sequence 0 already `Delivered`. Without an encryptor the connection operates
    /// with zero-length CIDs and the set never holds an entry.
    pub fn new(encryptor: Option<Arc<dyn CidEncryptor>>, initial: &CidPlaintext) -> Self {
        let mut this = Self {
            cids: [IssuedCid::unused(); Self::CAPACITY],
            active: 0,
            size: 0,
            next_sequence: 0,
            encryptor,
            plaintext: *initial,
        };
        if let Some(entry) = this.issue(IssuedCidState::Delivered) {
            this.cids[0] = entry;
            this.active = 1;
            this.size = 1;
        }
        this
    }

    /// Raise the number of simultaneously active CIDs toward `target`
    ///
    /// Returns how many entries were created; the caller should announce each of them to the
    /// peer in a NEW_CONNECTION_ID frame (see [`pending`](Self::pending)). Growth past
    /// [`CAPACITY`](Self::CAPACITY) is silently capped, and a target not exceeding the current
    /// size creates nothing.
    pub fn set_size(&mut self, target: usize) -> usize {
        let target = target.min(Self::CAPACITY);
        if self.encryptor.is_none() || target <= self.size {
            return 0;
        }
        let created = target - self.size;
        while self.size < target {
            if let Some(entry) = self.issue(IssuedCidState::Pending) {
                self.insert_pending(entry);
            }
            self.size += 1;
        }
        created
    }

    /// Entries the next outgoing flight must carry in NEW_CONNECTION_ID frames
    ///
    /// Once a flight containing the first `n` of these is transmitted, report it with
    /// [`on_sent`](Self::on_sent).
    pub fn pending(&self) -> impl Iterator<Item = &IssuedCid> + '_ {
        self.cids[..self.active]
            .iter()
            .take_while(|entry| entry.state == IssuedCidState::Pending)
    }

    /// Report that the first `count` pending entries were placed on the wire
    ///
    /// Transitions follow array order, oldest waiting entry first. If fewer than `count` entries
    /// are pending, all of them are transitioned.
    pub fn on_sent(&mut self, count: usize) {
        let pending = self.pending_len();
        let sent = count.min(pending);
        for entry in &mut self.cids[..sent] {
            entry.state = IssuedCidState::InFlight;
            trace!(sequence = entry.sequence, "NEW_CONNECTION_ID sent");
        }
        // The entries still awaiting transmission move back to the front
        self.cids[..pending].rotate_left(sent);
    }

    /// Handle transport-level acknowledgment of the frame carrying `sequence`
    ///
    /// An ack always wins: even if the entry was since marked lost and requeued, the peer
    /// evidently received the original transmission, so the pending retransmit is dropped.
    pub fn on_acked(&mut self, sequence: u64) -> CidOutcome {
        let Some(idx) = self.find(sequence) else {
            return CidOutcome::NotFound;
        };
        match self.cids[idx].state {
            IssuedCidState::Delivered => CidOutcome::NoOp,
            IssuedCidState::InFlight => {
                self.cids[idx].state = IssuedCidState::Delivered;
                trace!(sequence, "CID delivered");
                CidOutcome::Performed
            }
            IssuedCidState::Pending => {
                let pending = self.pending_len();
                self.cids[idx].state = IssuedCidState::Delivered;
                // Rotate the entry out of the pending prefix
                self.cids[idx..pending].rotate_left(1);
                trace!(sequence, "CID delivered by late ack");
                CidOutcome::Performed
            }
            // The active region never holds unused slots
            IssuedCidState::Unused => CidOutcome::NotFound,
        }
    }

    /// Handle a loss-detection verdict for the frame carrying `sequence`
    ///
    /// `Performed` means the entry was requeued and a retransmission flight should include its
    /// bytes and token again, under the same sequence. A verdict racing with an ack or a
    /// retirement never regresses the entry.
    pub fn on_lost(&mut self, sequence: u64) -> CidOutcome {
        let Some(idx) = self.find(sequence) else {
            return CidOutcome::NotFound;
        };
        if self.cids[idx].state != IssuedCidState::InFlight {
            return CidOutcome::NoOp;
        }
        debug!(sequence, "NEW_CONNECTION_ID lost, queueing retransmission");
        self.cids[idx].state = IssuedCidState::Pending;
        self.promote_pending(idx);
        CidOutcome::Performed
    }

    /// Retire `sequence`, issuing a replacement while the set is below its target size
    ///
    /// `Performed` directs the caller to emit a RETIRE_CONNECTION_ID frame for the old sequence
    /// and a NEW_CONNECTION_ID frame for the freshly issued replacement.
    pub fn retire(&mut self, sequence: u64) -> CidOutcome {
        let Some(idx) = self.find(sequence) else {
            return CidOutcome::NotFound;
        };
        // Compact the active region; removal preserves the pending prefix wherever it happens
        self.cids[idx..self.active].rotate_left(1);
        self.active -= 1;
        self.cids[self.active] = IssuedCid::unused();
        debug!(sequence, "CID retired");
        if self.active < self.size {
            if let Some(entry) = self.issue(IssuedCidState::Pending) {
                self.insert_pending(entry);
            }
        }
        CidOutcome::Performed
    }

    /// Whether this endpoint currently has no local CID at all
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Number of active entries
    pub fn active_len(&self) -> usize {
        self.active
    }

    /// Active entries, pending ones first
    pub fn iter(&self) -> impl Iterator<Item = &IssuedCid> + '_ {
        self.cids[..self.active].iter()
    }

    /// Allocate the next sequence number and compute its wire bytes
    ///
    /// `None` iff the connection issues no local CIDs.
    fn issue(&mut self, state: IssuedCidState) -> Option<IssuedCid> {
        let encryptor = self.encryptor.as_ref()?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let mut plaintext = self.plaintext;
        plaintext.path_id = sequence;
        let (cid, reset_token) = encryptor.encrypt_cid(&plaintext);
        trace!(sequence, "issued CID {}", cid);
        Some(IssuedCid {
            sequence,
            state,
            cid,
            reset_token,
        })
    }

    /// Append a freshly issued `Pending` entry to the active region
    fn insert_pending(&mut self, entry: IssuedCid) {
        let idx = self.active;
        self.cids[idx] = entry;
        self.active += 1;
        self.promote_pending(idx);
    }

    /// Restore the pending-prefix ordering after `cids[idx]` became `Pending`
    ///
    /// The entry rotates in at the back of the prefix, so entries that have waited longer keep
    /// their place at the front of the next flight.
    fn promote_pending(&mut self, idx: usize) {
        let insert_at = self.cids[..idx]
            .iter()
            .position(|entry| entry.state != IssuedCidState::Pending)
            .unwrap_or(idx);
        self.cids[insert_at..=idx].rotate_right(1);
    }

    fn pending_len(&self) -> usize {
        self.pending().count()
    }

    fn find(&self, sequence: u64) -> Option<usize> {
        self.cids[..self.active]
            .iter()
            .position(|entry| entry.sequence == sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_encryptor::HashedCidEncryptor;
    use assert_matches::assert_matches;

    const MASTER_ID: u64 = 11;
    const NUM_CIDS: usize = 4;

    fn subscribe() -> tracing::subscriber::DefaultGuard {
        let sub = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::set_default(sub)
    }

    fn encryptor() -> Arc<dyn CidEncryptor> {
        Arc::new(HashedCidEncryptor::from_key(0x5eed))
    }

    fn new_set(encryptor: Option<Arc<dyn CidEncryptor>>) -> IssuedCidSet {
        IssuedCidSet::new(
            encryptor,
            &CidPlaintext {
                master_id: MASTER_ID,
                path_id: 0,
            },
        )
    }

    /// Checks three properties over every active entry:
    /// 1. `Pending` CIDs are in front of the array
    /// 2. no sequence appears twice
    /// 3. decrypting the entry's bytes recovers its sequence
    fn verify_set(set: &IssuedCidSet, encryptor: &dyn CidEncryptor) {
        let mut allow_pending = true;
        let mut seen = Vec::new();
        for entry in set.iter() {
            if entry.state() == IssuedCidState::Pending {
                assert!(
                    allow_pending,
                    "pending CID {} behind a non-pending entry",
                    entry.sequence()
                );
            } else {
                allow_pending = false;
            }
            assert!(
                !seen.contains(&entry.sequence()),
                "duplicate sequence {}",
                entry.sequence()
            );
            seen.push(entry.sequence());
            let plaintext = encryptor
                .decrypt_cid(entry.cid())
                .expect("active CID must decrypt");
            assert_eq!(plaintext.path_id, entry.sequence());
            assert_eq!(plaintext.master_id, MASTER_ID);
        }
    }

    fn num_pending(set: &IssuedCidSet) -> usize {
        set.pending().count()
    }

    /// The sequence appears exactly once in the set, in the given state
    fn exists_once(set: &IssuedCidSet, sequence: u64, state: IssuedCidState) -> bool {
        let mut occurrence = 0;
        for entry in set.iter() {
            if entry.sequence() == sequence {
                if entry.state() != state {
                    return false;
                }
                occurrence += 1;
            }
        }
        occurrence == 1
    }

    #[test]
    fn lifecycle() {
        let _guard = subscribe();
        let encryptor = encryptor();
        let mut set = new_set(Some(encryptor.clone()));
        verify_set(&set, &*encryptor);
        assert_eq!(num_pending(&set), 0);
        assert!(exists_once(&set, 0, IssuedCidState::Delivered));

        assert_eq!(set.set_size(NUM_CIDS), NUM_CIDS - 1);
        verify_set(&set, &*encryptor);
        assert_eq!(num_pending(&set), NUM_CIDS - 1);
        assert!(exists_once(&set, 0, IssuedCidState::Delivered));
        assert!(exists_once(&set, 1, IssuedCidState::Pending));
        assert!(exists_once(&set, 2, IssuedCidState::Pending));
        assert!(exists_once(&set, 3, IssuedCidState::Pending));

        // Send three pending CIDs in one flight
        set.on_sent(NUM_CIDS - 1);
        verify_set(&set, &*encryptor);
        assert!(exists_once(&set, 1, IssuedCidState::InFlight));
        assert!(exists_once(&set, 2, IssuedCidState::InFlight));
        assert!(exists_once(&set, 3, IssuedCidState::InFlight));

        assert_matches!(set.on_acked(1), CidOutcome::Performed);
        assert_matches!(set.on_acked(3), CidOutcome::Performed);
        // Simulate a packet loss
        assert!(set.on_lost(2).performed());
        verify_set(&set, &*encryptor);
        assert_eq!(num_pending(&set), 1);
        assert!(exists_once(&set, 1, IssuedCidState::Delivered));
        assert!(exists_once(&set, 2, IssuedCidState::Pending));
        assert!(exists_once(&set, 3, IssuedCidState::Delivered));

        // Retransmit sequence 2
        set.on_sent(1);
        assert_eq!(num_pending(&set), 0);

        // Retire everything
        assert!(set.retire(0).performed());
        assert!(set.retire(1).performed());
        assert!(set.retire(2).performed());
        assert!(set.retire(3).performed());
        verify_set(&set, &*encryptor);
        assert_eq!(num_pending(&set), 4);

        // Partial send
        set.on_sent(1);
        verify_set(&set, &*encryptor);
        assert_eq!(num_pending(&set), 3);
        assert!(exists_once(&set, 4, IssuedCidState::InFlight));
        assert!(exists_once(&set, 5, IssuedCidState::Pending));
        assert!(exists_once(&set, 6, IssuedCidState::Pending));
        assert!(exists_once(&set, 7, IssuedCidState::Pending));

        // Retire one in the middle of the pending prefix
        assert!(set.retire(6).performed());
        verify_set(&set, &*encryptor);

        set.on_sent(2);
        assert!(set.on_lost(4).performed());
        // Late ack after the loss verdict, then a duplicate ack
        assert_matches!(set.on_acked(4), CidOutcome::Performed);
        assert_matches!(set.on_acked(5), CidOutcome::Performed);
        assert_matches!(set.on_acked(5), CidOutcome::NoOp);
        verify_set(&set, &*encryptor);
        assert!(exists_once(&set, 4, IssuedCidState::Delivered));
        assert!(exists_once(&set, 5, IssuedCidState::Delivered));
    }

    #[test]
    fn growth_is_capped() {
        let _guard = subscribe();
        let encryptor = encryptor();
        let mut set = new_set(Some(encryptor.clone()));

        assert_eq!(set.set_size(64), IssuedCidSet::CAPACITY - 1);
        verify_set(&set, &*encryptor);
        assert_eq!(set.active_len(), IssuedCidSet::CAPACITY);

        // Shrinking or repeating the target is the defined no-op path
        assert_eq!(set.set_size(IssuedCidSet::CAPACITY), 0);
        assert_eq!(set.set_size(1), 0);
    }

    #[test]
    fn ack_is_idempotent() {
        let _guard = subscribe();
        let mut set = new_set(Some(encryptor()));
        set.set_size(2);
        set.on_sent(1);

        assert_matches!(set.on_acked(1), CidOutcome::Performed);
        assert_matches!(set.on_acked(1), CidOutcome::NoOp);
        assert!(exists_once(&set, 1, IssuedCidState::Delivered));
        // The handshake CID was delivered by construction
        assert_matches!(set.on_acked(0), CidOutcome::NoOp);
        // Never issued
        assert_matches!(set.on_acked(17), CidOutcome::NotFound);
    }

    #[test]
    fn loss_then_late_ack() {
        let _guard = subscribe();
        let encryptor = encryptor();
        let mut set = new_set(Some(encryptor.clone()));
        set.set_size(3);
        set.on_sent(2);

        assert!(set.on_lost(1).performed());
        assert!(exists_once(&set, 1, IssuedCidState::Pending));
        // The peer received the original transmission after all
        assert_matches!(set.on_acked(1), CidOutcome::Performed);
        assert!(exists_once(&set, 1, IssuedCidState::Delivered));
        verify_set(&set, &*encryptor);
    }

    #[test]
    fn stale_loss_verdicts_change_nothing() {
        let _guard = subscribe();
        let mut set = new_set(Some(encryptor()));
        set.set_size(2);
        set.on_sent(1);
        set.on_acked(1);

        // Loss detection racing with the ack must not regress a delivered CID
        assert_matches!(set.on_lost(1), CidOutcome::NoOp);
        assert!(exists_once(&set, 1, IssuedCidState::Delivered));
        // Not in flight either
        assert_matches!(set.on_lost(0), CidOutcome::NoOp);
        assert_matches!(set.on_lost(9), CidOutcome::NotFound);
    }

    #[test]
    fn retire_preserves_population() {
        let _guard = subscribe();
        let encryptor = encryptor();
        let mut set = new_set(Some(encryptor.clone()));
        set.set_size(NUM_CIDS);

        let before = set.active_len();
        assert!(set.retire(2).performed());
        verify_set(&set, &*encryptor);
        assert_eq!(set.active_len(), before);
        // The replacement is fresh, not a reuse of the retired sequence
        assert!(exists_once(&set, NUM_CIDS as u64, IssuedCidState::Pending));
        assert!(set.iter().all(|entry| entry.sequence() != 2));

        // Retiring the same sequence again finds nothing
        assert_matches!(set.retire(2), CidOutcome::NotFound);
        assert_matches!(set.retire(99), CidOutcome::NotFound);
    }

    #[test]
    fn cidless_connection_stays_empty() {
        let _guard = subscribe();
        let mut set = new_set(None);
        assert!(set.is_empty());
        assert_eq!(set.set_size(NUM_CIDS), 0);
        assert!(set.is_empty());
        assert_eq!(set.pending().count(), 0);
        assert_matches!(set.on_acked(0), CidOutcome::NotFound);
        assert_matches!(set.on_lost(0), CidOutcome::NotFound);
        assert_matches!(set.retire(0), CidOutcome::NotFound);
    }

    #[test]
    fn sent_order_follows_the_pending_prefix() {
        let _guard = subscribe();
        let encryptor = encryptor();
        let mut set = new_set(Some(encryptor.clone()));
        set.set_size(NUM_CIDS);

        // Oldest waiting entries go out first
        set.on_sent(1);
        assert!(exists_once(&set, 1, IssuedCidState::InFlight));
        assert!(exists_once(&set, 2, IssuedCidState::Pending));
        verify_set(&set, &*encryptor);

        // A lost CID requeues behind the entries that are still waiting
        assert!(set.on_lost(1).performed());
        let pending: Vec<_> = set.pending().map(|entry| entry.sequence()).collect();
        assert_eq!(pending, vec![2, 3, 1]);
        verify_set(&set, &*encryptor);

        // Asking for more than is pending sends all of it
        set.on_sent(usize::MAX);
        assert_eq!(num_pending(&set), 0);
        verify_set(&set, &*encryptor);
    }
}
