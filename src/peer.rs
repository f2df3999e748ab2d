use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use wire::{Message, WireError};

use crate::bitfield::Bitfield;
use crate::connection::{Connection, ConnectionError};
use crate::logger::EventLog;
use crate::storage::{PieceStore, StorageError};

/// Everything we track about one handshake-complete neighbor. Created on
/// registration, destroyed when the connection's reader loop ends.
pub struct NeighborState {
    pub peer_id: u32,
    connection: Connection,
    /// Absent until their BITFIELD arrives; HAVE creates it lazily.
    pub bitfield: Option<Bitfield>,
    /// We refuse to serve them.
    pub am_choking: bool,
    /// They refuse to serve us.
    pub peer_choking_me: bool,
    /// We want something they have.
    pub am_interested: bool,
    /// They want something we have.
    pub peer_interested_in_me: bool,
    /// Payload bytes received from them since the last scheduler tick.
    pub download_bytes_window: u64,
}

impl NeighborState {
    fn new(peer_id: u32, connection: Connection) -> Self {
        NeighborState {
            peer_id,
            connection,
            bitfield: None,
            am_choking: true,
            peer_choking_me: true,
            am_interested: false,
            peer_interested_in_me: false,
            download_bytes_window: 0,
        }
    }
}

/// The coordination engine. One instance per process, behind one mutex that
/// is the linearization point for the whole protocol: every handler runs
/// start-to-finish under it, including the sends it provokes.
pub struct PeerCore {
    my_id: u32,
    store: PieceStore,
    log: Arc<EventLog>,
    neighbors: HashMap<u32, NeighborState>,
    preferred: HashSet<u32>,
    optimistic: Option<u32>,
    ever_had_neighbor: bool,
    completion_logged: bool,
}

impl PeerCore {
    pub fn new(my_id: u32, store: PieceStore, log: Arc<EventLog>) -> Self {
        let completion_logged = store.is_complete();
        PeerCore {
            my_id,
            store,
            log,
            neighbors: HashMap::new(),
            preferred: HashSet::new(),
            optimistic: None,
            ever_had_neighbor: false,
            completion_logged,
        }
    }

    /// Wires up a handshake-complete connection and, when we already hold
    /// pieces, opens with our BITFIELD. Returns false (closing the new
    /// connection) on a duplicate registration or a failed opening send.
    pub fn register_neighbor(&mut self, peer_id: u32, mut connection: Connection) -> bool {
        if self.neighbors.contains_key(&peer_id) {
            connection.close();
            return false;
        }
        if self.store.count_have() > 0 {
            let bitfield = Message::Bitfield(self.store.raw_bitfield());
            if connection.send(&bitfield).is_err() {
                connection.close();
                return false;
            }
        }
        self.neighbors
            .insert(peer_id, NeighborState::new(peer_id, connection));
        self.ever_had_neighbor = true;
        self.log
            .log(&format!("TCP connection established with Peer {}.", peer_id));
        true
    }

    /// Closes and forgets one neighbor. Safe to call twice.
    pub fn drop_neighbor(&mut self, peer_id: u32) {
        if let Some(state) = self.neighbors.remove(&peer_id) {
            state.connection.close();
            self.log.log(&format!(
                "Peer {} closed the connection to Peer {}.",
                self.my_id, peer_id
            ));
        }
    }

    /// Single entry point for all inbound traffic. Messages from unknown
    /// peer ids are dropped silently; a send failure provoked by a message
    /// tears down that one connection and nothing else.
    pub fn on_message(&mut self, remote_id: u32, message: Message) {
        if !self.neighbors.contains_key(&remote_id) {
            return;
        }
        let outcome = match message {
            Message::Choke => self.on_choke(remote_id),
            Message::Unchoke => self.on_unchoke(remote_id),
            Message::Interested => self.on_interested(remote_id),
            Message::NotInterested => self.on_not_interested(remote_id),
            Message::Have(index) => self.on_have(remote_id, index as usize),
            Message::Bitfield(payload) => self.on_bitfield(remote_id, payload),
            Message::Request(index) => self.on_request(remote_id, index as usize),
            Message::Piece { index, data } => self.on_piece(remote_id, index as usize, data),
        };
        if outcome.is_err() {
            self.drop_neighbor(remote_id);
        }
    }

    fn on_choke(&mut self, remote_id: u32) -> Result<(), ConnectionError> {
        let state = self.neighbors.get_mut(&remote_id).unwrap();
        state.peer_choking_me = true;
        self.log
            .log(&format!("Peer {} is choked by Peer {}.", self.my_id, remote_id));
        Ok(())
    }

    fn on_unchoke(&mut self, remote_id: u32) -> Result<(), ConnectionError> {
        let state = self.neighbors.get_mut(&remote_id).unwrap();
        state.peer_choking_me = false;
        self.log.log(&format!(
            "Peer {} is unchoked by Peer {}.",
            self.my_id, remote_id
        ));
        self.request_next(remote_id)
    }

    fn on_interested(&mut self, remote_id: u32) -> Result<(), ConnectionError> {
        let state = self.neighbors.get_mut(&remote_id).unwrap();
        state.peer_interested_in_me = true;
        self.log.log(&format!(
            "Peer {} received the 'interested' message from Peer {}.",
            self.my_id, remote_id
        ));
        Ok(())
    }

    fn on_not_interested(&mut self, remote_id: u32) -> Result<(), ConnectionError> {
        let state = self.neighbors.get_mut(&remote_id).unwrap();
        state.peer_interested_in_me = false;
        self.log.log(&format!(
            "Peer {} received the 'not interested' message from Peer {}.",
            self.my_id, remote_id
        ));
        Ok(())
    }

    fn on_have(&mut self, remote_id: u32, index: usize) -> Result<(), ConnectionError> {
        self.log.log(&format!(
            "Peer {} received the 'have' message from Peer {} for the piece {}.",
            self.my_id, remote_id, index
        ));
        let num_pieces = self.store.meta().num_pieces();
        let we_have = self.store.has_piece(index);
        let state = self.neighbors.get_mut(&remote_id).unwrap();
        let bitfield = state
            .bitfield
            .get_or_insert_with(|| Bitfield::new(num_pieces));
        if bitfield.set(index).is_err() {
            // index beyond the file: drop the message
            return Ok(());
        }
        if !we_have && !state.am_interested {
            state.am_interested = true;
            state.connection.send(&Message::Interested)?;
            self.log.log(&format!(
                "Peer {} sent INTERESTED to Peer {}.",
                self.my_id, remote_id
            ));
        }
        Ok(())
    }

    fn on_bitfield(&mut self, remote_id: u32, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.log.log(&format!(
            "Peer {} received BITFIELD from Peer {}.",
            self.my_id, remote_id
        ));
        let num_pieces = self.store.meta().num_pieces();
        let bitfield =
            Bitfield::from_bytes(&payload, num_pieces).map_err(|_| WireError::BadPayload {
                message: "BITFIELD",
                expected: Bitfield::packed_len(num_pieces),
                actual: payload.len(),
            })?;
        let useful = first_useful_piece(&self.store, &bitfield).is_some();
        let state = self.neighbors.get_mut(&remote_id).unwrap();
        state.bitfield = Some(bitfield);
        if useful && !state.am_interested {
            state.am_interested = true;
            state.connection.send(&Message::Interested)?;
            self.log.log(&format!(
                "Peer {} sent INTERESTED to Peer {}.",
                self.my_id, remote_id
            ));
        } else if !useful && state.am_interested {
            state.am_interested = false;
            state.connection.send(&Message::NotInterested)?;
            self.log.log(&format!(
                "Peer {} sent NOT_INTERESTED to Peer {}.",
                self.my_id, remote_id
            ));
        }
        Ok(())
    }

    fn on_request(&mut self, remote_id: u32, index: usize) -> Result<(), ConnectionError> {
        let choking = self
            .neighbors
            .get(&remote_id)
            .map(|state| state.am_choking)
            .unwrap_or(true);
        if choking || !self.store.has_piece(index) {
            return Ok(());
        }
        let data = match self.store.read_piece(index) {
            Ok(data) => data,
            Err(err) => {
                self.log.log(&format!(
                    "Peer {} failed to read piece {}: {}",
                    self.my_id, index, err
                ));
                return Ok(());
            }
        };
        let state = self.neighbors.get_mut(&remote_id).unwrap();
        state.connection.send(&Message::Piece {
            index: index as u32,
            data,
        })?;
        self.log.log(&format!(
            "Peer {} uploads piece {} to Peer {}.",
            self.my_id, index, remote_id
        ));
        Ok(())
    }

    fn on_piece(
        &mut self,
        remote_id: u32,
        index: usize,
        data: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        if index >= self.store.meta().num_pieces() {
            self.log.log(&format!(
                "Peer {} dropped PIECE with out-of-range index {} from Peer {}.",
                self.my_id, index, remote_id
            ));
            return Ok(());
        }
        match self.store.write_piece(index, &data) {
            Ok(()) => {}
            Err(err @ StorageError::WrongPieceSize { .. }) => {
                self.log.log(&format!(
                    "Peer {} dropped PIECE from Peer {}: {}",
                    self.my_id, remote_id, err
                ));
                return Ok(());
            }
            Err(err) => {
                self.log.log(&format!(
                    "Peer {} failed to store piece {}: {}",
                    self.my_id, index, err
                ));
                return Ok(());
            }
        }
        let state = self.neighbors.get_mut(&remote_id).unwrap();
        state.download_bytes_window += data.len() as u64;
        self.log.log(&format!(
            "Peer {} has downloaded the piece {} from Peer {}. Now the number of pieces it has is {}.",
            self.my_id,
            index,
            remote_id,
            self.store.count_have()
        ));

        self.broadcast_have(index);

        if self.store.is_complete() {
            if !self.completion_logged {
                self.completion_logged = true;
                self.log.log(&format!(
                    "Peer {} has downloaded the complete file.",
                    self.my_id
                ));
            }
            Ok(())
        } else {
            self.request_next(remote_id)
        }
    }

    /// HAVE goes to every current neighbor, the sender included; receivers
    /// treat redundant HAVEs as no-ops. Neighbors whose send fails are torn
    /// down here so the failure stays on their connection.
    fn broadcast_have(&mut self, index: usize) {
        let message = Message::Have(index as u32);
        let mut dead = Vec::new();
        for (peer_id, state) in self.neighbors.iter_mut() {
            if state.connection.send(&message).is_err() {
                dead.push(*peer_id);
            }
        }
        for peer_id in dead {
            self.drop_neighbor(peer_id);
        }
    }

    /// First-useful selection: the lowest index the remote has and we lack.
    /// When nothing qualifies, interest is withdrawn.
    fn request_next(&mut self, remote_id: u32) -> Result<(), ConnectionError> {
        let state = match self.neighbors.get_mut(&remote_id) {
            Some(state) => state,
            None => return Ok(()),
        };
        if state.peer_choking_me {
            return Ok(());
        }
        let bitfield = match &state.bitfield {
            Some(bitfield) => bitfield,
            None => return Ok(()),
        };
        match first_useful_piece(&self.store, bitfield) {
            Some(index) => {
                state.connection.send(&Message::Request(index as u32))?;
                self.log.log(&format!(
                    "Peer {} sent REQUEST for piece {} to Peer {}.",
                    self.my_id, index, remote_id
                ));
            }
            None => {
                if state.am_interested {
                    state.am_interested = false;
                    state.connection.send(&Message::NotInterested)?;
                    self.log.log(&format!(
                        "Peer {} sent NOT_INTERESTED to Peer {}.",
                        self.my_id, remote_id
                    ));
                }
            }
        }
        Ok(())
    }

    /// Scheduler input: the new preferred set. The unchoked set is always
    /// recomputed from preferred set and optimistic slot together.
    pub fn set_preferred_neighbors(&mut self, preferred: &[u32]) {
        self.preferred = preferred.iter().copied().collect();
        let mut listed: Vec<String> = preferred.iter().map(|id| id.to_string()).collect();
        listed.sort();
        self.log.log(&format!(
            "Peer {} has the preferred neighbors {}.",
            self.my_id,
            listed.join(", ")
        ));
        self.apply_chokes();
    }

    /// Scheduler input: the optimistic slot, or None when no choked
    /// interested neighbor exists.
    pub fn set_optimistic_slot(&mut self, slot: Option<u32>) {
        self.optimistic = slot;
        match slot {
            Some(peer_id) => self.log.log(&format!(
                "Peer {} has the optimistically unchoked neighbor {}.",
                self.my_id, peer_id
            )),
            None => self.log.log(&format!(
                "Peer {} has no optimistically unchoked neighbor.",
                self.my_id
            )),
        }
        self.apply_chokes();
    }

    /// Idempotent on the wire: CHOKE/UNCHOKE only go out on a state flip.
    fn apply_chokes(&mut self) {
        let mut dead = Vec::new();
        for (peer_id, state) in self.neighbors.iter_mut() {
            let unchoke = self.preferred.contains(peer_id) || self.optimistic == Some(*peer_id);
            if unchoke && state.am_choking {
                state.am_choking = false;
                if state.connection.send(&Message::Unchoke).is_err() {
                    dead.push(*peer_id);
                    continue;
                }
                self.log
                    .log(&format!("Peer {} unchokes Peer {}.", self.my_id, peer_id));
            } else if !unchoke && !state.am_choking {
                state.am_choking = true;
                if state.connection.send(&Message::Choke).is_err() {
                    dead.push(*peer_id);
                    continue;
                }
                self.log
                    .log(&format!("Peer {} chokes Peer {}.", self.my_id, peer_id));
            }
        }
        for peer_id in dead {
            self.drop_neighbor(peer_id);
        }
    }

    /// Snapshot-and-zero of every neighbor's download window. Called once
    /// per unchoking tick.
    pub fn get_and_reset_download_stats(&mut self) -> HashMap<u32, u64> {
        self.neighbors
            .iter_mut()
            .map(|(peer_id, state)| {
                let bytes = state.download_bytes_window;
                state.download_bytes_window = 0;
                (*peer_id, bytes)
            })
            .collect()
    }

    pub fn interested_in_me_ids(&self) -> HashSet<u32> {
        self.neighbors
            .iter()
            .filter(|(_, state)| state.peer_interested_in_me)
            .map(|(peer_id, _)| *peer_id)
            .collect()
    }

    /// Candidates for the optimistic slot: currently choked and interested.
    pub fn choked_interested_ids(&self) -> Vec<u32> {
        self.neighbors
            .iter()
            .filter(|(_, state)| state.am_choking && state.peer_interested_in_me)
            .map(|(peer_id, _)| *peer_id)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    pub fn count_have(&self) -> usize {
        self.store.count_have()
    }

    pub fn ever_had_neighbor(&self) -> bool {
        self.ever_had_neighbor
    }

    pub fn has_neighbor(&self, peer_id: u32) -> bool {
        self.neighbors.contains_key(&peer_id)
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Swarm-wide convergence test: we are complete, every expected peer is
    /// connected, and every one of their bitfields is fully set.
    pub fn swarm_complete(&self, expected: &HashSet<u32>) -> bool {
        if !self.store.is_complete() || !self.ever_had_neighbor {
            return false;
        }
        let connected: HashSet<u32> = self.neighbors.keys().copied().collect();
        if connected != *expected {
            return false;
        }
        self.neighbors.values().all(|state| {
            state
                .bitfield
                .as_ref()
                .map(|bitfield| bitfield.all_set())
                .unwrap_or(false)
        })
    }

    /// Shutdown path: close every socket so the reader loops fall out.
    pub fn close_all(&mut self) {
        for state in self.neighbors.values() {
            state.connection.close();
        }
        self.neighbors.clear();
    }
}

fn first_useful_piece(store: &PieceStore, remote: &Bitfield) -> Option<usize> {
    store.missing_pieces().find(|&index| remote.has(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileMeta;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn loopback_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (Connection::new(client), Connection::new(server))
    }

    // 3 pieces of lengths 4, 4, 2
    fn meta() -> FileMeta {
        FileMeta::new("target.dat", 10, 4)
    }

    fn empty_core(dir: &tempfile::TempDir, my_id: u32) -> PeerCore {
        let store = PieceStore::new(dir.path(), my_id, meta(), false).unwrap();
        let log = Arc::new(EventLog::create(dir.path(), my_id).unwrap());
        PeerCore::new(my_id, store, log)
    }

    fn seeded_core(dir: &tempfile::TempDir, my_id: u32) -> PeerCore {
        std::fs::write(dir.path().join("target.dat"), b"0123456789").unwrap();
        let store = PieceStore::new(dir.path(), my_id, meta(), true).unwrap();
        let log = Arc::new(EventLog::create(dir.path(), my_id).unwrap());
        PeerCore::new(my_id, store, log)
    }

    fn full_bits() -> Vec<u8> {
        vec![0b1110_0000]
    }

    #[test]
    fn bitfield_with_useful_pieces_triggers_interested() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (ours, mut theirs) = loopback_pair();
        assert!(core.register_neighbor(1001, ours));

        core.on_message(1001, Message::Bitfield(full_bits()));
        assert_eq!(theirs.receive().unwrap(), Some(Message::Interested));
        assert!(core.neighbors[&1001].am_interested);
    }

    #[test]
    fn useless_bitfield_after_interest_triggers_not_interested() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (ours, mut theirs) = loopback_pair();
        core.register_neighbor(1001, ours);

        core.on_message(1001, Message::Bitfield(full_bits()));
        assert_eq!(theirs.receive().unwrap(), Some(Message::Interested));

        core.on_message(1001, Message::Bitfield(vec![0u8]));
        assert_eq!(theirs.receive().unwrap(), Some(Message::NotInterested));
        assert!(!core.neighbors[&1001].am_interested);
    }

    #[test]
    fn malformed_bitfield_drops_the_neighbor() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (ours, _theirs) = loopback_pair();
        core.register_neighbor(1001, ours);

        core.on_message(1001, Message::Bitfield(vec![0, 0, 0]));
        assert!(!core.neighbors.contains_key(&1001));
    }

    #[test]
    fn have_signals_interest_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (ours, mut theirs) = loopback_pair();
        core.register_neighbor(1001, ours);

        core.on_message(1001, Message::Have(1));
        core.on_message(1001, Message::Have(2));
        assert_eq!(theirs.receive().unwrap(), Some(Message::Interested));

        // the lazily created bitfield tracked both indices
        let state = &core.neighbors[&1001];
        let bitfield = state.bitfield.as_ref().unwrap();
        assert!(bitfield.has(1) && bitfield.has(2) && !bitfield.has(0));
    }

    #[test]
    fn request_is_dropped_while_choking() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = seeded_core(&dir, 1001);
        let (ours, mut theirs) = loopback_pair();
        core.register_neighbor(1002, ours);
        // a seeded core opens with its bitfield
        assert_eq!(
            theirs.receive().unwrap(),
            Some(Message::Bitfield(full_bits()))
        );

        core.on_message(1002, Message::Request(0));
        core.on_message(1002, Message::Interested);
        core.set_preferred_neighbors(&[1002]);
        // the dropped REQUEST produced nothing; first reply is the unchoke
        assert_eq!(theirs.receive().unwrap(), Some(Message::Unchoke));

        core.on_message(1002, Message::Request(0));
        assert_eq!(
            theirs.receive().unwrap(),
            Some(Message::Piece {
                index: 0,
                data: b"0123".to_vec()
            })
        );
    }

    #[test]
    fn unchoke_starts_the_request_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (ours, mut theirs) = loopback_pair();
        core.register_neighbor(1001, ours);

        core.on_message(1001, Message::Bitfield(full_bits()));
        assert_eq!(theirs.receive().unwrap(), Some(Message::Interested));

        core.on_message(1001, Message::Unchoke);
        assert_eq!(theirs.receive().unwrap(), Some(Message::Request(0)));

        core.on_message(
            1001,
            Message::Piece {
                index: 0,
                data: b"0123".to_vec(),
            },
        );
        // the HAVE broadcast reaches the sender too, then the next request
        assert_eq!(theirs.receive().unwrap(), Some(Message::Have(0)));
        assert_eq!(theirs.receive().unwrap(), Some(Message::Request(1)));
        assert!(core.store.has_piece(0));
        assert_eq!(core.neighbors[&1001].download_bytes_window, 4);
    }

    #[test]
    fn finishing_the_file_stops_requesting() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (ours, mut theirs) = loopback_pair();
        core.register_neighbor(1001, ours);

        core.on_message(1001, Message::Bitfield(full_bits()));
        assert_eq!(theirs.receive().unwrap(), Some(Message::Interested));
        core.on_message(1001, Message::Unchoke);
        assert_eq!(theirs.receive().unwrap(), Some(Message::Request(0)));

        for (index, data) in [(0u32, &b"0123"[..]), (1, &b"4567"[..]), (2, &b"89"[..])] {
            core.on_message(
                1001,
                Message::Piece {
                    index,
                    data: data.to_vec(),
                },
            );
            assert_eq!(theirs.receive().unwrap(), Some(Message::Have(index)));
            if index < 2 {
                assert_eq!(theirs.receive().unwrap(), Some(Message::Request(index + 1)));
            }
        }
        assert!(core.is_complete());
        assert_eq!(core.count_have(), 3);
        // no further REQUEST after the last piece
        core.drop_neighbor(1001);
        assert!(theirs.receive().unwrap().is_none());
    }

    #[test]
    fn choke_transitions_are_idempotent_on_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = seeded_core(&dir, 1001);
        let (ours, mut theirs) = loopback_pair();
        core.register_neighbor(1002, ours);
        assert_eq!(
            theirs.receive().unwrap(),
            Some(Message::Bitfield(full_bits()))
        );

        core.set_preferred_neighbors(&[1002]);
        assert_eq!(theirs.receive().unwrap(), Some(Message::Unchoke));

        // same decision again, and an empty optimistic slot: nothing on the wire
        core.set_preferred_neighbors(&[1002]);
        core.set_optimistic_slot(None);
        assert!(!core.neighbors[&1002].am_choking);

        // removal from both inputs flips exactly one CHOKE out
        core.set_preferred_neighbors(&[]);
        assert_eq!(theirs.receive().unwrap(), Some(Message::Choke));
        assert!(core.neighbors[&1002].am_choking);
    }

    #[test]
    fn optimistic_slot_alone_unchokes() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = seeded_core(&dir, 1001);
        let (ours, mut theirs) = loopback_pair();
        core.register_neighbor(1002, ours);
        assert_eq!(
            theirs.receive().unwrap(),
            Some(Message::Bitfield(full_bits()))
        );

        core.set_optimistic_slot(Some(1002));
        assert_eq!(theirs.receive().unwrap(), Some(Message::Unchoke));

        // losing the slot while not preferred chokes again
        core.set_optimistic_slot(None);
        assert_eq!(theirs.receive().unwrap(), Some(Message::Choke));
    }

    #[test]
    fn download_stats_reset_after_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (ours, mut theirs) = loopback_pair();
        core.register_neighbor(1001, ours);

        core.on_message(1001, Message::Bitfield(full_bits()));
        theirs.receive().unwrap();
        core.on_message(1001, Message::Unchoke);
        theirs.receive().unwrap();
        core.on_message(
            1001,
            Message::Piece {
                index: 0,
                data: b"0123".to_vec(),
            },
        );

        let stats = core.get_and_reset_download_stats();
        assert_eq!(stats[&1001], 4);
        let stats = core.get_and_reset_download_stats();
        assert_eq!(stats[&1001], 0);
    }

    #[test]
    fn wrong_sized_piece_never_corrupts_the_bitfield() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (ours, _theirs) = loopback_pair();
        core.register_neighbor(1001, ours);

        core.on_message(
            1001,
            Message::Piece {
                index: 0,
                data: b"too long for a piece".to_vec(),
            },
        );
        assert_eq!(core.count_have(), 0);
        assert_eq!(core.neighbors[&1001].download_bytes_window, 0);
        // the neighbor survives a bad piece
        assert!(core.neighbors.contains_key(&1001));
    }

    #[test]
    fn out_of_range_piece_index_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (ours, _theirs) = loopback_pair();
        core.register_neighbor(1001, ours);

        core.on_message(
            1001,
            Message::Piece {
                index: 99,
                data: b"0123".to_vec(),
            },
        );
        assert_eq!(core.count_have(), 0);
        assert!(core.neighbors.contains_key(&1001));
    }

    #[test]
    fn unknown_peer_messages_are_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        core.on_message(4242, Message::Choke);
        core.on_message(4242, Message::Request(0));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = empty_core(&dir, 1002);
        let (first, _keep) = loopback_pair();
        let (second, _other) = loopback_pair();
        assert!(core.register_neighbor(1001, first));
        assert!(!core.register_neighbor(1001, second));
        assert_eq!(core.neighbors.len(), 1);
    }

    #[test]
    fn swarm_completion_requires_full_roster_and_full_bitfields() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = seeded_core(&dir, 1001);
        let expected: HashSet<u32> = [1002, 1003].into_iter().collect();

        // complete but nobody connected
        assert!(!core.swarm_complete(&expected));

        let (ours_a, mut theirs_a) = loopback_pair();
        core.register_neighbor(1002, ours_a);
        theirs_a.receive().unwrap();
        core.on_message(1002, Message::Bitfield(full_bits()));

        // roster not fully connected yet
        assert!(!core.swarm_complete(&expected));

        let (ours_b, mut theirs_b) = loopback_pair();
        core.register_neighbor(1003, ours_b);
        theirs_b.receive().unwrap();
        // connected, but 1003's bitfield is unknown
        assert!(!core.swarm_complete(&expected));

        core.on_message(1003, Message::Bitfield(vec![0b1100_0000]));
        assert!(!core.swarm_complete(&expected));

        core.on_message(1003, Message::Have(2));
        assert!(core.swarm_complete(&expected));
    }

    #[test]
    fn interested_and_choked_views_track_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = seeded_core(&dir, 1001);
        let (ours_a, mut theirs_a) = loopback_pair();
        let (ours_b, mut theirs_b) = loopback_pair();
        core.register_neighbor(1002, ours_a);
        core.register_neighbor(1003, ours_b);
        theirs_a.receive().unwrap();
        theirs_b.receive().unwrap();

        core.on_message(1002, Message::Interested);
        assert_eq!(core.interested_in_me_ids(), [1002].into_iter().collect());
        assert_eq!(core.choked_interested_ids(), vec![1002]);

        core.set_preferred_neighbors(&[1002]);
        assert_eq!(theirs_a.receive().unwrap(), Some(Message::Unchoke));
        assert!(core.choked_interested_ids().is_empty());

        core.on_message(1002, Message::NotInterested);
        assert!(core.interested_in_me_ids().is_empty());
    }
}
