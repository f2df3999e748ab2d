use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{load_common, load_peers, CommonConfig, ConfigError, PeerRecord};
use crate::connection::Connection;
use crate::logger::EventLog;
use crate::peer::PeerCore;
use crate::scheduler::ChokeScheduler;
use crate::storage::{FileMeta, PieceStore, StorageError};

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const COMPLETION_POLL: Duration = Duration::from_millis(500);
/// Convergence must have been visible this long before we exit, giving every
/// other peer time to observe it too.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DIAL_ATTEMPTS: u32 = 40;
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Whole-process lifecycle: configuration, storage, listener, dialer,
/// scheduler, completion detection, shutdown.
pub struct PeerProcess {
    my_id: u32,
    me: PeerRecord,
    roster: Vec<PeerRecord>,
    common: CommonConfig,
    core: Arc<Mutex<PeerCore>>,
    log: Arc<EventLog>,
    running: Arc<AtomicBool>,
}

impl PeerProcess {
    /// Loads both configuration files from `workdir`, builds the piece store
    /// (populating it when this peer is the seed) and the coordination core.
    pub fn new(workdir: &Path, my_id: u32) -> Result<Self, ProcessError> {
        let (common, warnings) = load_common(&workdir.join("Common.cfg"))?;
        let roster = load_peers(&workdir.join("PeerInfo.cfg"))?;
        let me = roster
            .iter()
            .find(|record| record.peer_id == my_id)
            .cloned()
            .ok_or(ProcessError::UnknownPeerId(my_id))?;

        let log = Arc::new(EventLog::create(workdir, my_id)?);
        for warning in warnings {
            log.log(&warning);
        }

        let meta = FileMeta::new(
            common.file_name.clone(),
            common.file_size,
            common.piece_size,
        );
        let store = PieceStore::new(workdir, my_id, meta.clone(), me.has_file)?;
        log.log(&format!(
            "Peer {} initialized with {} of {} pieces, {} peers in the roster.",
            my_id,
            store.count_have(),
            meta.num_pieces(),
            roster.len()
        ));

        let core = Arc::new(Mutex::new(PeerCore::new(my_id, store, Arc::clone(&log))));
        Ok(PeerProcess {
            my_id,
            me,
            roster,
            common,
            core,
            log,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.log.path().to_path_buf()
    }

    /// Runs the peer to completion: listen, dial earlier-ranked peers, start
    /// the choke scheduler, then poll for swarm convergence and shut down.
    pub fn run(&mut self) -> Result<(), ProcessError> {
        let listener = TcpListener::bind((self.me.host.as_str(), self.me.port))?;
        listener.set_nonblocking(true)?;
        self.log.log(&format!(
            "Peer {} listening on {}:{}.",
            self.my_id, self.me.host, self.me.port
        ));
        let accept_handle = self.spawn_accept_loop(listener);

        // lower-ranked peers are already up by protocol order, but a short
        // retry window keeps startup races out of the picture
        for record in self.roster.clone() {
            if record.peer_id < self.my_id {
                self.dial_peer(&record);
            }
        }

        let mut scheduler = ChokeScheduler::start(
            Arc::clone(&self.core),
            self.common.num_preferred_neighbors,
            self.common.unchoking_interval,
            self.common.optimistic_unchoking_interval,
        );

        let expected: HashSet<u32> = self
            .roster
            .iter()
            .map(|record| record.peer_id)
            .filter(|peer_id| *peer_id != self.my_id)
            .collect();

        // Convergence is latched: once every peer has been seen complete, a
        // neighbor disconnecting can only mean it finished and exited, so
        // the grace timer never rearms.
        let mut converged_at: Option<Instant> = None;
        loop {
            thread::sleep(COMPLETION_POLL);
            match converged_at {
                None => {
                    if self.core.lock().unwrap().swarm_complete(&expected) {
                        converged_at = Some(Instant::now());
                        self.log.log(&format!(
                            "Peer {} observed that every peer has the complete file.",
                            self.my_id
                        ));
                    }
                }
                Some(instant) => {
                    if instant.elapsed() >= SHUTDOWN_GRACE {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        scheduler.stop();
        self.core.lock().unwrap().close_all();
        let _ = accept_handle.join();
        // give detached reader threads a moment to fall out of their sockets
        thread::sleep(Duration::from_millis(200));
        self.log
            .log(&format!("Peer {} has shut down gracefully.", self.my_id));
        Ok(())
    }

    fn spawn_accept_loop(&self, listener: TcpListener) -> thread::JoinHandle<()> {
        let running = Arc::clone(&self.running);
        let core = Arc::clone(&self.core);
        let log = Arc::clone(&self.log);
        let my_id = self.my_id;
        let roster_ids: HashSet<u32> = self
            .roster
            .iter()
            .map(|record| record.peer_id)
            .filter(|peer_id| *peer_id != my_id)
            .collect();
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let core = Arc::clone(&core);
                        let log = Arc::clone(&log);
                        let roster_ids = roster_ids.clone();
                        thread::spawn(move || {
                            serve_incoming(stream, my_id, &roster_ids, &core, &log);
                        });
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(err) => {
                        if running.load(Ordering::SeqCst) {
                            log.log(&format!("Accept failed: {}", err));
                        }
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        })
    }

    fn dial_peer(&self, record: &PeerRecord) {
        let mut stream = None;
        for attempt in 0..DIAL_ATTEMPTS {
            match TcpStream::connect((record.host.as_str(), record.port)) {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(err) => {
                    if attempt + 1 == DIAL_ATTEMPTS {
                        self.log.log(&format!(
                            "Peer {} failed to connect to Peer {}: {}",
                            self.my_id, record.peer_id, err
                        ));
                    } else {
                        thread::sleep(DIAL_RETRY_DELAY);
                    }
                }
            }
        }
        let Some(mut stream) = stream else {
            return;
        };

        let remote_id = match dial_handshake(&mut stream, self.my_id) {
            Ok(remote_id) => remote_id,
            Err(err) => {
                self.log.log(&format!(
                    "Peer {} handshake with Peer {} failed: {}",
                    self.my_id, record.peer_id, err
                ));
                return;
            }
        };
        if remote_id != record.peer_id {
            self.log.log(&format!(
                "Handshake mismatch: expected {}, got {}.",
                record.peer_id, remote_id
            ));
            return;
        }
        self.log.log(&format!(
            "Peer {} makes a connection to Peer {}.",
            self.my_id, remote_id
        ));
        if let Err(err) = attach(&self.core, &self.log, remote_id, stream) {
            self.log.log(&format!(
                "Peer {} could not attach Peer {}: {}",
                self.my_id, remote_id, err
            ));
        }
    }
}

/// Outgoing side: our handshake first, then read and validate theirs.
fn dial_handshake(stream: &mut TcpStream, my_id: u32) -> Result<u32, ProcessError> {
    stream.write_all(&wire::encode_handshake(my_id))?;
    let mut reply = [0u8; wire::HANDSHAKE_LEN];
    stream.read_exact(&mut reply)?;
    Ok(wire::decode_handshake(&reply)?)
}

/// Incoming side: read their handshake, check the roster, answer with ours.
fn serve_incoming(
    stream: TcpStream,
    my_id: u32,
    roster_ids: &HashSet<u32>,
    core: &Arc<Mutex<PeerCore>>,
    log: &Arc<EventLog>,
) {
    let mut stream = stream;
    // the listener is non-blocking; its accepted sockets must not be
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    let mut frame = [0u8; wire::HANDSHAKE_LEN];
    if stream.read_exact(&mut frame).is_err() {
        return;
    }
    let remote_id = match wire::decode_handshake(&frame) {
        Ok(remote_id) => remote_id,
        Err(err) => {
            log.log(&format!("Rejected incoming handshake: {}", err));
            return;
        }
    };
    if !roster_ids.contains(&remote_id) {
        log.log(&format!(
            "Rejected incoming handshake from unknown Peer {}.",
            remote_id
        ));
        return;
    }
    if stream.write_all(&wire::encode_handshake(my_id)).is_err() {
        return;
    }
    log.log(&format!(
        "Peer {} is connected from Peer {}.",
        my_id, remote_id
    ));
    if let Err(err) = attach(core, log, remote_id, stream) {
        log.log(&format!(
            "Peer {} could not attach Peer {}: {}",
            my_id, remote_id, err
        ));
    }
}

/// Registers the neighbor and fans out its reader loop. The reader owns one
/// clone of the socket; the registered connection is the write half, used
/// only under the core lock.
fn attach(
    core: &Arc<Mutex<PeerCore>>,
    log: &Arc<EventLog>,
    remote_id: u32,
    stream: TcpStream,
) -> std::io::Result<()> {
    let connection = Connection::new(stream);
    let mut reader = connection.try_clone()?;
    if !core.lock().unwrap().register_neighbor(remote_id, connection) {
        reader.close();
        return Ok(());
    }
    let core = Arc::clone(core);
    let log = Arc::clone(log);
    thread::spawn(move || {
        loop {
            match reader.receive() {
                Ok(Some(message)) => core.lock().unwrap().on_message(remote_id, message),
                Ok(None) => break,
                Err(err) => {
                    log.log(&format!("Connection error with Peer {}: {}", remote_id, err));
                    break;
                }
            }
        }
        core.lock().unwrap().drop_neighbor(remote_id);
    });
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Peer {0} is not listed in PeerInfo.cfg.")]
    UnknownPeerId(u32),
    #[error("Configuration failed to load.")]
    Config(#[from] ConfigError),
    #[error("Piece store failed.")]
    Storage(#[from] StorageError),
    #[error("Handshake frame was malformed.")]
    Wire(#[from] wire::WireError),
    #[error("Network I/O failed.")]
    Io(#[from] std::io::Error),
}
