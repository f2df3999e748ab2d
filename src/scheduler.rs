use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::peer::PeerCore;

/// Periodic choke recomputation. One thread, one timer: every
/// `unchoking_interval` the preferred set is rebuilt from download stats,
/// and every K-th tick the optimistic slot rotates, where K is the rounded-
/// down ratio of the two intervals (never below one).
pub struct ChokeScheduler {
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ChokeScheduler {
    pub fn start(
        core: Arc<Mutex<PeerCore>>,
        num_preferred: u32,
        unchoking_interval: Duration,
        optimistic_interval: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let optimistic_every = optimistic_tick_ratio(unchoking_interval, optimistic_interval);
        let handle = std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let mut tick: u64 = 0;
            loop {
                match stop_rx.recv_timeout(unchoking_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                tick += 1;
                let mut core = core.lock().unwrap();

                let stats = core.get_and_reset_download_stats();
                let interested = core.interested_in_me_ids();
                let ranked: Vec<(u32, u64)> = stats
                    .into_iter()
                    .filter(|(peer_id, _)| interested.contains(peer_id))
                    .collect();
                let preferred = pick_preferred(ranked, num_preferred as usize, &mut rng);
                core.set_preferred_neighbors(&preferred);

                if tick % optimistic_every == 0 {
                    let candidates = core.choked_interested_ids();
                    let slot = candidates.choose(&mut rng).copied();
                    core.set_optimistic_slot(slot);
                }
            }
        });
        ChokeScheduler {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signals the tick loop and waits for it to exit.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ChokeScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn optimistic_tick_ratio(unchoking: Duration, optimistic: Duration) -> u64 {
    ((optimistic.as_millis() / unchoking.as_millis().max(1)) as u64).max(1)
}

/// Top `n` by window bytes, descending. A shuffle before the stable sort
/// breaks ties uniformly at random.
fn pick_preferred(mut ranked: Vec<(u32, u64)>, n: usize, rng: &mut impl Rng) -> Vec<u32> {
    ranked.shuffle(rng);
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.into_iter().take(n).map(|(peer_id, _)| peer_id).collect()
}
