use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Append-only event log at `<workdir>/log_peer_<id>.log`. One line per
/// event: `[YYYY-MM-DD HH:MM:SS] <message>`. Appends are serialized by an
/// internal lock and a failed append never disturbs the protocol.
pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    pub fn create(workdir: &Path, peer_id: u32) -> std::io::Result<Self> {
        let path = workdir.join(format!("log_peer_{}.log", peer_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(EventLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut file = self.file.lock().unwrap();
        let _ = writeln!(file, "[{}] {}", timestamp, message);
    }
}
