use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Swarm-wide settings from Common.cfg. Frozen after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonConfig {
    pub num_preferred_neighbors: u32,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
}

/// One roster line from PeerInfo.cfg. Frozen after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: u32,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

const KEY_PREFERRED: &str = "NumberOfPreferredNeighbors";
// Misspelled key still found in old deployments.
const KEY_PREFERRED_LEGACY: &str = "NumberofPreferedNeighbors";
const KEY_UNCHOKING: &str = "UnchokingInterval";
const KEY_OPTIMISTIC: &str = "OptimisticUnchokingInterval";
const KEY_FILE_NAME: &str = "FileName";
const KEY_FILE_SIZE: &str = "FileSize";
const KEY_PIECE_SIZE: &str = "PieceSize";

/// Loads Common.cfg. Returns the config plus deprecation warnings the caller
/// should route to the event log once one exists.
pub fn load_common(path: &Path) -> Result<(CommonConfig, Vec<String>), ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once(char::is_whitespace).ok_or_else(|| {
            ConfigError::BadValue {
                key: line.to_string(),
                value: String::new(),
            }
        })?;
        pairs.push((key.to_string(), value.trim().to_string()));
    }

    let mut warnings = Vec::new();
    let preferred_raw = match find_key(&pairs, KEY_PREFERRED) {
        Some(v) => v,
        None => match find_key(&pairs, KEY_PREFERRED_LEGACY) {
            Some(v) => {
                warnings.push(format!(
                    "Common.cfg uses deprecated key {}; rename it to {}",
                    KEY_PREFERRED_LEGACY, KEY_PREFERRED
                ));
                v
            }
            None => return Err(ConfigError::MissingKey(KEY_PREFERRED)),
        },
    };

    let config = CommonConfig {
        num_preferred_neighbors: parse_number(KEY_PREFERRED, preferred_raw)?,
        unchoking_interval: Duration::from_secs(parse_number(
            KEY_UNCHOKING,
            require_key(&pairs, KEY_UNCHOKING)?,
        )?),
        optimistic_unchoking_interval: Duration::from_secs(parse_number(
            KEY_OPTIMISTIC,
            require_key(&pairs, KEY_OPTIMISTIC)?,
        )?),
        file_name: require_key(&pairs, KEY_FILE_NAME)?.to_string(),
        file_size: parse_number(KEY_FILE_SIZE, require_key(&pairs, KEY_FILE_SIZE)?)?,
        piece_size: parse_number(KEY_PIECE_SIZE, require_key(&pairs, KEY_PIECE_SIZE)?)?,
    };
    validate_common(&config)?;
    Ok((config, warnings))
}

fn find_key<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn require_key<'a>(pairs: &'a [(String, String)], key: &'static str) -> Result<&'a str, ConfigError> {
    find_key(pairs, key).ok_or(ConfigError::MissingKey(key))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn validate_common(config: &CommonConfig) -> Result<(), ConfigError> {
    if config.num_preferred_neighbors == 0 {
        return Err(ConfigError::Invalid(format!("{} must be > 0", KEY_PREFERRED)));
    }
    if config.unchoking_interval.is_zero() || config.optimistic_unchoking_interval.is_zero() {
        return Err(ConfigError::Invalid(
            "unchoking intervals must be > 0".to_string(),
        ));
    }
    if config.file_size == 0 || config.piece_size == 0 {
        return Err(ConfigError::Invalid(
            "FileSize and PieceSize must be > 0".to_string(),
        ));
    }
    if config.piece_size > config.file_size {
        return Err(ConfigError::Invalid(
            "PieceSize cannot exceed FileSize".to_string(),
        ));
    }
    Ok(())
}

/// Loads PeerInfo.cfg: one `peerId host port hasFile` line per peer.
pub fn load_peers(path: &Path) -> Result<Vec<PeerRecord>, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let mut peers = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(ConfigError::BadValue {
                key: "PeerInfo.cfg".to_string(),
                value: line.to_string(),
            });
        }
        let peer_id: u32 = parse_number("peerId", fields[0])?;
        let port: u16 = parse_number("port", fields[2])?;
        let has_file = match fields[3] {
            "1" => true,
            "0" => false,
            other => {
                return Err(ConfigError::BadValue {
                    key: "hasFile".to_string(),
                    value: other.to_string(),
                })
            }
        };
        peers.push(PeerRecord {
            peer_id,
            host: fields[1].to_string(),
            port,
            has_file,
        });
    }
    validate_peers(&peers)?;
    Ok(peers)
}

fn validate_peers(peers: &[PeerRecord]) -> Result<(), ConfigError> {
    if peers.is_empty() {
        return Err(ConfigError::Invalid("no peers defined".to_string()));
    }
    let mut seen = HashSet::new();
    for peer in peers {
        if peer.peer_id == 0 {
            return Err(ConfigError::Invalid("peer ids must be > 0".to_string()));
        }
        if !seen.insert(peer.peer_id) {
            return Err(ConfigError::Invalid(format!(
                "duplicate peer id {}",
                peer.peer_id
            )));
        }
        if peer.port == 0 {
            return Err(ConfigError::Invalid(format!(
                "peer {} has port 0",
                peer.peer_id
            )));
        }
    }
    if peers.iter().filter(|p| p.has_file).count() > 1 {
        return Err(ConfigError::Invalid(
            "more than one peer marked hasFile=1".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration key {0}.")]
    MissingKey(&'static str),
    #[error("Bad value for {key}: {value:?}.")]
    BadValue { key: String, value: String },
    #[error("Invalid configuration: {0}.")]
    Invalid(String),
    #[error("Failed to read configuration file.")]
    Io(#[from] std::io::Error),
}
