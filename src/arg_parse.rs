use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// This process's peer id, as listed in PeerInfo.cfg
    pub peer_id: u32,

    /// Directory holding Common.cfg, PeerInfo.cfg and the shared file
    #[arg(long, short = 'w', default_value = ".")]
    pub workdir: PathBuf,
}
