mod arg_parse;

use clap::Parser;
use piece_swarm::process::PeerProcess;

fn main() {
    let cli = arg_parse::Cli::parse();

    let mut process = match PeerProcess::new(&cli.workdir, cli.peer_id) {
        Ok(process) => process,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = process.run() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}
