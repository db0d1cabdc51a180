use std::process::exit;

use clap::{error::ErrorKind, Parser};
use pummel::{
    cfg::Config,
    cmd::Cmd,
    engine::{Engine, EngineError},
};

pub fn main() {
    let cmd = match Cmd::try_parse() {
        Ok(cmd) => cmd,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit(0),
                _ => exit(1),
            }
        }
    };
    pummel::logging::init(cmd.verbose as usize).unwrap();

    if let Err(err) = run(cmd) {
        log::error!("ERROR: {err}");
        let code = match err {
            EngineError::Spawn { .. } => 2,
            _ => 1,
        };
        exit(code);
    }
}

fn run(cmd: Cmd) -> Result<(), EngineError> {
    let cfg: Config = cmd.try_into().map_err(EngineError::Other)?;

    Engine::new(cfg).run()?;

    Ok(())
}
