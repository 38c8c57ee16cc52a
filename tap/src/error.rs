use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TapError {
    #[error("unable to bind control socket at {path}: {source}")]
    ControlBind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to load stack library: {0}")]
    StackLoad(String),

    #[error("missing stack symbol {0}")]
    StackSymbol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),
}
