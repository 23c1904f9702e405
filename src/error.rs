use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse sampler config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to read config file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid sampler config: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to spawn sampling thread: {0}")]
    Spawn(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A failed call into the host runtime, with the status code it reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("runtime call failed with status {code:#010x}")]
pub struct RuntimeError {
    pub code: i32,
}

impl RuntimeError {
    pub fn new(code: i32) -> Self {
        RuntimeError { code }
    }
}

/// Ways a metadata lookup can fail. These never leave the name cache; each maps to a fixed name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("class is an array")]
    ClassIsArray,

    #[error("class is a composite")]
    ClassIsComposite,

    #[error("type loading is not complete")]
    DataIncomplete,

    #[error("no metadata found")]
    NotFound,

    #[error("metadata lookup failed with status {0:#010x}")]
    Runtime(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("buffer ended early at offset {0}")]
    UnexpectedEnd(usize),

    #[error("unexpected marker {marker:#04x} at offset {offset}")]
    UnexpectedMarker { marker: u8, offset: usize },

    #[error("frame at offset {offset} references undefined code {code}")]
    UndefinedCode { code: u16, offset: usize },

    #[error("code {code} at offset {offset} redefined or out of sequence")]
    BadDefinition { code: u16, offset: usize },

    #[error("string at offset {0} is not valid UTF-16")]
    BadString(usize),

    #[error("{0} trailing bytes after batch end")]
    TrailingBytes(usize),
}
