// src/error.rs
//
// Crate-wide error type for fallible boundaries (transport I/O, settings
// persistence). The byte-at-a-time codecs in `gvret` and `elm` never fail —
// malformed input is absorbed per the protocol's own tolerance rules — so
// this type only shows up at the edges: opening sockets/serial ports,
// reading/writing the settings file.

use std::fmt;

#[derive(Debug)]
pub enum IoError {
    Io(std::io::Error),
    Protocol { source: &'static str, message: String },
    Config(String),
}

impl IoError {
    pub fn protocol(source: &'static str, message: impl Into<String>) -> Self {
        IoError::Protocol {
            source,
            message: message.into(),
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Io(e) => write!(f, "io error: {}", e),
            IoError::Protocol { source, message } => write!(f, "{} protocol error: {}", source, message),
            IoError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for IoError {}

impl From<std::io::Error> for IoError {
    fn from(e: std::io::Error) -> Self {
        IoError::Io(e)
    }
}
