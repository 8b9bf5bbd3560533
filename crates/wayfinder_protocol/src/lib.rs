//! Stream parsing for the Wayfinder proxy.
//!
//! The bytes arriving from the game interleave three protocols on one TCP
//! stream: Telnet command/option/subnegotiation framing, the out-of-band MPI
//! block protocol used for remote viewing and editing, and an inline
//! XML-style tag stream annotating room names, descriptions, exits, prompts,
//! and movement. Each layer is an incremental, byte-at-a-time state machine
//! that consumes what it recognizes and passes the rest down the chain:
//!
//! ```text
//! socket -> telnet -> mpi -> xml -> display bytes + parsed events
//! ```
//!
//! [`Manager`] wires the chain up for one direction of the proxy and
//! collects everything a single read produced into a [`SessionBatch`].

pub mod manager;
pub mod mpi;
pub mod telnet;
pub mod xml;

pub use manager::{Manager, SessionBatch};
pub use mpi::{MpiFramer, MpiMessage, MPI_INIT};
pub use telnet::{TelnetCodec, TelnetEvent};
pub use xml::{XmlEvent, XmlTokenizer};

use std::fmt;
use std::str::FromStr;

/// How game output is transformed before being written to the player.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OutputFormat {
    /// Strip tags, unescape entities.
    #[default]
    Normal,
    /// Pass the tag stream through byte for byte.
    Raw,
    /// Rewrite selected tags to `NAME:`/`:NAME` style text markers.
    Tintin,
}

impl OutputFormat {
    pub const ALL: [Self; 3] = [Self::Normal, Self::Raw, Self::Tintin];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Raw => "raw",
            Self::Tintin => "tintin",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "raw" => Ok(Self::Raw),
            "tintin" => Ok(Self::Tintin),
            other => Err(format!("unknown output format '{other}'")),
        }
    }
}

/// Unescapes `&lt;`, `&gt;`, and `&amp;` in place of their entities.
///
/// `&amp;` is resolved last so that `&amp;lt;` round-trips to `&lt;` rather
/// than `<`.
pub fn unescape_entities(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'&' {
            let rest = &data[i..];
            if rest.starts_with(b"&lt;") {
                out.push(b'<');
                i += 4;
                continue;
            } else if rest.starts_with(b"&gt;") {
                out.push(b'>');
                i += 4;
                continue;
            } else if rest.starts_with(b"&amp;") {
                out.push(b'&');
                i += 5;
                continue;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Escapes `&`, `<`, and `>` for embedding text in the tag stream.
pub fn escape_entities(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            _ => out.push(b),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_round_trip() {
        let text = b"a <b> & c &amp;lt;";
        assert_eq!(
            unescape_entities(&escape_entities(text)),
            text.to_vec(),
            "escape then unescape must restore the original bytes"
        );
        assert_eq!(unescape_entities(b"&amp;lt;"), b"&lt;".to_vec());
    }

    #[test]
    fn output_format_parsing() {
        assert_eq!("raw".parse::<OutputFormat>(), Ok(OutputFormat::Raw));
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
