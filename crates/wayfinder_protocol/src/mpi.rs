//! MPI block framing.
//!
//! MPI is the game's out-of-band protocol for remote viewing and editing.
//! A block starts with the four-byte magic `~$#E` at the beginning of a
//! line, followed by a one-byte command (`E` edit, `V` view), an ASCII
//! decimal payload length terminated by LF, and exactly that many payload
//! bytes. Payload bytes never reach the display stream and are never
//! interpreted as XML.
//!
//! The line feed that precedes the magic belongs to the block: completing
//! the init sequence consumes it, and every failure path re-emits it
//! together with whatever was collected, so that non-MPI text is passed
//! through unchanged.

use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::telnet::LF;

pub const MPI_INIT: &[u8] = b"~$#E";

/// Longest accepted ASCII length field. Anything longer is treated as
/// malformed and re-emitted as text.
const MAX_LENGTH_DIGITS: usize = 9;

/// A completed MPI block.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MpiMessage {
    /// `E` for edit, `V` for view.
    pub command: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
enum State {
    Data,
    /// The previous byte was a line feed; the magic may start here.
    Newline,
    /// Matching the 4-byte magic; `matched` bytes seen so far.
    Init { matched: usize },
    /// Magic complete; the next byte is the command.
    Command,
    /// Accumulating decimal digits until LF.
    Length { command: u8, digits: Vec<u8> },
    /// Collecting exactly `length` payload bytes.
    Body {
        command: u8,
        length: usize,
        payload: Vec<u8>,
    },
}

/// Decoded output of one [`MpiFramer::feed`] call.
#[derive(Default)]
pub struct MpiBatch {
    /// Bytes that were not part of an MPI block.
    pub data: BytesMut,
    pub messages: Vec<MpiMessage>,
}

/// Incremental MPI extractor. Sits after the Telnet codec on the inbound
/// direction.
pub struct MpiFramer {
    state: State,
}

impl MpiFramer {
    pub fn new() -> Self {
        // The very start of the connection counts as a line start.
        Self {
            state: State::Newline,
        }
    }

    /// Bytes announcing MPI support, sent upstream once on connect.
    pub fn handshake() -> &'static [u8] {
        b"~$#EI\n"
    }

    pub fn feed(&mut self, input: &[u8]) -> MpiBatch {
        let mut batch = MpiBatch::default();
        for &byte in input {
            self.feed_byte(byte, &mut batch);
        }
        batch
    }

    fn feed_byte(&mut self, byte: u8, batch: &mut MpiBatch) {
        match std::mem::replace(&mut self.state, State::Data) {
            State::Data => {
                batch.data.put_u8(byte);
                if byte == LF {
                    self.state = State::Newline;
                }
            }
            State::Newline => {
                if byte == MPI_INIT[0] {
                    self.state = State::Init { matched: 1 };
                } else {
                    batch.data.put_u8(byte);
                    if byte == LF {
                        self.state = State::Newline;
                    }
                }
            }
            State::Init { matched } => {
                if byte == MPI_INIT[matched] {
                    if matched + 1 == MPI_INIT.len() {
                        // The block owns the line feed that introduced it.
                        self.eat_newline(batch);
                        self.state = State::Command;
                    } else {
                        self.state = State::Init {
                            matched: matched + 1,
                        };
                    }
                } else {
                    // Not the magic after all; put back what was held.
                    batch.data.put_slice(&MPI_INIT[..matched]);
                    batch.data.put_u8(byte);
                    if byte == LF {
                        self.state = State::Newline;
                    }
                }
            }
            State::Command => match byte {
                b'E' | b'V' => {
                    self.state = State::Length {
                        command: byte,
                        digits: Vec::new(),
                    };
                }
                _ => {
                    debug!(command = byte, "invalid MPI command");
                    batch.data.put_u8(LF);
                    batch.data.put_slice(MPI_INIT);
                    batch.data.put_u8(byte);
                    if byte == LF {
                        self.state = State::Newline;
                    }
                }
            },
            State::Length { command, digits } => {
                if byte == LF {
                    match parse_length(&digits) {
                        Some(0) => batch.messages.push(MpiMessage {
                            command,
                            payload: Vec::new(),
                        }),
                        Some(length) => {
                            self.state = State::Body {
                                command,
                                length,
                                payload: Vec::with_capacity(length),
                            };
                        }
                        None => {
                            debug!("invalid MPI length field");
                            self.reemit_length(command, &digits, batch);
                        }
                    }
                } else if digits.len() >= MAX_LENGTH_DIGITS {
                    debug!("oversized MPI length field");
                    let mut digits = digits;
                    digits.push(byte);
                    self.reemit_length(command, &digits, batch);
                } else {
                    let mut digits = digits;
                    digits.push(byte);
                    self.state = State::Length { command, digits };
                }
            }
            State::Body {
                command,
                length,
                mut payload,
            } => {
                payload.push(byte);
                if payload.len() == length {
                    batch.messages.push(MpiMessage { command, payload });
                } else {
                    self.state = State::Body {
                        command,
                        length,
                        payload,
                    };
                }
            }
        }
    }

    /// Removes the line feed that introduced a completed init sequence.
    ///
    /// A line feed flushed by an earlier read can no longer be retracted;
    /// that corner is logged and accepted.
    fn eat_newline(&mut self, batch: &mut MpiBatch) {
        if batch.data.last() == Some(&LF) {
            batch.data.truncate(batch.data.len() - 1);
        } else {
            debug!("MPI init newline was already flushed downstream");
        }
    }

    fn reemit_length(&mut self, command: u8, digits: &[u8], batch: &mut MpiBatch) {
        batch.data.put_u8(LF);
        batch.data.put_slice(MPI_INIT);
        batch.data.put_u8(command);
        batch.data.put_slice(digits);
        batch.data.put_u8(LF);
        self.state = State::Newline;
    }
}

impl Default for MpiFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_length(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
