//! Telnet framing and option negotiation (RFC 854 / RFC 1143).
//!
//! The codec removes every recognized Telnet sequence from the data stream,
//! normalizes CR LF / CR NUL line endings to bare LF / CR, and tracks
//! per-option negotiation state with the Q method so that answers to our own
//! offers never provoke counter-offers. Options and commands the codec was
//! not told to claim surface as [`TelnetEvent`]s; the proxy session forwards
//! those verbatim to the opposite socket.

use std::collections::{HashMap, HashSet};

use bytes::{BufMut, BytesMut};
use tracing::debug;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const NOP: u8 = 241;
pub const SE: u8 = 240;
pub const EOR: u8 = 239;

pub const CR: u8 = b'\r';
pub const LF: u8 = b'\n';
pub const NUL: u8 = 0;

pub mod option {
    pub const ECHO: u8 = 1;
    pub const SGA: u8 = 3;
    pub const TTYPE: u8 = 24;
    pub const EOR: u8 = 25;
    pub const NAWS: u8 = 31;
    pub const CHARSET: u8 = 42;
    pub const GMCP: u8 = 201;
}

pub mod charset {
    pub const REQUEST: u8 = 1;
    pub const ACCEPTED: u8 = 2;
    pub const REJECTED: u8 = 3;
}

/// Is `byte` one of WILL/WONT/DO/DONT?
pub fn is_negotiation(byte: u8) -> bool {
    matches!(byte, WILL | WONT | DO | DONT)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
enum OptState {
    #[default]
    No,
    WantNo,
    WantYes,
    Yes,
}

#[derive(Clone, Copy, Default)]
struct OptionPair {
    us: OptState,
    them: OptState,
}

#[derive(Debug)]
enum State {
    Data,
    /// An IAC was seen; the next byte is a command.
    Command,
    /// A negotiation verb was seen; the next byte is its option.
    CommandArg(u8),
    /// Inside a subnegotiation, collecting option and payload until IAC SE.
    Subnegotiation {
        option: Option<u8>,
        payload: Vec<u8>,
        iac: bool,
    },
    /// A CR was seen; decides between CR LF, CR NUL, and a bare CR.
    Newline,
}

/// Something the codec recognized but does not resolve on its own.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TelnetEvent {
    /// An unclaimed command or negotiation, to be forwarded verbatim.
    Command { command: u8, option: Option<u8> },
    /// An unclaimed subnegotiation, to be forwarded verbatim.
    Subnegotiation { option: u8, payload: Vec<u8> },
    /// IAC GA on a side that claims it: a prompt boundary.
    GoAhead,
    /// The peer agreed to an option we are willing to enable locally.
    LocalEnabled(u8),
    /// The peer told us to stop an option that was enabled locally.
    LocalDisabled(u8),
    /// A subnegotiation for an option this side claims.
    ClaimedSubnegotiation { option: u8, payload: Vec<u8> },
}

/// Decoded output of one [`TelnetCodec::feed`] call.
#[derive(Default)]
pub struct TelnetBatch {
    /// Application data with Telnet sequences removed and line endings
    /// normalized.
    pub data: BytesMut,
    /// Negotiation answers to write back to the same socket.
    pub replies: BytesMut,
    pub events: Vec<TelnetEvent>,
}

/// Incremental Telnet decoder for one side of the proxy.
pub struct TelnetCodec {
    state: State,
    options: HashMap<u8, OptionPair>,
    /// Options we are willing to enable on our side when asked.
    local_options: HashSet<u8>,
    /// Options whose subnegotiations this side consumes instead of
    /// forwarding.
    claimed_subnegotiations: HashSet<u8>,
    /// Two-byte commands this side consumes (IAC GA on the game side).
    claimed_commands: HashSet<u8>,
}

impl TelnetCodec {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            options: HashMap::new(),
            local_options: HashSet::new(),
            claimed_subnegotiations: HashSet::new(),
            claimed_commands: HashSet::new(),
        }
    }

    /// Declares willingness to enable `option` locally when the peer asks.
    pub fn support_local(&mut self, option: u8) {
        self.local_options.insert(option);
        self.claimed_subnegotiations.insert(option);
    }

    /// Declares that subnegotiations for `option` are consumed here.
    pub fn claim_subnegotiation(&mut self, option: u8) {
        self.claimed_subnegotiations.insert(option);
    }

    /// Declares that the two-byte command `command` is consumed here.
    pub fn claim_command(&mut self, command: u8) {
        self.claimed_commands.insert(command);
    }

    pub fn is_local_enabled(&self, option: u8) -> bool {
        self.options
            .get(&option)
            .is_some_and(|pair| pair.us == OptState::Yes)
    }

    fn is_claimed(&self, option: u8) -> bool {
        self.claimed_subnegotiations.contains(&option) || self.local_options.contains(&option)
    }

    /// Offers to enable `option` locally, returning the bytes to send.
    pub fn offer_will(&mut self, option: u8) -> [u8; 3] {
        self.local_options.insert(option);
        self.claimed_subnegotiations.insert(option);
        self.options.entry(option).or_default().us = OptState::WantYes;
        [IAC, WILL, option]
    }

    /// Withdraws a locally enabled option, returning the bytes to send.
    pub fn offer_wont(&mut self, option: u8) -> [u8; 3] {
        self.options.entry(option).or_default().us = OptState::WantNo;
        [IAC, WONT, option]
    }

    /// Builds an outgoing subnegotiation with IAC bytes in the payload
    /// doubled.
    pub fn build_subnegotiation(option: u8, payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(payload.len() + 6);
        out.put_slice(&[IAC, SB, option]);
        for &b in payload {
            out.put_u8(b);
            if b == IAC {
                out.put_u8(IAC);
            }
        }
        out.put_slice(&[IAC, SE]);
        out
    }

    /// Runs `input` through the state machine.
    pub fn feed(&mut self, input: &[u8]) -> TelnetBatch {
        let mut batch = TelnetBatch::default();
        for &byte in input {
            self.feed_byte(byte, &mut batch);
        }
        batch
    }

    fn feed_byte(&mut self, byte: u8, batch: &mut TelnetBatch) {
        match std::mem::replace(&mut self.state, State::Data) {
            State::Data => match byte {
                IAC => self.state = State::Command,
                CR => self.state = State::Newline,
                _ => batch.data.put_u8(byte),
            },
            State::Newline => match byte {
                LF => batch.data.put_u8(LF),
                NUL => batch.data.put_u8(CR),
                IAC => {
                    batch.data.put_u8(CR);
                    self.state = State::Command;
                }
                _ => {
                    batch.data.put_u8(CR);
                    // Reprocess the byte as ordinary data.
                    self.feed_byte(byte, batch);
                }
            },
            State::Command => match byte {
                IAC => batch.data.put_u8(IAC),
                WILL | WONT | DO | DONT => self.state = State::CommandArg(byte),
                SB => {
                    self.state = State::Subnegotiation {
                        option: None,
                        payload: Vec::new(),
                        iac: false,
                    };
                }
                _ => self.handle_command(byte, batch),
            },
            State::CommandArg(verb) => self.handle_negotiation(verb, byte, batch),
            State::Subnegotiation {
                option,
                mut payload,
                iac,
            } => {
                if iac {
                    match byte {
                        SE => {
                            match option {
                                Some(option) => {
                                    self.handle_subnegotiation(option, payload, batch);
                                }
                                None => debug!("empty subnegotiation dropped"),
                            }
                            return;
                        }
                        IAC => payload.push(IAC),
                        _ => {
                            debug!(byte, "malformed subnegotiation dropped");
                            return;
                        }
                    }
                    self.state = State::Subnegotiation {
                        option,
                        payload,
                        iac: false,
                    };
                } else if byte == IAC {
                    self.state = State::Subnegotiation {
                        option,
                        payload,
                        iac: true,
                    };
                } else if option.is_none() {
                    self.state = State::Subnegotiation {
                        option: Some(byte),
                        payload,
                        iac: false,
                    };
                } else {
                    payload.push(byte);
                    self.state = State::Subnegotiation {
                        option,
                        payload,
                        iac: false,
                    };
                }
            }
        }
    }

    fn handle_command(&mut self, command: u8, batch: &mut TelnetBatch) {
        if self.claimed_commands.contains(&command) {
            if command == GA {
                batch.events.push(TelnetEvent::GoAhead);
            }
        } else if command != NOP {
            batch.events.push(TelnetEvent::Command {
                command,
                option: None,
            });
        }
    }

    fn handle_negotiation(&mut self, verb: u8, opt: u8, batch: &mut TelnetBatch) {
        if !self.is_claimed(opt) {
            batch.events.push(TelnetEvent::Command {
                command: verb,
                option: Some(opt),
            });
            return;
        }
        let pair = self.options.entry(opt).or_default();
        match verb {
            WILL => match pair.them {
                // We never ask peers to enable options remotely, so a fresh
                // WILL for a claimed option is refused.
                OptState::No => batch.replies.put_slice(&[IAC, DONT, opt]),
                OptState::WantYes | OptState::WantNo => pair.them = OptState::Yes,
                OptState::Yes => {}
            },
            WONT => match pair.them {
                OptState::Yes => {
                    pair.them = OptState::No;
                    batch.replies.put_slice(&[IAC, DONT, opt]);
                }
                OptState::WantYes | OptState::WantNo => pair.them = OptState::No,
                OptState::No => {}
            },
            DO => match pair.us {
                OptState::No => {
                    if self.local_options.contains(&opt) {
                        pair.us = OptState::Yes;
                        batch.replies.put_slice(&[IAC, WILL, opt]);
                        batch.events.push(TelnetEvent::LocalEnabled(opt));
                    } else {
                        batch.replies.put_slice(&[IAC, WONT, opt]);
                    }
                }
                OptState::WantYes => {
                    // Answer to our own WILL; no counter-offer.
                    pair.us = OptState::Yes;
                    batch.events.push(TelnetEvent::LocalEnabled(opt));
                }
                OptState::WantNo => pair.us = OptState::No,
                OptState::Yes => {}
            },
            DONT => match pair.us {
                OptState::Yes => {
                    pair.us = OptState::No;
                    batch.replies.put_slice(&[IAC, WONT, opt]);
                    batch.events.push(TelnetEvent::LocalDisabled(opt));
                }
                OptState::WantYes => {
                    // Our offer was refused.
                    pair.us = OptState::No;
                }
                OptState::WantNo => pair.us = OptState::No,
                OptState::No => {}
            },
            _ => unreachable!("negotiation verbs only"),
        }
    }

    fn handle_subnegotiation(&mut self, option: u8, payload: Vec<u8>, batch: &mut TelnetBatch) {
        if self.is_claimed(option) {
            batch
                .events
                .push(TelnetEvent::ClaimedSubnegotiation { option, payload });
        } else {
            batch
                .events
                .push(TelnetEvent::Subnegotiation { option, payload });
        }
    }
}

impl Default for TelnetCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Doubles IAC bytes.
pub fn escape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

/// Prepares application bytes for the wire: IAC doubled, CR encoded as
/// CR NUL, and LF expanded to CR LF, in one pass.
pub fn encode_outbound(data: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(data.len() + data.len() / 8);
    for &b in data {
        match b {
            IAC => out.put_slice(&[IAC, IAC]),
            CR => out.put_slice(&[CR, NUL]),
            LF => out.put_slice(&[CR, LF]),
            _ => out.put_u8(b),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(codec: &mut TelnetCodec, input: &[u8]) -> TelnetBatch {
        codec.feed(input)
    }

    #[test]
    fn plain_data_passes_through() {
        let mut codec = TelnetCodec::new();
        let batch = parse(&mut codec, b"Hello World!");
        assert_eq!(&batch.data[..], b"Hello World!");
        assert!(batch.events.is_empty());
        assert!(batch.replies.is_empty());
    }

    #[test]
    fn line_ending_normalization() {
        let mut codec = TelnetCodec::new();
        assert_eq!(&parse(&mut codec, b"abc\r\n").data[..], b"abc\n");
        assert_eq!(&parse(&mut codec, b"abc\r\0").data[..], b"abc\r");
        // A bare CR is held until the next byte decides the ending.
        let batch = parse(&mut codec, b"abc\r");
        assert_eq!(&batch.data[..], b"abc");
        let batch = parse(&mut codec, b"x");
        assert_eq!(&batch.data[..], b"\rx");
    }

    #[test]
    fn cr_followed_by_iac() {
        let mut codec = TelnetCodec::new();
        codec.claim_command(GA);
        let batch = parse(&mut codec, &[b'>', b' ', CR, IAC, GA]);
        assert_eq!(&batch.data[..], b"> \r");
        assert_eq!(batch.events, vec![TelnetEvent::GoAhead]);
    }

    #[test]
    fn escaped_iac_yields_single_byte() {
        let mut codec = TelnetCodec::new();
        let batch = parse(&mut codec, &[b'a', IAC, IAC, b'b']);
        assert_eq!(&batch.data[..], &[b'a', IAC, b'b'][..]);
    }

    #[test]
    fn unclaimed_negotiation_becomes_event() {
        let mut codec = TelnetCodec::new();
        let batch = parse(&mut codec, &[IAC, WILL, option::ECHO]);
        assert_eq!(
            batch.events,
            vec![TelnetEvent::Command {
                command: WILL,
                option: Some(option::ECHO),
            }]
        );
        assert!(batch.replies.is_empty());
    }

    #[test]
    fn do_for_supported_option_answers_will_once() {
        let mut codec = TelnetCodec::new();
        codec.support_local(option::NAWS);
        let batch = parse(&mut codec, &[IAC, DO, option::NAWS]);
        assert_eq!(&batch.replies[..], &[IAC, WILL, option::NAWS][..]);
        assert_eq!(batch.events, vec![TelnetEvent::LocalEnabled(option::NAWS)]);
        // A repeated DO must not re-answer.
        let batch = parse(&mut codec, &[IAC, DO, option::NAWS]);
        assert!(batch.replies.is_empty());
        assert!(batch.events.is_empty());
    }

    #[test]
    fn answer_to_our_offer_is_not_countered() {
        let mut codec = TelnetCodec::new();
        let offer = codec.offer_will(option::CHARSET);
        assert_eq!(offer, [IAC, WILL, option::CHARSET]);
        let batch = parse(&mut codec, &[IAC, DO, option::CHARSET]);
        assert!(batch.replies.is_empty(), "no counter-offer after DO");
        assert_eq!(
            batch.events,
            vec![TelnetEvent::LocalEnabled(option::CHARSET)]
        );
        assert!(codec.is_local_enabled(option::CHARSET));
    }

    #[test]
    fn refused_offer_goes_quiet() {
        let mut codec = TelnetCodec::new();
        codec.offer_will(option::CHARSET);
        let batch = parse(&mut codec, &[IAC, DONT, option::CHARSET]);
        assert!(batch.replies.is_empty());
        assert!(batch.events.is_empty());
        assert!(!codec.is_local_enabled(option::CHARSET));
    }

    #[test]
    fn subnegotiation_payload_collected() {
        let mut codec = TelnetCodec::new();
        let batch = parse(
            &mut codec,
            &[IAC, SB, option::TTYPE, 1, b'x', IAC, IAC, b'y', IAC, SE],
        );
        assert_eq!(
            batch.events,
            vec![TelnetEvent::Subnegotiation {
                option: option::TTYPE,
                payload: vec![1, b'x', IAC, b'y'],
            }]
        );
    }

    #[test]
    fn claimed_subnegotiation_is_not_forwarded() {
        let mut codec = TelnetCodec::new();
        codec.support_local(option::CHARSET);
        let batch = parse(
            &mut codec,
            &[IAC, SB, option::CHARSET, charset::ACCEPTED, b'U', IAC, SE],
        );
        assert_eq!(
            batch.events,
            vec![TelnetEvent::ClaimedSubnegotiation {
                option: option::CHARSET,
                payload: vec![charset::ACCEPTED, b'U'],
            }]
        );
    }

    #[test]
    fn truncated_subnegotiation_is_dropped() {
        let mut codec = TelnetCodec::new();
        let batch = parse(&mut codec, &[IAC, SB, option::TTYPE, b'a', b'b']);
        assert!(batch.events.is_empty());
        // The stream resynchronizes once the malformed terminator arrives.
        let batch = parse(&mut codec, &[IAC, b'Q', b'k']);
        assert_eq!(&batch.data[..], b"k");
    }

    #[test]
    fn ga_with_surrounding_data() {
        let mut codec = TelnetCodec::new();
        codec.claim_command(GA);
        let batch = parse(&mut codec, &[IAC, GA, b'd', IAC, IAC, IAC, GA]);
        assert_eq!(&batch.data[..], &[b'd', IAC][..]);
        assert_eq!(batch.events, vec![TelnetEvent::GoAhead, TelnetEvent::GoAhead]);
    }

    #[test]
    fn outbound_encoding() {
        let encoded = encode_outbound(&[b'd', IAC, LF, CR]);
        assert_eq!(&encoded[..], &[b'd', IAC, IAC, CR, LF, CR, NUL][..]);
    }

    #[test]
    fn escape_unescape_round_trip() {
        let payload = [1, IAC, 2, IAC, IAC, 3];
        let wire = escape_iac(&payload);
        let mut codec = TelnetCodec::new();
        let batch = codec.feed(&wire);
        assert_eq!(&batch.data[..], &payload[..]);
    }

    #[test]
    fn subnegotiation_builder_escapes_payload() {
        let out = TelnetCodec::build_subnegotiation(option::NAWS, &[0, 80, IAC, IAC]);
        assert_eq!(
            &out[..],
            &[IAC, SB, option::NAWS, 0, 80, IAC, IAC, IAC, IAC, IAC, SE][..]
        );
    }
}
