//! Per-direction protocol pipeline.
//!
//! Each side of the proxy owns one [`Manager`]. The game side chains
//! Telnet → MPI → XML; the player side runs Telnet alone. One call to
//! [`Manager::feed`] consumes a socket read and returns everything it
//! produced: application bytes, answers for the same socket, verbatim
//! forwards for the opposite socket, and the parsed events.

use bytes::{BufMut, BytesMut};

use crate::mpi::{MpiFramer, MpiMessage};
use crate::telnet::{self, TelnetCodec, TelnetEvent};
use crate::xml::{XmlEvent, XmlTokenizer};
use crate::OutputFormat;

/// Everything one socket read produced.
#[derive(Default)]
pub struct SessionBatch {
    /// Decoded application bytes: the display stream on the game side, the
    /// player's raw input on the player side.
    pub app: BytesMut,
    /// Bytes to write back to the socket the data came from.
    pub replies: BytesMut,
    /// Unhandled Telnet negotiation, re-encoded verbatim for the opposite
    /// socket.
    pub forward: BytesMut,
    /// Claimed Telnet events for the session to act on.
    pub telnet_events: Vec<TelnetEvent>,
    pub mud_events: Vec<XmlEvent>,
    pub mpi_messages: Vec<MpiMessage>,
}

pub struct Manager {
    telnet: TelnetCodec,
    mpi: Option<MpiFramer>,
    xml: Option<XmlTokenizer>,
}

impl Manager {
    /// The pipeline for bytes arriving from the game.
    pub fn game(format: OutputFormat) -> Self {
        let mut codec = TelnetCodec::new();
        codec.claim_command(telnet::GA);
        codec.support_local(telnet::option::NAWS);
        Self {
            telnet: codec,
            mpi: Some(MpiFramer::new()),
            xml: Some(XmlTokenizer::new(format)),
        }
    }

    /// The pipeline for bytes arriving from the player.
    pub fn player() -> Self {
        Self {
            telnet: TelnetCodec::new(),
            mpi: None,
            xml: None,
        }
    }

    pub fn telnet_mut(&mut self) -> &mut TelnetCodec {
        &mut self.telnet
    }

    /// The bytes to send upstream immediately after connecting: the CHARSET
    /// offer, the MPI announce, the tag-stream enable request, and the
    /// request for IAC GA prompt terminators.
    pub fn connect_handshake(&mut self) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_slice(&self.telnet.offer_will(telnet::option::CHARSET));
        out.put_slice(MpiFramer::handshake());
        out.put_slice(XmlTokenizer::handshake());
        out.put_slice(b"~$#EP2\nG\n");
        out
    }

    pub fn feed(&mut self, input: &[u8]) -> SessionBatch {
        let mut batch = SessionBatch::default();
        let telnet_batch = self.telnet.feed(input);
        batch.replies = telnet_batch.replies;
        for event in telnet_batch.events {
            match event {
                TelnetEvent::Command { command, option } => {
                    batch.forward.put_u8(telnet::IAC);
                    batch.forward.put_u8(command);
                    if let Some(option) = option {
                        batch.forward.put_u8(option);
                    }
                }
                TelnetEvent::Subnegotiation { option, payload } => {
                    batch
                        .forward
                        .put_slice(&TelnetCodec::build_subnegotiation(option, &payload));
                }
                other => batch.telnet_events.push(other),
            }
        }

        let mut data = telnet_batch.data;
        if let Some(mpi) = &mut self.mpi {
            let mpi_batch = mpi.feed(&data);
            batch.mpi_messages = mpi_batch.messages;
            data = mpi_batch.data;
        }
        match &mut self.xml {
            Some(xml) => {
                let xml_batch = xml.feed(&data);
                batch.app = xml_batch.display;
                batch.mud_events = xml_batch.events;
            }
            None => batch.app = data,
        }
        batch
    }

    /// Prepares application bytes for this side's socket: IAC escaped and
    /// line endings normalized for the wire.
    pub fn encode(data: &[u8]) -> BytesMut {
        telnet::encode_outbound(data)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::telnet::{option, DO, GA, IAC, SB, SE, WILL};

    #[test]
    fn game_chain_parses_all_three_layers() {
        let mut manager = Manager::game(OutputFormat::Normal);
        let mut input = Vec::new();
        input.extend_from_slice(b"tail of a line\n");
        input.extend_from_slice(b"~$#EV5\nHELLO");
        input.extend_from_slice(b"<room><name>Spring</name><exits>Exits: east.\n</exits></room>\n");
        input.extend_from_slice(b"<prompt>o CW> </prompt>");
        input.push(IAC);
        input.push(GA);

        let batch = manager.feed(&input);
        // The line feed before the MPI block belongs to the block.
        assert_eq!(&batch.app[..], b"tail of a lineSpringExits: east.\n\no CW> ");
        assert_eq!(
            batch.mpi_messages,
            vec![MpiMessage {
                command: b'V',
                payload: b"HELLO".to_vec(),
            }]
        );
        assert_eq!(batch.telnet_events, vec![TelnetEvent::GoAhead]);
        let names: Vec<_> = batch
            .mud_events
            .iter()
            .filter(|event| matches!(event, XmlEvent::Name(_)))
            .collect();
        assert_eq!(names, vec![&XmlEvent::Name(b"Spring".to_vec())]);
    }

    #[test]
    fn unclaimed_negotiation_is_reencoded_for_forwarding() {
        let mut manager = Manager::player();
        let batch = manager.feed(&[IAC, WILL, option::GMCP]);
        assert_eq!(&batch.forward[..], &[IAC, WILL, option::GMCP][..]);
        assert!(batch.replies.is_empty());

        let batch = manager.feed(&[IAC, SB, option::GMCP, b'h', b'i', IAC, SE]);
        assert_eq!(
            &batch.forward[..],
            &[IAC, SB, option::GMCP, b'h', b'i', IAC, SE][..]
        );
    }

    #[test]
    fn game_handshake_offers_charset_and_enables_protocols() {
        let mut manager = Manager::game(OutputFormat::Normal);
        let handshake = manager.connect_handshake();
        let mut expected = vec![IAC, WILL, option::CHARSET];
        expected.extend_from_slice(b"~$#EI\n~$#EX2\n3G\n~$#EP2\nG\n");
        assert_eq!(&handshake[..], &expected[..]);

        // The game's DO answer must not provoke a counter-offer.
        let batch = manager.feed(&[IAC, DO, option::CHARSET]);
        assert!(batch.replies.is_empty());
        assert_eq!(
            batch.telnet_events,
            vec![TelnetEvent::LocalEnabled(option::CHARSET)]
        );
    }

    #[test]
    fn naws_request_is_answered() {
        let mut manager = Manager::game(OutputFormat::Normal);
        let batch = manager.feed(&[IAC, DO, option::NAWS]);
        assert_eq!(&batch.replies[..], &[IAC, WILL, option::NAWS][..]);
        assert_eq!(
            batch.telnet_events,
            vec![TelnetEvent::LocalEnabled(option::NAWS)]
        );
    }

    #[test]
    fn player_side_passes_input_through() {
        let mut manager = Manager::player();
        let batch = manager.feed(b"look\r\n");
        assert_eq!(&batch.app[..], b"look\n");
        assert!(batch.mud_events.is_empty());
    }

    #[test]
    fn encode_prepares_wire_bytes() {
        let encoded = Manager::encode(&[b'n', b'\n', IAC]);
        assert_eq!(&encoded[..], &[b'n', b'\r', b'\n', IAC, IAC][..]);
    }
}
