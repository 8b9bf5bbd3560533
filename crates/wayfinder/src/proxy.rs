//! The proxy session: two sockets, four tasks, one event queue.
//!
//! A reader task per socket feeds its pipeline manager and fans the results
//! out; a writer task per socket serializes every write onto the wire, so
//! the mapper and the MPI workers can all send without interleaving. The
//! mapper consumes the event queue on its own blocking thread.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};
use wayfinder_protocol::telnet::{self, charset, TelnetCodec};
use wayfinder_protocol::{Manager, OutputFormat, TelnetEvent, XmlEvent};

use crate::mapper::{MapperEvent, WriteMessage};
use crate::remote_edit;

/// The upstream connection, plain or TLS.
pub enum GameStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for GameStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for GameStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

const READ_BUF_SIZE: usize = 4096;

pub struct Session {
    pub output_format: OutputFormat,
    /// Written to the player in place of IAC GA.
    pub prompt_terminator: Vec<u8>,
    pub is_emulating_offline: bool,
    /// First words recognized as mapper commands.
    pub mapper_commands: Vec<Vec<u8>>,
}

/// Channel ends the session hands to its tasks.
pub struct SessionChannels {
    pub player_tx: flume::Sender<WriteMessage>,
    pub player_rx: flume::Receiver<WriteMessage>,
    pub game_tx: flume::Sender<WriteMessage>,
    pub game_rx: flume::Receiver<WriteMessage>,
    pub events_tx: flume::Sender<MapperEvent>,
}

impl Session {
    /// Runs the proxy until either socket closes. Returns after both reader
    /// tasks have stopped and both writers have drained.
    pub async fn run(
        self,
        player: TcpStream,
        game: Option<GameStream>,
        channels: SessionChannels,
    ) -> Result<()> {
        let SessionChannels {
            player_tx,
            player_rx,
            game_tx,
            game_rx,
            events_tx,
        } = channels;

        let (player_read, player_write) = player.into_split();
        let player_writer = tokio::spawn(socket_writer(
            player_write,
            player_rx,
            self.prompt_terminator.clone(),
        ));

        let (mut game_reader_task, game_writer): (JoinHandle<()>, JoinHandle<()>) = match game {
            Some(game) => {
                let (game_read, game_write) = tokio::io::split(game);
                let writer = tokio::spawn(async move {
                    let mut game_write = game_write;
                    while let Ok(message) = game_rx.recv_async().await {
                        let bytes = encode_for_wire(message, None);
                        if game_write.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                });
                let reader = tokio::spawn(game_reader(
                    game_read,
                    self.output_format,
                    player_tx.clone(),
                    game_tx.clone(),
                    events_tx.clone(),
                    self.prompt_terminator.clone(),
                ));
                (reader, writer)
            }
            None => {
                // Offline emulation: nothing upstream. Drain writes so
                // senders never block or error.
                let writer = tokio::spawn(async move {
                    while game_rx.recv_async().await.is_ok() {}
                });
                let reader = tokio::spawn(std::future::pending::<()>());
                (reader, writer)
            }
        };

        let mut player_reader_task = tokio::spawn(player_reader(
            player_read,
            self.is_emulating_offline,
            self.mapper_commands,
            player_tx.clone(),
            game_tx.clone(),
            events_tx.clone(),
        ));

        // Either side closing ends the session.
        tokio::select! {
            _ = &mut player_reader_task => debug!("player connection finished"),
            _ = &mut game_reader_task => debug!("game connection finished"),
        }
        player_reader_task.abort();
        game_reader_task.abort();

        // Closing the event queue is the mapper's shutdown signal; the
        // mapper drops its writer handles when it exits, which lets the
        // writers drain and stop.
        drop(events_tx);
        drop(player_tx);
        drop(game_tx);
        let _ = player_writer.await;
        let _ = game_writer.await;
        remote_edit::join_workers();
        Ok(())
    }
}

/// Serializes writes onto one socket. `Data` chunks are escaped and
/// line-normalized; a prompt-flagged chunk is followed by the terminator.
async fn socket_writer<W: AsyncWrite + Unpin>(
    mut socket: W,
    rx: flume::Receiver<WriteMessage>,
    prompt_terminator: Vec<u8>,
) {
    while let Ok(message) = rx.recv_async().await {
        let bytes = encode_for_wire(message, Some(&prompt_terminator));
        if let Err(error) = socket.write_all(&bytes).await {
            debug!(%error, "error writing to socket");
            break;
        }
    }
}

fn encode_for_wire(message: WriteMessage, prompt_terminator: Option<&[u8]>) -> Vec<u8> {
    match message {
        WriteMessage::Raw(bytes) => bytes,
        WriteMessage::Data { bytes, prompt } => {
            let mut encoded = Manager::encode(&bytes).to_vec();
            if prompt {
                if let Some(terminator) = prompt_terminator {
                    encoded.extend_from_slice(terminator);
                }
            }
            encoded
        }
    }
}

/// Reads the game socket, runs the full inbound pipeline, and fans out the
/// results.
async fn game_reader<R: AsyncRead + Unpin>(
    mut socket: R,
    format: OutputFormat,
    player_tx: flume::Sender<WriteMessage>,
    game_tx: flume::Sender<WriteMessage>,
    events_tx: flume::Sender<MapperEvent>,
    prompt_terminator: Vec<u8>,
) {
    let mut manager = Manager::game(format);
    let _ = game_tx.send(WriteMessage::Raw(manager.connect_handshake().to_vec()));

    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    loop {
        buf.clear();
        match socket.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%error, "error reading from game");
                break;
            }
        }
        let batch = manager.feed(&buf);
        if !batch.replies.is_empty()
            && game_tx
                .send(WriteMessage::Raw(batch.replies.to_vec()))
                .is_err()
        {
            break;
        }
        if !batch.forward.is_empty()
            && player_tx
                .send(WriteMessage::Raw(batch.forward.to_vec()))
                .is_err()
        {
            break;
        }
        if !batch.app.is_empty() {
            let _ = player_tx.send(WriteMessage::Data {
                bytes: batch.app.to_vec(),
                prompt: false,
            });
        }
        for event in batch.telnet_events {
            handle_game_telnet_event(event, &player_tx, &game_tx, &prompt_terminator);
        }
        for message in batch.mpi_messages {
            remote_edit::spawn(message, format, game_tx.clone(), player_tx.clone());
        }
        for event in batch.mud_events {
            let (name, text) = describe_mud_event(event);
            if events_tx.send(MapperEvent::Mud { name, text }).is_err() {
                return;
            }
        }
    }
}

/// Responds to the Telnet events the game side claims: prompt boundaries,
/// NAWS dimensions, and the CHARSET negotiation.
fn handle_game_telnet_event(
    event: TelnetEvent,
    player_tx: &flume::Sender<WriteMessage>,
    game_tx: &flume::Sender<WriteMessage>,
    prompt_terminator: &[u8],
) {
    match event {
        TelnetEvent::GoAhead => {
            // The configured terminator replaces IAC GA entirely.
            let _ = player_tx.send(WriteMessage::Raw(prompt_terminator.to_vec()));
        }
        TelnetEvent::LocalEnabled(option) if option == telnet::option::NAWS => {
            // 80 columns, unlimited height.
            let naws = TelnetCodec::build_subnegotiation(telnet::option::NAWS, &[0, 80, 0xFF, 0xFF]);
            let _ = game_tx.send(WriteMessage::Raw(naws.to_vec()));
        }
        TelnetEvent::LocalEnabled(option) if option == telnet::option::CHARSET => {
            let mut payload = vec![charset::REQUEST];
            payload.extend_from_slice(b";US-ASCII");
            let request = TelnetCodec::build_subnegotiation(telnet::option::CHARSET, &payload);
            let _ = game_tx.send(WriteMessage::Raw(request.to_vec()));
        }
        TelnetEvent::ClaimedSubnegotiation { option, payload }
            if option == telnet::option::CHARSET =>
        {
            match payload.first() {
                Some(&charset::ACCEPTED) => debug!("peer accepted the charset"),
                Some(&charset::REJECTED) => warn!("peer rejected the charset"),
                _ => warn!("unrecognized charset negotiation response"),
            }
        }
        other => debug!(?other, "unhandled telnet event"),
    }
}

fn describe_mud_event(event: XmlEvent) -> (String, String) {
    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8_lossy(&bytes).into_owned()
    }
    match event {
        XmlEvent::Room(bytes) => ("room".to_owned(), text(bytes)),
        XmlEvent::Name(bytes) => ("name".to_owned(), text(bytes)),
        XmlEvent::Description(bytes) => ("description".to_owned(), text(bytes)),
        XmlEvent::Terrain(bytes) => ("terrain".to_owned(), text(bytes)),
        XmlEvent::Exits(bytes) => ("exits".to_owned(), text(bytes)),
        XmlEvent::Prompt(bytes) => ("prompt".to_owned(), text(bytes)),
        XmlEvent::Dynamic(bytes) => ("dynamic".to_owned(), text(bytes)),
        XmlEvent::Movement(bytes) => ("movement".to_owned(), text(bytes)),
        XmlEvent::Line(bytes) => ("line".to_owned(), text(bytes)),
        // Unknown elements still reach the mapper so it can log them once.
        XmlEvent::Other { tag, text: bytes } => (tag, text(bytes)),
    }
}

/// Reads the player socket, buffering until each CR or LF and classifying
/// complete lines as mapper commands or game input.
async fn player_reader<R: AsyncRead + Unpin>(
    mut socket: R,
    is_emulating_offline: bool,
    mapper_commands: Vec<Vec<u8>>,
    player_tx: flume::Sender<WriteMessage>,
    game_tx: flume::Sender<WriteMessage>,
    events_tx: flume::Sender<MapperEvent>,
) {
    let mut manager = Manager::player();
    let mut lines = LineBuffer::default();
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    loop {
        buf.clear();
        match socket.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%error, "error reading from player");
                break;
            }
        }
        let batch = manager.feed(&buf);
        if !batch.replies.is_empty() {
            let _ = player_tx.send(WriteMessage::Raw(batch.replies.to_vec()));
        }
        if !batch.forward.is_empty()
            && game_tx
                .send(WriteMessage::Raw(batch.forward.to_vec()))
                .is_err()
        {
            break;
        }
        for line in lines.push(&batch.app) {
            if is_emulating_offline || is_mapper_command(&line, &mapper_commands) {
                let text = String::from_utf8_lossy(&line).into_owned();
                if events_tx.send(MapperEvent::UserInput(text)).is_err() {
                    return;
                }
            } else if game_tx
                .send(WriteMessage::Data {
                    bytes: line,
                    prompt: false,
                })
                .is_err()
            {
                return;
            }
        }
    }
}

/// Buffers player bytes until a line ending; incomplete trailing bytes
/// persist to the next read.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &byte in data {
            self.pending.push(byte);
            if byte == b'\n' || byte == b'\r' {
                lines.push(std::mem::take(&mut self.pending));
            }
        }
        lines
    }
}

/// True when the line's first whitespace-delimited word is a registered
/// mapper command.
fn is_mapper_command(line: &[u8], commands: &[Vec<u8>]) -> bool {
    let first_word = line
        .split(|byte| byte.is_ascii_whitespace())
        .find(|word| !word.is_empty());
    match first_word {
        Some(word) => commands.iter().any(|command| command == word),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use wayfinder_protocol::telnet::{GA, IAC};

    use super::*;

    #[test]
    fn line_buffer_keeps_incomplete_tails() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"loo").is_empty());
        let lines = buffer.push(b"k\nnor");
        assert_eq!(lines, vec![b"look\n".to_vec()]);
        let lines = buffer.push(b"th\n");
        assert_eq!(lines, vec![b"north\n".to_vec()]);
    }

    #[test]
    fn mapper_commands_are_recognized_by_first_word() {
        let commands = vec![b"run".to_vec(), b"rinfo".to_vec()];
        assert!(is_mapper_command(b"run home\n", &commands));
        assert!(is_mapper_command(b"  rinfo\n", &commands));
        assert!(!is_mapper_command(b"runs home\n", &commands));
        assert!(!is_mapper_command(b"look\n", &commands));
        assert!(!is_mapper_command(b"\n", &commands));
    }

    #[test]
    fn prompt_terminator_replaces_iac_ga() {
        let mut manager = Manager::game(OutputFormat::Normal);
        let mut input = b"> ".to_vec();
        input.push(IAC);
        input.push(GA);
        let batch = manager.feed(&input);
        assert_eq!(&batch.app[..], b"> ");
        assert_eq!(batch.telnet_events, vec![TelnetEvent::GoAhead]);

        // What the player socket sees: the display chunk, then the
        // configured terminator instead of IAC GA.
        let display = encode_for_wire(
            WriteMessage::Data {
                bytes: batch.app.to_vec(),
                prompt: false,
            },
            Some(b"\r\n"),
        );
        assert_eq!(display, b"> ".to_vec());
        let terminator = encode_for_wire(WriteMessage::Raw(b"\r\n".to_vec()), Some(b"\r\n"));
        assert_eq!(terminator, b"\r\n".to_vec());
    }

    #[test]
    fn prompt_flagged_data_appends_terminator() {
        let encoded = encode_for_wire(
            WriteMessage::Data {
                bytes: b"Ok.\n".to_vec(),
                prompt: true,
            },
            Some(&[IAC, GA]),
        );
        let mut expected = b"Ok.\r\n".to_vec();
        expected.push(IAC);
        expected.push(GA);
        assert_eq!(encoded, expected);
    }

    #[test]
    fn raw_bytes_bypass_encoding() {
        let encoded = encode_for_wire(WriteMessage::Raw(vec![IAC, GA]), Some(b"\r\n"));
        assert_eq!(encoded, vec![IAC, GA]);
    }
}
