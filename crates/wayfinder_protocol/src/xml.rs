//! Inline XML-style tag tokenization.
//!
//! The game annotates its output with a flat tag stream: `<room>`, `<name>`,
//! `<description>`, `<terrain>`, `<exits>`, `<prompt>`, `<movement .../>`,
//! and a handful of speech tags. Tags never nest angle brackets. The
//! tokenizer labels the text runs between tags with a mode, emits a typed
//! event per completed element, and produces the display stream for the
//! player in one of three formats.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::telnet::LF;
use crate::{unescape_entities, OutputFormat};

/// A parsed element or text line from the game.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum XmlEvent {
    /// The opening `<room>` tag's attribute text, verbatim.
    Room(Vec<u8>),
    Name(Vec<u8>),
    Description(Vec<u8>),
    Terrain(Vec<u8>),
    Exits(Vec<u8>),
    Prompt(Vec<u8>),
    /// Text between the end of the static description and `</room>`: the
    /// room's dynamic contents.
    Dynamic(Vec<u8>),
    /// `<movement dir="..."/>`; the payload is the direction, possibly
    /// empty.
    Movement(Vec<u8>),
    /// A completed plain-text line outside any recognized element.
    Line(Vec<u8>),
    /// Any other closing tag, with the text it enclosed.
    Other { tag: String, text: Vec<u8> },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
enum Mode {
    #[default]
    None,
    Room,
    Name,
    Description,
    Terrain,
    Exits,
    Prompt,
}

/// Decoded output of one [`XmlTokenizer::feed`] call.
#[derive(Default)]
pub struct XmlBatch {
    /// The transformed display stream for the player.
    pub display: BytesMut,
    pub events: Vec<XmlEvent>,
}

/// Incremental tokenizer for the inline tag stream.
pub struct XmlTokenizer {
    format: OutputFormat,
    in_tag: bool,
    gratuitous: bool,
    mode: Mode,
    tag_buf: Vec<u8>,
    /// Text since the last tag boundary.
    text_buf: Vec<u8>,
    /// Text accumulated at room level since the static description ended.
    dynamic_buf: Vec<u8>,
    /// Current plain-text line, while outside any element.
    line_buf: Vec<u8>,
}

impl XmlTokenizer {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            in_tag: false,
            gratuitous: false,
            mode: Mode::None,
            tag_buf: Vec::new(),
            text_buf: Vec::new(),
            dynamic_buf: Vec::new(),
            line_buf: Vec::new(),
        }
    }

    /// Bytes asking the game to enable the tag stream, sent upstream once
    /// on connect.
    pub fn handshake() -> &'static [u8] {
        b"~$#EX2\n3G\n"
    }

    pub fn feed(&mut self, input: &[u8]) -> XmlBatch {
        let mut batch = XmlBatch::default();
        for &byte in input {
            self.feed_byte(byte, &mut batch);
        }
        if self.format != OutputFormat::Raw {
            let unescaped = unescape_entities(&batch.display);
            batch.display.clear();
            batch.display.put_slice(&unescaped);
        }
        batch
    }

    fn feed_byte(&mut self, byte: u8, batch: &mut XmlBatch) {
        if self.in_tag {
            if byte == b'>' {
                self.in_tag = false;
                let tag = std::mem::take(&mut self.tag_buf);
                self.handle_tag(&tag, batch);
                self.text_buf.clear();
                self.line_buf.clear();
            } else {
                self.tag_buf.push(byte);
            }
        } else if byte == b'<' {
            self.in_tag = true;
        } else {
            self.text_buf.push(byte);
            if self.mode == Mode::Room {
                self.dynamic_buf.push(byte);
            }
            if self.format == OutputFormat::Raw || !self.gratuitous {
                batch.display.put_u8(byte);
            }
            if self.mode == Mode::None {
                if byte == LF {
                    let line = std::mem::take(&mut self.line_buf);
                    if !line.is_empty() {
                        batch.events.push(XmlEvent::Line(unescape_entities(&line)));
                    }
                    // A line boundary outside any element also bounds the
                    // element text buffer.
                    self.text_buf.clear();
                } else {
                    self.line_buf.push(byte);
                }
            }
        }
    }

    fn handle_tag(&mut self, tag: &[u8], batch: &mut XmlBatch) {
        self.emit_tag_display(tag, batch);
        let name = tag_name(tag);
        let text = unescape_entities(&self.text_buf);
        match name {
            b"movement" => {
                if self.mode == Mode::None {
                    batch
                        .events
                        .push(XmlEvent::Movement(tag_attribute(tag, b"dir")));
                }
            }
            b"gratuitous" => self.gratuitous = true,
            b"/gratuitous" => self.gratuitous = false,
            b"room" => {
                self.mode = Mode::Room;
                self.dynamic_buf.clear();
                let attrs = tag[b"room".len()..].to_vec();
                batch.events.push(XmlEvent::Room(attrs));
            }
            b"name" => self.mode = Mode::Name,
            b"description" => self.mode = Mode::Description,
            b"terrain" => self.mode = Mode::Terrain,
            b"exits" => self.mode = Mode::Exits,
            b"prompt" => self.mode = Mode::Prompt,
            b"/name" => {
                batch.events.push(XmlEvent::Name(text));
                self.enter_room_mode();
            }
            b"/description" => {
                batch.events.push(XmlEvent::Description(text));
                self.enter_room_mode();
            }
            b"/terrain" => {
                batch.events.push(XmlEvent::Terrain(text));
                self.enter_room_mode();
            }
            b"/exits" => {
                batch.events.push(XmlEvent::Exits(text));
                self.mode = Mode::None;
            }
            b"/prompt" => {
                batch.events.push(XmlEvent::Prompt(text));
                self.mode = Mode::None;
            }
            b"/room" => {
                let dynamic = unescape_entities(&std::mem::take(&mut self.dynamic_buf));
                batch.events.push(XmlEvent::Dynamic(dynamic));
                self.mode = Mode::None;
            }
            _ => {
                if let Some(closing) = name.strip_prefix(b"/") {
                    batch.events.push(XmlEvent::Other {
                        tag: String::from_utf8_lossy(closing).into_owned(),
                        text,
                    });
                }
            }
        }
    }

    fn enter_room_mode(&mut self) {
        self.mode = Mode::Room;
        // The dynamic contents are whatever follows the static part.
        self.dynamic_buf.clear();
    }

    fn emit_tag_display(&mut self, tag: &[u8], batch: &mut XmlBatch) {
        match self.format {
            OutputFormat::Raw => {
                batch.display.put_u8(b'<');
                batch.display.put_slice(tag);
                batch.display.put_u8(b'>');
            }
            OutputFormat::Tintin => {
                if !self.gratuitous {
                    if let Some(replacement) = tintin_replacement(tag_name(tag)) {
                        batch.display.put_slice(replacement);
                    }
                }
            }
            OutputFormat::Normal => {}
        }
    }
}

/// The tag's name: everything up to the first whitespace, without a
/// self-closing slash.
fn tag_name(tag: &[u8]) -> &[u8] {
    let end = tag
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(tag.len());
    let name = &tag[..end];
    if name.len() > 1 {
        name.strip_suffix(b"/").unwrap_or(name)
    } else {
        name
    }
}

/// Extracts a `key=value` or `key="value"` attribute from a tag's bytes.
fn tag_attribute(tag: &[u8], key: &[u8]) -> Vec<u8> {
    let mut needle = key.to_vec();
    needle.push(b'=');
    let Some(start) = tag
        .windows(needle.len())
        .position(|window| window == needle)
    else {
        return Vec::new();
    };
    let mut value = &tag[start + needle.len()..];
    let quoted = value.first() == Some(&b'"');
    if quoted {
        value = &value[1..];
    }
    let end = value
        .iter()
        .position(|&b| {
            if quoted {
                b == b'"'
            } else {
                b == b'/' || b.is_ascii_whitespace()
            }
        })
        .unwrap_or(value.len());
    value[..end].to_vec()
}

/// Parses the attribute text captured from an opening tag into key/value
/// pairs. Values may be bare or double-quoted.
pub fn parse_tag_attributes(attrs: &[u8]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let text = String::from_utf8_lossy(attrs);
    let mut rest = text.trim_start_matches(|c: char| c.is_whitespace());
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().trim_end_matches('/').to_owned();
        let mut value = &rest[eq + 1..];
        let end;
        if value.starts_with('"') {
            value = &value[1..];
            end = value.find('"').unwrap_or(value.len());
        } else {
            end = value
                .find(|c: char| c.is_whitespace() || c == '/')
                .unwrap_or(value.len());
        }
        if !key.is_empty() {
            out.insert(key, value[..end].to_owned());
        }
        rest = value[end..].trim_start_matches(['"', '/', ' ', '\t']);
    }
    out
}

fn tintin_replacement(name: &[u8]) -> Option<&'static [u8]> {
    Some(match name {
        b"prompt" => b"PROMPT:",
        b"/prompt" => b":PROMPT",
        b"name" => b"NAME:",
        b"/name" => b":NAME",
        b"tell" => b"TELL:",
        b"/tell" => b":TELL",
        b"narrate" => b"NARRATE:",
        b"/narrate" => b":NARRATE",
        b"pray" => b"PRAY:",
        b"/pray" => b":PRAY",
        b"say" => b"SAY:",
        b"/say" => b":SAY",
        b"emote" => b"EMOTE:",
        b"/emote" => b":EMOTE",
        _ => return None,
    })
}
