// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Incremental framing of an XML stream into top-level elements.
//!
//! An XMPP stream is a single XML document which is never complete while
//! the connection lives. The framer accumulates text and, whenever the
//! accumulated data forms complete elements, wraps it into a synthetic
//! document (re-using the last stream header and adding a closing tag when
//! needed) which is then handed to [`minidom`](crate::minidom).
//!
//! Data which does not parse yet is kept until the next chunk arrives. This
//! is not an error: truncated XML and malformed XML cannot be told apart
//! without a timeout, which is the business of the connection owner. The
//! buffer has no size bound besides available memory.

use crate::minidom::Element;
use crate::stream_start::{StreamHeader, STREAM_END};

/// Something the framer extracted from the incoming data.
#[derive(Debug, Clone, PartialEq)]
pub enum FramerEvent {
    /// A whitespace keep-alive was received.
    Ping,
    /// The peer opened a (new) stream.
    StreamOpen(StreamHeader),
    /// A complete top-level element.
    Element(Element),
    /// The peer closed the stream.
    StreamClose,
}

/// Accumulates chunks of an XML stream and yields complete elements.
#[derive(Debug, Default)]
pub struct XmlFramer {
    buffer: String,
    stream_start: Option<String>,
}

/// Find a stream header at the beginning of `data`: an optional XML
/// declaration, whitespace, then the `<stream:stream ...>` open tag. Returns
/// the length of the matched prefix.
fn find_stream_start(data: &str) -> Option<usize> {
    let mut pos = 0;
    if data.starts_with("<?xml") {
        pos = data.find("?>")? + 2;
    }
    pos += data[pos..].len() - data[pos..].trim_start().len();
    if !data[pos..].starts_with("<stream:stream") {
        return None;
    }
    let end = data[pos..].find('>')?;
    Some(pos + end + 1)
}

impl XmlFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget buffered data and the cached stream header. Called when the
    /// stream restarts and when the connection goes away.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stream_start = None;
    }

    /// Whether a stream header has been seen since the last reset.
    pub fn is_stream_open(&self) -> bool {
        self.stream_start.is_some()
    }

    /// Number of bytes waiting for more data.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed a chunk of text and return everything which became complete.
    pub fn feed(&mut self, chunk: &str) -> Vec<FramerEvent> {
        let mut events = Vec::new();

        if chunk.trim().is_empty() {
            // Whitespace between elements is a keep-alive; inside a partial
            // element it may be character data and must be kept.
            if !self.buffer.trim().is_empty() {
                self.buffer.push_str(chunk);
            } else {
                self.buffer.clear();
            }
            events.push(FramerEvent::Ping);
            return events;
        }

        self.buffer.push_str(chunk);

        let new_start = find_stream_start(&self.buffer);
        let mut document = match (new_start, &self.stream_start) {
            (Some(_), _) => self.buffer.clone(),
            (None, Some(start)) => format!("{}{}", start, self.buffer),
            // Nothing to wrap the data in, wait for a header.
            (None, None) => return events,
        };
        let has_end = self.buffer.trim_end().ends_with(STREAM_END);
        if !has_end {
            document.push_str(STREAM_END);
        }

        let root: Element = match document.parse() {
            Ok(root) => root,
            Err(e) => {
                log::trace!("Waiting for more data ({} bytes buffered): {}", self.buffer.len(), e);
                return events;
            }
        };

        log::trace!("RECV {}", self.buffer);
        if let Some(len) = new_start {
            self.stream_start = Some(self.buffer[..len].to_owned());
            events.push(FramerEvent::StreamOpen(StreamHeader::from_element(&root)));
        }
        self.buffer.clear();

        events.extend(root.children().cloned().map(FramerEvent::Element));
        if has_end {
            events.push(FramerEvent::StreamClose);
        }
        events
    }
}

/// Turns the bytes read from a transport into text, holding back a
/// multi-byte character split across two reads.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode `bytes` after whatever was held back.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> Result<String, std::io::Error> {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => {
                self.pending.clear();
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
            }
        };
        let tail = self.pending.split_off(valid);
        let text = std::mem::replace(&mut self.pending, tail);
        // Validated above.
        String::from_utf8(text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s1' version='1.0'>";

    fn transcript() -> String {
        format!(
            "{}<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features><message to='juliet@example.com'><body>Wherefore art thou?</body></message><presence/>{}",
            HEADER, STREAM_END
        )
    }

    fn element_names(events: &[FramerEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                FramerEvent::Ping => String::from("ping"),
                FramerEvent::StreamOpen(_) => String::from("open"),
                FramerEvent::Element(elem) => elem.name().to_owned(),
                FramerEvent::StreamClose => String::from("close"),
            })
            .collect()
    }

    #[test]
    fn whole_transcript() {
        let mut framer = XmlFramer::new();
        let events = framer.feed(&transcript());
        assert_eq!(
            element_names(&events),
            ["open", "features", "message", "presence", "close"]
        );
        match &events[0] {
            FramerEvent::StreamOpen(header) => {
                assert_eq!(header.from.as_deref(), Some("example.com"));
                assert_eq!(header.id.as_deref(), Some("s1"));
                assert_eq!(header.version.as_deref(), Some("1.0"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn any_split_yields_the_same_elements() {
        let transcript = transcript();
        let expected = element_names(&XmlFramer::new().feed(&transcript));

        for chunk_size in [1, 2, 3, 7, 13, 64] {
            let mut framer = XmlFramer::new();
            let mut events = Vec::new();
            let chars: Vec<char> = transcript.chars().collect();
            for chunk in chars.chunks(chunk_size) {
                let chunk: String = chunk.iter().collect();
                events.extend(framer.feed(&chunk));
            }
            // Single-space chunks may produce pings, these are not content.
            events.retain(|e| *e != FramerEvent::Ping);
            assert_eq!(element_names(&events), expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn whitespace_is_a_ping() {
        let mut framer = XmlFramer::new();
        framer.feed(HEADER);
        assert_eq!(framer.feed(" "), [FramerEvent::Ping]);
        assert_eq!(framer.feed(""), [FramerEvent::Ping]);
        assert_eq!(framer.feed("\n\t "), [FramerEvent::Ping]);
        assert_eq!(framer.buffered_len(), 0);
        let events = framer.feed("<presence/>");
        assert_eq!(element_names(&events), ["presence"]);
    }

    #[test]
    fn whitespace_inside_element_is_kept() {
        let mut framer = XmlFramer::new();
        framer.feed(HEADER);
        assert!(framer.feed("<message><body>a").is_empty());
        assert_eq!(framer.feed(" "), [FramerEvent::Ping]);
        let events = framer.feed("b</body></message>");
        let FramerEvent::Element(message) = &events[0] else {
            panic!("expected message");
        };
        let body = message.get_child("body", "jabber:client").unwrap();
        assert_eq!(body.text(), "a b");
    }

    #[test]
    fn data_before_header_waits() {
        let mut framer = XmlFramer::new();
        assert!(framer.feed(&HEADER[..32]).is_empty());
        assert!(!framer.is_stream_open());
        let events = framer.feed(&HEADER[32..]);
        assert_eq!(element_names(&events), ["open"]);
        assert!(framer.is_stream_open());
    }

    #[test]
    fn restarted_stream_after_reset() {
        let mut framer = XmlFramer::new();
        framer.feed(HEADER);
        framer.reset();
        assert!(!framer.is_stream_open());
        let events = framer.feed(&format!("{}<stream:features/>", HEADER));
        assert_eq!(element_names(&events), ["open", "features"]);
    }

    #[test]
    fn close_alone() {
        let mut framer = XmlFramer::new();
        framer.feed(HEADER);
        assert_eq!(framer.feed(STREAM_END), [FramerEvent::StreamClose]);
    }

    #[test]
    fn split_multibyte_character() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "<body>Schäfer</body>".as_bytes();
        let split = "<body>Sch".len() + 1;
        assert_eq!(decoder.decode(&bytes[..split]).unwrap(), "<body>Sch");
        assert_eq!(decoder.decode(&bytes[split..]).unwrap(), "äfer</body>");
        assert!(decoder.decode(&[0xff, b'a']).is_err());
    }
}
