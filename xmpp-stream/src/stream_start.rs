//! The `<stream:stream>` header, both directions.

use rand::{distributions::Alphanumeric, thread_rng, Rng};

use crate::minidom::Element;
use crate::ns;

/// Attributes of a stream header, as sent or received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// Default namespace of the stream, `jabber:client` or `jabber:server`.
    pub ns: String,
    /// `from` attribute.
    pub from: Option<String>,
    /// `to` attribute.
    pub to: Option<String>,
    /// Stream id, set by the receiving entity.
    pub id: Option<String>,
    /// Protocol version, `1.0` for any stream with features.
    pub version: Option<String>,
    /// Default language of the stream.
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Header of a stream a client opens towards `domain`.
    pub fn client(domain: &str) -> Self {
        StreamHeader {
            ns: String::from(ns::JABBER_CLIENT),
            to: Some(domain.to_owned()),
            version: Some(String::from("1.0")),
            ..Default::default()
        }
    }

    /// Header of the stream a server sends back, with a fresh stream id.
    pub fn server_reply(domain: &str) -> Self {
        StreamHeader {
            ns: String::from(ns::JABBER_CLIENT),
            from: Some(domain.to_owned()),
            id: Some(make_stream_id()),
            version: Some(String::from("1.0")),
            ..Default::default()
        }
    }

    /// Extract the header from the root element the framer parsed.
    pub fn from_element(root: &Element) -> Self {
        let attr = |name: &str| root.attr(name).map(str::to_owned);
        StreamHeader {
            ns: root.ns(),
            from: attr("from"),
            to: attr("to"),
            id: attr("id"),
            version: attr("version"),
            lang: attr("xml:lang"),
        }
    }

    /// Serialise as the opening of a stream, including the XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}'",
            escape(&self.ns),
            ns::STREAM
        );
        let attrs = [
            ("from", &self.from),
            ("to", &self.to),
            ("id", &self.id),
            ("version", &self.version),
            ("xml:lang", &self.lang),
        ];
        for (name, value) in attrs {
            if let Some(value) = value {
                out.push_str(&format!(" {}='{}'", name, escape(value)));
            }
        }
        out.push('>');
        out
    }
}

/// Closing tag of a stream.
pub const STREAM_END: &str = "</stream:stream>";

fn make_stream_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_header_text() {
        assert_eq!(
            StreamHeader::client("example.com").to_xml(),
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>"
        );
    }

    #[test]
    fn header_survives_parsing() {
        let header = StreamHeader::server_reply("example.com");
        let text = format!("{}{}", header.to_xml(), STREAM_END);
        let root: Element = text.parse().unwrap();
        assert_eq!(StreamHeader::from_element(&root), header);
        assert_eq!(header.id.as_ref().map(String::len), Some(16));
    }

    #[test]
    fn attribute_values_are_escaped() {
        let header = StreamHeader {
            ns: String::from(ns::JABBER_CLIENT),
            to: Some(String::from("a'b<c")),
            ..Default::default()
        };
        assert!(header.to_xml().contains("to='a&apos;b&lt;c'"));
    }
}
