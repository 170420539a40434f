//! Resource binding and legacy session establishment IQs.

use rand::{distributions::Alphanumeric, thread_rng, Rng};

use crate::error::ProtocolError;
use crate::jid::FullJid;
use crate::minidom::Element;
use crate::ns;

pub(crate) const BIND_REQ_ID: &str = "bind_1";
pub(crate) const SESSION_REQ_ID: &str = "session_1";

/// Random alphanumeric string, used for resources and their suffixes.
pub(crate) fn random_suffix(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Pick the resource to request: the configured one, or the prefix with a
/// random suffix so two clients with the same prefix do not collide, or
/// nothing to let the server choose.
pub(crate) fn requested_resource(explicit: Option<&str>, prefix: Option<&str>) -> Option<String> {
    match (explicit, prefix) {
        (Some(resource), _) => Some(resource.to_owned()),
        (None, Some(prefix)) => Some(format!("{}.{}", prefix, random_suffix(8))),
        (None, None) => None,
    }
}

pub(crate) fn bind_request(resource: Option<&str>) -> Element {
    let mut bind = Element::builder("bind", ns::BIND);
    if let Some(resource) = resource {
        bind = bind.append(
            Element::builder("resource", ns::BIND)
                .append(resource.to_owned())
                .build(),
        );
    }
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "set")
        .attr("id", BIND_REQ_ID)
        .append(bind.build())
        .build()
}

pub(crate) fn session_request() -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "set")
        .attr("id", SESSION_REQ_ID)
        .append(Element::builder("session", ns::SESSION).build())
        .build()
}

/// Whether `elem` is the IQ answering the request with `id`.
pub(crate) fn is_response_to(elem: &Element, id: &str) -> bool {
    elem.name() == "iq"
        && elem.attr("id") == Some(id)
        && matches!(elem.attr("type"), Some("result") | Some("error"))
}

pub(crate) fn parse_bind_response(iq: &Element) -> Result<FullJid, ProtocolError> {
    if iq.attr("type") != Some("result") {
        return Err(ProtocolError::InvalidBindResponse);
    }
    let jid = iq
        .get_child("bind", ns::BIND)
        .and_then(|bind| bind.get_child("jid", ns::BIND))
        .ok_or(ProtocolError::InvalidBindResponse)?
        .text();
    FullJid::new(jid.trim()).map_err(|_| ProtocolError::InvalidBindResponse)
}
