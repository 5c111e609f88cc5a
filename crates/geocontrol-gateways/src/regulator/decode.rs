// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Response decoding.
//!
//! The regulator answers with a SOAP envelope whose
//! `AtenderMensajeRNDCResponse/return` carries the reply, either as an
//! element tree or as escaped text (sometimes escaped twice). The reply's
//! root children decide the outcome:
//!
//! | Child | Outcome |
//! |-------|---------|
//! | `errormsg` | [`DecodeError::Rejected`] |
//! | `ingresoid` | [`Reply::Confirmation`] |
//! | `documento` | [`Reply::Manifests`] |
//! | anything else | [`Reply::Data`] |
//!
//! Replies the parser cannot read are scanned for an `errormsg` before
//! giving up.

use once_cell::sync::Lazy;
use regex::Regex;
use roxmltree::{Document, Node};
use tracing::{debug, warn};

use super::datetime::RegulatorClock;
use super::payload::{ControlPointDocument, ManifestDocument};
use crate::error::DecodeError;

static ERROR_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<errormsg>(.*?)</errormsg>").expect("error message pattern is valid")
});

static XML_DECLARATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<\?xml.*?\?>").expect("declaration pattern is valid"));

/// A successfully decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The regulator accepted a submission and assigned this id.
    Confirmation(String),
    /// Manifest listing; may be empty.
    Manifests(Vec<ManifestDocument>),
    /// Any other well-formed reply.
    Data,
}

/// Decode a raw SOAP response body.
pub fn decode(body: &str, clock: &RegulatorClock) -> Result<Reply, DecodeError> {
    let envelope = match Document::parse(body) {
        Ok(doc) => doc,
        Err(e) => return Err(salvage(body, &format!("invalid envelope: {e}"))),
    };

    let Some(soap_body) = envelope
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Body")
    else {
        return Err(salvage(body, "missing SOAP body"));
    };

    if let Some(fault) = soap_body
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "Fault")
    {
        let message = fault
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name() == "faultstring")
            .and_then(|n| n.text())
            .unwrap_or("unknown fault")
            .trim()
            .to_string();
        return Err(DecodeError::Fault(message));
    }

    let Some(ret) = soap_body
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "AtenderMensajeRNDCResponse")
        .and_then(|resp| {
            resp.children()
                .find(|n| n.is_element() && n.tag_name().name() == "return")
        })
    else {
        return Err(DecodeError::EmptyResponse);
    };

    if ret.children().any(|n| n.is_element()) {
        let container = ret
            .children()
            .filter(|n| n.is_element())
            .find(|n| n.tag_name().name().eq_ignore_ascii_case("root"))
            .unwrap_or(ret);
        return interpret(container, clock);
    }

    let text = ret.text().unwrap_or_default();
    decode_inner(text, clock)
}

fn decode_inner(text: &str, clock: &RegulatorClock) -> Result<Reply, DecodeError> {
    let text = if text.contains("&lt;") {
        unescape(text)
    } else {
        text.to_string()
    };
    let inner = XML_DECLARATION.replace(&text, "");
    let inner = inner.trim();

    if inner.is_empty() {
        return Err(DecodeError::EmptyResponse);
    }

    let lower = inner.to_ascii_lowercase();
    if lower.contains("</puntoscontrol>") && !lower.contains("<puntoscontrol>") {
        return Err(salvage(inner, "unbalanced puntoscontrol element"));
    }

    match Document::parse(inner) {
        Ok(doc) => interpret(doc.root_element(), clock),
        Err(e) => Err(salvage(inner, &format!("invalid reply: {e}"))),
    }
}

fn interpret(root: Node<'_, '_>, clock: &RegulatorClock) -> Result<Reply, DecodeError> {
    let children: Vec<Node<'_, '_>> = root.children().filter(|n| n.is_element()).collect();

    if let Some(error) = children.iter().find(|n| is_named(n, "errormsg")) {
        return Err(DecodeError::Rejected(node_text(error)));
    }

    if let Some(id) = children.iter().find(|n| is_named(n, "ingresoid")) {
        let id = node_text(id);
        if !id.is_empty() {
            return Ok(Reply::Confirmation(id));
        }
    }

    let documents: Vec<_> = children
        .iter()
        .filter(|n| is_named(n, "documento"))
        .collect();
    if !documents.is_empty() {
        let manifests = documents
            .into_iter()
            .filter_map(|doc| manifest_document(*doc, clock))
            .collect();
        return Ok(Reply::Manifests(manifests));
    }

    if is_named(&root, "documento") {
        return Ok(Reply::Manifests(
            manifest_document(root, clock).into_iter().collect(),
        ));
    }

    debug!(root = root.tag_name().name(), "Regulator reply carries data only");
    Ok(Reply::Data)
}

fn manifest_document(doc: Node<'_, '_>, clock: &RegulatorClock) -> Option<ManifestDocument> {
    let external_id = child_text(doc, "ingresoidmanifiesto").filter(|s| !s.is_empty());
    let plate = child_text(doc, "numplaca").filter(|s| !s.is_empty());

    let (Some(external_id), Some(plate)) = (external_id, plate) else {
        warn!("Skipping manifest document without id or plate");
        return None;
    };

    let points_parent = doc
        .children()
        .find(|n| is_named(n, "puntoscontrol"))
        .unwrap_or(doc);
    let control_points = points_parent
        .children()
        .filter(|n| is_named(n, "puntocontrol"))
        .filter_map(|p| control_point_document(p, &external_id, clock))
        .collect();

    Some(ManifestDocument {
        number: child_text(doc, "nummanifiestocarga").unwrap_or_default(),
        carrier_tax_id: child_text(doc, "numnitempresatransporte").unwrap_or_default(),
        plate: plate.to_uppercase(),
        issued_on: child_text(doc, "fechaexpedicionmanifiesto")
            .and_then(|d| clock.parse_date(&d)),
        external_id,
        control_points,
    })
}

fn control_point_document(
    node: Node<'_, '_>,
    manifest: &str,
    clock: &RegulatorClock,
) -> Option<ControlPointDocument> {
    let code = child_text(node, "codpuntocontrol").and_then(|c| c.parse::<i32>().ok());
    let latitude = child_text(node, "latitud").and_then(|v| parse_coordinate(&v));
    let longitude = child_text(node, "longitud").and_then(|v| parse_coordinate(&v));

    let (Some(code), Some(latitude), Some(longitude)) = (code, latitude, longitude) else {
        warn!(manifest, "Skipping control point with missing code or coordinates");
        return None;
    };

    let appointment = child_text(node, "fechacita")
        .and_then(|date| clock.appointment(&date, child_text(node, "horacita").as_deref()));

    Some(ControlPointDocument {
        code,
        municipality_code: child_text(node, "codmunicipio").filter(|s| !s.is_empty()),
        address: child_text(node, "direccion").filter(|s| !s.is_empty()),
        latitude,
        longitude,
        appointment,
        pact_minutes: child_text(node, "tiempopactado")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        adjusted: child_text(node, "ajuste").is_some_and(|v| v == "1"),
    })
}

fn parse_coordinate(raw: &str) -> Option<f64> {
    raw.replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn is_named(node: &Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name().eq_ignore_ascii_case(name)
}

fn node_text(node: &Node<'_, '_>) -> String {
    node.text().unwrap_or_default().trim().to_string()
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.children().find(|n| is_named(n, name)).map(|n| node_text(&n))
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Last resort for unreadable replies: surface an `errormsg` if present.
fn salvage(raw: &str, reason: &str) -> DecodeError {
    let unescaped = unescape(raw);
    match ERROR_MESSAGE.captures(&unescaped).and_then(|c| c.get(1)) {
        Some(m) => DecodeError::Rejected(m.as_str().trim().to_string()),
        None => DecodeError::Malformed(reason.to_string()),
    }
}
