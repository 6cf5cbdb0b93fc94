//! XML envelope codec for work items.
//!
//! The envelope is a self-describing document:
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <TransportMessage xmlns:xsi="..." xmlns:xsd="...">
//!   <CorrelationId>abc</CorrelationId>
//!   <Recoverable>true</Recoverable>
//!   <MessageIntent>Send</MessageIntent>
//!   <ReplyToAddress>replies@SALES</ReplyToAddress>
//!   <Body isBase64="true"><![CDATA[//4=]]></Body>
//!   <Headers>
//!     <item><key><string>k</string></key><value><string>v</string></value></item>
//!   </Headers>
//! </TransportMessage>
//! ```
//!
//! Bodies are written as literal CDATA text when they are UTF-8 made only of
//! legal XML characters, and as base64 flagged with `isBase64="true"`
//! otherwise. Literal text is also avoided for bodies that a conforming XML
//! reader would not hand back byte-for-byte: a leading BOM, carriage returns,
//! or the `]]>` CDATA terminator.
//!
//! Decoding never panics on hostile input. Every structural problem is a
//! [`CodecError`], which the queue handle turns into a poison classification.

use crate::error::CodecError;
use crate::message::{
    Address, Headers, MessageIntent, RawMessage, SendOptions, TransportMessage,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

const ROOT: &str = "TransportMessage";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

// ============================================================================
// Encoding
// ============================================================================

/// Encode a work item into envelope bytes.
///
/// # Arguments
///
/// * `message` - The work item to encode
/// * `options` - Send options; a reply-to address here wins over the item's own
pub fn encode(message: &TransportMessage, options: &SendOptions) -> Result<Bytes, CodecError> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut root = BytesStart::new(ROOT);
    root.push_attribute(("xmlns:xsi", XSI_NAMESPACE));
    root.push_attribute(("xmlns:xsd", XSD_NAMESPACE));
    writer.write_event(Event::Start(root))?;

    if let Some(correlation_id) = message.correlation_id.as_deref() {
        write_text_element(&mut writer, "CorrelationId", correlation_id)?;
    }
    write_text_element(
        &mut writer,
        "Recoverable",
        if message.recoverable { "true" } else { "false" },
    )?;
    write_text_element(&mut writer, "MessageIntent", message.message_intent.as_str())?;

    let reply_to = options
        .reply_to_address
        .as_ref()
        .or(message.reply_to_address.as_ref());
    if let Some(address) = reply_to {
        write_text_element(&mut writer, "ReplyToAddress", &address.to_string())?;
    }

    write_body(&mut writer, &message.body)?;
    write_headers(&mut writer, &message.headers)?;

    writer.write_event(Event::End(BytesEnd::new(ROOT)))?;
    Ok(Bytes::from(writer.into_inner()))
}

/// True for code points allowed by the XML 1.0 `Char` production
pub fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

/// Returns the body as literal text when it survives a CDATA round trip.
fn literal_body(body: &[u8]) -> Option<&str> {
    if body.starts_with(UTF8_BOM) {
        return None;
    }
    let text = std::str::from_utf8(body).ok()?;
    (is_literal_text(text) && !text.contains("]]>")).then_some(text)
}

/// True when a reader hands the text back unchanged
fn is_literal_text(text: &str) -> bool {
    text.chars().all(|c| is_xml_char(c) && c != '\r')
}

fn write_body(writer: &mut Writer<Vec<u8>>, body: &[u8]) -> Result<(), CodecError> {
    let mut start = BytesStart::new("Body");
    match literal_body(body) {
        Some(text) => {
            writer.write_event(Event::Start(start))?;
            writer.write_event(Event::CData(BytesCData::new(text)))?;
        }
        None => {
            start.push_attribute(("isBase64", "true"));
            writer.write_event(Event::Start(start))?;
            let encoded = STANDARD.encode(body);
            writer.write_event(Event::CData(BytesCData::new(encoded.as_str())))?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("Body")))?;
    Ok(())
}

/// Headers are written as text, so keys and values must be XML-legal and
/// free of carriage returns, which readers normalise away.
fn write_headers(writer: &mut Writer<Vec<u8>>, headers: &Headers) -> Result<(), CodecError> {
    writer.write_event(Event::Start(BytesStart::new("Headers")))?;
    for (key, value) in headers.iter() {
        if !is_literal_text(key) || !is_literal_text(value) {
            return Err(CodecError::IllegalHeaderText {
                key: key.escape_debug().to_string(),
            });
        }
        writer.write_event(Event::Start(BytesStart::new("item")))?;
        write_string_wrapper(writer, "key", key)?;
        write_string_wrapper(writer, "value", value)?;
        writer.write_event(Event::End(BytesEnd::new("item")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("Headers")))?;
    Ok(())
}

fn write_string_wrapper(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    value: &str,
) -> Result<(), CodecError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    write_text_element(writer, "string", value)?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    value: &str,
) -> Result<(), CodecError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a raw broker message into a work item.
///
/// # Errors
///
/// Returns a [`CodecError`] for any envelope that is not well formed or whose
/// fields cannot be parsed. Callers treat such payloads as poison.
pub fn decode(raw: &RawMessage) -> Result<TransportMessage, CodecError> {
    let id = format_message_id(&raw.message_id).ok_or(CodecError::MissingMessageId)?;

    let xml = std::str::from_utf8(&raw.payload).map_err(|_| CodecError::InvalidUtf8)?;
    let xml = xml.strip_prefix('\u{feff}').unwrap_or(xml);
    let fields = parse_envelope(xml)?;

    let body = match fields.body {
        None => Bytes::new(),
        Some(text) if fields.body_is_base64 => {
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            let decoded = STANDARD
                .decode(compact)
                .map_err(|e| CodecError::InvalidBase64 {
                    message: e.to_string(),
                })?;
            Bytes::from(decoded)
        }
        Some(text) => {
            let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
            Bytes::copy_from_slice(text.as_bytes())
        }
    };

    let message_intent = match fields.intent.as_deref().map(str::trim) {
        None | Some("") => MessageIntent::default(),
        Some(tag) => tag
            .parse()
            .map_err(|_| CodecError::UnknownMessageIntent {
                value: tag.to_string(),
            })?,
    };

    let recoverable = match fields.recoverable.as_deref().map(str::trim) {
        None => true,
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(other) => {
            return Err(CodecError::InvalidRecoverable {
                value: other.to_string(),
            })
        }
    };

    let reply_to_address = match non_blank(fields.reply_to) {
        None => None,
        Some(text) => Some(
            text.parse::<Address>()
                .map_err(|_| CodecError::InvalidAddress { value: text })?,
        ),
    };

    Ok(TransportMessage {
        id,
        headers: fields.headers,
        body,
        correlation_id: fields
            .correlation_id
            .filter(|id| !id.is_empty())
            .or_else(|| raw.correlation_id.clone()),
        message_intent,
        reply_to_address,
        recoverable,
    })
}

/// Render a broker message id.
///
/// Sixteen-byte ids are GUIDs stored in little-endian field order; any other
/// length is rendered as hex. Returns `None` for an empty id.
pub fn format_message_id(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    match <[u8; 16]>::try_from(bytes) {
        Ok(guid) => Some(uuid::Uuid::from_bytes_le(guid).to_string()),
        Err(_) => Some(hex::encode(bytes)),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Envelope fields as raw text, before interpretation
#[derive(Default)]
struct EnvelopeFields {
    seen_root: bool,
    correlation_id: Option<String>,
    recoverable: Option<String>,
    intent: Option<String>,
    reply_to: Option<String>,
    body: Option<String>,
    body_is_base64: bool,
    headers: Headers,
}

/// Header item under construction
#[derive(Default)]
struct HeaderItem {
    last_string: Option<String>,
    key: Option<String>,
    value: Option<String>,
}

/// Character content of the element being read.
///
/// CDATA sections are also kept apart so a body can ignore the indentation
/// around them.
#[derive(Default)]
struct ElementText {
    text: String,
    cdata: Option<String>,
}

impl ElementText {
    fn clear(&mut self) {
        self.text.clear();
        self.cdata = None;
    }

    fn push_cdata(&mut self, content: &str) {
        self.text.push_str(content);
        self.cdata.get_or_insert_with(String::new).push_str(content);
    }
}

fn parse_envelope(xml: &str) -> Result<EnvelopeFields, CodecError> {
    let mut reader = Reader::from_str(xml);
    let mut fields = EnvelopeFields::default();
    let mut item = HeaderItem::default();
    let mut path: Vec<String> = Vec::new();
    let mut text = ElementText::default();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = element_name(&e)?;
                open_element(&path, &name, &e, &mut fields)?;
                path.push(name);
                text.clear();
            }
            Event::Empty(e) => {
                let name = element_name(&e)?;
                open_element(&path, &name, &e, &mut fields)?;
                path.push(name);
                text.clear();
                close_element(&mut path, &mut text, &mut item, &mut fields)?;
            }
            Event::Text(t) => text.text.push_str(&t.unescape()?),
            Event::CData(c) => {
                let inner = c.into_inner();
                text.push_cdata(std::str::from_utf8(&inner).map_err(|_| CodecError::InvalidUtf8)?);
            }
            Event::End(_) => close_element(&mut path, &mut text, &mut item, &mut fields)?,
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = path.pop() {
        return Err(CodecError::Truncated { element: open });
    }
    if !fields.seen_root {
        return Err(CodecError::Truncated {
            element: ROOT.to_string(),
        });
    }
    Ok(fields)
}

fn element_name(start: &BytesStart) -> Result<String, CodecError> {
    let local = start.local_name();
    std::str::from_utf8(local.as_ref())
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidUtf8)
}

fn open_element(
    path: &[String],
    name: &str,
    start: &BytesStart,
    fields: &mut EnvelopeFields,
) -> Result<(), CodecError> {
    if path.is_empty() {
        if fields.seen_root {
            return Err(CodecError::Xml {
                message: format!("unexpected second root element '{}'", name),
            });
        }
        if name != ROOT {
            return Err(CodecError::UnexpectedRoot {
                found: name.to_string(),
            });
        }
        fields.seen_root = true;
    } else if path.len() == 1 && name == "Body" {
        let flag = start
            .try_get_attribute("isBase64")
            .map_err(|e| CodecError::Xml {
                message: e.to_string(),
            })?;
        fields.body_is_base64 = match flag {
            Some(attribute) => attribute
                .unescape_value()?
                .trim()
                .eq_ignore_ascii_case("true"),
            None => false,
        };
    }
    Ok(())
}

fn close_element(
    path: &mut Vec<String>,
    text: &mut ElementText,
    item: &mut HeaderItem,
    fields: &mut EnvelopeFields,
) -> Result<(), CodecError> {
    let Some(name) = path.pop() else {
        return Ok(());
    };
    let ElementText { text: value, cdata } = std::mem::take(text);
    let parents: Vec<&str> = path.iter().map(String::as_str).collect();

    match (parents.as_slice(), name.as_str()) {
        ([ROOT], "CorrelationId") => fields.correlation_id = Some(value),
        ([ROOT], "Recoverable") => fields.recoverable = Some(value),
        ([ROOT], "MessageIntent") => fields.intent = Some(value),
        ([ROOT], "ReplyToAddress") => fields.reply_to = Some(value),
        ([ROOT], "Body") => fields.body = Some(cdata.unwrap_or(value)),
        ([ROOT, "Headers", "item", _], "string") => item.last_string = Some(value),
        ([ROOT, "Headers", "item"], "key") => {
            item.key = Some(item.last_string.take().unwrap_or(value));
        }
        ([ROOT, "Headers", "item"], "value") => {
            item.value = Some(item.last_string.take().unwrap_or(value));
        }
        ([ROOT, "Headers"], "item") => {
            let HeaderItem { key, value, .. } = std::mem::take(item);
            let key = key.ok_or_else(|| CodecError::IncompleteHeader {
                part: "key".to_string(),
            })?;
            let value = value.ok_or_else(|| CodecError::IncompleteHeader {
                part: "value".to_string(),
            })?;
            if fields.headers.contains_key(&key) {
                return Err(CodecError::DuplicateHeader { key });
            }
            fields.headers.insert(key, value);
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
