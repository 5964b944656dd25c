//! Streaming reader for OAI-PMH response documents.
//!
//! One pass over the document collects protocol errors, ListRecords entries,
//! ListSets entries, the Identify block and the resumption token. The element
//! inside `<metadata>` is re-serialized verbatim so downstream stages see the
//! record exactly as the repository sent it.

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::protocol::OaiErrorCode;
use crate::{FaultKind, OaiError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: OaiErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MetadataNode {
    /// No `<metadata>` element at all.
    #[default]
    Absent,
    /// `<metadata>` present but without a child element.
    Empty,
    Xml(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub has_header: bool,
    pub identifier: Option<String>,
    pub datestamp: Option<String>,
    pub set_specs: Vec<String>,
    pub deleted: bool,
    pub metadata: MetadataNode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryIdentity {
    pub repository_name: String,
    pub base_url: String,
    pub protocol_version: String,
    pub earliest_datestamp: Option<String>,
    pub deleted_record: Option<String>,
    pub granularity: Option<String>,
    pub admin_emails: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OaiSet {
    pub spec: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OaiResponse {
    pub errors: Vec<ProtocolError>,
    pub records: Vec<RawRecord>,
    pub sets: Vec<OaiSet>,
    pub identity: Option<RepositoryIdentity>,
    pub resumption_token: Option<String>,
}

impl OaiResponse {
    pub fn protocol_fault(&self) -> Option<OaiError> {
        self.errors.first().map(|err| {
            OaiError::new(FaultKind::Protocol(err.code.clone()), err.message.clone())
        })
    }
}

pub fn parse_response(xml: &str) -> Result<OaiResponse, OaiError> {
    let mut reader = Reader::from_str(xml);
    let mut parser = ResponseParser::default();

    loop {
        let event = reader.read_event().map_err(|err| {
            malformed(format!("at byte {}: {err}", reader.buffer_position()))
        })?;
        if parser.capture(&event)? {
            continue;
        }
        match event {
            Event::Start(e) => parser.open(&e, false)?,
            Event::Empty(e) => parser.open(&e, true)?,
            Event::End(_) => parser.close()?,
            Event::Text(e) => {
                let text = e.unescape().map_err(|err| malformed(err.to_string()))?;
                parser.text.push_str(&text);
            }
            Event::CData(e) => parser.text.push_str(&String::from_utf8_lossy(&e)),
            Event::Eof => break,
            _ => {}
        }
    }

    parser.finish()
}

fn malformed(message: impl Into<String>) -> OaiError {
    OaiError::new(FaultKind::MalformedResponse, message)
}

struct Capture {
    writer: Writer<Vec<u8>>,
    depth: usize,
    has_element: bool,
}

impl Capture {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
            depth: 0,
            has_element: false,
        }
    }

    fn finish(self) -> Result<MetadataNode, OaiError> {
        if !self.has_element {
            return Ok(MetadataNode::Empty);
        }
        let xml = String::from_utf8(self.writer.into_inner())
            .map_err(|err| malformed(err.to_string()))?;
        Ok(MetadataNode::Xml(xml.trim().to_string()))
    }
}

#[derive(Default)]
struct ResponseParser {
    response: OaiResponse,
    path: Vec<String>,
    text: String,
    saw_root: bool,
    error_code: Option<OaiErrorCode>,
    record: Option<RawRecord>,
    set: Option<OaiSet>,
    identity: Option<RepositoryIdentity>,
    capture: Option<Capture>,
}

impl ResponseParser {
    /// Feeds `event` to an open `<metadata>` capture; `true` when consumed.
    fn capture(&mut self, event: &Event<'_>) -> Result<bool, OaiError> {
        let Some(cap) = self.capture.as_mut() else {
            return Ok(false);
        };
        match event {
            Event::End(_) if cap.depth == 0 => {
                let node = self.capture.take().map(Capture::finish).transpose()?;
                if let (Some(record), Some(node)) = (self.record.as_mut(), node) {
                    record.metadata = node;
                }
                self.path.pop();
                return Ok(true);
            }
            Event::Start(_) => {
                cap.depth += 1;
                cap.has_element = true;
            }
            Event::Empty(_) => cap.has_element = true,
            Event::End(_) => cap.depth -= 1,
            Event::Eof => return Err(malformed("document ends inside <metadata>")),
            _ => {}
        }
        cap.writer
            .write_event(event.clone())
            .map_err(|err| malformed(err.to_string()))?;
        Ok(true)
    }

    fn open(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<(), OaiError> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        self.text.clear();

        match (self.path.last().map(String::as_str), name.as_str()) {
            (None, "OAI-PMH") => self.saw_root = true,
            (None, other) => {
                return Err(malformed(format!("unexpected root element <{other}>")));
            }
            (Some("OAI-PMH"), "error") => {
                self.error_code = Some(OaiErrorCode::parse(
                    &attribute(e, "code").unwrap_or_default(),
                ));
            }
            (Some("OAI-PMH"), "Identify") => self.identity = Some(RepositoryIdentity::default()),
            (Some("ListRecords"), "record") => self.record = Some(RawRecord::default()),
            (Some("record"), "header") => {
                if let Some(record) = self.record.as_mut() {
                    record.has_header = true;
                    record.deleted = attribute(e, "status").is_some_and(|s| s == "deleted");
                }
            }
            (Some("record"), "metadata") => {
                if empty {
                    if let Some(record) = self.record.as_mut() {
                        record.metadata = MetadataNode::Empty;
                    }
                } else {
                    self.capture = Some(Capture::new());
                }
            }
            (Some("ListSets"), "set") => self.set = Some(OaiSet::default()),
            _ => {}
        }

        self.path.push(name);
        if empty {
            self.close()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), OaiError> {
        let Some(name) = self.path.pop() else {
            return Err(malformed("unbalanced end tag"));
        };
        let value = std::mem::take(&mut self.text).trim().to_string();

        match (self.path.last().map(String::as_str), name.as_str()) {
            (Some("OAI-PMH"), "error") => {
                let code = self
                    .error_code
                    .take()
                    .unwrap_or_else(|| OaiErrorCode::Other(String::new()));
                self.response.errors.push(ProtocolError {
                    code,
                    message: value,
                });
            }
            (Some("header"), field) => {
                if let Some(record) = self.record.as_mut() {
                    match field {
                        "identifier" => record.identifier = Some(value),
                        "datestamp" => record.datestamp = Some(value),
                        "setSpec" => record.set_specs.push(value),
                        _ => {}
                    }
                }
            }
            (Some("ListRecords"), "record") => {
                if let Some(record) = self.record.take() {
                    self.response.records.push(record);
                }
            }
            (Some("ListRecords" | "ListSets"), "resumptionToken") => {
                self.response.resumption_token = Some(value).filter(|v| !v.is_empty());
            }
            (Some("set"), field) => {
                if let Some(set) = self.set.as_mut() {
                    match field {
                        "setSpec" => set.spec = value,
                        "setName" => set.name = value,
                        _ => {}
                    }
                }
            }
            (Some("ListSets"), "set") => {
                if let Some(set) = self.set.take() {
                    self.response.sets.push(set);
                }
            }
            (Some("Identify"), field) => {
                if let Some(identity) = self.identity.as_mut() {
                    match field {
                        "repositoryName" => identity.repository_name = value,
                        "baseURL" => identity.base_url = value,
                        "protocolVersion" => identity.protocol_version = value,
                        "earliestDatestamp" => identity.earliest_datestamp = Some(value),
                        "deletedRecord" => identity.deleted_record = Some(value),
                        "granularity" => identity.granularity = Some(value),
                        "adminEmail" => identity.admin_emails.push(value),
                        _ => {}
                    }
                }
            }
            (Some("OAI-PMH"), "Identify") => self.response.identity = self.identity.take(),
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<OaiResponse, OaiError> {
        if !self.saw_root {
            return Err(malformed("no OAI-PMH element in response"));
        }
        if !self.path.is_empty() {
            return Err(malformed(format!(
                "document truncated inside <{}>",
                self.path.join("/")
            )));
        }
        Ok(self.response)
    }
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == key.as_bytes())
        .map(|attr| match attr.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        })
}
