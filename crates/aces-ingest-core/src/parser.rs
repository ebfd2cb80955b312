//! Pull-mode ACES reader.
//!
//! `AcesReader` walks the document with `quick_xml` and yields one fully materialised
//! `<App>` subtree per iteration. Only the subtree being built is held in memory; each
//! record is handed to the caller and dropped before the reader advances. Document-level
//! `<Header>` metadata is read eagerly when the reader is opened and `<Footer>` metadata
//! becomes available once the iterator is exhausted.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Read};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};

use crate::model::{coerce, DocumentFooter, DocumentHeader};
use crate::schema_map::header_field;
use crate::tree::XmlNode;

const ROOT_ELEMENT: &str = "ACES";
const APP_ELEMENT: &str = "App";
const HEADER_ELEMENT: &str = "Header";
const FOOTER_ELEMENT: &str = "Footer";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("malformed ACES document at byte {offset}: {message}")]
    Fatal { offset: u64, message: String },
    #[error("invalid <App> at byte {offset}: {reason}")]
    Record { offset: u64, app_id: Option<i64>, reason: String },
}

/// One `<App>` element and where it started in the input.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AppRecord {
    pub app_id: i64,
    pub byte_offset: u64,
    pub node: XmlNode,
}

enum Owned {
    Start(XmlNode),
    Empty(XmlNode),
    End(String),
    Text(String),
    Eof,
    Skip,
}

struct TopLevelApp {
    node: XmlNode,
    offset: u64,
    self_closing: bool,
}

pub struct AcesReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    header: DocumentHeader,
    footer: Option<DocumentFooter>,
    skipped_elements: BTreeMap<String, u64>,
    pending: Option<TopLevelApp>,
    apps_seen: u64,
    finished: bool,
}

impl<R: BufRead> AcesReader<R> {
    /// Open a document: consume the prolog, the `<ACES>` root tag, and the `<Header>`.
    ///
    /// # Errors
    /// Returns [`ParseError::Fatal`] when the document is malformed before the first
    /// application or the root element is not `ACES`.
    pub fn new(input: R) -> Result<Self, ParseError> {
        let mut this = Self {
            reader: Reader::from_reader(input),
            buf: Vec::with_capacity(8 * 1024),
            header: DocumentHeader::default(),
            footer: None,
            skipped_elements: BTreeMap::new(),
            pending: None,
            apps_seen: 0,
            finished: false,
        };
        this.open_root()?;
        if !this.finished {
            this.pending = this.next_top_level_app()?;
        }
        Ok(this)
    }

    #[must_use]
    pub fn header(&self) -> &DocumentHeader {
        &self.header
    }

    /// Available after the iterator has returned `None`.
    #[must_use]
    pub fn footer(&self) -> Option<&DocumentFooter> {
        self.footer.as_ref()
    }

    /// Top-level elements other than `Header`, `App`, and `Footer`, counted by name.
    #[must_use]
    pub fn skipped_elements(&self) -> &BTreeMap<String, u64> {
        &self.skipped_elements
    }

    /// Number of `<App>` elements read so far, including invalid ones.
    #[must_use]
    pub fn apps_seen(&self) -> u64 {
        self.apps_seen
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        to_u64(self.reader.buffer_position())
    }

    #[must_use]
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    fn fatal(&self, message: impl Into<String>) -> ParseError {
        ParseError::Fatal { offset: self.position(), message: message.into() }
    }

    fn read_owned(&mut self) -> Result<Owned, ParseError> {
        self.buf.clear();
        let event = match self.reader.read_event_into(&mut self.buf) {
            Ok(event) => event,
            Err(err) => {
                return Err(ParseError::Fatal {
                    offset: to_u64(self.reader.buffer_position()),
                    message: err.to_string(),
                })
            }
        };
        let offset = to_u64(self.reader.buffer_position());

        let owned = match event {
            Event::Start(start) => Owned::Start(owned_element(&start, offset)?),
            Event::Empty(start) => Owned::Empty(owned_element(&start, offset)?),
            Event::End(end) => {
                Owned::End(String::from_utf8_lossy(end.local_name().as_ref()).into_owned())
            }
            Event::Text(text) => {
                let unescaped = text.unescape().map_err(|err| ParseError::Fatal {
                    offset,
                    message: format!("invalid character data: {err}"),
                })?;
                Owned::Text(unescaped.into_owned())
            }
            Event::CData(data) => {
                Owned::Text(String::from_utf8_lossy(&data.into_inner()).into_owned())
            }
            Event::Eof => Owned::Eof,
            Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => Owned::Skip,
        };
        Ok(owned)
    }

    fn open_root(&mut self) -> Result<(), ParseError> {
        loop {
            match self.read_owned()? {
                Owned::Start(node) if node.name == ROOT_ELEMENT => {
                    self.header.aces_version = node.attribute("version").map(str::to_string);
                    return Ok(());
                }
                Owned::Empty(node) if node.name == ROOT_ELEMENT => {
                    self.header.aces_version = node.attribute("version").map(str::to_string);
                    self.finished = true;
                    return Ok(());
                }
                Owned::Start(node) | Owned::Empty(node) => {
                    return Err(self.fatal(format!(
                        "expected <{ROOT_ELEMENT}> root element, found <{}>",
                        node.name
                    )));
                }
                Owned::Text(text) if text.trim().is_empty() => {}
                Owned::Text(_) => {
                    return Err(self.fatal("character data before the root element"));
                }
                Owned::End(name) => {
                    return Err(self.fatal(format!("unexpected closing tag </{name}>")));
                }
                Owned::Eof => {
                    return Err(self.fatal(format!("document has no <{ROOT_ELEMENT}> root element")));
                }
                Owned::Skip => {}
            }
        }
    }

    /// Advance through top-level content until the next `<App>` start or the root end.
    fn next_top_level_app(&mut self) -> Result<Option<TopLevelApp>, ParseError> {
        loop {
            let offset = Self::position(self);
            match self.read_owned()? {
                Owned::Start(node) if node.name == APP_ELEMENT => {
                    return Ok(Some(TopLevelApp { node, offset, self_closing: false }));
                }
                Owned::Empty(node) if node.name == APP_ELEMENT => {
                    return Ok(Some(TopLevelApp { node, offset, self_closing: true }));
                }
                Owned::Start(node) if node.name == HEADER_ELEMENT => {
                    let header = self.read_subtree(node)?;
                    self.absorb_header(&header);
                }
                Owned::Start(node) if node.name == FOOTER_ELEMENT => {
                    let footer = self.read_subtree(node)?;
                    self.footer = Some(footer_from_node(&footer));
                }
                Owned::Start(node) => {
                    self.skip_subtree(&node.name)?;
                    tracing::debug!(element = %node.name, "skipped top-level element");
                    *self.skipped_elements.entry(node.name).or_default() += 1;
                }
                Owned::Empty(node) => {
                    if node.name == FOOTER_ELEMENT {
                        self.footer = Some(DocumentFooter::default());
                    } else if node.name != HEADER_ELEMENT {
                        *self.skipped_elements.entry(node.name).or_default() += 1;
                    }
                }
                Owned::End(name) if name == ROOT_ELEMENT => {
                    self.finished = true;
                    return Ok(None);
                }
                Owned::End(name) => {
                    return Err(self.fatal(format!("unexpected closing tag </{name}>")));
                }
                Owned::Text(text) if text.trim().is_empty() => {}
                Owned::Text(_) => {
                    return Err(self.fatal("unexpected character data between records"));
                }
                Owned::Eof => {
                    return Err(self.fatal(format!(
                        "unexpected end of document: <{ROOT_ELEMENT}> was never closed"
                    )));
                }
                Owned::Skip => {}
            }
        }
    }

    /// Read the remainder of an element whose start tag has been consumed.
    /// Consume events up to the end of an element whose start was just read, keeping
    /// nothing but the nesting depth.
    fn skip_subtree(&mut self, name: &str) -> Result<(), ParseError> {
        let mut depth = 1_usize;
        while depth > 0 {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(_)) => depth += 1,
                Ok(Event::End(_)) => depth -= 1,
                Ok(Event::Eof) => {
                    return Err(self.fatal(format!("unexpected end of document inside <{name}>")));
                }
                Ok(_) => {}
                Err(err) => return Err(self.fatal(err.to_string())),
            }
        }
        Ok(())
    }

    fn read_subtree(&mut self, root: XmlNode) -> Result<XmlNode, ParseError> {
        let root_name = root.name.clone();
        let mut stack = vec![root];
        loop {
            match self.read_owned()? {
                Owned::Start(node) => stack.push(node),
                Owned::Empty(node) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.content.push(crate::tree::XmlContent::Element(node));
                    }
                }
                Owned::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.push_text(text);
                    }
                }
                Owned::End(_) => {
                    let Some(done) = stack.pop() else {
                        return Err(self.fatal("unbalanced closing tag"));
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.content.push(crate::tree::XmlContent::Element(done)),
                        None => return Ok(done),
                    }
                }
                Owned::Eof => {
                    return Err(self.fatal(format!(
                        "unexpected end of document inside <{root_name}>"
                    )));
                }
                Owned::Skip => {}
            }
        }
    }

    fn absorb_header(&mut self, node: &XmlNode) {
        for child in node.children() {
            let raw = if child.has_children() {
                child.children().map(XmlNode::text).collect::<Vec<_>>().join(",")
            } else {
                child.text()
            };
            if raw.is_empty() {
                continue;
            }
            match header_field(&child.name) {
                Some(field) => match coerce(field.kind, &raw) {
                    Ok(value) => {
                        self.header.fields.insert(field.key.to_string(), value.into_text());
                    }
                    Err(err) => {
                        tracing::warn!(element = %child.name, %err, "header value kept unmapped");
                        self.header.unmapped.insert(child.name.clone(), raw);
                    }
                },
                None => {
                    self.header.unmapped.insert(child.name.clone(), raw);
                }
            }
        }
    }

    fn complete_app(&mut self, start: TopLevelApp) -> Result<AppRecord, ParseError> {
        self.apps_seen += 1;
        let TopLevelApp { node, offset, self_closing } = start;
        let node = if self_closing { node } else { self.read_subtree(node)? };

        let app_id = match node.attribute("id") {
            None => {
                return Err(ParseError::Record {
                    offset,
                    app_id: None,
                    reason: "missing id attribute".to_string(),
                })
            }
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| ParseError::Record {
                offset,
                app_id: None,
                reason: format!("id `{raw}` is not an integer"),
            })?,
        };

        Ok(AppRecord { app_id, byte_offset: offset, node })
    }
}

impl<R: BufRead> Iterator for AcesReader<R> {
    type Item = Result<AppRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = match self.pending.take() {
            Some(start) => start,
            None if self.finished => return None,
            None => match self.next_top_level_app() {
                Ok(Some(start)) => start,
                Ok(None) => return None,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            },
        };

        let result = self.complete_app(start);
        if matches!(result, Err(ParseError::Fatal { .. })) {
            self.finished = true;
        }
        Some(result)
    }
}

fn owned_element(start: &BytesStart<'_>, offset: u64) -> Result<XmlNode, ParseError> {
    let mut node = XmlNode::new(String::from_utf8_lossy(start.local_name().as_ref()));
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|err| ParseError::Fatal {
            offset,
            message: format!("invalid attribute on <{}>: {err}", node.name),
        })?;
        let key = attribute.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }
        let name = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let value = attribute.unescape_value().map_err(|err| ParseError::Fatal {
            offset,
            message: format!("invalid value for attribute {name}: {err}"),
        })?;
        node.attributes.push((name, value.into_owned()));
    }
    Ok(node)
}

fn footer_from_node(node: &XmlNode) -> DocumentFooter {
    let record_count = node.children_named("RecordCount").next().and_then(|child| {
        let raw = child.text();
        let parsed = raw.parse::<u64>().ok();
        if parsed.is_none() {
            tracing::warn!(value = %raw, "footer RecordCount is not a number");
        }
        parsed
    });
    DocumentFooter { record_count }
}

fn to_u64<P: TryInto<u64>>(position: P) -> u64 {
    position.try_into().unwrap_or(u64::MAX)
}

/// Byte source that hashes everything read through it.
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, hasher: Sha256::new(), bytes: 0 }
    }

    /// Drain the rest of the input and return `(sha256 hex, total bytes)`.
    ///
    /// # Errors
    /// Returns an I/O error when the remaining input cannot be read.
    pub fn finish(mut self) -> io::Result<(String, u64)> {
        io::copy(&mut self, &mut io::sink())?;
        Ok((format!("{:x}", self.hasher.finalize()), self.bytes))
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.bytes += to_u64(read);
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn reader(xml: &str) -> AcesReader<Cursor<Vec<u8>>> {
        match AcesReader::new(Cursor::new(xml.as_bytes().to_vec())) {
            Ok(reader) => reader,
            Err(err) => panic!("fixture should open: {err}"),
        }
    }

    fn collect(xml: &str) -> Vec<Result<AppRecord, ParseError>> {
        reader(xml).collect()
    }

    const TWO_APPS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ACES version="4.2">
  <Header>
    <Company>Acme Parts</Company>
    <SenderName>Jo Doe</SenderName>
    <TransferDate>2024-05-01</TransferDate>
    <EffectiveDate>not-a-date</EffectiveDate>
    <ApprovedFor><Country>US</Country><Country>CA</Country></ApprovedFor>
    <Custom>kept</Custom>
  </Header>
  <App action="A" id="1"><BaseVehicle id="10"/><PartType id="5"/><Part>ABC-1</Part></App>
  <!-- comment between records -->
  <App action="A" id="2"><Note>install &amp; torque</Note><Note><![CDATA[<raw>]]></Note></App>
  <Footer><RecordCount>2</RecordCount></Footer>
</ACES>"#;

    #[test]
    fn yields_each_app_with_offsets_and_subtree() {
        let records = collect(TWO_APPS);
        assert_eq!(records.len(), 2);

        let Ok(first) = &records[0] else { panic!("first record should parse") };
        assert_eq!(first.app_id, 1);
        assert_eq!(first.node.name, "App");
        assert_eq!(first.node.children().count(), 3);
        assert!(TWO_APPS[usize::try_from(first.byte_offset).unwrap_or(0)..].starts_with("<App"));

        let Ok(second) = &records[1] else { panic!("second record should parse") };
        let notes = second.node.children_named("Note").map(XmlNode::text).collect::<Vec<_>>();
        assert_eq!(notes, vec!["install & torque", "<raw>"]);
        assert!(second.byte_offset > first.byte_offset);
    }

    #[test]
    fn header_and_footer_are_captured() {
        let mut aces = reader(TWO_APPS);
        assert_eq!(aces.header().aces_version.as_deref(), Some("4.2"));
        assert_eq!(aces.header().field("company"), Some("Acme Parts"));
        assert_eq!(aces.header().field("transfer_date"), Some("2024-05-01"));
        assert_eq!(aces.header().field("approved_for"), Some("US,CA"));
        assert_eq!(aces.header().field("effective_date"), None);
        assert_eq!(
            aces.header().unmapped.get("EffectiveDate").map(String::as_str),
            Some("not-a-date")
        );
        assert_eq!(aces.header().unmapped.get("Custom").map(String::as_str), Some("kept"));

        assert!(aces.footer().is_none());
        while aces.next().is_some() {}
        assert_eq!(aces.footer().and_then(|footer| footer.record_count), Some(2));
        assert_eq!(aces.apps_seen(), 2);
    }

    #[test]
    fn missing_id_is_a_record_error_and_reading_continues() {
        let xml = r#"<ACES><App action="A"><Part>X</Part></App><App id="9"/></ACES>"#;
        let records = collect(xml);
        assert_eq!(records.len(), 2);
        assert!(matches!(
            &records[0],
            Err(ParseError::Record { app_id: None, reason, .. }) if reason.contains("missing id")
        ));
        assert!(matches!(&records[1], Ok(record) if record.app_id == 9));
    }

    #[test]
    fn non_integer_id_is_a_record_error() {
        let records = collect(r#"<ACES><App id="abc"/></ACES>"#);
        assert!(matches!(
            &records[0],
            Err(ParseError::Record { reason, .. }) if reason.contains("not an integer")
        ));
    }

    #[test]
    fn truncated_app_is_fatal_and_stops_iteration() {
        let xml = r#"<ACES><App id="1"><Part>ABC</Part></App><App id="2"><Part>AB"#;
        let records = collect(xml);
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());
        assert!(matches!(&records[1], Err(ParseError::Fatal { .. })));
    }

    #[test]
    fn unclosed_root_is_fatal() {
        let records = collect(r#"<ACES><App id="1"/>"#);
        assert!(records[0].is_ok());
        assert!(matches!(&records[1], Err(ParseError::Fatal { message, .. }) if message.contains("never closed")));
    }

    #[test]
    fn mismatched_tags_are_fatal() {
        let records = collect(r#"<ACES><App id="1"><Part>X</Qty></App></ACES>"#);
        assert!(matches!(&records[0], Err(ParseError::Fatal { .. })));
    }

    #[test]
    fn wrong_root_is_rejected_on_open() {
        let result = AcesReader::new(Cursor::new(b"<PIES><Item/></PIES>".to_vec()));
        assert!(matches!(result, Err(ParseError::Fatal { message, .. }) if message.contains("root")));
    }

    #[test]
    fn empty_document_has_no_apps() {
        assert!(collect(r#"<ACES version="3.2"/>"#).is_empty());
        assert!(collect("<ACES><Header/></ACES>").is_empty());
    }

    #[test]
    fn unknown_top_level_elements_are_skipped_and_counted() {
        let xml = r#"<ACES><DigitalAsset><DigitalFileInformation/></DigitalAsset><App id="1"/><DigitalAsset/></ACES>"#;
        let mut aces = reader(xml);
        let records = aces.by_ref().collect::<Vec<_>>();
        assert_eq!(records.len(), 1);
        assert_eq!(aces.skipped_elements().get("DigitalAsset"), Some(&2));
    }

    #[test]
    fn skipped_blocks_stream_through_nesting_and_fail_when_cut() {
        let mut xml = String::from("<ACES><DigitalAsset>");
        for index in 0..500 {
            xml.push_str(&format!("<DigitalAsset><FileName>f{index}.jpg</FileName><!-- c --></DigitalAsset>"));
        }
        xml.push_str(r#"</DigitalAsset><App id="4"/></ACES>"#);
        let mut aces = reader(&xml);
        let ids = aces.by_ref().map(|record| record.map(|record| record.app_id)).collect::<Vec<_>>();
        assert_eq!(ids, vec![Ok(4)]);
        assert_eq!(aces.skipped_elements().get("DigitalAsset"), Some(&1));

        let cut = collect("<ACES><DigitalAsset><FileName>a.jpg</FileName>");
        assert!(matches!(&cut[0], Err(ParseError::Fatal { message, .. }) if message.contains("<DigitalAsset>")));
    }

    #[test]
    fn namespace_prefixes_are_stripped() {
        let xml = r#"<a:ACES xmlns:a="urn:aces"><a:App id="3"><a:Qty>2</a:Qty></a:App></a:ACES>"#;
        let records = collect(xml);
        let Ok(record) = &records[0] else { panic!("record should parse") };
        assert_eq!(record.node.attributes, vec![("id".to_string(), "3".to_string())]);
        assert_eq!(record.node.children().next().map(|child| child.name.as_str()), Some("Qty"));
    }

    #[test]
    fn digest_reader_hashes_all_bytes() -> io::Result<()> {
        let mut reader = DigestReader::new(Cursor::new(b"abc".to_vec()));
        let mut first = [0_u8; 1];
        reader.read_exact(&mut first)?;
        let (digest, bytes) = reader.finish()?;
        assert_eq!(bytes, 3);
        assert_eq!(digest, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        Ok(())
    }
}
