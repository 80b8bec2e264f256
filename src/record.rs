//! Monitoring record model
//!
//! One monitoring sample per host, split into three sections:
//!
//! - `capacity`: numeric counters (FREE_CPU, USED_MEMORY, ...)
//! - `datastores`: one entry per datastore reported by the probe
//! - `system`: free-form host facts (hypervisor version, feature flags, ...)
//!
//! Samples travel as flat `KEY=VALUE` template text on the wire and as XML in
//! durable storage. Drivers may report partial updates (a beacon carries no
//! data at all), so merging is sticky: sections and keys absent from a new
//! sample never erase previously known data.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::xml;

/// Keys routed into the `capacity` section. Everything else that is not a
/// datastore entry lands in `system`. Bare `CPU`/`MEMORY` are accepted for
/// probes that report totals without the `TOTAL_` prefix.
const CAPACITY_KEYS: [&str; 10] = [
    "CPU",
    "TOTAL_CPU",
    "FREE_CPU",
    "USED_CPU",
    "MEMORY",
    "TOTAL_MEMORY",
    "FREE_MEMORY",
    "USED_MEMORY",
    "NETRX",
    "NETTX",
];

/// A typed template value. Quoted values stay text even when they look
/// numeric, so types survive a text round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    /// Parse a raw template value. Surrounding quotes force text.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            return AttributeValue::Text(raw[1..raw.len() - 1].to_string());
        }

        if let Ok(i) = raw.parse::<i64>() {
            return AttributeValue::Integer(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return AttributeValue::Float(f);
        }

        AttributeValue::Text(raw.to_string())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            AttributeValue::Float(f) => Some(*f as i64),
            AttributeValue::Text(_) => None,
        }
    }

    fn is_numeric(&self) -> bool {
        !matches!(self, AttributeValue::Text(_))
    }

    /// Render in template syntax: numbers bare, text quoted.
    fn write_template(&self, out: &mut String) {
        match self {
            AttributeValue::Integer(i) => {
                let _ = write!(out, "{i}");
            }
            AttributeValue::Float(f) if f.fract() == 0.0 => {
                // keep the decimal point so the value re-parses as a float
                let _ = write!(out, "{f:.1}");
            }
            AttributeValue::Float(f) => {
                let _ = write!(out, "{f}");
            }
            AttributeValue::Text(s) => {
                let _ = write!(out, "\"{s}\"");
            }
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Integer(i) => write!(f, "{i}"),
            AttributeValue::Float(v) if v.fract() == 0.0 => write!(f, "{v:.1}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// One datastore reported by a host probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreEntry {
    pub id: i64,
    pub free_mb: u64,
    pub used_mb: u64,

    /// Probe-specific keys beyond the fixed triple.
    #[serde(default)]
    pub extra: BTreeMap<String, AttributeValue>,
}

/// Errors from parsing monitoring samples or their XML form.
#[derive(Debug)]
pub enum RecordError {
    /// The payload contained no parsable `KEY=VALUE` pairs at all.
    MalformedRecord(String),

    /// The XML document was unparsable or missing required tags.
    MalformedXml(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::MalformedRecord(msg) => write!(f, "malformed record: {msg}"),
            RecordError::MalformedXml(msg) => write!(f, "malformed record xml: {msg}"),
        }
    }
}

impl std::error::Error for RecordError {}

/// One monitoring sample for one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringRecord {
    pub host_id: i64,
    pub timestamp: DateTime<Utc>,
    pub capacity: BTreeMap<String, AttributeValue>,
    pub datastores: Vec<DatastoreEntry>,
    pub system: BTreeMap<String, AttributeValue>,
}

impl MonitoringRecord {
    /// An empty sample, used for beacons and freshly registered hosts.
    pub fn empty(host_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            host_id,
            timestamp,
            capacity: BTreeMap::new(),
            datastores: Vec::new(),
            system: BTreeMap::new(),
        }
    }

    /// Decode a flat `KEY=VALUE` template block.
    ///
    /// Bracketed vector attributes (`DS=[ID=...,FREE_MB=...,USED_MB=...]`)
    /// become datastore entries; capacity keys must be numeric (a malformed
    /// number drops that field only); unknown keys are preserved in `system`.
    /// Fails only when the block yields no pairs at all.
    pub fn parse(
        host_id: i64,
        timestamp: DateTime<Utc>,
        raw: &str,
    ) -> Result<Self, RecordError> {
        let mut record = Self::empty(host_id, timestamp);
        let mut pairs = 0usize;

        let mut lines = raw.lines();
        while let Some(line) = lines.next() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_string();
            let mut value = value.trim().to_string();

            if value.starts_with('[') {
                // vector attribute, possibly spanning lines
                while !value.contains(']') {
                    match lines.next() {
                        Some(next) => {
                            value.push(',');
                            value.push_str(next.trim());
                        }
                        None => break,
                    }
                }
                let inner = value
                    .trim_start_matches('[')
                    .trim_end()
                    .trim_end_matches(']');
                let fields = parse_vector(inner);
                if fields.is_empty() {
                    continue;
                }
                pairs += 1;

                if key == "DS" {
                    if let Some(ds) = datastore_from_fields(host_id, fields) {
                        record.datastores.push(ds);
                    }
                } else {
                    // non-datastore vectors are kept verbatim as host facts
                    record
                        .system
                        .insert(key, AttributeValue::Text(inner.to_string()));
                }
                continue;
            }

            pairs += 1;
            let parsed = AttributeValue::parse(&value);

            if CAPACITY_KEYS.contains(&key.as_str()) {
                if parsed.is_numeric() {
                    record.capacity.insert(key, parsed);
                } else {
                    warn!("host {host_id}: non-numeric capacity field {key}={value}, skipped");
                }
            } else {
                record.system.insert(key, parsed);
            }
        }

        if pairs == 0 {
            return Err(RecordError::MalformedRecord(
                "no KEY=VALUE pairs in payload".to_string(),
            ));
        }

        Ok(record)
    }

    /// Sticky merge of a newer sample into this record.
    ///
    /// `capacity` and `system` are merged key by key; `datastores` is replaced
    /// wholesale, but only when the new sample actually reports datastores.
    /// A beacon-style empty sample therefore changes nothing but the
    /// timestamp.
    pub fn merge(&mut self, newer: MonitoringRecord) {
        self.capacity.extend(newer.capacity);
        self.system.extend(newer.system);

        if !newer.datastores.is_empty() {
            self.datastores = newer.datastores;
        }

        if newer.timestamp > self.timestamp {
            self.timestamp = newer.timestamp;
        }
    }

    /// Render the sample as template text (the wire payload format).
    pub fn to_template_text(&self) -> String {
        let mut out = String::new();

        for (key, value) in &self.capacity {
            let _ = write!(out, "{key}=");
            value.write_template(&mut out);
            out.push('\n');
        }

        for ds in &self.datastores {
            let _ = write!(out, "DS=[ID={},FREE_MB={},USED_MB={}", ds.id, ds.free_mb, ds.used_mb);
            for (key, value) in &ds.extra {
                let _ = write!(out, ",{key}=");
                value.write_template(&mut out);
            }
            out.push_str("]\n");
        }

        for (key, value) in &self.system {
            let _ = write!(out, "{key}=");
            value.write_template(&mut out);
            out.push('\n');
        }

        out
    }

    /// Append the `<MONITORING>` element to `out`.
    ///
    /// Section values are rendered in template syntax (text quoted, numbers
    /// bare) so the XML round-trip preserves value types.
    pub(crate) fn write_xml(&self, out: &mut String) {
        let tpl = |value: &AttributeValue| {
            let mut s = String::new();
            value.write_template(&mut s);
            s
        };

        out.push_str("<MONITORING>");
        xml::print_tag(out, "ID", self.host_id);
        xml::print_tag(out, "TIMESTAMP", self.timestamp.timestamp());

        out.push_str("<CAPACITY>");
        for (key, value) in &self.capacity {
            xml::print_tag(out, key, tpl(value));
        }
        out.push_str("</CAPACITY>");

        out.push_str("<DATASTORES>");
        for ds in &self.datastores {
            out.push_str("<DS>");
            xml::print_tag(out, "ID", ds.id);
            xml::print_tag(out, "FREE_MB", ds.free_mb);
            xml::print_tag(out, "USED_MB", ds.used_mb);
            for (key, value) in &ds.extra {
                xml::print_tag(out, key, tpl(value));
            }
            out.push_str("</DS>");
        }
        out.push_str("</DATASTORES>");

        out.push_str("<SYSTEM>");
        for (key, value) in &self.system {
            xml::print_tag(out, key, tpl(value));
        }
        out.push_str("</SYSTEM>");

        out.push_str("</MONITORING>");
    }

    /// Canonical XML serialization, used for storage.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    pub fn from_xml(xml_str: &str) -> Result<Self, RecordError> {
        let doc = roxmltree::Document::parse(xml_str)
            .map_err(|e| RecordError::MalformedXml(e.to_string()))?;
        Self::from_xml_node(doc.root_element())
    }

    /// Build a record from an already-parsed `<MONITORING>` element.
    pub(crate) fn from_xml_node(node: roxmltree::Node<'_, '_>) -> Result<Self, RecordError> {
        if node.tag_name().name() != "MONITORING" {
            return Err(RecordError::MalformedXml(format!(
                "expected MONITORING element, found {}",
                node.tag_name().name()
            )));
        }

        let host_id = xml::child_text(node, "ID")
            .and_then(|t| t.trim().parse().ok())
            .ok_or_else(|| RecordError::MalformedXml("missing or invalid ID".to_string()))?;

        let epoch: i64 = xml::child_text(node, "TIMESTAMP")
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or_default();
        let timestamp = DateTime::from_timestamp(epoch, 0).unwrap_or_default();

        let mut record = Self::empty(host_id, timestamp);

        if let Some(capacity) = xml::child(node, "CAPACITY") {
            record.capacity = section_from_node(capacity);
        }

        if let Some(datastores) = xml::child(node, "DATASTORES") {
            for ds in datastores
                .children()
                .filter(|c| c.is_element() && c.tag_name().name() == "DS")
            {
                let mut fields: Vec<(String, AttributeValue)> = ds
                    .children()
                    .filter(|c| c.is_element())
                    .map(|c| {
                        (
                            c.tag_name().name().to_string(),
                            AttributeValue::parse(c.text().unwrap_or_default()),
                        )
                    })
                    .collect();
                fields.retain(|(k, _)| !k.is_empty());
                if let Some(entry) = datastore_from_fields(host_id, fields) {
                    record.datastores.push(entry);
                }
            }
        }

        if let Some(system) = xml::child(node, "SYSTEM") {
            record.system = section_from_node(system);
        }

        Ok(record)
    }
}

fn section_from_node(node: roxmltree::Node<'_, '_>) -> BTreeMap<String, AttributeValue> {
    node.children()
        .filter(|c| c.is_element())
        .map(|c| {
            (
                c.tag_name().name().to_string(),
                AttributeValue::parse(c.text().unwrap_or_default()),
            )
        })
        .collect()
}

/// Split the inner part of a bracketed vector attribute into key/value pairs.
fn parse_vector(inner: &str) -> Vec<(String, AttributeValue)> {
    inner
        .split(',')
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), AttributeValue::parse(value)))
        })
        .collect()
}

/// Build a datastore entry from vector fields. A missing or non-numeric ID
/// drops the whole entry; malformed FREE_MB/USED_MB drop that field only.
fn datastore_from_fields(
    host_id: i64,
    fields: Vec<(String, AttributeValue)>,
) -> Option<DatastoreEntry> {
    let mut entry = DatastoreEntry {
        id: -1,
        free_mb: 0,
        used_mb: 0,
        extra: BTreeMap::new(),
    };
    let mut have_id = false;

    for (key, value) in fields {
        match key.as_str() {
            "ID" => match value.as_i64() {
                Some(id) => {
                    entry.id = id;
                    have_id = true;
                }
                None => {
                    warn!("host {host_id}: datastore entry with non-numeric ID, skipped");
                    return None;
                }
            },
            "FREE_MB" => match value.as_i64() {
                Some(v) if v >= 0 => entry.free_mb = v as u64,
                _ => warn!("host {host_id}: malformed FREE_MB in datastore entry, field skipped"),
            },
            "USED_MB" => match value.as_i64() {
                Some(v) if v >= 0 => entry.used_mb = v as u64,
                _ => warn!("host {host_id}: malformed USED_MB in datastore entry, field skipped"),
            },
            _ => {
                entry.extra.insert(key, value);
            }
        }
    }

    if !have_id {
        warn!("host {host_id}: datastore entry without ID, skipped");
        return None;
    }

    Some(entry)
}
