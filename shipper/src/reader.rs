//! Turns raw object bytes into events.

use crate::model::{Event, ObjectDescriptor, ObjectRef, SourceDescriptor};
use chrono::{DateTime, Utc};
use serde_json::Value;
use shipper_core::config::{Compression, Encoding, SplitMode};
use shipper_core::{Error, Result};
use std::io::Read;

const TIMESTAMP_FIELDS: [&str; 2] = ["@timestamp", "timestamp"];

pub fn decode_object(
    source: &SourceDescriptor,
    object: &ObjectDescriptor,
    data: &[u8],
) -> Result<Vec<Event>> {
    let object_key = format!("{}/{}", source.bucket, object.name);

    let raw = decompress(source.reader.compression, &object.name, data)
        .map_err(|details| Error::decode(&object_key, details))?;
    let text = decode_text(source.reader.encoding, raw)
        .map_err(|details| Error::decode(&object_key, details))?;

    let records: Vec<&str> = match source.reader.split {
        SplitMode::Lines => text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect(),
        SplitMode::Whole if text.trim().is_empty() => Vec::new(),
        SplitMode::Whole => vec![text.as_str()],
    };

    let mut builder = EventBuilder::new(source, object);
    for record in records {
        if !source.parse_json {
            builder.push(record.to_string(), None);
            continue;
        }

        let value: Value = serde_json::from_str(record)
            .map_err(|e| Error::decode(&object_key, format!("invalid JSON: {}", e)))?;

        let expanded = source
            .expand_event_list_from_field
            .as_deref()
            .and_then(|field| match value.get(field) {
                Some(Value::Array(items)) => Some(items.clone()),
                _ => None,
            });

        match expanded {
            Some(items) => {
                for item in items {
                    builder.push(item.to_string(), Some(item));
                }
            }
            None => builder.push(record.to_string(), Some(value)),
        }
    }

    Ok(builder.finish())
}

fn decompress(compression: Compression, name: &str, data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let lz4 = match compression {
        Compression::Lz4 => true,
        Compression::None => false,
        Compression::Auto => name.ends_with(".lz4"),
    };

    if !lz4 {
        return Ok(data.to_vec());
    }

    let mut decoder = lz4_flex::frame::FrameDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| format!("failed to decompress LZ4 data: {}", e))?;
    Ok(decompressed)
}

fn decode_text(encoding: Encoding, raw: Vec<u8>) -> std::result::Result<String, String> {
    match encoding {
        Encoding::Utf8 => {
            String::from_utf8(raw).map_err(|e| format!("invalid UTF-8 data: {}", e))
        }
        Encoding::Latin1 => Ok(raw.into_iter().map(char::from).collect()),
    }
}

fn timestamp_from_json(value: &Value) -> Option<DateTime<Utc>> {
    TIMESTAMP_FIELDS.iter().find_map(|field| match value.get(field)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    })
}

struct EventBuilder<'a> {
    source: &'a SourceDescriptor,
    object: &'a ObjectDescriptor,
    fallback_ts: DateTime<Utc>,
    events: Vec<Event>,
}

impl<'a> EventBuilder<'a> {
    fn new(source: &'a SourceDescriptor, object: &'a ObjectDescriptor) -> Self {
        // Content timestamp, then the configured epoch, then the object's mtime.
        let fallback_ts = source
            .timestamp_epoch
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or(object.last_modified)
            .unwrap_or_else(Utc::now);

        Self {
            source,
            object,
            fallback_ts,
            events: Vec::new(),
        }
    }

    fn push(&mut self, message: String, json: Option<Value>) {
        let offset = self.events.len() as u64;
        let timestamp = json
            .as_ref()
            .and_then(timestamp_from_json)
            .unwrap_or(self.fallback_ts);

        self.events.push(Event {
            id: format!(
                "{}/{}#{}-{}",
                self.source.bucket, self.object.name, self.object.generation, offset
            ),
            timestamp,
            message,
            json,
            project_id: self.source.project_id.clone(),
            bucket: self.source.bucket.clone(),
            object: ObjectRef {
                name: self.object.name.clone(),
                generation: self.object.generation.clone(),
                content_type: self.object.content_type.clone(),
            },
            offset,
        });
    }

    fn finish(self) -> Vec<Event> {
        self.events
    }
}
