// Push events from the gateway's `subscribe` command.
//
// The gateway keeps the response open and writes one line per value change.
// Leading fields carry a timestamp in several columns; the trailing fields
// are `<A|S> <id> <name> <subtype> <value>`. Lines are tab separated, but
// plain whitespace separation is accepted as long as the name is the only
// field that may contain spaces.

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::debug;

use super::transport::Transport;
use super::{DeviceKind, PushUpdate, Subtype};
use crate::error::Error;

/// Lines longer than this without a newline are discarded.
const MAX_LINE_BYTES: usize = 16 * 1024;

/// Reads [`PushUpdate`]s from an open subscription response.
pub struct EventStream {
    chunks: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    transport: Transport,
}

impl EventStream {
    pub(crate) fn new(response: reqwest::Response, transport: Transport) -> Self {
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Self {
            chunks,
            buffer: Vec::new(),
            transport,
        }
    }

    /// Next recognised update, or `None` once the gateway closes the stream.
    pub async fn next_update(&mut self) -> Result<Option<PushUpdate>, Error> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match parse_event_line(text) {
                    Some(update) => return Ok(Some(update)),
                    None => {
                        debug!("Ignoring unrecognised event line: {:?}", text);
                        continue;
                    }
                }
            }

            if self.buffer.len() > MAX_LINE_BYTES {
                debug!("Dropping {} bytes of unterminated event data", self.buffer.len());
                self.buffer.clear();
            }

            match self.chunks.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(self.transport.classify(e)),
                None => return Ok(None),
            }
        }
    }
}

/// Parse one subscription line. Returns `None` for anything that is not a
/// device value record (keep-alives, headers, garbage).
pub fn parse_event_line(line: &str) -> Option<PushUpdate> {
    let fields: Vec<&str> = if line.contains('\t') {
        line.split('\t').map(str::trim).collect()
    } else {
        line.split_whitespace().collect()
    };
    let len = fields.len();
    if len < 5 {
        return None;
    }

    // Locate the kind marker followed by a numeric id, leaving at least one
    // name field plus subtype and value behind it.
    let marker = (0..len.saturating_sub(4)).find(|&i| {
        matches!(fields[i], "A" | "S") && fields[i + 1].parse::<u32>().is_ok_and(|id| id > 0)
    })?;

    let kind = match fields[marker] {
        "A" => DeviceKind::Actuator,
        _ => DeviceKind::Sensor,
    };
    let id = fields[marker + 1].parse().ok()?;
    let name = fields[marker + 2..len - 2].join(" ");
    if name.is_empty() {
        return None;
    }
    let subtype = Subtype::from_wire(fields[len - 2]);
    let value: f64 = fields[len - 1].parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    Some(PushUpdate {
        kind,
        id,
        name,
        subtype,
        value,
    })
}
