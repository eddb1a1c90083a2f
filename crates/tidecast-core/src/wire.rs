//! Server-Sent Events framing.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::event::ChangeEvent;

/// Response headers sent before the first frame of a stream.
pub const STREAM_HEADERS: [(&str, &str); 3] = [
    ("content-type", "text/event-stream"),
    ("cache-control", "no-cache"),
    ("connection", "keep-alive"),
];

/// Encode one event as an SSE frame: an `id:` line, a `data:` line, a blank line.
///
/// CR and LF are removed from the id; JSON output never contains raw newlines.
pub fn encode_event(event: &ChangeEvent) -> Result<Bytes> {
    let data = serde_json::to_vec(event.payload())?;
    let id = event.id();

    let mut buf = BytesMut::with_capacity(id.len() + data.len() + 12);
    buf.put_slice(b"id: ");
    if id.contains(['\r', '\n']) {
        buf.put_slice(id.replace(['\r', '\n'], "").as_bytes());
    } else {
        buf.put_slice(id.as_bytes());
    }
    buf.put_slice(b"\ndata: ");
    buf.put_slice(&data);
    buf.put_slice(b"\n\n");

    Ok(buf.freeze())
}
