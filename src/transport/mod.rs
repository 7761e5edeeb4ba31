//! Upload transports (spec.md §4.5): direct (chunked escape codes inline on
//! stdout), stream (same wire shape, written incrementally so progress can
//! be tracked), file (hand the terminal a path and let it read the file
//! itself), and the unsupported `temp` sentinel.
//!
//! The direct/stream chunking mirrors `protocol/kitty.rs::transmit_virtual`:
//! base64 in 4096-byte chunks, `m=1` on every chunk but the last.

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::cache::Format;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Direct,
    Stream,
    File,
    Temp,
}

impl Method {
    pub fn parse(text: &str) -> Result<Method> {
        match text {
            "direct" => Ok(Method::Direct),
            "stream" => Ok(Method::Stream),
            "file" => Ok(Method::File),
            "temp" => Ok(Method::Temp),
            other => Err(Error::InvalidArg(format!("unknown transport {other:?}"))),
        }
    }
}

pub trait ProgressSink {
    fn on_progress(&mut self, bytes_sent: u64);
}

impl ProgressSink for () {
    fn on_progress(&mut self, _bytes_sent: u64) {}
}

/// Bytes per base64-encoded escape-code chunk, matching the teacher's
/// `CHARS_PER_CHUNK` for direct/stream transports.
const CHARS_PER_CHUNK: usize = 4096;
const CHUNK_SIZE: usize = (CHARS_PER_CHUNK / 4) * 3;

/// Send `payload` (already-encoded image bytes) to `out` for id `id` using
/// `method`, with image dims `(w, h)` and pixel format `fmt` on the first
/// chunk. Calls `sink.on_progress` after every chunk is written so the
/// caller can detect a stall (spec.md §4.5's progress-timestamp mechanism).
pub fn upload(
    out: &mut impl Write,
    method: Method,
    id: u32,
    payload: &[u8],
    w: u32,
    h: u32,
    fmt: Format,
    path: Option<&Path>,
    stall_timeout: Duration,
    sink: &mut impl ProgressSink,
) -> Result<u64> {
    match method {
        Method::Temp => Err(Error::TransportUnsupported("temp".to_string())),
        Method::File => upload_file(out, id, w, h, fmt, path, sink),
        Method::Direct | Method::Stream => {
            upload_chunked(out, id, payload, w, h, fmt, stall_timeout, sink)
        }
    }
}

fn upload_file(
    out: &mut impl Write,
    id: u32,
    w: u32,
    h: u32,
    fmt: Format,
    path: Option<&Path>,
    sink: &mut impl ProgressSink,
) -> Result<u64> {
    let path = path.ok_or_else(|| Error::InvalidArg("file transport needs a path".to_string()))?;
    let path_str = path.to_string_lossy();
    write!(
        out,
        "\x1b_Ga=T,i={id},U=1,f={},t=f,s={w},v={h};{}\x1b\\",
        fmt.wire_code(),
        path_str
    )?;
    sink.on_progress(path_str.len() as u64);
    Ok(path_str.len() as u64)
}

fn upload_chunked(
    out: &mut impl Write,
    id: u32,
    payload: &[u8],
    w: u32,
    h: u32,
    fmt: Format,
    stall_timeout: Duration,
    sink: &mut impl ProgressSink,
) -> Result<u64> {
    let chunks: Vec<&[u8]> = payload.chunks(CHUNK_SIZE).collect();
    let chunk_count = chunks.len().max(1);
    let mut sent = 0u64;
    let mut last_progress = Instant::now();

    if chunks.is_empty() {
        write!(out, "\x1b_Ga=T,i={id},U=1,f={},t=d,s={w},v={h},m=0;\x1b\\", fmt.wire_code())?;
        return Ok(0);
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let encoded = base64_simd::STANDARD.encode_to_string(chunk);
        write!(out, "\x1b_G")?;
        if i == 0 {
            write!(out, "i={id},a=T,U=1,f={},t=d,s={w},v={h},", fmt.wire_code())?;
        }
        let more = u8::from(chunk_count > i + 1);
        write!(out, "m={more};{encoded}\x1b\\")?;
        out.flush()?;

        sent += chunk.len() as u64;
        sink.on_progress(sent);

        let now = Instant::now();
        if now.duration_since(last_progress) > stall_timeout {
            return Err(Error::InvalidArg("upload stalled".to_string()));
        }
        last_progress = now;
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);
    impl ProgressSink for Counter {
        fn on_progress(&mut self, _bytes_sent: u64) {
            self.0 += 1;
        }
    }

    #[test]
    fn temp_is_unsupported() {
        let mut out = Vec::new();
        let mut sink = ();
        let err = upload(
            &mut out,
            Method::Temp,
            1,
            b"",
            1,
            1,
            Format::Png,
            None,
            Duration::from_secs(1),
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, Error::TransportUnsupported(_)));
    }

    #[test]
    fn direct_chunks_and_reports_progress() {
        let mut out = Vec::new();
        let mut sink = Counter(0);
        let payload = vec![7u8; CHUNK_SIZE * 3 + 10];
        let sent = upload(
            &mut out,
            Method::Direct,
            42,
            &payload,
            10,
            10,
            Format::Png,
            None,
            Duration::from_secs(5),
            &mut sink,
        )
        .unwrap();
        assert_eq!(sent, payload.len() as u64);
        assert_eq!(sink.0, 4);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("i=42"));
        assert!(text.contains("m=0;"));
    }

    #[test]
    fn file_transport_writes_path_reference() {
        let mut out = Vec::new();
        let mut sink = ();
        upload(
            &mut out,
            Method::File,
            9,
            b"",
            2,
            2,
            Format::Jpeg,
            Some(Path::new("/tmp/x.jpeg")),
            Duration::from_secs(1),
            &mut sink,
        )
        .unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("t=f"));
        assert!(text.contains("/tmp/x.jpeg"));
    }
}
