//! Streaming decoders for connector stdout.
//!
//! Connectors emit either little-endian length-prefixed binary records or
//! newline-delimited JSON. Both decoders present the same sink contract:
//! `write` accepts arbitrarily chunked bytes and fires a callback once per
//! fully re-assembled record, `close` verifies that no partial record was
//! left behind.

use anyhow::{bail, Context};
use bytes::{Buf, BytesMut};

/// Hard cap on a single record, to bound decoder memory. Connectors that
/// need more must be changed, or this raised explicitly.
pub const MAX_RECORD_SIZE: usize = 8 << 20;

/// Sink contract shared by both decoders, and by anything else a process
/// runner can pump stdout into.
pub trait RecordSink: Send {
    /// Consume one chunk of the stream. Chunk boundaries carry no meaning.
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()>;

    /// Signal end-of-stream. Errors if un-parsed residual bytes remain.
    fn close(&mut self) -> anyhow::Result<()>;
}

// ========== Length-prefixed binary ==========

enum BinaryState {
    NeedHeader,
    NeedBody(usize),
}

/// Decoder for `(u32-LE length)(payload)` framed streams. The callback
/// borrows the assembled record; callers decode it into a reused target.
pub struct LengthDelimited<F> {
    state: BinaryState,
    buf: BytesMut,
    on_record: F,
}

impl<F> LengthDelimited<F>
where
    F: FnMut(&[u8]) -> anyhow::Result<()> + Send,
{
    pub fn new(on_record: F) -> Self {
        Self {
            state: BinaryState::NeedHeader,
            buf: BytesMut::new(),
            on_record,
        }
    }
}

impl<F> RecordSink for LengthDelimited<F>
where
    F: FnMut(&[u8]) -> anyhow::Result<()> + Send,
{
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.buf.extend_from_slice(chunk);

        loop {
            match self.state {
                BinaryState::NeedHeader => {
                    if self.buf.len() < 4 {
                        return Ok(());
                    }
                    let len = u32::from_le_bytes(self.buf[0..4].try_into().unwrap()) as usize;
                    if len > MAX_RECORD_SIZE {
                        bail!("record length {len} exceeds maximum of {MAX_RECORD_SIZE} bytes");
                    }
                    self.buf.advance(4);
                    self.state = BinaryState::NeedBody(len);
                }
                BinaryState::NeedBody(len) => {
                    if self.buf.len() < len {
                        return Ok(());
                    }
                    (self.on_record)(&self.buf[..len])?;
                    self.buf.advance(len);
                    self.state = BinaryState::NeedHeader;
                }
            }
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        match self.state {
            BinaryState::NeedHeader if self.buf.is_empty() => Ok(()),
            BinaryState::NeedHeader => bail!(
                "stream closed with {} bytes of partial record header",
                self.buf.len()
            ),
            BinaryState::NeedBody(len) => bail!(
                "stream closed with partial record ({} of {len} bytes)",
                self.buf.len()
            ),
        }
    }
}

/// Encode one record in the length-prefixed binary framing.
pub fn encode_length_delimited(record: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(record.len() as u32).to_le_bytes());
    out.extend_from_slice(record);
}

// ========== Newline-delimited text ==========

/// Decoder for LF-separated JSON records.
///
/// `on_record` receives each deserialized value in stream order. A line which
/// fails to deserialize goes to `on_error`, which decides whether the failure
/// is fatal (returns the error) or recoverable (returns `Ok`, dropping the
/// line): some connector implementations interleave unframed diagnostics with
/// structured records. Empty lines are skipped.
pub struct NdjsonLines<D, F, E> {
    residual: BytesMut,
    on_record: F,
    on_error: E,
    _marker: std::marker::PhantomData<fn() -> D>,
}

impl<D, F, E> NdjsonLines<D, F, E>
where
    D: serde::de::DeserializeOwned,
    F: FnMut(D) -> anyhow::Result<()> + Send,
    E: FnMut(&[u8], serde_json::Error) -> anyhow::Result<()> + Send,
{
    pub fn new(on_record: F, on_error: E) -> Self {
        Self {
            residual: BytesMut::new(),
            on_record,
            on_error,
            _marker: std::marker::PhantomData,
        }
    }

    fn decode_line(&mut self, line: &[u8]) -> anyhow::Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        if line.len() > MAX_RECORD_SIZE {
            bail!(
                "record of {} bytes exceeds maximum of {MAX_RECORD_SIZE} bytes",
                line.len()
            );
        }
        match serde_json::from_slice::<D>(line) {
            Ok(record) => (self.on_record)(record),
            Err(err) => (self.on_error)(line, err),
        }
    }
}

impl<D, F, E> RecordSink for NdjsonLines<D, F, E>
where
    D: serde::de::DeserializeOwned,
    F: FnMut(D) -> anyhow::Result<()> + Send,
    E: FnMut(&[u8], serde_json::Error) -> anyhow::Result<()> + Send,
{
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let mut rest = chunk;

        // Complete a previously buffered partial line first.
        if !self.residual.is_empty() {
            match rest.iter().position(|&b| b == b'\n') {
                None => {
                    if self.residual.len() + rest.len() > MAX_RECORD_SIZE {
                        bail!(
                            "unterminated record exceeds maximum of {MAX_RECORD_SIZE} bytes"
                        );
                    }
                    self.residual.extend_from_slice(rest);
                    return Ok(());
                }
                Some(at) => {
                    self.residual.extend_from_slice(&rest[..at]);
                    let line = self.residual.split();
                    self.decode_line(&line)?;
                    rest = &rest[at + 1..];
                }
            }
        }

        // Decode all complete lines of the remainder as one batch, keeping
        // trailing bytes as the new residual.
        match rest.iter().rposition(|&b| b == b'\n') {
            None => {
                if rest.len() > MAX_RECORD_SIZE {
                    bail!("unterminated record exceeds maximum of {MAX_RECORD_SIZE} bytes");
                }
                self.residual.extend_from_slice(rest);
            }
            Some(last) => {
                for line in rest[..last].split(|&b| b == b'\n') {
                    self.decode_line(line)?;
                }
                let tail = &rest[last + 1..];
                if tail.len() > MAX_RECORD_SIZE {
                    bail!("unterminated record exceeds maximum of {MAX_RECORD_SIZE} bytes");
                }
                self.residual.extend_from_slice(tail);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if !self.residual.is_empty() {
            bail!(
                "stream closed with {} bytes of unterminated record",
                self.residual.len()
            );
        }
        Ok(())
    }
}

/// Build an `NdjsonLines` whose error hook logs and drops undecodable lines.
pub fn ndjson_logging_errors<D, F>(
    on_record: F,
) -> NdjsonLines<D, F, impl FnMut(&[u8], serde_json::Error) -> anyhow::Result<()> + Send>
where
    D: serde::de::DeserializeOwned,
    F: FnMut(D) -> anyhow::Result<()> + Send,
{
    NdjsonLines::new(on_record, |line, err| {
        tracing::warn!(
            line = %String::from_utf8_lossy(&line[..line.len().min(256)]),
            error = %err,
            "dropping undecodable connector output line"
        );
        Ok(())
    })
}

/// Fatal-on-anything error hook, for protocols with no diagnostic lines.
pub fn ndjson_strict<D, F>(
    on_record: F,
) -> NdjsonLines<D, F, impl FnMut(&[u8], serde_json::Error) -> anyhow::Result<()> + Send>
where
    D: serde::de::DeserializeOwned,
    F: FnMut(D) -> anyhow::Result<()> + Send,
{
    NdjsonLines::new(on_record, |line, err| {
        Err(err).context(format!(
            "decoding connector output line {:?}",
            String::from_utf8_lossy(&line[..line.len().min(256)])
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Seen<T> = Arc<Mutex<Vec<T>>>;

    fn collecting_binary() -> (
        LengthDelimited<impl FnMut(&[u8]) -> anyhow::Result<()> + Send>,
        Seen<Vec<u8>>,
    ) {
        let seen: Seen<Vec<u8>> = Arc::default();
        let sink_seen = Arc::clone(&seen);
        let sink = LengthDelimited::new(move |rec: &[u8]| {
            sink_seen.lock().push(rec.to_vec());
            Ok(())
        });
        (sink, seen)
    }

    #[test]
    fn binary_two_records_then_partial() {
        let (mut sink, seen) = collecting_binary();
        sink.write(&[4, 0, 0, 0]).unwrap();
        sink.write(b"ABCD").unwrap();
        sink.write(&[2, 0, 0, 0, b'E', b'F']).unwrap();
        assert_eq!(*seen.lock(), vec![b"ABCD".to_vec(), b"EF".to_vec()]);
        assert!(sink.close().is_ok());

        sink.write(&[5, 0, 0, 0, b'G', b'H', b'I']).unwrap();
        let err = sink.close().unwrap_err().to_string();
        assert!(err.contains("partial"), "got: {err}");
    }

    #[test]
    fn binary_header_split_across_writes() {
        let (mut sink, seen) = collecting_binary();
        sink.write(&[3, 0]).unwrap();
        sink.write(&[0]).unwrap();
        sink.write(&[0, b'x']).unwrap();
        sink.write(b"yz").unwrap();
        assert_eq!(*seen.lock(), vec![b"xyz".to_vec()]);
        assert!(sink.close().is_ok());
    }

    #[test]
    fn binary_zero_length_record() {
        let (mut sink, seen) = collecting_binary();
        sink.write(&[0, 0, 0, 0, 1, 0, 0, 0, b'a']).unwrap();
        assert_eq!(*seen.lock(), vec![Vec::<u8>::new(), b"a".to_vec()]);
    }

    #[test]
    fn binary_oversize_is_fatal_and_delivers_nothing() {
        let (mut sink, seen) = collecting_binary();
        let oversize = (MAX_RECORD_SIZE as u32 + 1).to_le_bytes();
        let err = sink.write(&oversize).unwrap_err().to_string();
        assert!(err.contains("exceeds maximum"), "got: {err}");
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn binary_max_size_record_is_accepted() {
        let (mut sink, seen) = collecting_binary();
        let mut encoded = Vec::new();
        encode_length_delimited(&vec![7u8; MAX_RECORD_SIZE], &mut encoded);
        sink.write(&encoded).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].len(), MAX_RECORD_SIZE);
    }

    #[test]
    fn binary_callback_error_halts_write() {
        let mut sink = LengthDelimited::new(|_rec: &[u8]| bail!("refused"));
        let mut encoded = Vec::new();
        encode_length_delimited(b"one", &mut encoded);
        let err = sink.write(&encoded).unwrap_err().to_string();
        assert_eq!(err, "refused");
    }

    fn collecting_ndjson() -> (impl RecordSink, Seen<String>) {
        let seen: Seen<String> = Arc::default();
        let sink_seen = Arc::clone(&seen);
        let sink = ndjson_strict(move |rec: String| {
            sink_seen.lock().push(rec);
            Ok(())
        });
        (sink, seen)
    }

    #[test]
    fn ndjson_worst_case_chunking() {
        let (mut sink, seen) = collecting_ndjson();
        sink.write(b"\"one\"\n\"tw").unwrap();
        sink.write(b"o\"\n\"three\"\n\"fo").unwrap();
        sink.write(b"ur\"\n\"fi").unwrap();
        assert_eq!(*seen.lock(), vec!["one", "two", "three", "four"]);

        let err = sink.close().unwrap_err().to_string();
        assert!(err.contains("unterminated"), "got: {err}");
    }

    #[test]
    fn ndjson_skips_empty_lines() {
        let (mut sink, seen) = collecting_ndjson();
        sink.write(b"\n\"a\"\n\n\"b\"\n\n").unwrap();
        assert_eq!(*seen.lock(), vec!["a", "b"]);
        assert!(sink.close().is_ok());
    }

    #[test]
    fn ndjson_recoverable_decode_error_drops_line() {
        let seen: Seen<String> = Arc::default();
        let sink_seen = Arc::clone(&seen);
        let mut sink = NdjsonLines::new(
            move |rec: String| {
                sink_seen.lock().push(rec);
                Ok(())
            },
            |_line, _err| Ok(()),
        );
        sink.write(b"\"ok\"\nnot json at all\n\"also ok\"\n").unwrap();
        sink.close().unwrap();
        assert_eq!(*seen.lock(), vec!["ok", "also ok"]);
    }

    #[test]
    fn ndjson_fatal_decode_error_halts() {
        let (mut sink, seen) = collecting_ndjson();
        sink.write(b"\"ok\"\n").unwrap();
        assert!(sink.write(b"garbage\n").is_err());
        assert_eq!(*seen.lock(), vec!["ok"]);
    }

    #[test]
    fn ndjson_unterminated_oversize_is_fatal() {
        let (mut sink, _seen) = collecting_ndjson();
        let big = vec![b'a'; MAX_RECORD_SIZE / 2];
        sink.write(&big).unwrap();
        sink.write(&big).unwrap();
        let err = sink.write(&[b'a']).unwrap_err().to_string();
        assert!(err.contains("exceeds maximum"), "got: {err}");
    }

    proptest::proptest! {
        #[test]
        fn binary_chunking_insensitivity(
            records in proptest::collection::vec(
                proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64), 1..8),
            split in proptest::prelude::any::<proptest::sample::Index>(),
        ) {
            let mut encoded = Vec::new();
            for r in &records {
                encode_length_delimited(r, &mut encoded);
            }
            let at = split.index(encoded.len() + 1);

            let (mut sink, seen) = collecting_binary();
            sink.write(&encoded[..at]).unwrap();
            sink.write(&encoded[at..]).unwrap();
            sink.close().unwrap();
            proptest::prop_assert_eq!(&*seen.lock(), &records);
        }

        #[test]
        fn ndjson_chunking_insensitivity(
            records in proptest::collection::vec("[a-z]{0,12}", 1..8),
            split in proptest::prelude::any::<proptest::sample::Index>(),
        ) {
            let mut encoded = Vec::new();
            for r in &records {
                encoded.extend_from_slice(serde_json::to_string(r).unwrap().as_bytes());
                encoded.push(b'\n');
            }
            let at = split.index(encoded.len() + 1);

            let (mut sink, seen) = collecting_ndjson();
            sink.write(&encoded[..at]).unwrap();
            sink.write(&encoded[at..]).unwrap();
            sink.close().unwrap();
            proptest::prop_assert_eq!(&*seen.lock(), &records);
        }
    }
}
