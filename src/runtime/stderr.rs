//! Bounded capture of a connector's stderr.

/// Default capture limit. A crashing connector can emit gigabytes of stderr;
/// error messages only ever need a short prefix.
pub const DEFAULT_STDERR_CAP: usize = 4096;

/// Write-sink retaining at most `cap` bytes of whatever is written to it.
/// Writes always report full consumption so the feeding copy loop never
/// stalls or errors on account of the cap.
#[derive(Debug)]
pub struct BoundedStderr {
    buf: Vec<u8>,
    cap: usize,
}

impl Default for BoundedStderr {
    fn default() -> Self {
        Self::with_cap(DEFAULT_STDERR_CAP)
    }
}

impl BoundedStderr {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(DEFAULT_STDERR_CAP)),
            cap,
        }
    }

    /// Append `chunk`, discarding anything past the cap. Returns the full
    /// chunk length, as a well-behaved sink.
    pub fn write(&mut self, chunk: &[u8]) -> usize {
        let room = self.cap.saturating_sub(self.buf.len());
        let keep = chunk.len().min(room);
        self.buf.extend_from_slice(&chunk[..keep]);
        chunk.len()
    }

    /// The captured prefix, lossily decoded for inclusion in error messages.
    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl std::io::Write for BoundedStderr {
    fn write(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        Ok(BoundedStderr::write(self, chunk))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_limit_but_reports_full_writes() {
        let mut sink = BoundedStderr::with_cap(8);
        assert_eq!(sink.write(b"hello"), 5);
        assert_eq!(sink.write(b" world, more"), 12);
        assert_eq!(sink.len(), 8);
        assert_eq!(sink.snapshot(), "hello wo");
    }

    #[test]
    fn lossy_snapshot_of_invalid_utf8() {
        let mut sink = BoundedStderr::default();
        sink.write(b"ok \xff\xfe tail");
        assert!(sink.snapshot().starts_with("ok "));
        assert!(sink.snapshot().ends_with(" tail"));
    }

    #[test]
    fn exact_cap_boundary() {
        let mut sink = BoundedStderr::with_cap(4);
        assert_eq!(sink.write(b"abcd"), 4);
        assert_eq!(sink.write(b"efgh"), 4);
        assert_eq!(sink.snapshot(), "abcd");
    }
}
