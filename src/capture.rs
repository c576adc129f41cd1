//! Extraction of the self-test report from the serial console output.
//!
//! After the diagnostic firmware boots, the board prints its boot log and
//! test chatter, then a single JSON object summarizing the self-tests. The
//! capture reads the raw byte stream, echoes everything outside the object
//! so the operator can follow the test, and returns the text of the first
//! complete top-level `{...}` object.
//!
//! The framing is a small state machine:
//!
//! ```text
//!              '{'                     '}' at depth 1
//!   Outside ---------> Inside(depth) -----------------> frame complete
//!    ^   |              |    ^    |
//!    '---'              '----'    | byte that cannot be JSON
//!   other bytes       '{' depth+1,|
//!   are echoed        '}' depth-1 v
//!                              Outside, accumulated bytes echoed
//! ```
//!
//! Braces are counted, so nested objects are captured whole, and braces
//! appearing inside JSON string literals are ignored. The boot ROM prints at
//! another baud rate, so the console starts with random bytes that may
//! include a `{`. An object is dropped as soon as it cannot be valid JSON:
//! a control or non-ASCII byte outside a string, a control byte inside a
//! string, anything but a key or `}` after `{`. A `{` where no value is
//! expected restarts the object.

use std::{
    io::{self, Read, Write},
    thread,
    time::Duration,
};

use hexplay::HexViewBuilder;
use log::{debug, log_enabled, trace, Level::Debug};
use serialport::SerialPort;

use crate::error::{ProvisionError, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// Read at most this many bytes from the port at once.
const READ_CHUNK: u32 = 4096;

/// A byte oriented input with a "bytes available" check, such as a serial
/// port.
pub trait ByteSource {
    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<u32>;
    /// Read into `buf`, returning the number of bytes read. A return of `0`
    /// means the source is closed.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}
impl ByteSource for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<u32> {
        Ok(self.bytes_to_read()?)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// The framing state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FrameState {
    /// Not inside an object; bytes are echoed.
    Outside,
    /// Accumulating an object.
    Inside {
        depth: usize,
        in_string: bool,
        escaped: bool,
        /// Last byte outside strings that was not whitespace, `"` once a
        /// string is closed.
        last: u8,
    },
}

/// What happened to a byte fed to the [`FrameCapture`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Feed {
    /// The byte is outside any object and should be shown to the operator.
    Echo(u8),
    /// The byte was added to the object being accumulated.
    Accumulated,
    /// The bytes accumulated so far turned out not to be an object. They
    /// should be shown to the operator like any other output.
    Discarded(Vec<u8>),
    /// The byte closed the top-level object; here is its text.
    Complete(String),
}

/// Incremental extractor of the first top-level JSON object in a byte
/// stream.
#[derive(Debug, Clone)]
pub struct FrameCapture {
    state: FrameState,
    buffer: Vec<u8>,
}
impl Default for FrameCapture {
    fn default() -> Self {
        FrameCapture::new()
    }
}
impl FrameCapture {
    pub fn new() -> Self {
        FrameCapture {
            state: FrameState::Outside,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Advance the framing state machine by one byte.
    pub fn feed(&mut self, byte: u8) -> Feed {
        let (depth, in_string, escaped, last) = match self.state {
            FrameState::Outside => {
                if byte != b'{' {
                    return Feed::Echo(byte);
                }
                self.buffer.clear();
                self.buffer.push(byte);
                self.state = FrameState::Inside {
                    depth: 1,
                    in_string: false,
                    escaped: false,
                    last: b'{',
                };
                return Feed::Accumulated;
            }
            FrameState::Inside {
                depth,
                in_string,
                escaped,
                last,
            } => (depth, in_string, escaped, last),
        };

        if in_string {
            // Raw control characters are not allowed in JSON strings
            if byte < 0x20 {
                return self.abandon(byte);
            }
            let closed = !escaped && byte == b'"';
            self.buffer.push(byte);
            self.state = FrameState::Inside {
                depth,
                in_string: !closed,
                escaped: !escaped && byte == b'\\',
                last: if closed { b'"' } else { last },
            };
            return Feed::Accumulated;
        }

        match byte {
            b' ' | b'\t' | b'\r' | b'\n' => {
                self.buffer.push(byte);
                Feed::Accumulated
            }
            _ if byte < 0x20 || byte >= 0x80 => self.abandon(byte),
            // An object can only start where a value is expected
            b'{' if !matches!(last, b':' | b',' | b'[') => self.restart(),
            // A key or the end of the object must follow `{`
            _ if last == b'{' && byte != b'"' && byte != b'}' => self.abandon(byte),
            b'{' => self.accumulate(byte, depth + 1),
            b'}' if depth == 1 => {
                self.state = FrameState::Outside;
                self.buffer.push(byte);
                let frame = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                Feed::Complete(frame)
            }
            b'}' => self.accumulate(byte, depth - 1),
            b'"' => {
                self.buffer.push(byte);
                self.state = FrameState::Inside {
                    depth,
                    in_string: true,
                    escaped: false,
                    last,
                };
                Feed::Accumulated
            }
            _ => self.accumulate(byte, depth),
        }
    }

    /// Block until a complete object has been read from `source`, echoing
    /// all bytes outside of it to `echo`.
    ///
    /// There is no timeout: the call returns only when an object is complete
    /// or when the source fails or closes, which is reported as a
    /// [`ProvisionError::TransportError`]. Bytes following the object in the
    /// same read are discarded.
    pub fn capture(
        &mut self,
        source: &mut dyn ByteSource,
        echo: &mut dyn Write,
        poll_interval: Duration,
    ) -> Result<String> {
        let mut serial_buf: Vec<u8> = vec![0; READ_CHUNK as usize];
        loop {
            // Only read what is already there so that the read never blocks
            // indefinitely on a half-open port.
            let available = source.bytes_available().map_err(transport_error)?;
            trace!("Bytes available to read: {}", available);
            if available == 0 {
                thread::sleep(poll_interval);
                continue;
            }

            let wanted = std::cmp::min(available, READ_CHUNK) as usize;
            let n = source
                .read_bytes(&mut serial_buf[..wanted])
                .map_err(transport_error)?;
            if n == 0 {
                return Err(ProvisionError::TransportError(
                    "serial connection closed".into(),
                ));
            }

            // Dump the received data in a hex table for debugging
            if log_enabled!(Debug) {
                let view = HexViewBuilder::new(&serial_buf[..n])
                    .address_offset(0)
                    .row_width(16)
                    .finish();
                debug!("received:\n{}", view);
            }

            let mut echoed: Vec<u8> = Vec::with_capacity(n);
            let mut frame = None;
            for byte in &serial_buf[..n] {
                match self.feed(*byte) {
                    Feed::Echo(b) => echoed.push(b),
                    Feed::Accumulated => {}
                    Feed::Discarded(bytes) => echoed.extend_from_slice(&bytes),
                    Feed::Complete(text) => {
                        frame = Some(text);
                        break;
                    }
                }
            }
            // Console echo is for the operator only, a broken stdout must not
            // abort the capture.
            let _ = echo.write_all(&echoed).and_then(|_| echo.flush());

            if let Some(text) = frame {
                debug!("captured frame of {} bytes", text.len());
                return Ok(text);
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

impl FrameCapture {
    fn accumulate(&mut self, byte: u8, depth: usize) -> Feed {
        self.buffer.push(byte);
        self.state = FrameState::Inside {
            depth,
            in_string: false,
            escaped: false,
            last: byte,
        };
        Feed::Accumulated
    }

    /// The bytes so far cannot be a JSON object: hand them back for echoing
    /// and look for the next `{`.
    fn abandon(&mut self, byte: u8) -> Feed {
        let mut discarded = std::mem::take(&mut self.buffer);
        discarded.push(byte);
        self.state = FrameState::Outside;
        trace!("dropped {} bytes of a broken object", discarded.len());
        Feed::Discarded(discarded)
    }

    /// Start over on the `{` just received.
    fn restart(&mut self) -> Feed {
        let discarded = std::mem::replace(&mut self.buffer, vec![b'{']);
        self.state = FrameState::Inside {
            depth: 1,
            in_string: false,
            escaped: false,
            last: b'{',
        };
        trace!("restarting the object after {} bytes", discarded.len());
        Feed::Discarded(discarded)
    }
}

fn transport_error(e: io::Error) -> ProvisionError {
    ProvisionError::TransportError(e.to_string())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out pre-recorded reads, then fails like an unplugged port.
    struct Scripted {
        reads: VecDeque<Vec<u8>>,
    }
    impl Scripted {
        fn new(reads: &[&[u8]]) -> Self {
            Scripted {
                reads: reads.iter().map(|r| r.to_vec()).collect(),
            }
        }
    }
    impl ByteSource for Scripted {
        fn bytes_available(&mut self) -> io::Result<u32> {
            match self.reads.front() {
                Some(r) => Ok(r.len() as u32),
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")),
            }
        }
        fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let r = self.reads.pop_front().unwrap_or_default();
            buf[..r.len()].copy_from_slice(&r);
            Ok(r.len())
        }
    }

    fn run(reads: &[&[u8]]) -> (Result<String>, Vec<u8>) {
        let mut source = Scripted::new(reads);
        let mut echo = Vec::new();
        let result = FrameCapture::new().capture(&mut source, &mut echo, Duration::from_millis(1));
        (result, echo)
    }

    #[test]
    fn frame_is_extracted_and_noise_echoed() {
        let (result, echo) = run(&[b"boot: ok\r\n{\"a\":true}\r\ntrailing"]);
        assert_eq!(result.unwrap(), "{\"a\":true}");
        assert_eq!(echo, b"boot: ok\r\n");
    }

    #[test]
    fn frame_split_across_reads() {
        let (result, echo) = run(&[b"I (32) boot", b": {\"nvs_pa", b"ssed\": tr", b"ue}"]);
        assert_eq!(result.unwrap(), "{\"nvs_passed\": true}");
        assert_eq!(echo, b"I (32) boot: ");
    }

    #[test]
    fn nested_objects_are_captured_whole() {
        let (result, _) = run(&[b"x{\"a\":{\"b\":1},\"c\":2}y"]);
        assert_eq!(result.unwrap(), "{\"a\":{\"b\":1},\"c\":2}");
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let (result, _) = run(&[br#"{"msg":"a } and \" {","ok":true}"#]);
        assert_eq!(result.unwrap(), r#"{"msg":"a } and \" {","ok":true}"#);
    }

    #[test]
    fn disconnect_is_a_transport_error() {
        let (result, echo) = run(&[b"log line\n{\"a\":"]);
        assert!(matches!(result, Err(ProvisionError::TransportError(_))));
        assert_eq!(echo, b"log line\n");
    }

    #[test]
    fn closing_brace_outside_an_object_is_echoed() {
        let mut capture = FrameCapture::new();
        assert_eq!(capture.feed(b'}'), Feed::Echo(b'}'));
        assert_eq!(capture.state(), FrameState::Outside);
    }

    #[test]
    fn state_returns_to_outside_after_a_frame() {
        let mut capture = FrameCapture::new();
        for b in b"{\"k\":1" {
            assert_eq!(capture.feed(*b), Feed::Accumulated);
        }
        assert_eq!(capture.feed(b'}'), Feed::Complete("{\"k\":1}".into()));
        assert_eq!(capture.state(), FrameState::Outside);
    }

    #[test]
    fn stray_open_brace_in_rom_noise_is_dropped() {
        let (result, echo) = run(&[
            b"\x13\x7b\x9c garbage\r\n",
            b"{\"nvs_passed\":true}\r\n",
        ]);
        assert_eq!(result.unwrap(), "{\"nvs_passed\":true}");
        assert_eq!(echo, b"\x13{\x9c garbage\r\n");
    }

    #[test]
    fn open_brace_followed_by_text_is_echoed() {
        let (result, echo) = run(&[b"rst:{ets Jun  8 2016\r\n{\"a\":1}"]);
        assert_eq!(result.unwrap(), "{\"a\":1}");
        assert_eq!(echo, b"rst:{ets Jun  8 2016\r\n");
    }

    #[test]
    fn unexpected_open_brace_restarts_the_object() {
        let (result, echo) = run(&[b"{\"boot\":\"x\" {\"a\":{\"b\":2}}"]);
        assert_eq!(result.unwrap(), "{\"a\":{\"b\":2}}");
        assert_eq!(echo, b"{\"boot\":\"x\" ");
    }

    #[test]
    fn line_break_inside_a_string_drops_the_object() {
        let (result, echo) = run(&[b"{\"msg\r\n{\"ok\":true}"]);
        assert_eq!(result.unwrap(), "{\"ok\":true}");
        assert_eq!(echo, b"{\"msg\r\n");
    }

    #[test]
    fn pretty_printed_report_is_captured_whole() {
        let frame = "{\n  \"a\": {\n    \"b\": [1, {\"c\": null}]\n  },\n  \"d\": true\n}";
        let (result, echo) = run(&[b"I (90) test: done\r\n", frame.as_bytes()]);
        assert_eq!(result.unwrap(), frame);
        assert_eq!(echo, b"I (90) test: done\r\n");
    }

    #[test]
    fn any_noise_around_a_single_frame() {
        let frame = "{\"wifi_passed\":false,\"mac_address\":\"24:6F:28:AA:BB:CC\"}";
        let prefixes: &[&[u8]] = &[
            b"",
            b"\r\n",
            b"ets Jun  8 2016 00:22:57\r\n",
            &[0u8, 0xff, 0x7f],
            &[0x7b, 0x9c, b'\n'],
            b"{{{ x",
        ];
        let suffixes: &[&[u8]] = &[b"", b"\n", b"done"];
        for prefix in prefixes {
            for suffix in suffixes {
                let mut stream = prefix.to_vec();
                stream.extend_from_slice(frame.as_bytes());
                stream.extend_from_slice(suffix);
                let (result, echo) = run(&[stream.as_slice()]);
                assert_eq!(result.unwrap(), frame);
                assert_eq!(&echo[..], *prefix);
            }
        }
    }
}
