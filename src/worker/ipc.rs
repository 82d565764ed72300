//! Blocking line I/O over the worker's IPC socket.
//!
//! The child side of the protocol is synchronous: one thread reads a request,
//! runs it, and writes replies back over the same socket.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create from a raw file descriptor (takes ownership).
    ///
    /// # Safety
    /// The caller must ensure `fd` is a valid open file descriptor that nothing
    /// else owns.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    /// Duplicate the descriptor so a socket can be read and written from two handles.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered line reader.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line_buffer: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read a line without its terminator. Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        if self.reader.read_line(&mut self.line_buffer)? == 0 {
            return Ok(None);
        }
        if self.line_buffer.ends_with('\n') {
            self.line_buffer.pop();
        }
        if self.line_buffer.ends_with('\r') {
            self.line_buffer.pop();
        }
        Ok(Some(&self.line_buffer))
    }
}

/// Buffered line writer. Every line is flushed as soon as it is written.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

/// Open both halves of the protocol socket from a single descriptor.
pub fn split(fd: PipeFd) -> io::Result<(LineReader, LineWriter)> {
    let write_half = fd.try_clone()?;
    Ok((LineReader::new(fd), LineWriter::new(write_half)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn socket_pair() -> (PipeFd, PipeFd) {
        let (a, b) = UnixStream::pair().expect("Failed to create socket pair");
        (PipeFd::new(a.into()), PipeFd::new(b.into()))
    }

    #[test]
    fn test_line_roundtrip_over_socket() {
        let (ours, theirs) = socket_pair();
        let mut writer = LineWriter::new(ours);
        let mut reader = LineReader::new(theirs);

        writer.write_line("hello").unwrap();
        writer.write_line("world\n").unwrap();
        writer.write_line("").unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap(), Some("hello"));
        assert_eq!(reader.read_line().unwrap(), Some("world"));
        assert_eq!(reader.read_line().unwrap(), Some(""));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_crlf_is_stripped() {
        let (ours, theirs) = socket_pair();
        let mut writer = LineWriter::new(ours);
        let mut reader = LineReader::new(theirs);

        writer.write_line("line1\r\n").unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap(), Some("line1"));
    }

    #[test]
    fn test_split_is_bidirectional() {
        let (ours, theirs) = socket_pair();
        let (mut our_reader, mut our_writer) = split(ours).unwrap();
        let (mut their_reader, mut their_writer) = split(theirs).unwrap();

        our_writer.write_line("ping").unwrap();
        assert_eq!(their_reader.read_line().unwrap(), Some("ping"));

        their_writer.write_line("pong").unwrap();
        assert_eq!(our_reader.read_line().unwrap(), Some("pong"));
    }

    #[test]
    fn test_eof_needs_every_clone_closed() {
        let (ours, theirs) = socket_pair();
        let clone = ours.try_clone().unwrap();
        let mut reader = LineReader::new(theirs);

        let mut writer = LineWriter::new(ours);
        writer.write_line("a").unwrap();
        drop(writer);
        assert_eq!(reader.read_line().unwrap(), Some("a"));

        drop(clone);
        assert_eq!(reader.read_line().unwrap(), None);
    }
}
