//! Bridges process output and wire traffic into the active test's log.
//!
//! A fixture outlives the subtests that use it, but its output should show
//! up under whichever subtest is running when it is produced. A
//! [`TestWriter`] holds the currently bound [`TestHandle`] behind a mutex so
//! the stdout reader task can write while the test task rebinds it.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::testing::{lock, TestHandle};

/// Tag for bytes read from the server.
pub const RECV: &str = "RECV";
/// Tag for bytes written to the server.
pub const SENT: &str = "SENT";

/// Rebindable sink that forwards lines to the current test.
///
/// Writes made while no test is bound are dropped and still count as
/// successful.
#[derive(Debug, Default)]
pub struct TestWriter {
    tag: &'static str,
    current: Mutex<Option<TestHandle>>,
}

impl TestWriter {
    /// Create an unbound writer whose lines are prefixed with `tag`.
    pub fn new(tag: &'static str) -> Self {
        Self {
            tag,
            current: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Send subsequent writes to `t`.
    pub fn bind(&self, t: &TestHandle) {
        *lock(&self.current) = Some(t.clone());
    }

    /// Stop forwarding writes.
    pub fn unbind(&self) {
        *lock(&self.current) = None;
    }

    /// Name of the bound test, if any.
    pub fn bound_to(&self) -> Option<String> {
        lock(&self.current).as_ref().map(|t| t.name().to_string())
    }

    /// Forward one line to the bound test.
    pub fn write_line(&self, line: &str) {
        let current = lock(&self.current);
        match current.as_ref() {
            Some(t) if self.tag.is_empty() => t.log(line),
            Some(t) => t.log(format_args!("{} {}", self.tag, line)),
            None => trace!(tag = self.tag, "dropping fixture output, no test bound"),
        }
    }

    /// Forward raw bytes, one log line per line of input.
    pub fn write_bytes(&self, buf: &[u8]) {
        let text = String::from_utf8_lossy(buf);
        for line in text.lines() {
            self.write_line(line);
        }
    }
}

impl io::Write for &TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Stream wrapper that mirrors traffic into a pair of [`TestWriter`]s.
///
/// Bytes read from the inner stream go to `recv`, bytes written to it go to
/// `sent`. Protocol code that negotiates a session over a fixture socket can
/// wrap its transport in this to get the exchange in the test log.
#[derive(Debug)]
pub struct TeeStream<S> {
    inner: S,
    recv: Arc<TestWriter>,
    sent: Arc<TestWriter>,
}

impl<S> TeeStream<S> {
    pub fn new(inner: S, recv: Arc<TestWriter>, sent: Arc<TestWriter>) -> Self {
        Self { inner, recv, sent }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TeeStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = &buf.filled()[before..];
            if !read.is_empty() {
                self.recv.write_bytes(read);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TeeStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.sent.write_bytes(&buf[..*n]);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_unbound_writes_are_discarded() {
        let mut w = TestWriter::new("");
        assert_eq!(w.write(b"hello\n").unwrap(), 6);
        assert!(w.bound_to().is_none());
    }

    #[test]
    fn test_rebinding_moves_output() {
        let w = TestWriter::new(RECV);
        let first = TestHandle::new("t/prosody/0");
        let second = TestHandle::new("t/prosody/1");

        w.bind(&first);
        w.write_line("<stream:stream>");
        w.bind(&second);
        w.write_line("<presence/>");
        w.unbind();
        w.write_line("lost");

        assert_eq!(first.logs(), vec!["RECV <stream:stream>"]);
        assert_eq!(second.logs(), vec!["RECV <presence/>"]);
    }

    #[test]
    fn test_multi_line_writes_split() {
        let w = TestWriter::new("");
        let t = TestHandle::new("t");
        w.bind(&t);
        (&w).write_all(b"one\ntwo\r\nthree").unwrap();
        assert_eq!(t.logs(), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_concurrent_writers_and_rebinds() {
        let w = Arc::new(TestWriter::new(""));
        let t = TestHandle::new("t");
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let w = w.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        w.write_line(&format!("{i}-{j}"));
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            w.bind(&t);
            w.unbind();
        }
        for handle in writers {
            handle.join().unwrap();
        }
        assert!(t.logs().len() <= 200);
    }

    #[tokio::test]
    async fn test_tee_stream_logs_both_directions() {
        let (client, mut server) = tokio::io::duplex(64);
        let recv = Arc::new(TestWriter::new(RECV));
        let sent = Arc::new(TestWriter::new(SENT));
        let t = TestHandle::new("tee");
        recv.bind(&t);
        sent.bind(&t);

        let mut tee = TeeStream::new(client, recv, sent);
        tee.write_all(b"<iq type='get'/>").await.unwrap();
        let mut buf = [0u8; 16];
        server.read_exact(&mut buf).await.unwrap();
        server.write_all(b"<iq type='result'/>").await.unwrap();
        let mut reply = vec![0u8; 19];
        tee.read_exact(&mut reply).await.unwrap();

        let logs = t.logs();
        assert_eq!(logs[0], "SENT <iq type='get'/>");
        assert!(logs[1..].iter().all(|l| l.starts_with("RECV ")));
        assert_eq!(
            logs[1..]
                .iter()
                .map(|l| &l["RECV ".len()..])
                .collect::<String>(),
            "<iq type='result'/>"
        );
    }
}
