//! Sentinel-framed request/response protocol over the engine's pipes.
//!
//! The engine's streaming mode reads log lines from stdin and, after
//! processing each one, prints a fixed separator line. Everything between
//! a request and its separator is that request's response. This module
//! frames that byte stream so the protocol can be exercised against
//! in-memory duplex streams instead of a spawned process.

use monitord_protocol::SkipReason;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Line the engine prints after each processed batch.
pub const RESPONSE_SEPARATOR: &str = "## end of response ##";

/// Line the engine prints once a `-replay` file has been fully consumed
/// and it switches to reading live input from stdin.
pub const REPLAY_DONE_MARKER: &str = "## replay complete, awaiting live input ##";

/// Directive that makes the engine persist its internal state and exit
/// cleanly. The path names the state blob to write.
pub fn save_and_exit_directive(path: &std::path::Path) -> String {
    format!("> save_and_exit {} <\n", path.display())
}

const OUT_OF_ORDER_MARKER: &str = "out of order";
const ERROR_MARKER: &str = "ERROR";

/// Aggregated engine output for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineResponse {
    pub lines: Vec<String>,
}

impl EngineResponse {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// The engine warned that this timepoint's timestamp went backwards.
    pub fn is_out_of_order(&self) -> bool {
        self.lines
            .iter()
            .any(|l| l.to_ascii_lowercase().contains(OUT_OF_ORDER_MARKER))
    }

    pub fn is_error(&self) -> bool {
        self.lines.iter().any(|l| l.contains(ERROR_MARKER))
    }

    /// Classify the response for the ingest path: a skip reason excludes
    /// the timepoint from persistence but never drops it silently.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        if self.is_out_of_order() {
            Some(SkipReason::OutOfOrder)
        } else if self.is_error() {
            Some(SkipReason::EngineError)
        } else {
            None
        }
    }
}

/// Frames a write half + read half into request/response exchanges.
pub struct SentinelFramed<W, R> {
    writer: W,
    reader: BufReader<R>,
}

impl<W, R> SentinelFramed<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            writer,
            reader: BufReader::new(reader),
        }
    }

    /// Write one fully-formed line. A trailing newline is added when the
    /// caller did not provide one.
    pub async fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await
    }

    /// Collect output lines until the separator. EOF before the separator
    /// is an `UnexpectedEof` error; the caller decides whether the child
    /// died or the pipe broke.
    pub async fn read_response(&mut self) -> std::io::Result<EngineResponse> {
        self.read_until_marker(RESPONSE_SEPARATOR).await
    }

    /// Collect output lines until `marker` appears on a line of its own.
    pub async fn read_until_marker(&mut self, marker: &str) -> std::io::Result<EngineResponse> {
        let mut response = EngineResponse::default();
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("engine closed its output before {marker:?}"),
                ));
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == marker {
                return Ok(response);
            }
            response.lines.push(trimmed.to_string());
        }
    }

    /// One blocking-synchronous exchange: send the line, read until the
    /// separator.
    pub async fn request(&mut self, line: &str) -> std::io::Result<EngineResponse> {
        self.send(line).await?;
        self.read_response().await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tokio::io::AsyncReadExt;

    /// Fake engine: read a line, reply with scripted output plus the
    /// separator. Runs over in-memory duplex pipes.
    fn scripted_engine(
        replies: Vec<Vec<&'static str>>,
    ) -> (
        SentinelFramed<tokio::io::DuplexStream, tokio::io::DuplexStream>,
        tokio::task::JoinHandle<()>,
    ) {
        let (client_w, mut server_r) = tokio::io::duplex(4096);
        let (mut server_w, client_r) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(&mut server_r);
            for reply in replies {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                for out in reply {
                    server_w
                        .write_all(format!("{out}\n").as_bytes())
                        .await
                        .unwrap();
                }
                server_w
                    .write_all(format!("{RESPONSE_SEPARATOR}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });
        (SentinelFramed::new(client_w, client_r), handle)
    }

    #[tokio::test]
    async fn aggregates_lines_until_separator() {
        let (mut framed, server) =
            scripted_engine(vec![vec!["At time point 0:", "false"]]);
        let resp = framed.request("@10 P (1) ;").await.unwrap();
        assert_eq!(resp.lines, vec!["At time point 0:", "false"]);
        assert!(resp.skip_reason().is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn consecutive_requests_stay_framed() {
        let (mut framed, server) = scripted_engine(vec![vec!["first"], vec!["second"]]);
        assert_eq!(
            framed.request("@1 ;").await.unwrap().lines,
            vec!["first"]
        );
        assert_eq!(
            framed.request("@2 ;").await.unwrap().lines,
            vec!["second"]
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn classifies_out_of_order_warning() {
        let (mut framed, server) = scripted_engine(vec![vec![
            "WARNING: Skipping out of order timestamp 5 (last: 10)",
        ]]);
        let resp = framed.request("@5 ;").await.unwrap();
        assert_eq!(resp.skip_reason(), Some(SkipReason::OutOfOrder));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn classifies_error_output() {
        let (mut framed, server) = scripted_engine(vec![vec!["ERROR: unknown predicate Z"]]);
        let resp = framed.request("@5 Z (1) ;").await.unwrap();
        assert_eq!(resp.skip_reason(), Some(SkipReason::EngineError));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn eof_before_separator_is_unexpected_eof() {
        let (client_w, _server_r) = tokio::io::duplex(64);
        let (server_w, client_r) = tokio::io::duplex(64);
        drop(server_w);
        let mut framed = SentinelFramed::new(client_w, client_r);
        let err = framed.request("@1 ;").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn read_until_replay_marker() {
        let (client_w, _server_r) = tokio::io::duplex(1024);
        let (mut server_w, client_r) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            for line in ["replaying 3 timepoints", REPLAY_DONE_MARKER] {
                server_w
                    .write_all(format!("{line}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });
        let mut framed = SentinelFramed::new(client_w, client_r);
        let resp = framed.read_until_marker(REPLAY_DONE_MARKER).await.unwrap();
        assert_eq!(resp.lines, vec!["replaying 3 timepoints"]);
    }

    #[tokio::test]
    async fn send_appends_missing_newline() {
        let (client_w, mut server_r) = tokio::io::duplex(64);
        let (_server_w, client_r) = tokio::io::duplex(64);
        let mut framed = SentinelFramed::new(client_w, client_r);
        framed.send("@1 ;").await.unwrap();
        drop(framed);
        let mut buf = String::new();
        server_r.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "@1 ;\n");
    }
}
