//! Bounded decoder for server-sent-event `data:` payloads.

use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{RelayError, Result};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>, max_bytes: usize) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }
        let newline = buf.iter().position(|byte| *byte == b'\n');
        let take = newline.map(|pos| pos + 1).unwrap_or(buf.len());
        if out.len().saturating_add(take) > max_bytes {
            return Err(RelayError::InvalidResponse(format!(
                "SSE line exceeds max_line_bytes={max_bytes}"
            )));
        }
        out.extend_from_slice(&buf[..take]);
        reader.consume(take);
        if newline.is_some() {
            return Ok(true);
        }
    }
}

/// Read the next event's joined `data:` payload. `[DONE]` and end-of-input
/// both terminate the sequence.
async fn next_event<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    event: &mut String,
    limits: SseLimits,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    event.clear();
    loop {
        let has_line = read_line_limited(reader, line, limits.max_line_bytes).await?;
        if !has_line {
            if event.is_empty() {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(event)));
        }

        let text = std::str::from_utf8(line)
            .map_err(|err| RelayError::InvalidResponse(format!("invalid SSE UTF-8: {err}")))?;
        let text = text.trim_end_matches(['\r', '\n']);

        if text.is_empty() {
            if event.is_empty() {
                continue;
            }
            if event == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(event)));
        }

        if let Some(rest) = text.strip_prefix("data:") {
            let rest = rest.trim_start();
            let separator = usize::from(!event.is_empty());
            if event
                .len()
                .saturating_add(separator)
                .saturating_add(rest.len())
                > limits.max_event_bytes
            {
                return Err(RelayError::InvalidResponse(format!(
                    "SSE event exceeds max_event_bytes={}",
                    limits.max_event_bytes
                )));
            }
            if separator == 1 {
                event.push('\n');
            }
            event.push_str(rest);
        }
    }
}

pub fn sse_events<R>(reader: R, limits: SseLimits) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::new(), String::new()),
        move |(mut reader, mut line, mut event)| async move {
            match next_event(&mut reader, &mut line, &mut event, limits).await? {
                Some(data) => Ok(Some((data, (reader, line, event)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn sse_events_from_response(response: reqwest::Response) -> BoxStream<'static, Result<String>> {
    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    let reader = tokio::io::BufReader::new(StreamReader::new(bytes));
    sse_events(reader, SseLimits::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn reader_for(raw: &str) -> impl AsyncBufRead + Unpin + Send + 'static {
        let stream = stream::iter([Ok::<_, std::io::Error>(Bytes::from(raw.to_owned()))]);
        tokio::io::BufReader::new(StreamReader::new(stream))
    }

    #[tokio::test]
    async fn parses_data_events_and_stops_at_done() -> Result<()> {
        let raw = concat!(
            "event: message\n",
            "data: {\"a\":1}\n\n",
            "data: one\n",
            "data: two\n\n",
            "data: [DONE]\n\n",
            "data: after\n\n",
        );
        let mut events = sse_events(reader_for(raw), SseLimits::default());
        let mut out = Vec::new();
        while let Some(item) = events.next().await {
            out.push(item?);
        }
        assert_eq!(out, vec!["{\"a\":1}", "one\ntwo"]);
        Ok(())
    }

    #[tokio::test]
    async fn enforces_line_limit() {
        let raw = format!("data: {}\n\n", "x".repeat(512));
        let mut events = sse_events(
            reader_for(&raw),
            SseLimits {
                max_line_bytes: 64,
                max_event_bytes: 4096,
            },
        );
        let err = events.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("max_line_bytes"));
    }

    #[tokio::test]
    async fn enforces_event_limit() {
        let raw = format!("data: {}\ndata: {}\n\n", "a".repeat(100), "b".repeat(100));
        let mut events = sse_events(
            reader_for(&raw),
            SseLimits {
                max_line_bytes: 4096,
                max_event_bytes: 128,
            },
        );
        let err = events.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("max_event_bytes"));
    }
}
