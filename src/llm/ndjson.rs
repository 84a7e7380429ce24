//! Newline-delimited JSON framing over a chunked byte stream.
//!
//! Chunks may split a line (or a multi-byte character) anywhere, so bytes are
//! buffered until a full line is available.

use super::{LlmError, LlmResult};
use futures::stream::{self, Stream, StreamExt};
use std::fmt::Display;
use std::pin::Pin;

struct LineState<S> {
    inner: Pin<Box<S>>,
    buf: Vec<u8>,
    done: bool,
}

impl<S> LineState<S> {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        Some(line)
    }
}

fn decode(line: Vec<u8>) -> Option<LlmResult<String>> {
    match String::from_utf8(line) {
        Ok(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| Ok(trimmed.to_string()))
        }
        Err(e) => Some(Err(LlmError::ParseError(e.to_string()))),
    }
}

/// Split a byte stream into non-empty, trimmed lines
pub fn ndjson_lines<S, B, E>(inner: S) -> impl Stream<Item = LlmResult<String>> + Send
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let state = LineState {
        inner: Box::pin(inner),
        buf: Vec::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.take_line() {
                match decode(line) {
                    Some(item) => return Some((item, st)),
                    None => continue,
                }
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    st.done = true;
                    st.buf.clear();
                    return Some((Err(LlmError::ApiError(e.to_string())), st));
                }
                None => {
                    st.done = true;
                    // Trailing line without a newline
                    let rest = std::mem::take(&mut st.buf);
                    if let Some(item) = decode(rest) {
                        return Some((item, st));
                    }
                    return None;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn lines(chunks: Vec<Result<&'static [u8], &'static str>>) -> Vec<LlmResult<String>> {
        ndjson_lines(stream::iter(chunks)).collect().await
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let out = lines(vec![
            Ok(b"{\"a\":1}\n{\"b\"".as_slice()),
            Ok(b":2}\n\n".as_slice()),
            Ok(b"{\"c\":3}".as_slice()),
        ])
        .await;
        assert_eq!(
            out,
            vec![
                Ok("{\"a\":1}".to_string()),
                Ok("{\"b\":2}".to_string()),
                Ok("{\"c\":3}".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_multibyte_character_split_between_chunks() {
        let bytes = "{\"t\":\"ü\"}\n".as_bytes();
        // Split inside the two-byte 'ü'
        let (a, b) = bytes.split_at(7);
        let a: &'static [u8] = Box::leak(a.to_vec().into_boxed_slice());
        let b: &'static [u8] = Box::leak(b.to_vec().into_boxed_slice());

        let out = lines(vec![Ok(a), Ok(b)]).await;
        assert_eq!(out, vec![Ok("{\"t\":\"ü\"}".to_string())]);
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let out = lines(vec![
            Ok(b"{\"a\":1}\n{\"b".as_slice()),
            Err("connection reset"),
            Ok(b"{\"c\":3}\n".as_slice()),
        ])
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Ok("{\"a\":1}".to_string()));
        assert_eq!(out[1], Err(LlmError::ApiError("connection reset".to_string())));
    }
}
