//! Incremental HTTP/1.1 request decoding over an async byte stream

use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::{split_target, CodecError, HttpRequest, MAX_HEADER_BYTES};

/// Read one request from `reader`.
///
/// Returns `Ok(None)` when the peer closes the stream before sending any
/// bytes, which is how idle keep-alive connections end.
pub async fn read_request<R>(
    reader: &mut R,
    max_body: usize,
) -> Result<Option<HttpRequest>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEADER_BYTES;

    // Tolerate stray CRLFs between pipelined requests.
    let request_line = loop {
        match read_line(reader, &mut budget).await? {
            None => return Ok(None),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/1.") => (m, t, v),
        _ => {
            return Err(CodecError::MalformedRequest(format!(
                "bad request line: {request_line}"
            )))
        }
    };
    if !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(CodecError::MalformedRequest(format!("bad method: {method}")));
    }

    let mut headers: HashMap<String, String> = HashMap::new();
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| CodecError::MalformedRequest("eof inside headers".to_string()))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedRequest(format!("bad header: {line}")))?;
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(CodecError::MalformedRequest("empty header name".to_string()));
        }
        let value = value.trim();
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));

    let body = if chunked {
        read_chunked_body(reader, max_body).await?
    } else {
        let len = match headers.get("content-length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| CodecError::MalformedRequest(format!("bad content-length: {v}")))?,
            None => 0,
        };
        if len > max_body {
            return Err(CodecError::BodyTooLarge { limit: max_body });
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(eof_as_malformed)?;
        body
    };

    let (path, query) = split_target(target);
    Ok(Some(HttpRequest {
        method: method.to_string(),
        path,
        query,
        version: version.to_string(),
        headers,
        body,
    }))
}

/// Read one CRLF (or bare LF) terminated line, charging it to `budget`
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<String>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(*budget as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if n > *budget {
        return Err(CodecError::HeadersTooLarge);
    }
    *budget -= n;
    if buf.last() != Some(&b'\n') {
        return Err(CodecError::MalformedRequest("unterminated line".to_string()));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| CodecError::MalformedRequest("non utf-8 header".to_string()))
}

async fn read_chunked_body<R>(reader: &mut R, max_body: usize) -> Result<Vec<u8>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut budget = MAX_HEADER_BYTES;
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| CodecError::MalformedRequest("eof inside chunked body".to_string()))?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| CodecError::MalformedRequest(format!("bad chunk size: {size_str}")))?;

        if size == 0 {
            // Trailers, up to the terminating empty line.
            loop {
                match read_line(reader, &mut budget).await? {
                    Some(l) if !l.is_empty() => continue,
                    _ => return Ok(body),
                }
            }
        }

        let end = body
            .len()
            .checked_add(size)
            .filter(|n| *n <= max_body)
            .ok_or(CodecError::BodyTooLarge { limit: max_body })?;
        let start = body.len();
        body.resize(end, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(eof_as_malformed)?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await.map_err(eof_as_malformed)?;
        if &crlf != b"\r\n" {
            return Err(CodecError::MalformedRequest(
                "chunk not followed by CRLF".to_string(),
            ));
        }
    }
}

fn eof_as_malformed(e: std::io::Error) -> CodecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::MalformedRequest("body shorter than declared".to_string())
    } else {
        CodecError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    async fn parse(raw: &[u8]) -> Result<Option<HttpRequest>, CodecError> {
        let mut reader = raw;
        read_request(&mut reader, 1024).await
    }

    #[tokio::test]
    async fn test_parse_post_with_body() {
        let raw = b"POST /mcp?sessionId=s1 HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: 4\r\n\r\nbody";
        let req = parse(raw).await.unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/mcp");
        assert_eq!(req.query.get("sessionId").map(String::as_str), Some("s1"));
        assert_eq!(req.header("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(req.body, b"body");
    }

    #[tokio::test]
    async fn test_header_names_are_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nmCp-SeSsIoN-iD: abc\r\n\r\n";
        let req = parse(raw).await.unwrap().unwrap();
        assert_eq!(req.header("Mcp-Session-Id"), Some("abc"));
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        let req = parse(raw).await.unwrap().unwrap();
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        assert!(parse(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_malformed() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(
            parse(raw).await,
            Err(CodecError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_request_line() {
        assert!(matches!(
            parse(b"hello\r\n\r\n").await,
            Err(CodecError::MalformedRequest(_))
        ));
        assert!(matches!(
            parse(b"POST / SPDY/3\r\n\r\n").await,
            Err(CodecError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5000\r\n\r\n";
        assert!(matches!(
            parse(raw).await,
            Err(CodecError::BodyTooLarge { limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_chunked_body() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\n";
        let req = parse(raw).await.unwrap().unwrap();
        assert_eq!(req.body, b"Wikipedia");
    }

    #[tokio::test]
    async fn test_chunked_body_limit() {
        let mut raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend_from_slice(b"400\r\n");
        raw.extend(std::iter::repeat(b'a').take(0x400));
        raw.extend_from_slice(b"\r\n1\r\nb\r\n0\r\n\r\n");
        assert!(matches!(
            parse(&raw).await,
            Err(CodecError::BodyTooLarge { limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_huge_chunk_size_is_too_large() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\nffffffffffffffff\r\n";
        assert!(matches!(
            parse(raw).await,
            Err(CodecError::BodyTooLarge { limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_headers() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES + 10));
        raw.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(
            parse(&raw).await,
            Err(CodecError::HeadersTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_body_split_across_reads() {
        let (client, server) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            let mut client = client;
            client
                .write_all(b"POST / HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello")
                .await
                .unwrap();
            tokio::task::yield_now().await;
            client.write_all(b" world").await.unwrap();
        });

        let mut reader = BufReader::new(server);
        let req = read_request(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(req.body, b"hello world");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_requests() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 1\r\n\r\naGET /health HTTP/1.1\r\n\r\n";
        let mut reader = &raw[..];
        let first = read_request(&mut reader, 1024).await.unwrap().unwrap();
        let second = read_request(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(first.body, b"a");
        assert_eq!(second.path, "/health");
        assert!(read_request(&mut reader, 1024).await.unwrap().is_none());
    }
}
