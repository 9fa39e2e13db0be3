//! HTTP/1.x framing.
//!
//! A cycle in the request direction relays one full request (head and body)
//! to the backend and one full response back, so exactly one exchange is
//! consumed before control returns to the connection loop. Heads are parsed
//! with `httparse`; bodies are framed by `Transfer-Encoding: chunked`,
//! `Content-Length` or, for responses only, the backend closing the socket.

use async_trait::async_trait;
use bytes::Bytes;

use super::{abort_handling, MessageReader, Protocol, ProtocolOptions, MAX_HEAD};
use crate::behavior::{Direction, Forward};
use crate::endpoint::Endpoint;
use crate::error::ProtocolError;

const NAME: &str = "http";
const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone)]
struct Header {
    name: String,
    value: Vec<u8>,
}

#[derive(Debug)]
struct RequestHead {
    raw: Bytes,
    method: String,
    path: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Vec<Header>,
}

#[derive(Debug)]
struct ResponseHead {
    raw: Bytes,
    code: u16,
    version: u8,
    headers: Vec<Header>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLength {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

fn owned(headers: &[httparse::Header<'_>]) -> Vec<Header> {
    headers
        .iter()
        .map(|h| Header {
            name: h.name.to_string(),
            value: h.value.to_vec(),
        })
        .collect()
}

/// A message head parsed from the start of a buffer.
trait ParsedHead: Sized {
    fn parse(buf: &[u8]) -> Result<Option<Self>, ProtocolError>;

    /// The head exactly as received.
    fn raw(&self) -> &Bytes;
}

impl ParsedHead for RequestHead {
    fn parse(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        parse_request(buf)
    }

    fn raw(&self) -> &Bytes {
        &self.raw
    }
}

impl ParsedHead for ResponseHead {
    fn parse(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        parse_response(buf)
    }

    fn raw(&self) -> &Bytes {
        &self.raw
    }
}

fn parse_request(buf: &[u8]) -> Result<Option<RequestHead>, ProtocolError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => Ok(Some(RequestHead {
            raw: Bytes::copy_from_slice(&buf[..len]),
            method: req.method.unwrap_or_default().to_string(),
            path: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers: owned(req.headers),
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProtocolError::malformed(NAME, format!("request: {e}"))),
    }
}

fn parse_response(buf: &[u8]) -> Result<Option<ResponseHead>, ProtocolError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => Ok(Some(ResponseHead {
            raw: Bytes::copy_from_slice(&buf[..len]),
            code: res.code.unwrap_or_default(),
            version: res.version.unwrap_or(1),
            headers: owned(res.headers),
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProtocolError::malformed(NAME, format!("response: {e}"))),
    }
}

/// Lowercased comma-separated tokens of every `name` header.
fn header_tokens(headers: &[Header], name: &str) -> Vec<String> {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
        .flat_map(|h| {
            String::from_utf8_lossy(&h.value)
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Persistent-connection semantics of RFC 9112: HTTP/1.1 defaults to
/// keep-alive, HTTP/1.0 to close.
fn keep_alive(version: u8, headers: &[Header]) -> bool {
    let tokens = header_tokens(headers, "connection");
    if tokens.iter().any(|t| t == "close") {
        return false;
    }
    version >= 1 || tokens.iter().any(|t| t == "keep-alive")
}

fn is_chunked(headers: &[Header]) -> bool {
    header_tokens(headers, "transfer-encoding")
        .last()
        .is_some_and(|t| t == "chunked")
}

fn content_length(headers: &[Header]) -> Result<Option<u64>, ProtocolError> {
    let mut length = None;
    for header in headers.iter().filter(|h| h.name.eq_ignore_ascii_case("content-length")) {
        let value: u64 = std::str::from_utf8(&header.value)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ProtocolError::malformed(NAME, "invalid Content-Length"))?;
        if length.is_some_and(|l| l != value) {
            return Err(ProtocolError::malformed(NAME, "conflicting Content-Length"));
        }
        length = Some(value);
    }
    Ok(length)
}

fn request_body(headers: &[Header]) -> Result<BodyLength, ProtocolError> {
    if is_chunked(headers) {
        return Ok(BodyLength::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyLength::Empty,
        Some(n) => BodyLength::Fixed(n),
    })
}

fn response_body(method: Option<&str>, head: &ResponseHead) -> Result<BodyLength, ProtocolError> {
    if head.code == 101 {
        return Ok(BodyLength::UntilClose);
    }
    if method == Some("HEAD") || (100..200).contains(&head.code) || matches!(head.code, 204 | 304) {
        return Ok(BodyLength::Empty);
    }
    if is_chunked(&head.headers) {
        return Ok(BodyLength::Chunked);
    }
    Ok(match content_length(&head.headers)? {
        Some(0) => BodyLength::Empty,
        Some(n) => BodyLength::Fixed(n),
        None => BodyLength::UntilClose,
    })
}

/// Read a full head. `None` if the peer closed before sending anything.
async fn read_head<T: ParsedHead>(reader: &mut MessageReader<'_>) -> Result<Option<T>, ProtocolError> {
    loop {
        if !reader.buffered().is_empty() {
            if let Some(head) = T::parse(reader.buffered())? {
                reader.consume(head.raw().len());
                return Ok(Some(head));
            }
            if reader.buffered().len() > MAX_HEAD {
                return Err(ProtocolError::malformed(
                    NAME,
                    format!("header block larger than {MAX_HEAD} bytes"),
                ));
            }
        }
        if !reader.fill().await? {
            if reader.buffered().is_empty() {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated);
        }
    }
}

async fn relay_body(
    reader: &mut MessageReader<'_>,
    dest: &Endpoint,
    length: BodyLength,
) -> Result<(), ProtocolError> {
    match length {
        BodyLength::Empty => {}
        BodyLength::Fixed(n) => reader.relay_exact(dest, n).await?,
        BodyLength::UntilClose => {
            reader.relay_to_eof(dest).await?;
        }
        BodyLength::Chunked => loop {
            let line = reader
                .line(NAME, MAX_HEAD)
                .await?
                .ok_or(ProtocolError::Truncated)?;
            let size = match httparse::parse_chunk_size(&line) {
                Ok(httparse::Status::Complete((_, size))) => size,
                _ => return Err(ProtocolError::malformed(NAME, "invalid chunk size")),
            };
            dest.write_all(&line).await?;

            if size == 0 {
                loop {
                    let trailer = reader
                        .line(NAME, MAX_HEAD)
                        .await?
                        .ok_or(ProtocolError::Truncated)?;
                    dest.write_all(&trailer).await?;
                    if trailer.as_ref() == b"\r\n" || trailer.as_ref() == b"\n" {
                        break;
                    }
                }
                break;
            }
            // Chunk data plus its CRLF.
            let chunk = size
                .checked_add(2)
                .ok_or_else(|| ProtocolError::malformed(NAME, format!("chunk of {size} bytes")))?;
            reader.relay_exact(dest, chunk).await?;
        },
    }
    Ok(())
}

/// HTTP/1.x request/response exchanges.
#[derive(Debug)]
pub struct Http {
    options: ProtocolOptions,
    /// Backend address written into `Host` when rewriting is on.
    backend: String,
}

impl Http {
    pub fn new(options: ProtocolOptions, backend: String) -> Self {
        Self { options, backend }
    }

    fn rewrite_host(&self, head: &RequestHead) -> Vec<u8> {
        let mut out =
            format!("{} {} HTTP/1.{}\r\n", head.method, head.path, head.version).into_bytes();
        for header in &head.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            if header.name.eq_ignore_ascii_case("host") {
                out.extend_from_slice(self.backend.as_bytes());
            } else {
                out.extend_from_slice(&header.value);
            }
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Relay one request from the client and its response from the backend.
    async fn exchange(&self, fwd: &Forward<'_>) -> Result<Option<bool>, ProtocolError> {
        let mut request = MessageReader::new(fwd.source, self.options.buffer);
        let Some(head) = read_head::<RequestHead>(&mut request).await? else {
            return Ok(None);
        };

        if self.options.overwrite_host_header {
            fwd.dest.write_all(&self.rewrite_host(&head)).await?;
        } else {
            fwd.dest.write_all(&head.raw).await?;
        }
        relay_body(&mut request, fwd.dest, request_body(&head.headers)?).await?;
        request.finish().await;

        let response_keep_alive = self
            .relay_response(fwd.dest, fwd.source, Some(&head.method))
            .await?
            .ok_or(ProtocolError::Truncated)?;
        Ok(Some(
            response_keep_alive && keep_alive(head.version, &head.headers),
        ))
    }

    /// Relay one final response, forwarding interim 1xx responses first.
    async fn relay_response(
        &self,
        from: &Endpoint,
        to: &Endpoint,
        method: Option<&str>,
    ) -> Result<Option<bool>, ProtocolError> {
        let mut response = MessageReader::new(from, self.options.buffer);
        loop {
            let Some(head) = read_head::<ResponseHead>(&mut response).await? else {
                return Ok(None);
            };
            to.write_all(&head.raw).await?;
            if (100..200).contains(&head.code) && head.code != 101 {
                continue;
            }

            let length = response_body(method, &head)?;
            relay_body(&mut response, to, length).await?;
            response.finish().await;
            return Ok(Some(
                length != BodyLength::UntilClose && keep_alive(head.version, &head.headers),
            ));
        }
    }
}

#[async_trait]
impl Protocol for Http {
    fn name(&self) -> &'static str {
        NAME
    }

    fn options(&self) -> &ProtocolOptions {
        &self.options
    }

    async fn handle(&self, fwd: &Forward<'_>) -> Result<bool, ProtocolError> {
        let relayed = match fwd.direction {
            Direction::ToBackend => self.exchange(fwd).await?,
            Direction::ToClient => self.relay_response(fwd.source, fwd.dest, None).await?,
        };
        let Some(keep_alive) = relayed else {
            abort_handling(fwd, &self.options);
            return Ok(false);
        };

        if !keep_alive && !self.options.keep_alive {
            fwd.client().close();
        }
        if !self.options.reuse_socket && !self.options.keep_alive {
            fwd.backend().close();
        }
        Ok(keep_alive || self.options.keep_alive)
    }
}
