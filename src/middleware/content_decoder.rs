use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::{BrotliDecoder, DeflateDecoder, GzipDecoder, ZstdDecoder};
use futures_util::TryStreamExt;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::{BodyStream, StreamBody};
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio_util::io::{ReaderStream, StreamReader};
use tower::Service;

use crate::http::{Body, BoxError, HttpService};
use crate::rewrite::BodyKind;

/// Tower layer that decompresses target responses the rewriter will touch.
///
/// Supports `gzip`, `x-gzip`, `br` (Brotli), `zstd`, and `deflate`. Requests
/// have their `Accept-Encoding` narrowed to those codings. Responses whose
/// content type is not rewritable keep their encoding and stream through.
#[derive(Clone, Default)]
pub struct ContentDecoder;

impl ContentDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl tower::Layer<HttpService> for ContentDecoder {
    type Service = ContentDecoderService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        ContentDecoderService { inner }
    }
}

pub struct ContentDecoderService {
    inner: HttpService,
}

impl Service<Request<Body>> for ContentDecoderService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        narrow_accept_encoding(req.headers_mut());
        let is_head = req.method() == Method::HEAD;
        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut resp = fut.await?;

            let has_body = !is_head
                && resp.status() != StatusCode::NO_CONTENT
                && resp.status() != StatusCode::NOT_MODIFIED;
            let rewritable = has_body
                && resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(BodyKind::from_content_type)
                    .is_some();
            let encoding = resp
                .headers()
                .get(CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_ascii_lowercase());

            if rewritable
                && let Some(enc) = encoding
                && is_supported(&enc)
            {
                resp.headers_mut().remove(CONTENT_ENCODING);
                resp.headers_mut().remove(CONTENT_LENGTH);

                let (parts, body) = resp.into_parts();
                let decoded = decode_body(body, &enc);
                return Ok(Response::from_parts(parts, decoded));
            }

            Ok(resp)
        })
    }
}

fn is_supported(encoding: &str) -> bool {
    matches!(encoding, "gzip" | "x-gzip" | "br" | "zstd" | "deflate")
}

/// Drop codings we could not decode, so the target never sends them.
fn narrow_accept_encoding(headers: &mut http::HeaderMap) {
    let Some(value) = headers.get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let kept: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|coding| {
            let name = coding.split(';').next().unwrap_or_default().trim();
            is_supported(&name.to_ascii_lowercase()) || name == "identity" || name == "*"
        })
        .collect();
    let narrowed = kept.join(", ");
    if narrowed.is_empty() {
        headers.remove(ACCEPT_ENCODING);
    } else if let Ok(v) = HeaderValue::from_str(&narrowed) {
        headers.insert(ACCEPT_ENCODING, v);
    }
}

fn decode_body(body: Body, encoding: &str) -> Body {
    use http_body_util::BodyExt;

    let stream = BodyStream::new(body)
        .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
        .map_err(io::Error::other);

    let reader = BufReader::new(StreamReader::new(Box::pin(stream)));

    let decoded: Box<dyn AsyncRead + Send + Sync + Unpin> = match encoding {
        "br" => Box::new(BrotliDecoder::new(reader)),
        "zstd" => Box::new(ZstdDecoder::new(reader)),
        "deflate" => Box::new(DeflateDecoder::new(reader)),
        _ => Box::new(GzipDecoder::new(reader)),
    };

    BodyExt::boxed(StreamBody::new(
        ReaderStream::new(decoded)
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_encoding_is_narrowed() {
        let mut headers = http::HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, "gzip, compress;q=0.5, br, dcb".parse().unwrap());
        narrow_accept_encoding(&mut headers);
        assert_eq!(headers[ACCEPT_ENCODING], "gzip, br");

        headers.insert(ACCEPT_ENCODING, "compress".parse().unwrap());
        narrow_accept_encoding(&mut headers);
        assert!(!headers.contains_key(ACCEPT_ENCODING));
    }
}
