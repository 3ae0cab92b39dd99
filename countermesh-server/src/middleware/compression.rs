// Copyright 2025 CounterMesh Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use axum::{body::Body, extract::Request, http::header, middleware::Next, response::Response};
use http;
use http_body::Body as _;
use tower_http::compression::{CompressionLayer, Predicate};

/// Compression predicate gating on a configurable minimum response size
/// (spec §6.3): bodies below the threshold skip gzip/br/deflate framing,
/// since the compression overhead outweighs the savings. A body whose
/// size can't be determined up front (no exact `size_hint`) is still
/// compressed, matching `tower_http`'s own default behavior.
#[derive(Clone, Copy)]
pub struct SizeThresholdPredicate {
    min_bytes: u64,
}

impl SizeThresholdPredicate {
    pub fn new(min_bytes: u64) -> Self {
        Self { min_bytes }
    }
}

impl Default for SizeThresholdPredicate {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Predicate for SizeThresholdPredicate {
    fn should_compress<B>(&self, response: &http::Response<B>) -> bool
    where
        B: http_body::Body,
    {
        match response.body().size_hint().exact() {
            Some(size) => size >= self.min_bytes,
            None => true,
        }
    }
}

/// Compresses responses with gzip/br/deflate per the request's
/// `Accept-Encoding` q-values, skipping bodies under `min_bytes` (spec
/// §6.3).
pub fn compression_layer(min_bytes: u64) -> CompressionLayer<SizeThresholdPredicate> {
    CompressionLayer::new().compress_when(SizeThresholdPredicate::new(min_bytes))
}

/// Request decompression middleware
///
/// Decompresses request bodies if Content-Encoding header is present.
/// Supports gzip encoding.
pub async fn decompress_request_middleware(
    request: Request,
    next: Next,
) -> Result<Response, axum::http::StatusCode> {
    let (parts, body) = request.into_parts();

    // Check if request is compressed
    let encoding = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());

    let body = match encoding {
        Some("gzip") => {
            // Decompress gzip body
            match decompress_gzip_body(body).await {
                Ok(decompressed) => decompressed,
                Err(_) => {
                    return Err(axum::http::StatusCode::BAD_REQUEST);
                }
            }
        }
        Some(_unsupported) => {
            // Unsupported encoding
            return Err(axum::http::StatusCode::UNSUPPORTED_MEDIA_TYPE);
        }
        None => body, // No compression
    };

    // Reconstruct request with decompressed body
    let request = Request::from_parts(parts, body);

    Ok(next.run(request).await)
}

/// Decompress gzip body
async fn decompress_gzip_body(body: Body) -> Result<Body, std::io::Error> {
    use axum::body::to_bytes;
    use flate2::read::GzDecoder;
    use std::io::Read;

    // Collect body bytes
    let body_bytes = to_bytes(body, usize::MAX)
        .await
        .map_err(std::io::Error::other)?;

    // Decompress
    let mut decoder = GzDecoder::new(&body_bytes[..]);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;

    Ok(Body::from(decompressed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_layer_creation() {
        let _layer = compression_layer(1024);
    }

    #[test]
    fn predicate_rejects_small_known_bodies_and_allows_large_ones() {
        let predicate = SizeThresholdPredicate::new(1024);
        let small = http::Response::new(http_body_util::Full::new(bytes::Bytes::from(vec![0u8; 100])));
        assert!(!predicate.should_compress(&small));

        let large = http::Response::new(http_body_util::Full::new(bytes::Bytes::from(vec![0u8; 2048])));
        assert!(predicate.should_compress(&large));
    }
}
