//! Bounded request body reading and `Content-Encoding` inflation.

use std::io::Read;

use axum::body::Body;
use axum::http::{header, HeaderMap};
use flate2::read::{GzDecoder, ZlibDecoder};
use futures_util::StreamExt;

use crate::error::InsertError;

/// Reads the whole body, failing as soon as more than `limit` bytes arrive.
/// A `Content-Length` above the limit is rejected before reading anything.
pub async fn read_body(format: &'static str, headers: &HeaderMap, body: Body, limit: usize) -> Result<Vec<u8>, InsertError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|n| n > limit as u64) {
        return Err(InsertError::PayloadTooLarge { format, limit });
    }

    let mut out = Vec::with_capacity(declared.map_or(0, |n| (n as usize).min(1 << 20)));
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| InsertError::Body {
            format,
            message: e.to_string(),
        })?;
        if out.len() + chunk.len() > limit {
            return Err(InsertError::PayloadTooLarge { format, limit });
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Inflates `data` according to the request's `Content-Encoding`. The
/// inflated size is bounded by `limit` too.
pub fn decompress(format: &'static str, headers: &HeaderMap, data: Vec<u8>, limit: usize) -> Result<Vec<u8>, InsertError> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match encoding.as_str() {
        "" | "identity" => Ok(data),
        "gzip" | "x-gzip" => inflate(format, "gzip", GzDecoder::new(data.as_slice()), data.len(), limit),
        "deflate" => inflate(format, "deflate", ZlibDecoder::new(data.as_slice()), data.len(), limit),
        _ => Err(InsertError::UnsupportedEncoding { format, encoding }),
    }
}

fn inflate(
    format: &'static str,
    encoding: &'static str,
    reader: impl Read,
    bytes: usize,
    limit: usize,
) -> Result<Vec<u8>, InsertError> {
    let mut out = Vec::new();
    reader
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|source| InsertError::Decompress {
            format,
            encoding,
            bytes,
            source,
        })?;
    if out.len() > limit {
        return Err(InsertError::PayloadTooLarge { format, limit });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn headers(encoding: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::CONTENT_ENCODING, HeaderValue::from_str(encoding).unwrap());
        h
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_gzip_and_deflate() {
        let data = b"hello world".to_vec();
        assert_eq!(decompress("jsonline", &headers("gzip"), gzip(&data), 100).unwrap(), data);

        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&data).unwrap();
        let z = enc.finish().unwrap();
        assert_eq!(decompress("jsonline", &headers("deflate"), z, 100).unwrap(), data);
        assert_eq!(decompress("jsonline", &HeaderMap::new(), data.clone(), 100).unwrap(), data);
    }

    #[test]
    fn test_inflation_is_bounded() {
        let bomb = gzip(&vec![b'a'; 10_000]);
        assert!(bomb.len() < 1000);
        let err = decompress("jsonline", &headers("gzip"), bomb, 1000).unwrap_err();
        assert!(matches!(err, InsertError::PayloadTooLarge { limit: 1000, .. }));
    }

    #[test]
    fn test_unsupported_and_corrupt() {
        let err = decompress("native", &headers("br"), vec![1, 2], 100).unwrap_err();
        assert!(matches!(err, InsertError::UnsupportedEncoding { .. }));

        let err = decompress("native", &headers("gzip"), vec![1, 2, 3], 100).unwrap_err();
        assert!(err.to_string().contains("from 3 bytes"));
    }

    #[tokio::test]
    async fn test_read_body_limits() {
        let mut h = HeaderMap::new();
        h.insert(header::CONTENT_LENGTH, HeaderValue::from_static("500"));
        let err = read_body("jsonline", &h, Body::from("x"), 10).await.unwrap_err();
        assert!(matches!(err, InsertError::PayloadTooLarge { .. }));

        let err = read_body("jsonline", &HeaderMap::new(), Body::from(vec![0u8; 11]), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, InsertError::PayloadTooLarge { .. }));

        let ok = read_body("jsonline", &HeaderMap::new(), Body::from("0123456789"), 10).await.unwrap();
        assert_eq!(ok.len(), 10);
    }
}
