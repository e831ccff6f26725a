//! Speed-test endpoint
//!
//! Drains uploads and serves zero-filled downloads of a requested size, both
//! capped by configuration. No upstream is involved.

use axum::body::Body;
use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use once_cell::sync::Lazy;

use crate::config::SpeedTestSettings;
use crate::context::RequestContext;
use crate::error::plain_text_error;
use crate::handlers::SiteInfo;

const CHUNK_SIZE: usize = 16384;

static ZERO_CHUNK: Lazy<Bytes> = Lazy::new(|| Bytes::from(vec![b'0'; CHUNK_SIZE]));

pub struct SpeedTestHandler {
    info: SiteInfo,
    settings: SpeedTestSettings,
}

impl SpeedTestHandler {
    pub fn new(info: SiteInfo, settings: SpeedTestSettings) -> Self {
        Self { info, settings }
    }

    pub fn info(&self) -> &SiteInfo {
        &self.info
    }

    pub async fn serve(&self, _ctx: &RequestContext, req: Request<Body>) -> Response {
        let max_upload = self.settings.max_upload_bytes.unwrap_or(0);
        let max_download = self.settings.max_download_bytes.unwrap_or(0);

        let content_length = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        let query_bytes = req.uri().query().and_then(|query| {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("bytes="))
                .map(str::to_string)
        });

        if content_length > 0 {
            if max_upload < 0 {
                return plain_text_error(StatusCode::BAD_REQUEST, "Upload test is disabled");
            }
            if content_length > max_upload {
                return plain_text_error(
                    StatusCode::BAD_REQUEST,
                    &format!("Upload size too much ({content_length} > {max_upload})"),
                );
            }
            let mut stream = req.into_body().into_data_stream();
            while let Some(chunk) = stream.next().await {
                if chunk.is_err() {
                    return plain_text_error(StatusCode::BAD_REQUEST, "read request failed");
                }
            }
        }

        let Some(download_size_str) = query_bytes else {
            // no download requested
            return Response::new(Body::empty());
        };

        if max_download < 0 {
            return plain_text_error(StatusCode::BAD_REQUEST, "Download test is disabled");
        }
        let download_size = match download_size_str.parse::<i64>() {
            Ok(size) if size >= 0 => size,
            _ => {
                return plain_text_error(
                    StatusCode::BAD_REQUEST,
                    "`bytes` must be a non-negative integer",
                )
            }
        };
        if download_size > max_download {
            return plain_text_error(
                StatusCode::BAD_REQUEST,
                &format!("Download size too much ({download_size} > {max_download})"),
            );
        }

        let body = Body::from_stream(futures_util::stream::unfold(
            download_size,
            |remaining| async move {
                if remaining <= 0 {
                    return None;
                }
                let take = remaining.min(CHUNK_SIZE as i64);
                let chunk = ZERO_CHUNK.slice(..take as usize);
                Some((Ok::<_, std::convert::Infallible>(chunk), remaining - take))
            },
        ));

        let mut resp = Response::new(body);
        resp.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        resp.headers_mut().insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&download_size.to_string()).expect("integer header value"),
        );
        resp.headers_mut()
            .insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn handler(max_upload: i64, max_download: i64) -> SpeedTestHandler {
        SpeedTestHandler::new(
            SiteInfo {
                id: "st".to_string(),
                path_prefix: String::new(),
                self_url: String::new(),
            },
            SpeedTestSettings {
                max_upload_bytes: Some(max_upload),
                max_download_bytes: Some(max_download),
            },
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::new("st", "h", "203.0.113.9")
    }

    #[tokio::test]
    async fn test_download_exact_size() {
        let h = handler(0, 1024 * 1024);
        let req = Request::builder()
            .uri("http://h/?bytes=40000")
            .body(Body::empty())
            .unwrap();
        let resp = h.serve(&ctx(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "40000");
        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "identity");

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), 40000);
        assert!(body.iter().all(|&b| b == b'0'));
    }

    #[tokio::test]
    async fn test_download_over_limit() {
        let h = handler(0, 1000);
        let req = Request::builder()
            .uri("http://h/?bytes=1001")
            .body(Body::empty())
            .unwrap();
        let resp = h.serve(&ctx(), req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_download_disabled() {
        let h = handler(0, -1);
        let req = Request::builder()
            .uri("http://h/?bytes=1")
            .body(Body::empty())
            .unwrap();
        let resp = h.serve(&ctx(), req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bad_bytes_param() {
        let h = handler(0, 1000);
        for query in ["bytes=-5", "bytes=abc"] {
            let req = Request::builder()
                .uri(format!("http://h/?{query}"))
                .body(Body::empty())
                .unwrap();
            let resp = h.serve(&ctx(), req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{query}");
        }
    }

    #[tokio::test]
    async fn test_upload_drained_and_ok() {
        let h = handler(1024, 0);
        let payload = vec![b'x'; 512];
        let req = Request::builder()
            .uri("http://h/")
            .header(CONTENT_LENGTH, payload.len())
            .body(Body::from(payload))
            .unwrap();
        let resp = h.serve(&ctx(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_too_large() {
        let h = handler(16, 0);
        let payload = vec![b'x'; 64];
        let req = Request::builder()
            .uri("http://h/")
            .header(CONTENT_LENGTH, payload.len())
            .body(Body::from(payload))
            .unwrap();
        let resp = h.serve(&ctx(), req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_no_download_param_empty_ok() {
        let h = handler(0, 1000);
        let req = Request::builder().uri("http://h/").body(Body::empty()).unwrap();
        let resp = h.serve(&ctx(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }
}
