use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use super::{ObjectLocation, ObjectMeta, ObjectStore, PutResult, RangeClient};
use crate::io::ByteStream;

/// Object store reached over plain HTTP(S).
///
/// Object URLs are built from an endpoint template such as
/// `https://{bucket}.s3.{region}.amazonaws.com`, with the key appended as
/// percent-encoded path segments. Request signing is not done here: the
/// endpoint must either be public, pre-authorized, or accept a static
/// authorization header.
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    auth: Option<(HeaderName, HeaderValue)>,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth: None,
        })
    }

    /// Send `name: value` with every request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("invalid header name {name:?}"))?;
        let value = HeaderValue::from_str(value.trim()).context("invalid header value")?;
        self.auth = Some((name, value));
        Ok(self)
    }

    /// Resolve the URL of an object.
    pub fn object_url(&self, location: &ObjectLocation) -> Result<Url> {
        let base = self
            .endpoint
            .replace("{bucket}", &location.bucket)
            .replace("{region}", &location.region);
        let mut url = Url::parse(&base).with_context(|| format!("invalid endpoint {base:?}"))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("endpoint {base:?} cannot carry a path"))?
            .pop_if_empty()
            .extend(location.key.split('/'));
        Ok(url)
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some((name, value)) => builder.header(name.clone(), value.clone()),
            None => builder,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectMeta> {
        let url = self.object_url(location)?;

        // A one-byte range tells us both the length and whether ranges work.
        let resp = self
            .request(self.client.get(url).header(RANGE, "bytes=0-0"))
            .send()
            .await?;
        let headers = resp.headers();
        let content_length = object_length(
            resp.status(),
            header_str(headers.get(CONTENT_RANGE)),
            header_str(headers.get(CONTENT_LENGTH)),
        )?;
        Ok(ObjectMeta {
            content_length,
            etag: header_str(headers.get(ETAG)).map(str::to_string),
        })
    }

    async fn get_object(
        &self,
        location: &ObjectLocation,
        range: Option<(u64, u64)>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let url = self.object_url(location)?;
        let mut req = self.client.get(url);
        if let Some((start, end)) = range {
            req = req.header(RANGE, range_header(start, end));
        }

        let mut resp = self.request(req).send().await?;
        let expected = if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        if resp.status() != expected {
            bail!("HTTP request failed with status: {}", resp.status());
        }

        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }

    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: ByteStream,
        content_length: u64,
    ) -> Result<PutResult> {
        let url = self.object_url(location)?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(body));
        let resp = self
            .request(
                self.client
                    .put(url)
                    .header(CONTENT_LENGTH, content_length)
                    .body(body),
            )
            .send()
            .await?;

        if !resp.status().is_success() {
            bail!("HTTP upload failed with status: {}", resp.status());
        }
        Ok(PutResult {
            etag: header_str(resp.headers().get(ETAG)).map(str::to_string),
        })
    }

    fn range_client(&self, location: &ObjectLocation) -> Result<Arc<dyn RangeClient>> {
        let mut client = HttpRangeClient::new(self.client.clone(), self.object_url(location)?);
        client.auth = self.auth.clone();
        Ok(Arc::new(client))
    }
}

/// Ranged GETs against one object URL.
pub struct HttpRangeClient {
    client: Client,
    url: Url,
    auth: Option<(HeaderName, HeaderValue)>,
}

impl HttpRangeClient {
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            auth: None,
        }
    }
}

#[async_trait]
impl RangeClient for HttpRangeClient {
    async fn open_range(&self, start: u64, end: u64) -> Result<ByteStream> {
        if start >= end {
            return Ok(crate::io::empty_stream());
        }

        let mut req = self
            .client
            .get(self.url.clone())
            .header(RANGE, range_header(start, end));
        if let Some((name, value)) = &self.auth {
            req = req.header(name.clone(), value.clone());
        }

        debug!("range request bytes={}-{}", start, end - 1);
        let resp = req.send().await?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            bail!("HTTP request failed with status: {}", resp.status());
        }

        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }
}

/// Object length from the answer to a one-byte `bytes=0-0` GET.
///
/// A 206 carries the total in `Content-Range`; a 416 means there is no first
/// byte, so the object is empty. A plain 200 is only acceptable when the
/// whole body fits in the one byte asked for.
fn object_length(status: StatusCode, content_range: Option<&str>, content_length: Option<&str>) -> Result<u64> {
    match status {
        StatusCode::PARTIAL_CONTENT => content_range
            .and_then(|v| v.rsplit('/').next())
            .and_then(|total| total.trim().parse().ok())
            .ok_or_else(|| anyhow!("Remote server did not return Content-Range")),
        StatusCode::RANGE_NOT_SATISFIABLE => Ok(0),
        StatusCode::OK => {
            let len: u64 = content_length.and_then(|v| v.trim().parse().ok()).unwrap_or(0);
            if len > 1 {
                bail!("Remote server does not support Range requests");
            }
            Ok(len)
        }
        status => bail!("HTTP request failed with status: {}", status),
    }
}

/// Half-open `[start, end)` as an inclusive HTTP byte range.
fn range_header(start: u64, end: u64) -> String {
    format!("bytes={}-{}", start, end.saturating_sub(1))
}

fn header_str(value: Option<&HeaderValue>) -> Option<&str> {
    value.and_then(|v| v.to_str().ok())
}
