use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use mime::Mime;
use reqwest::{header, Client, Url};

use crate::OptimizerError;

/// Downloads source images after a header-only probe.
///
/// The timeout bounds the probe and the download separately.
#[derive(Clone, Default)]
pub struct SourceFetcher {
    client: Client,
}

impl SourceFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Probes the source, then downloads it.
    ///
    /// # Errors
    /// - `InvalidSourceUrl` when a request fails or answers non-2xx
    /// - `FetchTimeout` when either request exceeds `timeout`
    /// - `ImageTooLarge` when the declared or streamed size exceeds `max_size`
    /// - `InvalidImageType` when the declared content type is not `image/*`
    pub async fn fetch(&self, url: &Url, timeout: Duration, max_size: u64) -> Result<Bytes, OptimizerError> {
        self.probe(url, timeout, max_size).await?;
        self.download(url, timeout, max_size).await
    }

    pub async fn probe(&self, url: &Url, timeout: Duration, max_size: u64) -> Result<(), OptimizerError> {
        let resp = self
            .client
            .head(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(request_error)?;

        if !resp.status().is_success() {
            return Err(OptimizerError::InvalidSourceUrl(format!(
                "probe status: {}",
                resp.status()
            )));
        }

        // HEAD responses have no body, so read the header instead of the body length.
        let declared = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(size) = declared {
            if size > max_size {
                return Err(OptimizerError::ImageTooLarge { size, limit: max_size });
            }
        }

        let ct = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match ct.parse::<Mime>() {
            Ok(m) if m.type_() == mime::IMAGE => Ok(()),
            _ => Err(OptimizerError::InvalidImageType(format!("declared {ct:?}"))),
        }
    }

    pub async fn download(&self, url: &Url, timeout: Duration, max_size: u64) -> Result<Bytes, OptimizerError> {
        let resp = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(request_error)?;

        if !resp.status().is_success() {
            return Err(OptimizerError::InvalidSourceUrl(format!(
                "upstream status: {}",
                resp.status()
            )));
        }

        // Stream with size enforcement; the probe may have lied.
        let mut buf = BytesMut::with_capacity(8192);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await.transpose().map_err(request_error)? {
            let size = (buf.len() + chunk.len()) as u64;
            if size > max_size {
                return Err(OptimizerError::ImageTooLarge { size, limit: max_size });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

fn request_error(e: reqwest::Error) -> OptimizerError {
    if e.is_timeout() {
        OptimizerError::FetchTimeout
    } else {
        OptimizerError::InvalidSourceUrl(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlaceholderError {
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("download answered {0}")]
    Status(reqwest::StatusCode),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Loads the broken-image placeholder from an http(s) URL or a local path.
pub async fn load_placeholder(client: &Client, source: &str) -> Result<Bytes, PlaceholderError> {
    match Url::parse(source) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            let resp = client.get(url).send().await?;
            if resp.status() != reqwest::StatusCode::OK {
                return Err(PlaceholderError::Status(resp.status()));
            }
            Ok(resp.bytes().await?)
        }
        _ => Ok(Bytes::from(tokio::fs::read(source).await?)),
    }
}
