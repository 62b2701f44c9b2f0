//! The HTTP pass-through backend, used when this service runs in a proxy role in front of
//! another `imageio`-compatible origin.

use async_trait::async_trait;
use camino::Utf8Path;
use imageio_nbd::Extent;
use serde::Deserialize;
use url::Url;

use super::{Backend, BackendError, BackendFeatures, ExtentContext, Result};

pub struct HttpBackend {
    client: reqwest::Client,
    origin: Url,
    size: u64,
}

impl HttpBackend {
    pub async fn connect(origin: Url, tls_ca: Option<&Utf8Path>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(ca_path) = tls_ca {
            let pem = std::fs::read(ca_path).map_err(BackendError::Io)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| BackendError::Origin(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(|e| BackendError::Origin(e.to_string()))?;

        let size = probe_size(&client, &origin).await?;

        Ok(Self { client, origin, size })
    }
}

async fn probe_size(client: &reqwest::Client, origin: &Url) -> Result<u64> {
    let response = client
        .get(origin.clone())
        .header(reqwest::header::RANGE, "bytes=0-0")
        .send()
        .await
        .map_err(|e| BackendError::Origin(e.to_string()))?;

    if !response.status().is_success() {
        return Err(BackendError::Origin(format!("origin probe returned {}", response.status())));
    }

    let content_range = response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BackendError::Origin("origin did not send Content-Range".to_owned()))?;

    content_range
        .rsplit_once('/')
        .and_then(|(_, size)| size.parse().ok())
        .ok_or_else(|| BackendError::Origin(format!("unparsable Content-Range: {content_range}")))
}

#[async_trait]
impl Backend for HttpBackend {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_to(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        let response = self
            .client
            .get(self.origin.clone())
            .header(reqwest::header::RANGE, format!("bytes={offset}-{}", end.saturating_sub(1)))
            .send()
            .await
            .map_err(|e| BackendError::Origin(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Origin(format!("origin GET returned {}", response.status())));
        }

        let body = response.bytes().await.map_err(|e| BackendError::Origin(e.to_string()))?;
        if body.len() != buf.len() {
            return Err(BackendError::Origin("origin returned unexpected body length".to_owned()));
        }
        buf.copy_from_slice(&body);
        Ok(())
    }

    async fn write_from(&self, offset: u64, data: &[u8], flush: bool) -> Result<()> {
        let end = offset + data.len() as u64;
        let mut url = self.origin.clone();
        url.query_pairs_mut().append_pair("flush", if flush { "y" } else { "n" });

        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_RANGE, format!("bytes {offset}-{}/*", end.saturating_sub(1)))
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| BackendError::Origin(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Origin(format!("origin PUT returned {}", response.status())));
        }
        Ok(())
    }

    async fn zero(&self, offset: u64, length: u64, flush: bool, _punch_hole: bool) -> Result<()> {
        let body = serde_json::json!({ "op": "zero", "offset": offset, "size": length, "flush": flush });
        self.patch(&body).await
    }

    async fn flush(&self) -> Result<()> {
        let body = serde_json::json!({ "op": "flush" });
        self.patch(&body).await
    }

    async fn extents(&self, context: ExtentContext) -> Result<Vec<Extent>> {
        let mut url = self.origin.join("extents").map_err(|e| BackendError::Origin(e.to_string()))?;
        match &context {
            ExtentContext::Zero => {
                url.query_pairs_mut().append_pair("context", "zero");
            }
            ExtentContext::Dirty(name) => {
                url.query_pairs_mut().append_pair("context", "dirty").append_pair("bitmap", name);
            }
        }

        let response = self.client.get(url).send().await.map_err(|e| BackendError::Origin(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackendError::Origin(format!("origin extents query returned {}", response.status())));
        }

        #[derive(Deserialize)]
        struct WireExtent {
            start: u64,
            length: u64,
            #[serde(default)]
            zero: bool,
            #[serde(default)]
            hole: bool,
            #[serde(default)]
            dirty: Option<bool>,
        }

        let wire: Vec<WireExtent> = response.json().await.map_err(|e| BackendError::Origin(e.to_string()))?;
        Ok(wire
            .into_iter()
            .map(|e| Extent { start: e.start, length: e.length, zero: e.zero, hole: e.hole, dirty: e.dirty })
            .collect())
    }

    fn max_readers(&self) -> usize {
        4
    }

    fn max_writers(&self) -> usize {
        4
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            extents: true,
            dirty_extents: true,
            zero: true,
            flush: true,
        }
    }
}

impl HttpBackend {
    async fn patch(&self, body: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .patch(self.origin.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Origin(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackendError::Origin(format!("origin PATCH returned {}", response.status())));
        }
        Ok(())
    }
}
