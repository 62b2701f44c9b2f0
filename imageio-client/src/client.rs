//! The low-level data-plane capability object: one `ImageioClient` per ticket, issuing
//! OPTIONS/GET/PUT/PATCH requests against `/images/{id}` and `/images/{id}/extents`.

use camino::Utf8Path;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize)]
pub struct OptionsBody {
    pub features: Vec<String>,
    pub max_readers: Option<usize>,
    pub max_writers: Option<usize>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WireExtent {
    pub start: u64,
    pub length: u64,
    #[serde(default)]
    pub zero: bool,
    #[serde(default)]
    pub hole: bool,
    #[serde(default)]
    pub dirty: Option<bool>,
}

pub struct ImageioClient {
    http: reqwest::Client,
    ticket_url: Url,
}

impl ImageioClient {
    /// `ca_cert`, when set, is trusted in addition to the system's native roots — for talking to
    /// a server running on its self-signed first-run certificate or one issued by a private CA.
    pub fn new(ticket_url: Url, ca_cert: Option<&Utf8Path>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(path) = ca_cert {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self { http: builder.build()?, ticket_url })
    }

    pub async fn options(&self) -> anyhow::Result<OptionsBody> {
        let response = self.http.request(reqwest::Method::OPTIONS, self.ticket_url.clone()).send().await?;
        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Probes the image size the same way the server's own HTTP pass-through backend does: a
    /// one-byte ranged GET, reading the total size back out of `Content-Range`.
    pub async fn probe_size(&self) -> anyhow::Result<u64> {
        let response = self
            .http
            .get(self.ticket_url.clone())
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await?
            .error_for_status()?;

        let content_range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow::anyhow!("server did not send Content-Range"))?;

        parse_content_range_size(content_range)
    }

    pub async fn get_range(&self, start: u64, end: u64) -> anyhow::Result<bytes::Bytes> {
        let response = self
            .http
            .get(self.ticket_url.clone())
            .header(reqwest::header::RANGE, format!("bytes={start}-{}", end.saturating_sub(1)))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?)
    }

    pub async fn put_range(&self, start: u64, end: u64, body: bytes::Bytes, flush: bool) -> anyhow::Result<()> {
        let mut url = self.ticket_url.clone();
        url.query_pairs_mut().append_pair("flush", if flush { "y" } else { "n" });

        self.http
            .put(url)
            .header(reqwest::header::CONTENT_RANGE, format!("bytes {start}-{}/*", end.saturating_sub(1)))
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn patch_zero(&self, offset: u64, size: u64, flush: bool) -> anyhow::Result<()> {
        self.patch(&serde_json::json!({ "op": "zero", "offset": offset, "size": size, "flush": flush })).await
    }

    pub async fn patch_flush(&self) -> anyhow::Result<()> {
        self.patch(&serde_json::json!({ "op": "flush" })).await
    }

    async fn patch(&self, body: &serde_json::Value) -> anyhow::Result<()> {
        self.http.patch(self.ticket_url.clone()).json(body).send().await?.error_for_status()?;
        Ok(())
    }

    pub async fn extents(&self, bitmap: Option<&str>) -> anyhow::Result<Vec<WireExtent>> {
        let mut url = self.ticket_url.join("extents")?;
        match bitmap {
            Some(name) => {
                url.query_pairs_mut().append_pair("context", "dirty").append_pair("bitmap", name);
            }
            None => {
                url.query_pairs_mut().append_pair("context", "zero");
            }
        }
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Pulls the total size out of a `Content-Range: bytes 0-0/<size>` header value.
fn parse_content_range_size(content_range: &str) -> anyhow::Result<u64> {
    content_range
        .rsplit_once('/')
        .and_then(|(_, size)| size.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("unparsable Content-Range: {content_range}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_content_range_size_extracts_total() {
        assert_eq!(parse_content_range_size("bytes 0-0/1073741824").unwrap(), 1_073_741_824);
    }

    #[test]
    fn parse_content_range_size_rejects_wildcard() {
        assert!(parse_content_range_size("bytes 0-0/*").is_err());
    }

    #[test]
    fn parse_content_range_size_rejects_garbage() {
        assert!(parse_content_range_size("not a content range").is_err());
    }
}
