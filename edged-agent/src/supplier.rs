//! Target supplier: fetches device manifests from the control plane.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::manifest::DeviceManifest;

/// Produces validated-shape target manifests for the supervisor.
///
/// Implementations own the wire format and transport; the supervisor only
/// sees typed manifests or "nothing newer".
#[async_trait]
pub trait TargetSupplier: Send + Sync {
    /// Fetch the current manifest, or None when nothing newer than
    /// `since_revision` exists.
    async fn fetch(&self, since_revision: u64) -> Result<Option<DeviceManifest>>;
}

/// HTTP supplier polling the control-plane device API.
pub struct HttpSupplier {
    client: Client<HttpConnector, Empty<Bytes>>,
    base: String,
    device: String,
}

impl HttpSupplier {
    pub fn new(base: &str, device: &str) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            device: device.to_string(),
        }
    }
}

#[async_trait]
impl TargetSupplier for HttpSupplier {
    async fn fetch(&self, since_revision: u64) -> Result<Option<DeviceManifest>> {
        let uri: Uri = format!(
            "{}/v1/devices/{}/target?since={}",
            self.base, self.device, since_revision
        )
        .parse()
        .context("Invalid control-plane URI")?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("accept", "application/json")
            .body(Empty::new())
            .context("Failed to build manifest request")?;

        let response = self
            .client
            .request(request)
            .await
            .context("Manifest request failed")?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => return Ok(None),
            status => bail!("Control plane returned {status}"),
        }

        let body = response
            .into_body()
            .collect()
            .await
            .context("Failed to read manifest body")?
            .to_bytes();

        let manifest: DeviceManifest =
            serde_json::from_slice(&body).context("Invalid manifest JSON")?;
        Ok(Some(manifest))
    }
}
