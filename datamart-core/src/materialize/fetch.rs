use std::{collections::HashMap, fmt, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use datamart_model::{DatasetId, DatasetMetadata, MaterializeSource};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::FetchError;

/// Produces the canonical CSV of a dataset at `destination`.
#[async_trait]
pub trait DatasetFetcher: Send + Sync + fmt::Debug + 'static {
    async fn fetch(
        &self,
        id: &DatasetId,
        metadata: &DatasetMetadata,
        destination: &Path,
    ) -> Result<(), FetchError>;
}

/// Streaming HTTP download with an optional size cap.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    size_limit: Option<u64>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, size_limit: Option<u64>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, size_limit })
    }

    pub fn with_client(client: reqwest::Client, size_limit: Option<u64>) -> Self {
        Self { client, size_limit }
    }

    /// Download `url` to `destination`, returning the byte count.
    pub async fn download(&self, url: &str, destination: &Path) -> Result<u64, FetchError> {
        let url = url::Url::parse(url)
            .map_err(|err| FetchError::InvalidDescriptor(format!("bad URL {url:?}: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidDescriptor(format!(
                "unsupported URL scheme {:?}",
                url.scheme()
            )));
        }

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        if let (Some(limit), Some(length)) = (self.size_limit, response.content_length())
            && length > limit
        {
            return Err(FetchError::TooBig { limit });
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut size: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            if let Some(limit) = self.size_limit
                && size > limit
            {
                return Err(FetchError::TooBig { limit });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(url = %url, size, "download complete");
        Ok(size)
    }
}

/// Fetches according to the dataset's materialize descriptor: a direct URL
/// is downloaded, otherwise the materializer registered under the
/// descriptor's identifier is asked.
#[derive(Clone)]
pub struct DescriptorFetcher {
    http: HttpFetcher,
    materializers: HashMap<String, Arc<dyn DatasetFetcher>>,
}

impl DescriptorFetcher {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            materializers: HashMap::new(),
        }
    }

    pub fn with_materializer(
        mut self,
        identifier: impl Into<String>,
        materializer: Arc<dyn DatasetFetcher>,
    ) -> Self {
        self.materializers.insert(identifier.into(), materializer);
        self
    }

    pub fn register(&mut self, identifier: impl Into<String>, materializer: Arc<dyn DatasetFetcher>) {
        self.materializers.insert(identifier.into(), materializer);
    }
}

impl fmt::Debug for DescriptorFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.materializers.keys().collect();
        names.sort();
        f.debug_struct("DescriptorFetcher")
            .field("http", &self.http)
            .field("materializers", &names)
            .finish()
    }
}

#[async_trait]
impl DatasetFetcher for DescriptorFetcher {
    async fn fetch(
        &self,
        id: &DatasetId,
        metadata: &DatasetMetadata,
        destination: &Path,
    ) -> Result<(), FetchError> {
        let descriptor = metadata.materialize().ok_or_else(|| {
            FetchError::InvalidDescriptor(format!("{id} has no materialize info"))
        })?;
        match descriptor.source() {
            MaterializeSource::DirectUrl(url) => {
                info!(dataset_id = %id, url, "Downloading");
                self.http.download(url, destination).await.map(|_| ())
            }
            MaterializeSource::Materializer(identifier) => {
                let materializer = self
                    .materializers
                    .get(identifier)
                    .ok_or_else(|| FetchError::MaterializerUnavailable(identifier.to_string()))?;
                info!(dataset_id = %id, materializer = identifier, "Materializing");
                materializer.fetch(id, metadata, destination).await
            }
            MaterializeSource::SharedStorage => Err(FetchError::InvalidDescriptor(format!(
                "{id} names neither a URL nor a materializer"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamart_model::MaterializeDescriptor;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Serves `body` once per connection with a plain HTTP/1.1 response.
    async fn serve(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
            }
        });
        format!("http://{addr}/data.csv")
    }

    fn metadata(descriptor: MaterializeDescriptor) -> DatasetMetadata {
        let mut metadata = DatasetMetadata::new();
        metadata.set_materialize(descriptor);
        metadata
    }

    #[tokio::test]
    async fn downloads_direct_urls() {
        let url = serve(b"a,b\n1,2\n").await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out");
        let fetcher = DescriptorFetcher::new(
            HttpFetcher::new(Duration::from_secs(10), None).unwrap(),
        );

        fetcher
            .fetch(
                &DatasetId::from_full("dm.x").unwrap(),
                &metadata(MaterializeDescriptor::direct_url(url)),
                &dest,
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn enforces_the_size_limit() {
        let url = serve(b"0123456789").await;
        let dir = TempDir::new().unwrap();
        let http = HttpFetcher::new(Duration::from_secs(10), Some(4)).unwrap();

        let err = http.download(&url, &dir.path().join("out")).await.unwrap_err();
        assert!(matches!(err, FetchError::TooBig { limit: 4 }));
    }

    #[tokio::test]
    async fn unknown_materializer_is_reported() {
        let dir = TempDir::new().unwrap();
        let fetcher = DescriptorFetcher::new(
            HttpFetcher::new(Duration::from_secs(10), None).unwrap(),
        );
        let descriptor = MaterializeDescriptor::shared_storage()
            .with_field("identifier", json!("datamart.noaa"));

        let err = fetcher
            .fetch(
                &DatasetId::from_full("datamart.noaa.x").unwrap(),
                &metadata(descriptor),
                &dir.path().join("out"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MaterializerUnavailable(ref id) if id == "datamart.noaa"));

        let err = fetcher
            .fetch(
                &DatasetId::from_full("datamart.noaa.x").unwrap(),
                &DatasetMetadata::new(),
                &dir.path().join("out"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidDescriptor(_)));
    }
}
