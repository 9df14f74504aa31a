//! Byte fetching for binary payloads.

use cache::PayloadCache;
use futures::future::{self, FutureExt, LocalBoxFuture};
use futures::stream::{self, LocalBoxStream, StreamExt, TryStreamExt};
use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;

pub type ByteStream = LocalBoxStream<'static, Result<Vec<u8>, FetchError>>;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("{address}: not found")]
    NotFound { address: String },
    #[error("{address}: {reason}")]
    Io { address: String, reason: String },
}

pub trait ByteFetcher {
    /// Start fetching `address`. Resolves once the payload is available to
    /// stream; errors while streaming surface as stream items.
    fn fetch(&self, address: &str) -> LocalBoxFuture<'static, Result<ByteStream, FetchError>>;
}

pub async fn collect_bytes(bytes: ByteStream) -> Result<Vec<u8>, FetchError> {
    bytes.try_concat().await
}

pub fn single_chunk(bytes: Vec<u8>) -> ByteStream {
    stream::once(future::ready(Ok(bytes))).boxed_local()
}

const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Streams payloads from a directory, treating addresses as paths under it.
pub struct FsFetcher {
    root: PathBuf,
    read_chunk: usize,
}

impl FsFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    fn resolve(&self, address: &str) -> Result<PathBuf, FetchError> {
        let relative = Path::new(address.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(FetchError::Io {
                address: address.to_string(),
                reason: "address escapes the fetch root".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl ByteFetcher for FsFetcher {
    fn fetch(&self, address: &str) -> LocalBoxFuture<'static, Result<ByteStream, FetchError>> {
        let path = match self.resolve(address) {
            Ok(path) => path,
            Err(err) => return future::ready(Err(err)).boxed_local(),
        };
        let address = address.to_string();
        let read_chunk = self.read_chunk;

        async move {
            let file = tokio::fs::File::open(&path).await.map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    FetchError::NotFound {
                        address: address.clone(),
                    }
                } else {
                    FetchError::Io {
                        address: address.clone(),
                        reason: err.to_string(),
                    }
                }
            })?;
            tracing::trace!(address = %address, path = ?path, "streaming payload from disk");

            let chunks = stream::try_unfold((file, address), move |(mut file, address)| async move {
                let mut buf = vec![0u8; read_chunk];
                let read = file.read(&mut buf).await.map_err(|err| FetchError::Io {
                    address: address.clone(),
                    reason: err.to_string(),
                })?;
                if read == 0 {
                    return Ok::<_, FetchError>(None);
                }
                buf.truncate(read);
                Ok(Some((buf, (file, address))))
            });
            Ok::<ByteStream, FetchError>(chunks.boxed_local())
        }
        .boxed_local()
    }
}

/// Payloads held in memory, e.g. embedded in the host with `include_bytes!`.
#[derive(Default)]
pub struct MemoryFetcher {
    payloads: HashMap<String, Rc<[u8]>>,
    latency: Duration,
    fetches: Cell<usize>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, address: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.payloads.insert(address.into(), Rc::from(bytes.into()));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.get()
    }
}

impl ByteFetcher for MemoryFetcher {
    fn fetch(&self, address: &str) -> LocalBoxFuture<'static, Result<ByteStream, FetchError>> {
        self.fetches.set(self.fetches.get() + 1);
        let payload = self.payloads.get(address).cloned();
        let address = address.to_string();
        let latency = self.latency;

        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let payload = payload.ok_or(FetchError::NotFound { address })?;
            Ok::<ByteStream, FetchError>(single_chunk(payload.to_vec()))
        }
        .boxed_local()
    }
}

/// Keeps fetched payloads in a persistent cache keyed by address. Deployed
/// addresses carry the payload's content hash, so hits never go stale.
pub struct CachingFetcher<F> {
    inner: F,
    cache: PayloadCache,
}

impl<F: ByteFetcher> CachingFetcher<F> {
    pub fn new(inner: F, cache: PayloadCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &PayloadCache {
        &self.cache
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: ByteFetcher> ByteFetcher for CachingFetcher<F> {
    fn fetch(&self, address: &str) -> LocalBoxFuture<'static, Result<ByteStream, FetchError>> {
        match self.cache.get(address) {
            Ok(Some(bytes)) => {
                tracing::debug!(address, bytes = bytes.len(), "payload cache hit");
                return future::ready(Ok(single_chunk(bytes))).boxed_local();
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(address, "payload cache unreadable: {:#}", err),
        }

        let pending = self.inner.fetch(address);
        let cache = self.cache.clone();
        let address = address.to_string();

        async move {
            let bytes = collect_bytes(pending.await?).await?;
            if let Err(err) = cache.put(&address, &bytes) {
                tracing::warn!(address = %address, "failed to cache payload: {:#}", err);
            }
            Ok::<ByteStream, FetchError>(single_chunk(bytes))
        }
        .boxed_local()
    }
}
