//! Chunk state tracking and request coalescing.

use futures::future::{self, FutureExt, LocalBoxFuture, Shared};
use manifest::{BinaryId, ChunkId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::binary::BinaryStatus;
use crate::error::LoadError;
use crate::loader::{spawn_shared, Loader};
use crate::transport::ChunkPayload;

/// Completion handle shared by every requester of one chunk load.
pub type ChunkHandle = Shared<LocalBoxFuture<'static, Result<(), LoadError>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    Unrequested,
    Pending,
    Installed,
}

struct PendingChunk {
    handle: ChunkHandle,
    /// Set once a payload naming this chunk has arrived.
    delivered: bool,
    /// Payloads held back until every part of the chunk has loaded.
    staged: Vec<Rc<ChunkPayload>>,
}

enum ChunkState {
    Pending(PendingChunk),
    Installed,
}

#[derive(Default)]
pub(crate) struct ChunkTable {
    states: RefCell<HashMap<ChunkId, ChunkState>>,
}

impl ChunkTable {
    pub(crate) fn status(&self, chunk: &ChunkId) -> ChunkStatus {
        match self.states.borrow().get(chunk) {
            None => ChunkStatus::Unrequested,
            Some(ChunkState::Pending(_)) => ChunkStatus::Pending,
            Some(ChunkState::Installed) => ChunkStatus::Installed,
        }
    }

    pub(crate) fn mark_installed(&self, chunk: ChunkId) {
        self.states.borrow_mut().insert(chunk, ChunkState::Installed);
    }

    fn pending_handle(&self, chunk: &ChunkId) -> Option<ChunkHandle> {
        match self.states.borrow().get(chunk) {
            Some(ChunkState::Pending(pending)) => Some(pending.handle.clone()),
            _ => None,
        }
    }

    fn begin(&self, chunk: ChunkId, handle: ChunkHandle) {
        self.states.borrow_mut().insert(
            chunk,
            ChunkState::Pending(PendingChunk {
                handle,
                delivered: false,
                staged: Vec::new(),
            }),
        );
    }

    /// Stage a payload on a pending chunk. False if the chunk is not pending.
    pub(crate) fn stage(&self, chunk: &ChunkId, payload: &Rc<ChunkPayload>) -> bool {
        match self.states.borrow_mut().get_mut(chunk) {
            Some(ChunkState::Pending(pending)) => {
                pending.delivered = true;
                pending.staged.push(payload.clone());
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_delivered(&self, chunk: &ChunkId) -> bool {
        matches!(
            self.states.borrow().get(chunk),
            Some(ChunkState::Pending(PendingChunk { delivered: true, .. }))
        )
    }

    /// Pending -> Installed, handing back the staged payloads.
    fn install(&self, chunk: &ChunkId) -> Vec<Rc<ChunkPayload>> {
        let previous = self
            .states
            .borrow_mut()
            .insert(chunk.clone(), ChunkState::Installed);
        match previous {
            Some(ChunkState::Pending(pending)) => pending.staged,
            _ => Vec::new(),
        }
    }

    /// Pending -> Unrequested, discarding anything staged.
    fn reset(&self, chunk: &ChunkId) {
        let mut states = self.states.borrow_mut();
        if let Some(ChunkState::Pending(_)) = states.get(chunk) {
            states.remove(chunk);
        }
    }
}

impl Loader {
    pub fn chunk_status(&self, chunk: impl Into<ChunkId>) -> ChunkStatus {
        self.inner.chunks.status(&chunk.into())
    }

    /// Resolve once `chunk` and every binary module it declares are loaded.
    ///
    /// Concurrent calls for a chunk that is still loading share one handle and
    /// one outcome. A failed load leaves the chunk unrequested so that a later
    /// call starts over.
    pub fn ensure_chunk(&self, chunk: impl Into<ChunkId>) -> ChunkHandle {
        let chunk = chunk.into();
        let binaries = self.manifest().binaries_for(&chunk).to_vec();

        match self.inner.chunks.status(&chunk) {
            ChunkStatus::Installed => return self.installed_handle(binaries),
            ChunkStatus::Pending => {
                if let Some(handle) = self.inner.chunks.pending_handle(&chunk) {
                    tracing::debug!(chunk = %chunk, "joining in-flight chunk load");
                    return handle;
                }
            }
            ChunkStatus::Unrequested => {}
        }

        let cancelled = LoadError::ChunkLoadNetworkError {
            chunk: chunk.clone(),
            src: self.manifest().script_src(&chunk),
            reason: "load cancelled".to_string(),
        };
        let handle = spawn_shared(self.clone().load_chunk(chunk.clone(), binaries), move || Err(cancelled));
        self.inner.chunks.begin(chunk, handle.clone());
        handle
    }

    /// Ensure several chunks, failing with the first error.
    pub async fn ensure_chunks<I, C>(&self, chunks: I) -> Result<(), LoadError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ChunkId>,
    {
        let handles: Vec<_> = chunks.into_iter().map(|c| self.ensure_chunk(c)).collect();
        future::try_join_all(handles).await.map(|_| ())
    }

    /// An installed chunk resolves at once unless it was delivered ahead of
    /// any request and its binaries have not been instantiated yet.
    fn installed_handle(&self, binaries: Vec<BinaryId>) -> ChunkHandle {
        let outstanding: Vec<BinaryId> = binaries
            .into_iter()
            .filter(|b| self.binary_status(b.clone()) != BinaryStatus::Loaded)
            .collect();
        if outstanding.is_empty() {
            return future::ready(Ok(())).boxed_local().shared();
        }

        let loads: Vec<_> = outstanding
            .into_iter()
            .map(|b| self.instantiate_binary(b))
            .collect();
        async move { future::try_join_all(loads).await.map(|_| ()) }
            .boxed_local()
            .shared()
    }

    async fn load_chunk(self, chunk: ChunkId, binaries: Vec<BinaryId>) -> Result<(), LoadError> {
        let script = self.fetch_chunk_script(&chunk);
        let binary_loads = future::join_all(binaries.into_iter().map(|b| self.instantiate_binary(b)));

        let (script, binary_results) = futures::join!(script, binary_loads);
        let outcome = script.and_then(|()| {
            binary_results
                .into_iter()
                .find_map(Result::err)
                .map_or(Ok(()), Err)
        });
        self.settle_chunk(&chunk, outcome)
    }

    /// All parts are in: install atomically or roll back to unrequested.
    ///
    /// Unrequested chunks that arrived in the same payload are installed with
    /// this one; still pending ones settle on their own.
    fn settle_chunk(&self, chunk: &ChunkId, outcome: Result<(), LoadError>) -> Result<(), LoadError> {
        match outcome {
            Ok(()) => {
                let staged = self.inner.chunks.install(chunk);
                let mut modules = 0;
                for payload in staged {
                    modules += self.inner.registry.merge(payload.modules.iter().cloned());
                    for other in &payload.chunk_ids {
                        if self.inner.chunks.status(other) == ChunkStatus::Unrequested {
                            tracing::debug!(chunk = %other, with = %chunk, "chunk installed alongside");
                            self.inner.chunks.mark_installed(other.clone());
                        }
                    }
                }
                tracing::info!(chunk = %chunk, modules, "chunk installed");
                Ok(())
            }
            Err(err) => {
                self.inner.chunks.reset(chunk);
                self.inner.platform.errors.chunk_failed(chunk, &err);
                tracing::debug!(chunk = %chunk, category = %err.category(), "chunk reset to unrequested");
                Err(err)
            }
        }
    }
}
