//! Chunk script transport.
//!
//! A transport brings one chunk's script to life. The script does not return
//! its modules: while it runs it pushes a [`ChunkPayload`] into the
//! [`DeliverySink`] it was handed, and the loader drains those deliveries into
//! the registry once the transport reports completion.

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::{FutureExt, LocalBoxFuture};
use manifest::ChunkId;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

use crate::error::LoadError;
use crate::loader::Loader;
use crate::registry::{Factory, ModuleId};

/// Modules delivered by one script, for one or more chunks.
#[derive(Clone)]
pub struct ChunkPayload {
    pub chunk_ids: Vec<ChunkId>,
    pub modules: Vec<(ModuleId, Factory)>,
}

impl ChunkPayload {
    pub fn new(chunk_ids: Vec<ChunkId>, modules: Vec<(ModuleId, Factory)>) -> Self {
        Self { chunk_ids, modules }
    }
}

/// Write end of the delivery channel handed to running scripts.
#[derive(Clone)]
pub struct DeliverySink {
    tx: UnboundedSender<ChunkPayload>,
}

impl DeliverySink {
    pub fn deliver(&self, chunk_ids: Vec<ChunkId>, modules: Vec<(ModuleId, Factory)>) {
        self.send(ChunkPayload::new(chunk_ids, modules));
    }

    pub fn send(&self, payload: ChunkPayload) {
        if self.tx.unbounded_send(payload).is_err() {
            tracing::warn!("loader is gone; chunk payload discarded");
        }
    }
}

pub(crate) struct DeliveryQueue {
    tx: UnboundedSender<ChunkPayload>,
    rx: RefCell<UnboundedReceiver<ChunkPayload>>,
}

impl DeliveryQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx: RefCell::new(rx),
        }
    }

    pub(crate) fn sink(&self) -> DeliverySink {
        DeliverySink {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn drain(&self) -> Vec<ChunkPayload> {
        let mut rx = self.rx.borrow_mut();
        let mut payloads = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            payloads.push(payload);
        }
        payloads
    }
}

/// What a transport is asked to load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptRequest {
    pub chunk: ChunkId,
    pub src: String,
    pub charset: String,
    pub nonce: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The script could not be obtained.
    #[error("{0}")]
    Network(String),
    /// The script was obtained but threw while evaluating.
    #[error("{0}")]
    Script(String),
}

pub trait ScriptTransport {
    /// Resolves once the script has finished evaluating. Any payload it
    /// delivers must be sent into `sink` before then.
    fn load(
        &self,
        request: ScriptRequest,
        sink: DeliverySink,
    ) -> LocalBoxFuture<'static, Result<(), TransportError>>;
}

pub type ScriptBody = Rc<dyn Fn(&DeliverySink) -> anyhow::Result<()>>;

/// Chunk scripts linked into the host, keyed by source address.
#[derive(Default)]
pub struct BundledScripts {
    scripts: RefCell<HashMap<String, ScriptBody>>,
    latency: Duration,
    loads: Cell<usize>,
}

impl BundledScripts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every load, as a network round trip would.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_script<F>(self, src: impl Into<String>, body: F) -> Self
    where
        F: Fn(&DeliverySink) -> anyhow::Result<()> + 'static,
    {
        self.insert(src, body);
        self
    }

    pub fn insert<F>(&self, src: impl Into<String>, body: F)
    where
        F: Fn(&DeliverySink) -> anyhow::Result<()> + 'static,
    {
        self.scripts.borrow_mut().insert(src.into(), Rc::new(body));
    }

    /// Number of loads started so far.
    pub fn load_count(&self) -> usize {
        self.loads.get()
    }
}

impl ScriptTransport for BundledScripts {
    fn load(
        &self,
        request: ScriptRequest,
        sink: DeliverySink,
    ) -> LocalBoxFuture<'static, Result<(), TransportError>> {
        self.loads.set(self.loads.get() + 1);
        let body = self.scripts.borrow().get(&request.src).cloned();
        let latency = self.latency;

        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let body = body.ok_or_else(|| {
                TransportError::Network(format!("no script is served at {}", request.src))
            })?;
            tracing::debug!(chunk = %request.chunk, src = %request.src, "evaluating chunk script");
            body(&sink).map_err(|err| TransportError::Script(format!("{:#}", err)))
        }
        .boxed_local()
    }
}

impl Loader {
    /// The channel end that chunk scripts deliver their payloads into.
    pub fn sink(&self) -> DeliverySink {
        self.inner.deliveries.sink()
    }

    /// Merge every payload delivered so far. Returns how many were merged.
    pub fn pump(&self) -> usize {
        let payloads = self.inner.deliveries.drain();
        let count = payloads.len();
        for payload in payloads {
            self.on_chunk_payload_delivered(payload.chunk_ids, payload.modules);
        }
        count
    }

    /// Run the chunk's script through the transport, bounded by the
    /// configured timeout. Whichever of completion and timeout comes first
    /// decides the outcome; the other is dropped.
    pub(crate) async fn fetch_chunk_script(&self, chunk: &ChunkId) -> Result<(), LoadError> {
        let config = self.config();
        let src = self.manifest().script_src(chunk);
        let request = ScriptRequest {
            chunk: chunk.clone(),
            src: src.clone(),
            charset: config.script_charset.clone(),
            nonce: config.script_nonce.clone(),
        };

        tracing::debug!(chunk = %chunk, src = %src, "requesting chunk script");
        let load = self.inner.platform.scripts.load(request, self.sink());
        let outcome = tokio::time::timeout(config.chunk_timeout(), load).await;
        self.pump();

        match outcome {
            Err(_) => Err(LoadError::ChunkLoadTimeout {
                chunk: chunk.clone(),
                src,
            }),
            Ok(Err(TransportError::Network(reason))) => Err(LoadError::ChunkLoadNetworkError {
                chunk: chunk.clone(),
                src,
                reason,
            }),
            Ok(Err(TransportError::Script(reason))) => Err(LoadError::ChunkLoadScriptError {
                chunk: chunk.clone(),
                src,
                reason,
            }),
            Ok(Ok(())) if self.inner.chunks.is_delivered(chunk) => Ok(()),
            Ok(Ok(())) => {
                tracing::warn!(chunk = %chunk, src = %src, "script loaded without delivering its chunk");
                Err(LoadError::ChunkLoadMissing {
                    chunk: chunk.clone(),
                    src,
                })
            }
        }
    }
}
