//! §4.D Type Registry: the process-wide, append-only map from a job-type
//! name to its handler, encoder, and default retry budget.
//!
//! Registration happens once at process start (or under a single-writer
//! lock); every subsequent lookup is lock-free, via `dashmap`, exactly as
//! the concurrency model in §5 requires.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{WharfError, WharfResult};
use crate::job::{Job, Priority, Timestamp};
use crate::queue::JobQueue;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Converts a typed payload to and from the opaque byte string the store
/// holds. The mechanism is opaque to the core: only the contract (`bytes
/// -> value` succeeds or yields a decode error) matters, per the "Payload
/// typing" design note.
pub trait Encoder<T>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn encode(&self, value: &T) -> Result<Vec<u8>, Self::Error>;
    fn decode(&self, bytes: &[u8]) -> Result<T, Self::Error>;
}

/// The reference `Encoder`: JSON via `serde`, for any payload that derives
/// `Serialize`/`Deserialize`. Applications may supply their own (msgpack,
/// protobuf, ...); the registry only ever talks to this trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl<T> Encoder<T> for JsonEncoder
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Error = serde_json::Error;

    fn encode(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A registered job handler: a single-parameter async callback. Returning
/// `Err` is equivalent to the handler panicking — both decrement the
/// job's retry budget — but a clean `Err` never unwinds the worker's
/// stack.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn call(&self, payload: T) -> Result<(), String>;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    async fn call(&self, payload: T) -> Result<(), String> {
        (self)(payload).await
    }
}

/// What the worker loop sees after decode-and-invoke: the two handler-
/// facing failure modes from §7, kept separate from store/registry errors
/// so the caller can craft the `retryOrFailJob` message appropriately.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Success,
    DecodeFailed(String),
    HandlerFailed(String),
}

type ErasedInvoke = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

struct RegistryEntry {
    default_retries: u32,
    invoke: ErasedInvoke,
}

/// Process-wide map from job-type name to its handler, encoder, and
/// default retry budget. Re-registering a name is an error (§4.D).
#[derive(Default)]
pub struct TypeRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Registers `handler` under `type_name` using `encoder` to decode
    /// payloads, and returns a [`TypeHandle`] producers can use to
    /// schedule jobs of this type against `queue`.
    ///
    /// Errors with [`WharfError::Misconfiguration`] if the name is
    /// already registered.
    pub fn register<T, E, H, Q>(
        self: &Arc<Self>,
        type_name: impl Into<String>,
        default_retries: u32,
        encoder: E,
        handler: H,
        queue: Arc<Q>,
    ) -> WharfResult<TypeHandle<T, E, Q>>
    where
        T: Send + 'static,
        E: Encoder<T> + Clone,
        H: Handler<T>,
        Q: JobQueue,
    {
        let type_name = type_name.into();
        let handler = Arc::new(handler);
        let decode_encoder = encoder.clone();
        let invoke: ErasedInvoke = Arc::new(move |bytes: Vec<u8>| {
            let handler = Arc::clone(&handler);
            let encoder = decode_encoder.clone();
            Box::pin(async move {
                match encoder.decode(&bytes) {
                    Ok(value) => match handler.call(value).await {
                        Ok(()) => HandlerOutcome::Success,
                        Err(e) => HandlerOutcome::HandlerFailed(e),
                    },
                    Err(e) => HandlerOutcome::DecodeFailed(e.to_string()),
                }
            })
        });

        match self.entries.entry(type_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(WharfError::Misconfiguration(
                format!("job type {type_name:?} already registered"),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    default_retries,
                    invoke,
                });
                Ok(TypeHandle {
                    type_name,
                    default_retries,
                    encoder,
                    queue,
                    _marker: PhantomData,
                })
            }
        }
    }

    /// Looks up the default retry budget registered for `type_name`, if
    /// any.
    pub fn default_retries(&self, type_name: &str) -> Option<u32> {
        self.entries.get(type_name).map(|e| e.default_retries)
    }

    /// Decodes `payload` and invokes the handler registered for
    /// `type_name`. Returns [`WharfError::UnknownType`] if no handler is
    /// registered — the worker treats that as a permanent failure.
    pub async fn dispatch(&self, type_name: &str, payload: Vec<u8>) -> WharfResult<HandlerOutcome> {
        let invoke = {
            let entry = self
                .entries
                .get(type_name)
                .ok_or_else(|| WharfError::UnknownType(type_name.to_string()))?;
            Arc::clone(&entry.invoke)
        };
        Ok(invoke(payload).await)
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }
}

/// A type-bound handle returned by [`TypeRegistry::register`]. Producers
/// use this instead of restating the type name and encoder at every call
/// site (§6 library surface).
pub struct TypeHandle<T, E, Q> {
    type_name: String,
    default_retries: u32,
    encoder: E,
    queue: Arc<Q>,
    _marker: PhantomData<fn(T)>,
}

impl<T, E, Q> Clone for TypeHandle<T, E, Q>
where
    E: Clone,
{
    fn clone(&self) -> Self {
        Self {
            type_name: self.type_name.clone(),
            default_retries: self.default_retries,
            encoder: self.encoder.clone(),
            queue: Arc::clone(&self.queue),
            _marker: PhantomData,
        }
    }
}

impl<T, E, Q> TypeHandle<T, E, Q>
where
    T: Send + Sync + 'static,
    E: Encoder<T>,
    Q: JobQueue,
{
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// `TypeHandle.Schedule(priority, time, payload) -> Job`.
    pub async fn schedule(&self, priority: Priority, time: Timestamp, payload: &T) -> WharfResult<Job> {
        let bytes = self
            .encoder
            .encode(payload)
            .map_err(|e| WharfError::Decode {
                job_id: String::new(),
                type_name: self.type_name.clone(),
                source: Box::new(e),
            })?;
        self.queue
            .schedule(&self.type_name, priority, time, bytes, self.default_retries)
            .await
    }

    /// `TypeHandle.ScheduleRecurring(priority, firstTime, freq, payload) -> Job`.
    pub async fn schedule_recurring(
        &self,
        priority: Priority,
        first_time: Timestamp,
        freq: i64,
        payload: &T,
    ) -> WharfResult<Job> {
        let bytes = self
            .encoder
            .encode(payload)
            .map_err(|e| WharfError::Decode {
                job_id: String::new(),
                type_name: self.type_name.clone(),
                source: Box::new(e),
            })?;
        self.queue
            .schedule_recurring(
                &self.type_name,
                priority,
                first_time,
                freq,
                bytes,
                self.default_retries,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_testing::FakeJobQueue;

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = Arc::new(TypeRegistry::new());
        let queue = Arc::new(FakeJobQueue::new());

        registry
            .register::<String, _, _, _>(
                "greet",
                0,
                JsonEncoder,
                |_payload: String| async move { Ok(()) },
                Arc::clone(&queue),
            )
            .expect("first registration succeeds");

        let err = registry
            .register::<String, _, _, _>(
                "greet",
                0,
                JsonEncoder,
                |_payload: String| async move { Ok(()) },
                queue,
            )
            .expect_err("duplicate registration must fail");

        assert!(err.is_misconfiguration());
    }

    #[tokio::test]
    async fn dispatch_unknown_type_is_an_error() {
        let registry = TypeRegistry::new();
        let err = registry.dispatch("nope", vec![]).await.unwrap_err();
        assert!(matches!(err, WharfError::UnknownType(name) if name == "nope"));
    }

    #[tokio::test]
    async fn dispatch_decodes_and_invokes() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let registry = Arc::new(TypeRegistry::new());
        let queue = Arc::new(FakeJobQueue::new());
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        registry
            .register::<String, _, _, _>(
                "greet",
                0,
                JsonEncoder,
                move |payload: String| {
                    let called = Arc::clone(&called_clone);
                    async move {
                        assert_eq!(payload, "world");
                        called.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                },
                queue,
            )
            .unwrap();

        let payload = serde_json::to_vec("world").unwrap();
        let outcome = registry.dispatch("greet", payload).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Success));
        assert!(called.load(Ordering::SeqCst));
    }
}
