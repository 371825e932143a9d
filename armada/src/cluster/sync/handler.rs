//! Typed data sync handlers.

use super::{ErasedSyncHandler, SyncError, SyncOutcome};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

type Collector<T> = Box<dyn Fn() -> Vec<T> + Send + Sync>;
type CurrentGetter<T> = Box<dyn Fn(&T) -> Option<T> + Send + Sync>;
type Writer<T> = Box<dyn Fn(T) + Send + Sync>;
type NameExtractor<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type Resolver<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Descriptor of one replicated entity class.
///
/// Records are serialized as opaque JSON buffers; the callbacks bridge to
/// wherever the entity actually lives (entity stores, the service manager,
/// the roster).
pub struct DataSyncHandler<T> {
    key: String,
    always_force_apply: bool,
    collector: Collector<T>,
    current_getter: CurrentGetter<T>,
    writer: Writer<T>,
    name_extractor: NameExtractor<T>,
    /// Returns true when the incoming record should win the conflict.
    resolver: Resolver<T>,
}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> DataSyncHandler<T> {
    pub fn builder(key: impl Into<String>) -> DataSyncHandlerBuilder<T> {
        DataSyncHandlerBuilder {
            key: key.into(),
            always_force_apply: false,
            collector: None,
            current_getter: None,
            writer: None,
            name_extractor: None,
            resolver: None,
        }
    }

    /// Identity key of a record, used for conflict matching.
    pub fn name_of(&self, record: &T) -> String {
        (self.name_extractor)(record)
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> ErasedSyncHandler
    for DataSyncHandler<T>
{
    fn key(&self) -> &str {
        &self.key
    }

    fn always_force_apply(&self) -> bool {
        self.always_force_apply
    }

    fn collect_serialized(&self) -> Vec<Bytes> {
        (self.collector)()
            .iter()
            .map(|record| Bytes::from(serde_json::to_vec(record).expect("record serializes")))
            .collect()
    }

    fn apply_serialized(&self, record: &[u8], force: bool) -> Result<SyncOutcome, SyncError> {
        let incoming: T =
            serde_json::from_slice(record).map_err(|source| SyncError::MalformedRecord {
                key: self.key.clone(),
                source,
            })?;

        match (self.current_getter)(&incoming) {
            None => {
                (self.writer)(incoming);
                Ok(SyncOutcome::Written)
            }
            Some(local) => {
                if force || self.always_force_apply || (self.resolver)(&local, &incoming) {
                    (self.writer)(incoming);
                    Ok(SyncOutcome::Overwritten)
                } else {
                    Ok(SyncOutcome::Discarded)
                }
            }
        }
    }
}

/// Builder for [`DataSyncHandler`].
pub struct DataSyncHandlerBuilder<T> {
    key: String,
    always_force_apply: bool,
    collector: Option<Collector<T>>,
    current_getter: Option<CurrentGetter<T>>,
    writer: Option<Writer<T>>,
    name_extractor: Option<NameExtractor<T>>,
    resolver: Option<Resolver<T>>,
}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> DataSyncHandlerBuilder<T> {
    /// Conflicts always resolve to the incoming record.
    pub fn always_force(mut self) -> Self {
        self.always_force_apply = true;
        self
    }

    /// Enumerates the current local records.
    pub fn collector<F: Fn() -> Vec<T> + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.collector = Some(Box::new(f));
        self
    }

    /// Looks up the existing local record matching a candidate.
    pub fn current_getter<F: Fn(&T) -> Option<T> + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.current_getter = Some(Box::new(f));
        self
    }

    /// Applies a record locally (upsert).
    pub fn writer<F: Fn(T) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.writer = Some(Box::new(f));
        self
    }

    /// Identity key used in conflict resolution.
    pub fn name_extractor<F: Fn(&T) -> String + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.name_extractor = Some(Box::new(f));
        self
    }

    /// `resolver(local, incoming)` returning true when incoming wins.
    /// Defaults to incoming-wins.
    pub fn resolver<F: Fn(&T, &T) -> bool + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.resolver = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<DataSyncHandler<T>> {
        Arc::new(DataSyncHandler {
            key: self.key,
            always_force_apply: self.always_force_apply,
            collector: self.collector.expect("collector is required"),
            current_getter: self.current_getter.expect("current getter is required"),
            writer: self.writer.expect("writer is required"),
            name_extractor: self.name_extractor.expect("name extractor is required"),
            resolver: self.resolver.unwrap_or_else(|| Box::new(|_, _| true)),
        })
    }
}
