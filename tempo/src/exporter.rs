//! Writing pipeline streams into a store.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use tempo_serialization::Serializer;
use tempo_store::{StoreWriter, StoreWriterOptions};
use tempo_time::Envelope;

use crate::error::Error;
use crate::message::Message;
use crate::pipeline::Pipeline;
use crate::stream::Stream;
use crate::streams::DeliveryPolicy;

/// Writes streams of one pipeline into one store.
///
/// Write edges default to a synchronous (lossless) delivery policy so
/// the store observes every message before the source advances; callers
/// may override per stream. The store closes once every exported stream
/// has closed.
pub struct Exporter {
    pipeline: Pipeline,
    writer: Arc<Mutex<StoreWriter>>,
    serializer: Serializer,
    open_streams: Arc<AtomicUsize>,
}

impl Exporter {
    /// Creates a store `name` under `path` attached to `pipeline`.
    pub fn create(pipeline: &Pipeline, name: &str, path: &Path) -> Result<Exporter, Error> {
        Self::create_with_options(pipeline, name, path, StoreWriterOptions::default())
    }

    /// Creates a store with explicit options.
    pub fn create_with_options(
        pipeline: &Pipeline,
        name: &str,
        path: &Path,
        options: StoreWriterOptions,
    ) -> Result<Exporter, Error> {
        let writer = StoreWriter::create(name, path, options)?;
        Ok(Exporter {
            pipeline: pipeline.clone(),
            writer: Arc::new(Mutex::new(writer)),
            serializer: Serializer::new(),
            open_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The serializer registry used for payloads.
    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// Persists `stream` under `name` with the default lossless policy.
    pub fn write<T>(&self, stream: &Stream<T>, name: &str) -> Result<(), Error>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.write_with_policy(stream, name, DeliveryPolicy::SynchronousOrThrottle)
    }

    /// Persists `stream` under `name` with an explicit delivery policy;
    /// lossy policies make the stored stream lossy too.
    pub fn write_with_policy<T>(
        &self,
        stream: &Stream<T>,
        name: &str,
        policy: DeliveryPolicy,
    ) -> Result<(), Error>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let stream_id = {
            let mut writer = self.writer.lock().expect("exporter poisoned");
            let id = writer.max_stream_id().map_or(0, |max| max + 1);
            writer.create_stream(id, name, std::any::type_name::<T>())?;
            id
        };
        self.open_streams.fetch_add(1, Ordering::AcqRel);

        let writer = Arc::clone(&self.writer);
        let serializer = self.serializer.clone();
        let stream_name = name.to_string();
        let receiver = self.pipeline.create_receiver::<T>(
            &format!("Export.{name}"),
            move |message: Message<T>| {
                let payload = serializer
                    .serialize(&message.data)
                    .unwrap_or_else(|error| panic!("failed to serialize `{stream_name}`: {error}"));
                let envelope = Envelope { source_id: stream_id, ..message.envelope };
                writer
                    .lock()
                    .expect("exporter poisoned")
                    .write_message(&envelope, &payload)
                    .unwrap_or_else(|error| panic!("failed to persist `{stream_name}`: {error}"));
            },
        );

        let writer = Arc::clone(&self.writer);
        let open_streams = Arc::clone(&self.open_streams);
        receiver.on_closed(move |time| {
            if open_streams.fetch_sub(1, Ordering::AcqRel) == 1 {
                // The last exported stream closed; seal the store.
                if let Err(error) =
                    writer.lock().expect("exporter poisoned").close(Some(time))
                {
                    log::error!("failed to close store: {error}");
                }
            }
        });

        stream.pipe_to(&receiver, policy);
        Ok(())
    }

    /// Attaches supplemental metadata to an exported stream.
    pub fn set_supplemental<V>(&self, stream_name: &str, value: &V) -> Result<(), Error>
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let payload = self.serializer.serialize(value)?;
        let mut writer = self.writer.lock().expect("exporter poisoned");
        let stream_id = writer
            .streams()
            .find(|metadata| metadata.name == stream_name)
            .map(|metadata| metadata.id)
            .ok_or_else(|| Error::InvalidArgument(format!("no exported stream `{stream_name}`")))?;
        writer.set_supplemental(stream_id, std::any::type_name::<V>(), payload)?;
        Ok(())
    }
}
