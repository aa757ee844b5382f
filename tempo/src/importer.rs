//! Replaying stored streams into a pipeline.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use tempo_serialization::{SerializationError, Serializer};
use tempo_store::StoreReader;
use tempo_time::{Envelope, Time, TimeInterval};

use crate::error::Error;
use crate::pipeline::{CompletionNotifier, Pipeline, ReplayDescriptor, SourceComponent};
use crate::stream::Stream;
use crate::streams::Emitter;

/// Reads a store and replays its streams as pipeline sources.
///
/// Each opened stream becomes a source that posts stored messages at
/// their recorded originating times; with replay-clock enforcement the
/// pipeline reproduces the original pacing (scaled by replay speed),
/// without it the replay is best-effort.
pub struct Importer {
    pipeline: Pipeline,
    reader: Arc<Mutex<StoreReader>>,
    serializer: Serializer,
}

impl Importer {
    /// Opens store `name` under `path` for replay into `pipeline`.
    pub fn open(pipeline: &Pipeline, name: &str, path: &Path) -> Result<Importer, Error> {
        let reader = StoreReader::open(name, path)?;
        let importer = Importer {
            pipeline: pipeline.clone(),
            reader: Arc::new(Mutex::new(reader)),
            serializer: Serializer::new(),
        };
        importer
            .reader
            .lock()
            .expect("importer poisoned")
            .validate_serialization(importer.serializer.known_serializers())?;
        Ok(importer)
    }

    /// The serializer registry used for payloads.
    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// Names of the stored streams.
    pub fn stream_names(&self) -> Vec<String> {
        self.reader
            .lock()
            .expect("importer poisoned")
            .streams()
            .map(|metadata| metadata.name.clone())
            .collect()
    }

    /// The originating-time range covered by the store.
    pub fn originating_time_range(&self) -> Option<(Time, Time)> {
        self.reader.lock().expect("importer poisoned").originating_time_range()
    }

    /// A descriptor replaying the store's full interval with clock
    /// enforcement (the default for file replay).
    pub fn replay_descriptor(&self) -> ReplayDescriptor {
        match self.originating_time_range() {
            Some((start, end)) => ReplayDescriptor::replay(start, end),
            None => ReplayDescriptor::live(),
        }
    }

    /// Opens stored stream `name` as a typed pipeline stream.
    ///
    /// Fails with a type mismatch when `T` differs from the recorded
    /// payload type.
    pub fn stream<T>(&self, name: &str) -> Result<Stream<T>, Error>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let (stream_id, recorded_type) = {
            let reader = self.reader.lock().expect("importer poisoned");
            let metadata = reader.stream(name).ok_or_else(|| {
                Error::Store(tempo_store::StoreError::UnknownStream(name.to_string()))
            })?;
            (metadata.id, metadata.type_name.clone())
        };
        let expected = std::any::type_name::<T>();
        if recorded_type != expected {
            return Err(Error::Serialization(SerializationError::TypeMismatch {
                expected: expected.to_string(),
                found: recorded_type,
            }));
        }

        let messages = self
            .reader
            .lock()
            .expect("importer poisoned")
            .read_stream_messages(stream_id, TimeInterval::infinite())?;

        let emitter = self.pipeline.create_emitter::<T>(name);
        self.pipeline.add_source(
            &format!("Import.{name}"),
            ReplaySource {
                pipeline: self.pipeline.clone(),
                emitter: emitter.clone(),
                serializer: self.serializer.clone(),
                messages: Some(messages.into()),
                stopped: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(Stream::from_emitter(emitter, self.pipeline.clone()))
    }
}

struct ReplaySource<T: Clone + Send + 'static> {
    pipeline: Pipeline,
    emitter: Emitter<T>,
    serializer: Serializer,
    messages: Option<VecDeque<(Envelope, Vec<u8>)>>,
    stopped: Arc<AtomicBool>,
}

struct ReplayState<T: Clone + Send + 'static> {
    pipeline: Pipeline,
    emitter: Emitter<T>,
    serializer: Serializer,
    messages: Mutex<VecDeque<(Envelope, Vec<u8>)>>,
    stopped: Arc<AtomicBool>,
    notifier: Mutex<Option<CompletionNotifier>>,
}

impl<T> SourceComponent for ReplaySource<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn start(&mut self, notifier: CompletionNotifier) {
        let messages = self.messages.take().unwrap_or_default();
        if messages.is_empty() {
            let now = self.pipeline.now();
            notifier.completed(now);
            self.emitter.close(now);
            return;
        }
        let first_due = messages.front().expect("non-empty").0.originating_time;
        let state = Arc::new(ReplayState {
            pipeline: self.pipeline.clone(),
            emitter: self.emitter.clone(),
            serializer: self.serializer.clone(),
            messages: Mutex::new(messages),
            stopped: Arc::clone(&self.stopped),
            notifier: Mutex::new(Some(notifier)),
        });
        replay_step(state, first_due);
    }

    fn stop(&mut self, _final_time: Time) {
        self.stopped.store(true, Ordering::Release);
    }
}

fn replay_step<T>(state: Arc<ReplayState<T>>, due: Time)
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let scheduler = state.pipeline.scheduler().clone();
    let context = Arc::clone(state.pipeline.context());
    scheduler.schedule(&context, due, move || {
        if state.stopped.load(Ordering::Acquire) {
            return;
        }
        if !state.emitter.has_capacity() {
            std::thread::yield_now();
            replay_step(Arc::clone(&state), due);
            return;
        }
        let next = state.messages.lock().expect("replay poisoned").pop_front();
        let Some((envelope, payload)) = next else {
            finish_replay(&state, due);
            return;
        };
        let value: T = state
            .serializer
            .deserialize(&payload)
            .unwrap_or_else(|error| panic!("failed to deserialize replayed message: {error}"));
        state
            .emitter
            .post(value, envelope.originating_time)
            .expect("stored messages replay in originating order");

        let upcoming = state
            .messages
            .lock()
            .expect("replay poisoned")
            .front()
            .map(|(envelope, _)| envelope.originating_time);
        match upcoming {
            Some(next_due) => replay_step(Arc::clone(&state), next_due.max(due)),
            None => finish_replay(&state, envelope.originating_time),
        }
    });
}

fn finish_replay<T: Clone + Send + 'static>(state: &Arc<ReplayState<T>>, last: Time) {
    if let Some(notifier) = state.notifier.lock().expect("replay poisoned").take() {
        notifier.completed(last);
    }
    state.emitter.close(last);
}
