//! Finite and always-on test/source generators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempo_time::{Time, TimeSpan};

use crate::pipeline::{CompletionNotifier, Pipeline, SourceComponent};
use crate::stream::Stream;
use crate::streams::Emitter;

/// Factory for generator sources.
pub struct Generators;

impl Generators {
    /// A source posting `items` at fixed `spacing`, starting at the
    /// pipeline's start time; completes (and closes its stream) after
    /// the last item.
    pub fn sequence<T: Clone + Send + 'static>(
        pipeline: &Pipeline,
        name: &str,
        items: Vec<T>,
        spacing: TimeSpan,
    ) -> Stream<T> {
        Self::sequence_with(pipeline, name, items, spacing, false)
    }

    /// Like [`Generators::sequence`], but the source reports indefinite
    /// operation: the pipeline does not stop when the items run out.
    pub fn sequence_keep_open<T: Clone + Send + 'static>(
        pipeline: &Pipeline,
        name: &str,
        items: Vec<T>,
        spacing: TimeSpan,
    ) -> Stream<T> {
        Self::sequence_with(pipeline, name, items, spacing, true)
    }

    /// A sequence of consecutive integers.
    pub fn range(
        pipeline: &Pipeline,
        name: &str,
        range: std::ops::Range<i64>,
        spacing: TimeSpan,
    ) -> Stream<i64> {
        Self::sequence(pipeline, name, range.collect(), spacing)
    }

    fn sequence_with<T: Clone + Send + 'static>(
        pipeline: &Pipeline,
        name: &str,
        items: Vec<T>,
        spacing: TimeSpan,
        keep_open: bool,
    ) -> Stream<T> {
        assert!(spacing > TimeSpan::ZERO, "generator spacing must be positive");
        let emitter = pipeline.create_emitter::<T>(name);
        pipeline.add_source(
            name,
            SequenceSource {
                pipeline: pipeline.clone(),
                emitter: emitter.clone(),
                items: Some(items),
                spacing,
                keep_open,
                stopped: Arc::new(AtomicBool::new(false)),
            },
        );
        Stream::from_emitter(emitter, pipeline.clone())
    }
}

struct SequenceSource<T: Clone + Send + 'static> {
    pipeline: Pipeline,
    emitter: Emitter<T>,
    items: Option<Vec<T>>,
    spacing: TimeSpan,
    keep_open: bool,
    stopped: Arc<AtomicBool>,
}

struct EmitState<T: Clone + Send + 'static> {
    pipeline: Pipeline,
    emitter: Emitter<T>,
    items: Mutex<VecDeque<T>>,
    spacing: TimeSpan,
    keep_open: bool,
    stopped: Arc<AtomicBool>,
    notifier: Mutex<Option<CompletionNotifier>>,
}

impl<T: Clone + Send + 'static> SourceComponent for SequenceSource<T> {
    fn start(&mut self, notifier: CompletionNotifier) {
        let items: VecDeque<T> = self.items.take().unwrap_or_default().into();
        let start_time = self.pipeline.now();
        if items.is_empty() {
            if self.keep_open {
                notifier.indefinite();
            } else {
                notifier.completed(start_time);
                self.emitter.close(start_time);
            }
            return;
        }
        if self.keep_open {
            notifier.indefinite();
        }
        let state = Arc::new(EmitState {
            pipeline: self.pipeline.clone(),
            emitter: self.emitter.clone(),
            items: Mutex::new(items),
            spacing: self.spacing,
            keep_open: self.keep_open,
            stopped: Arc::clone(&self.stopped),
            notifier: Mutex::new(Some(notifier)),
        });
        step(state, start_time);
    }

    fn stop(&mut self, _final_time: Time) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Schedules the emission of the next item at `due`; each emission
/// schedules its successor, yielding the worker between items.
fn step<T: Clone + Send + 'static>(state: Arc<EmitState<T>>, due: Time) {
    let scheduler = state.pipeline.scheduler().clone();
    let context = Arc::clone(state.pipeline.context());
    scheduler.schedule(&context, due, move || {
        if state.stopped.load(Ordering::Acquire) {
            return;
        }
        // Throttled subscribers exert back-pressure here, on the
        // source's own work item, never inside `post`.
        if !state.emitter.has_capacity() {
            std::thread::yield_now();
            step(Arc::clone(&state), due);
            return;
        }
        let next = state.items.lock().expect("generator poisoned").pop_front();
        let Some(value) = next else {
            finish(&state, due);
            return;
        };
        state
            .emitter
            .post(value, due)
            .expect("generator posts advance monotonically");
        let remaining = !state.items.lock().expect("generator poisoned").is_empty();
        if remaining {
            let next_due = due + state.spacing;
            step(Arc::clone(&state), next_due);
        } else {
            finish(&state, due);
        }
    });
}

fn finish<T: Clone + Send + 'static>(state: &Arc<EmitState<T>>, last: Time) {
    if state.keep_open {
        // Indefinite sources keep their stream open; the pipeline closes
        // it at stop.
        return;
    }
    if let Some(notifier) = state.notifier.lock().expect("generator poisoned").take() {
        notifier.completed(last);
    }
    state.emitter.close(last);
}
