//! Elementwise stream operators.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tempo_time::{Time, TimeSpan};

use crate::message::Message;
use crate::stream::Stream;
use crate::streams::DeliveryPolicy;

/// One edit applied to a live stream by [`Stream::edit`], keyed by
/// originating time.
#[derive(Clone, Debug)]
pub enum StreamEditOp<T> {
    /// Posts a new message at the keyed time.
    Insert(T),
    /// Replaces the payload of the message at the keyed time.
    Update(T),
    /// Drops the message at the keyed time.
    Delete,
}

impl<T: Clone + Send + 'static> Stream<T> {
    /// Maps each payload through `transform`.
    pub fn select<U: Clone + Send + 'static>(
        &self,
        mut transform: impl FnMut(T) -> U + Send + 'static,
    ) -> Stream<U> {
        self.unary("Select", DeliveryPolicy::Unlimited, move |message, output| {
            let time = message.originating_time();
            output
                .post(transform(message.data), time)
                .expect("mapped posts preserve input order");
        })
    }

    /// Keeps only payloads for which `predicate` holds.
    pub fn filter(&self, mut predicate: impl FnMut(&T) -> bool + Send + 'static) -> Stream<T> {
        self.unary("Where", DeliveryPolicy::Unlimited, move |message, output| {
            if predicate(&message.data) {
                let time = message.originating_time();
                output.post(message.data, time).expect("filtered posts preserve input order");
            }
        })
    }

    /// Observes each message (payload and envelope) and passes it along
    /// unchanged.
    pub fn inspect(&self, mut observe: impl FnMut(&Message<T>) + Send + 'static) -> Stream<T> {
        self.unary("Do", DeliveryPolicy::Unlimited, move |message, output| {
            observe(&message);
            let time = message.originating_time();
            output.post(message.data, time).expect("inspected posts preserve input order");
        })
    }

    /// Folds messages into an accumulator, emitting the running value.
    pub fn aggregate<A: Clone + Send + 'static>(
        &self,
        seed: A,
        mut fold: impl FnMut(A, T) -> A + Send + 'static,
    ) -> Stream<A> {
        let mut accumulator = Some(seed);
        self.unary("Aggregate", DeliveryPolicy::Unlimited, move |message, output| {
            let time = message.originating_time();
            let next = fold(accumulator.take().expect("accumulator present"), message.data);
            accumulator = Some(next.clone());
            output.post(next, time).expect("aggregated posts preserve input order");
        })
    }

    /// Shifts each message `span` into the future (originating times
    /// move with it); delivery is rescheduled to the shifted time.
    pub fn delay(&self, span: TimeSpan) -> Stream<T> {
        assert!(!span.is_negative(), "delay spans must be non-negative");
        let pipeline = self.pipeline().clone();
        let close_pipeline = pipeline.clone();
        self.unary_with_close(
            "Delay",
            DeliveryPolicy::Unlimited,
            move |message: Message<T>, output| {
                let delayed = message.originating_time() + span;
                let output = output.clone();
                let scheduler = pipeline.scheduler().clone();
                scheduler.schedule(pipeline.context(), delayed, move || {
                    output.post(message.data, delayed).expect("delayed posts preserve order");
                });
            },
            move |time, output| {
                let delayed = time + span;
                let output = output.clone();
                let scheduler = close_pipeline.scheduler().clone();
                scheduler.schedule(close_pipeline.context(), delayed, move || {
                    output.close(delayed);
                });
            },
        )
    }

    /// Applies insert/update/delete operations keyed by originating
    /// time while the stream flows. Unedited messages pass through with
    /// their payloads untouched; inserts may target times before the
    /// first or after the last message of the stream.
    pub fn edit(&self, edits: Vec<(Time, StreamEditOp<T>)>) -> Stream<T> {
        let mut ordered = edits;
        ordered.sort_by_key(|(time, _)| *time);
        let pending = Arc::new(Mutex::new(VecDeque::from(ordered)));
        let close_pending = Arc::clone(&pending);
        self.unary_with_close(
            "EditStream",
            DeliveryPolicy::Unlimited,
            move |message: Message<T>, output| {
                let time = message.originating_time();
                let mut pending = pending.lock().expect("edit state poisoned");
                // Flush inserts scheduled before this message.
                while let Some((edit_time, _)) = pending.front() {
                    if *edit_time >= time {
                        break;
                    }
                    let (edit_time, op) = pending.pop_front().expect("peeked");
                    if let StreamEditOp::Insert(value) = op {
                        output.post(value, edit_time).expect("edits are time-ordered");
                    }
                }
                // An edit keyed exactly at this message's time rewrites it.
                if pending.front().is_some_and(|(edit_time, _)| *edit_time == time) {
                    let (edit_time, op) = pending.pop_front().expect("peeked");
                    match op {
                        StreamEditOp::Insert(value) => {
                            output.post(value, edit_time).expect("edits are time-ordered");
                            output.post(message.data, time).expect("in order");
                        }
                        StreamEditOp::Update(value) => {
                            output.post(value, time).expect("in order");
                        }
                        StreamEditOp::Delete => {}
                    }
                } else {
                    output.post(message.data, time).expect("in order");
                }
            },
            move |time, output| {
                // Flush trailing inserts past the final message.
                let mut close_at = time;
                let mut pending = close_pending.lock().expect("edit state poisoned");
                while let Some((edit_time, op)) = pending.pop_front() {
                    if let StreamEditOp::Insert(value) = op {
                        output.post(value, edit_time).expect("edits are time-ordered");
                        close_at = close_at.max(edit_time);
                    }
                }
                output.close(close_at);
            },
        )
    }
}
