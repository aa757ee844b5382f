//! The compositional stream surface over emitters and receivers.

use tempo_time::Time;

use crate::message::Message;
use crate::pipeline::Pipeline;
use crate::streams::{DeliveryPolicy, Emitter, Receiver};

/// A typed stream: an emitter plus the pipeline that owns it.
///
/// Operators ([`Stream::select`], [`Stream::fuse`], ...) build new
/// components subscribed to this stream and return the stream of their
/// output. `Stream` is a cheap-clone handle.
pub struct Stream<T: Clone + Send + 'static> {
    emitter: Emitter<T>,
    pipeline: Pipeline,
}

impl<T: Clone + Send + 'static> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Stream { emitter: self.emitter.clone(), pipeline: self.pipeline.clone() }
    }
}

impl<T: Clone + Send + 'static> Stream<T> {
    /// Wraps an emitter as a composable stream.
    pub fn from_emitter(emitter: Emitter<T>, pipeline: Pipeline) -> Stream<T> {
        Stream { emitter, pipeline }
    }

    /// The underlying emitter.
    pub fn emitter(&self) -> &Emitter<T> {
        &self.emitter
    }

    /// The owning pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Connects this stream to `receiver` under `policy`.
    pub fn pipe_to(&self, receiver: &Receiver<T>, policy: DeliveryPolicy) {
        self.emitter.pipe_to(receiver, policy);
    }

    /// Builds a one-input operator: `on_message` runs for every message
    /// and posts to the returned stream's emitter; the output closes
    /// when the input does.
    pub fn unary<U: Clone + Send + 'static>(
        &self,
        name: &str,
        policy: DeliveryPolicy,
        on_message: impl FnMut(Message<T>, &Emitter<U>) + Send + 'static,
    ) -> Stream<U> {
        self.unary_with_close(name, policy, on_message, |time, output: &Emitter<U>| {
            output.close(time);
        })
    }

    /// Builds a one-input operator with an explicit close handler, which
    /// is responsible for closing the output (possibly after flushing
    /// buffered state).
    pub fn unary_with_close<U: Clone + Send + 'static>(
        &self,
        name: &str,
        policy: DeliveryPolicy,
        mut on_message: impl FnMut(Message<T>, &Emitter<U>) + Send + 'static,
        mut on_close: impl FnMut(Time, &Emitter<U>) + Send + 'static,
    ) -> Stream<U> {
        let output = self.pipeline.create_emitter::<U>(name);
        output.set_cascade_closed();
        let message_output = output.clone();
        let receiver = self
            .pipeline
            .create_receiver::<T>(name, move |message| on_message(message, &message_output));
        let close_output = output.clone();
        receiver.on_closed(move |time| on_close(time, &close_output));
        self.emitter.pipe_to(&receiver, policy);
        Stream { emitter: output, pipeline: self.pipeline.clone() }
    }
}
