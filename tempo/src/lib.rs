//! A deterministic, time-aware stream-processing runtime.
//!
//! Authors compose directed graphs of components exchanging timestamped
//! messages over typed [`Emitter`]/[`Receiver`] endpoints; the runtime
//! guarantees per-receiver delivery in non-decreasing originating-time
//! order, starts every source before any message flows, and replays
//! recorded streams deterministically — optionally pinned to the wall
//! clock at a chosen speed.
//!
//! # Examples
//!
//! Sum a generated sequence:
//!
//! ```
//! use tempo::{Generators, Pipeline, ReplayDescriptor};
//! use tempo_time::TimeSpan;
//! use std::sync::{Arc, Mutex};
//!
//! let pipeline = Pipeline::with_defaults("example");
//! let total = Arc::new(Mutex::new(0i64));
//! let seen = Arc::clone(&total);
//! Generators::range(&pipeline, "seq", 1..11, TimeSpan::from_millis(1))
//!     .aggregate(0i64, |sum, value| sum + value)
//!     .inspect(move |message| *seen.lock().unwrap() = message.data);
//! pipeline.run(ReplayDescriptor::live()).unwrap();
//! assert_eq!(*total.lock().unwrap(), 55);
//! pipeline.shutdown();
//! ```

pub mod error;
pub mod exporter;
pub mod generators;
pub mod importer;
pub mod interpolators;
pub mod message;
pub mod operators;
pub mod pipeline;
pub mod scheduling;
pub mod stream;
pub mod streams;

pub use error::{Error, PipelineError};
pub use exporter::Exporter;
pub use generators::Generators;
pub use importer::Importer;
pub use interpolators::{Fidelity, InterpolationResult, Interpolator, Lerp, OnMissing};
pub use message::Message;
pub use operators::StreamEditOp;
pub use pipeline::{
    CompletionNotifier, Pipeline, PipelineConfig, PipelineState, ReplayDescriptor, RunHandle,
    SourceComponent,
};
pub use scheduling::{Scheduler, SchedulerContext};
pub use stream::Stream;
pub use streams::{DeliveryPolicy, Emitter, Receiver};

// The time model and the shared resource pools are part of the public
// surface.
pub use tempo_pool::{KeyedSharedPool, Shared, SharedPool};
pub use tempo_time::{
    Clock, Envelope, IntervalEndpoint, RelativeTimeInterval, TickCalibration, Time, TimeInterval,
    TimeSpan,
};
