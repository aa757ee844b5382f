//! Fusion, sampling, and elementwise operator behavior.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempo::{
    DeliveryPolicy, Generators, Pipeline, RelativeTimeInterval, ReplayDescriptor, Stream,
    StreamEditOp, Time, TimeSpan,
};

fn drain(pipeline: &Pipeline) {
    pipeline.pause_for_quiescence(Duration::from_secs(10)).unwrap();
    pipeline.resume_after_quiescence();
}

fn ticks(value: i64) -> Time {
    Time::from_ticks(value)
}

fn collect<T: Clone + Send + 'static>(stream: &Stream<T>) -> Arc<Mutex<Vec<T>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let receiver = stream
        .pipeline()
        .create_receiver::<T>("collect", move |message| {
            sink.lock().unwrap().push(message.data);
        });
    stream.pipe_to(&receiver, DeliveryPolicy::Unlimited);
    collected
}

#[test]
fn select_filter_aggregate_chain() {
    let pipeline = Pipeline::with_defaults("chain");
    let doubled_evens = Generators::range(&pipeline, "seq", 0..10, TimeSpan::from_ticks(10))
        .filter(|value| value % 2 == 0)
        .select(|value| value * 2)
        .aggregate(0i64, |sum, value| sum + value);
    let collected = collect(&doubled_evens);
    pipeline.run(ReplayDescriptor::live()).unwrap();
    // 0, 4, 8, 12, 16 accumulated.
    assert_eq!(*collected.lock().unwrap(), vec![0, 4, 12, 24, 40]);
    pipeline.shutdown();
}

#[test]
fn join_is_deterministic_despite_delayed_arrival() {
    let pipeline = Pipeline::with_defaults("join");
    let primary = pipeline.create_emitter::<i64>("a");
    let secondary = pipeline.create_emitter::<i64>("b");
    let a = Stream::from_emitter(primary.clone(), pipeline.clone());
    let b = Stream::from_emitter(secondary.clone(), pipeline.clone());
    let joined = collect(&a.join(&b));

    pipeline.start(ReplayDescriptor::live()).unwrap();
    for value in 1..=5i64 {
        primary.post(value, ticks(value * 1_000)).unwrap();
    }
    drain(&pipeline);
    // Nothing can resolve before the matching stream arrives.
    assert!(joined.lock().unwrap().is_empty());

    // The secondary arrives much later, same originating times.
    for value in 1..=5i64 {
        secondary.post(value * 10, ticks(value * 1_000)).unwrap();
    }
    drain(&pipeline);
    pipeline.stop().unwrap();

    assert_eq!(
        *joined.lock().unwrap(),
        vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]
    );
    pipeline.shutdown();
}

#[test]
fn pair_uses_the_latest_known_secondary() {
    let pipeline = Pipeline::with_defaults("pair");
    let primary = pipeline.create_emitter::<i64>("a");
    let secondary = pipeline.create_emitter::<i64>("b");
    let a = Stream::from_emitter(primary.clone(), pipeline.clone());
    let b = Stream::from_emitter(secondary.clone(), pipeline.clone());
    let paired = collect(&a.pair(&b, None));

    pipeline.start(ReplayDescriptor::live()).unwrap();
    // All secondaries arrive before any (delayed) primary is processed.
    for value in 0..5i64 {
        secondary.post(value, ticks(value)).unwrap();
    }
    drain(&pipeline);
    for value in 0..5i64 {
        primary.post(value, ticks(100 + value)).unwrap();
    }
    drain(&pipeline);
    pipeline.stop().unwrap();

    assert_eq!(
        *paired.lock().unwrap(),
        vec![(0, 4), (1, 4), (2, 4), (3, 4), (4, 4)]
    );
    pipeline.shutdown();
}

#[test]
fn pair_with_initial_value_emits_before_any_secondary() {
    let pipeline = Pipeline::with_defaults("pair-initial");
    let primary = pipeline.create_emitter::<i64>("a");
    let secondary = pipeline.create_emitter::<i64>("b");
    let a = Stream::from_emitter(primary.clone(), pipeline.clone());
    let b = Stream::from_emitter(secondary, pipeline.clone());
    let paired = collect(&a.pair(&b, Some(-1)));

    pipeline.start(ReplayDescriptor::live()).unwrap();
    primary.post(7, ticks(10)).unwrap();
    drain(&pipeline);
    pipeline.stop().unwrap();

    assert_eq!(*paired.lock().unwrap(), vec![(7, -1)]);
    pipeline.shutdown();
}

#[test]
fn join_within_matches_the_nearest_in_tolerance() {
    let pipeline = Pipeline::with_defaults("join-within");
    let primary = pipeline.create_emitter::<i64>("a");
    let secondary = pipeline.create_emitter::<i64>("b");
    let a = Stream::from_emitter(primary.clone(), pipeline.clone());
    let b = Stream::from_emitter(secondary.clone(), pipeline.clone());
    let joined = collect(&a.join_within(&b, TimeSpan::from_ticks(5)));

    pipeline.start(ReplayDescriptor::live()).unwrap();
    secondary.post(10, ticks(8)).unwrap();
    secondary.post(20, ticks(14)).unwrap();
    secondary.post(30, ticks(100)).unwrap();
    primary.post(1, ticks(10)).unwrap();
    primary.post(2, ticks(50)).unwrap();
    drain(&pipeline);
    pipeline.stop().unwrap();

    // 10 matches 8 (distance 2 beats 14's distance 4); 50 has nothing
    // within 5 ticks and is dropped.
    assert_eq!(*joined.lock().unwrap(), vec![(1, 10)]);
    pipeline.shutdown();
}

#[test]
fn linear_interpolation_anchors_to_straddling_samples() {
    let pipeline = Pipeline::with_defaults("lerp");
    let primary = pipeline.create_emitter::<i64>("query");
    let secondary = pipeline.create_emitter::<f64>("signal");
    let queries = Stream::from_emitter(primary.clone(), pipeline.clone());
    let signal = Stream::from_emitter(secondary.clone(), pipeline.clone());
    let interpolated = collect(&queries.interpolate(&signal));

    pipeline.start(ReplayDescriptor::live()).unwrap();
    secondary.post(0.0, ticks(0)).unwrap();
    secondary.post(10.0, ticks(100)).unwrap();
    primary.post(0, ticks(50)).unwrap();
    primary.post(0, ticks(75)).unwrap();
    drain(&pipeline);
    pipeline.stop().unwrap();

    let observed = interpolated.lock().unwrap().clone();
    assert_eq!(observed.len(), 2);
    assert!((observed[0] - 5.0).abs() < 1e-9);
    assert!((observed[1] - 7.5).abs() < 1e-9);
    pipeline.shutdown();
}

#[test]
fn chained_joins_flatten_into_tuples() {
    let pipeline = Pipeline::with_defaults("flatten");
    let first = pipeline.create_emitter::<i64>("a");
    let second = pipeline.create_emitter::<i64>("b");
    let third = pipeline.create_emitter::<i64>("c");
    let a = Stream::from_emitter(first.clone(), pipeline.clone());
    let b = Stream::from_emitter(second.clone(), pipeline.clone());
    let c = Stream::from_emitter(third.clone(), pipeline.clone());
    let triples = collect(&a.join(&b).join(&c).flattened());

    pipeline.start(ReplayDescriptor::live()).unwrap();
    for value in 1..=3i64 {
        first.post(value, ticks(value)).unwrap();
        second.post(value * 10, ticks(value)).unwrap();
        third.post(value * 100, ticks(value)).unwrap();
    }
    drain(&pipeline);
    pipeline.stop().unwrap();

    assert_eq!(
        *triples.lock().unwrap(),
        vec![(1, 10, 100), (2, 20, 200), (3, 30, 300)]
    );
    pipeline.shutdown();
}

#[test]
fn sample_emits_nearest_at_each_tick() {
    let pipeline = Pipeline::with_defaults("sample");
    let source = pipeline.create_emitter::<i64>("signal");
    let signal = Stream::from_emitter(source.clone(), pipeline.clone());
    let window = RelativeTimeInterval::within(TimeSpan::from_ticks(5));
    let sampled = collect(&signal.sample(TimeSpan::from_ticks(10), window));

    pipeline.start(ReplayDescriptor::live()).unwrap();
    // Messages at 0, 12, 19, 30: ticks at 0, 10, 20, 30.
    source.post(100, ticks(0)).unwrap();
    source.post(101, ticks(12)).unwrap();
    source.post(102, ticks(19)).unwrap();
    source.post(103, ticks(30)).unwrap();
    drain(&pipeline);
    pipeline.stop().unwrap();

    // Tick 0 -> 100; tick 10 -> 101 (distance 2); tick 20 -> 102
    // (distance 1); tick 30 -> 103.
    assert_eq!(*sampled.lock().unwrap(), vec![100, 101, 102, 103]);
    pipeline.shutdown();
}

#[test]
fn delay_shifts_originating_times() {
    let pipeline = Pipeline::with_defaults("delay");
    let source = pipeline.create_emitter::<i64>("values");
    let stream = Stream::from_emitter(source.clone(), pipeline.clone());
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let delayed = stream.delay(TimeSpan::from_ticks(500));
    let receiver = delayed
        .pipeline()
        .create_receiver::<i64>("sink", move |message| {
            sink.lock().unwrap().push((message.data, message.originating_time()));
        });
    delayed.pipe_to(&receiver, DeliveryPolicy::Unlimited);

    pipeline.start(ReplayDescriptor::live()).unwrap();
    source.post(1, ticks(1_000)).unwrap();
    source.post(2, ticks(2_000)).unwrap();
    drain(&pipeline);
    pipeline.stop().unwrap();

    assert_eq!(
        *observed.lock().unwrap(),
        vec![(1, ticks(1_500)), (2, ticks(2_500))]
    );
    pipeline.shutdown();
}

#[test]
fn edit_rewrites_a_live_stream() {
    let pipeline = Pipeline::with_defaults("edit");
    let source = pipeline.create_emitter::<i64>("values");
    let stream = Stream::from_emitter(source.clone(), pipeline.clone());
    let edited = stream.edit(vec![
        (ticks(50), StreamEditOp::Insert(99)),
        (ticks(200), StreamEditOp::Delete),
        (ticks(300), StreamEditOp::Update(-3)),
        (ticks(1_000), StreamEditOp::Insert(77)),
    ]);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let receiver = edited
        .pipeline()
        .create_receiver::<i64>("sink", move |message| {
            sink.lock().unwrap().push((message.data, message.originating_time().ticks()));
        });
    edited.pipe_to(&receiver, DeliveryPolicy::Unlimited);

    pipeline.start(ReplayDescriptor::live()).unwrap();
    for value in 0..5i64 {
        source.post(value, ticks(value * 100)).unwrap();
    }
    drain(&pipeline);
    pipeline.stop().unwrap();
    drain(&pipeline);

    assert_eq!(
        *observed.lock().unwrap(),
        vec![(0, 0), (99, 50), (1, 100), (-3, 300), (4, 400), (77, 1_000)]
    );
    pipeline.shutdown();
}
