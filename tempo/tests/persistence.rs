//! Persisting pipeline streams and replaying them.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use tempo::{
    DeliveryPolicy, Exporter, Generators, Importer, Pipeline, ReplayDescriptor, Time, TimeSpan,
};

#[test]
fn persist_and_replay_sum() {
    let dir = TempDir::new().unwrap();

    // Record 1..=100 into stream "seq".
    {
        let pipeline = Pipeline::with_defaults("record");
        let exporter = Exporter::create(&pipeline, "numbers", dir.path()).unwrap();
        let stream = Generators::range(&pipeline, "seq", 1..101, TimeSpan::from_ticks(10));
        exporter.write(&stream, "seq").unwrap();
        pipeline.run(ReplayDescriptor::live()).unwrap();
        pipeline.shutdown();
    }

    // Replay and sum.
    let total = Arc::new(Mutex::new(0i64));
    {
        let pipeline = Pipeline::with_defaults("replay");
        let importer = Importer::open(&pipeline, "numbers", dir.path()).unwrap();
        assert_eq!(importer.stream_names(), vec![String::from("seq")]);
        let sum = Arc::clone(&total);
        importer
            .stream::<i64>("seq")
            .unwrap()
            .inspect(move |message| *sum.lock().unwrap() += message.data);
        let descriptor = importer.replay_descriptor().best_effort();
        pipeline.run(descriptor).unwrap();
        pipeline.shutdown();
    }
    assert_eq!(*total.lock().unwrap(), 5050);
}

#[test]
fn replayed_envelopes_preserve_originating_times() {
    let dir = TempDir::new().unwrap();
    {
        let pipeline = Pipeline::with_defaults("record");
        let exporter = Exporter::create(&pipeline, "env", dir.path()).unwrap();
        let stream = Generators::range(&pipeline, "seq", 0..20, TimeSpan::from_ticks(100));
        exporter.write(&stream, "seq").unwrap();
        pipeline.run(ReplayDescriptor::live()).unwrap();
        pipeline.shutdown();
    }

    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let pipeline = Pipeline::with_defaults("replay");
        let importer = Importer::open(&pipeline, "env", dir.path()).unwrap();
        let times = Arc::clone(&observed);
        importer
            .stream::<i64>("seq")
            .unwrap()
            .inspect(move |message| {
                times.lock().unwrap().push((message.data, message.originating_time()))
            });
        pipeline.run(importer.replay_descriptor().best_effort()).unwrap();
        pipeline.shutdown();
    }

    let observed = observed.lock().unwrap().clone();
    assert_eq!(observed.len(), 20);
    // Spacing between recorded messages survives the round trip.
    for pair in observed.windows(2) {
        assert_eq!((pair[1].1 - pair[0].1), TimeSpan::from_ticks(100));
    }
    assert_eq!(observed.iter().map(|(v, _)| *v).collect::<Vec<_>>(), (0..20).collect::<Vec<_>>());
}

#[test]
fn wrong_payload_type_is_rejected_on_replay() {
    let dir = TempDir::new().unwrap();
    {
        let pipeline = Pipeline::with_defaults("record");
        let exporter = Exporter::create(&pipeline, "typed", dir.path()).unwrap();
        let stream = Generators::range(&pipeline, "seq", 0..3, TimeSpan::from_ticks(1));
        exporter.write(&stream, "seq").unwrap();
        pipeline.run(ReplayDescriptor::live()).unwrap();
        pipeline.shutdown();
    }
    let pipeline = Pipeline::with_defaults("replay");
    let importer = Importer::open(&pipeline, "typed", dir.path()).unwrap();
    assert!(importer.stream::<String>("seq").is_err());
    pipeline.shutdown();
}

#[test]
fn replay_clock_enforcement_paces_delivery() {
    let dir = TempDir::new().unwrap();
    let spacing = TimeSpan::from_millis(10);
    {
        let pipeline = Pipeline::with_defaults("record");
        let exporter = Exporter::create(&pipeline, "paced", dir.path()).unwrap();
        let stream = Generators::range(&pipeline, "seq", 1..11, spacing);
        exporter.write(&stream, "seq").unwrap();
        // Recording runs without enforcement, so it is fast.
        pipeline.run(ReplayDescriptor::live()).unwrap();
        pipeline.shutdown();
    }

    let arrivals = Arc::new(Mutex::new(Vec::new()));
    {
        let pipeline = Pipeline::with_defaults("replay");
        let importer = Importer::open(&pipeline, "paced", dir.path()).unwrap();
        let times = Arc::clone(&arrivals);
        importer
            .stream::<i64>("seq")
            .unwrap()
            .inspect(move |_| times.lock().unwrap().push(Instant::now()));
        let descriptor = importer.replay_descriptor();
        assert!(descriptor.enforce_replay_clock);
        let started = Instant::now();
        pipeline.run(descriptor).unwrap();
        // Ten messages spaced 10 ms: the run cannot beat the virtual
        // span.
        assert!(started.elapsed() >= Duration::from_millis(80));
        pipeline.shutdown();
    }

    let arrivals = arrivals.lock().unwrap().clone();
    assert_eq!(arrivals.len(), 10);
    for pair in arrivals.windows(2) {
        // Real deltas dominate virtual deltas (minus scheduler jitter).
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(7));
    }
}

#[test]
fn exported_stores_carry_supplemental_metadata() {
    let dir = TempDir::new().unwrap();
    {
        let pipeline = Pipeline::with_defaults("record");
        let exporter = Exporter::create(&pipeline, "annotated", dir.path()).unwrap();
        let stream = Generators::range(&pipeline, "seq", 0..5, TimeSpan::from_ticks(1));
        exporter.write(&stream, "seq").unwrap();
        exporter.set_supplemental("seq", &String::from("calibration v2")).unwrap();
        pipeline.run(ReplayDescriptor::live()).unwrap();
        pipeline.shutdown();
    }

    let reader = tempo_store::StoreReader::open("annotated", dir.path()).unwrap();
    assert!(reader.is_closed());
    let metadata = reader.stream("seq").unwrap();
    assert_eq!(metadata.message_count, 5);
    assert_eq!(metadata.type_name, "i64");
    let supplemental: String = tempo_serialization::Serializer::new()
        .deserialize(&metadata.supplemental_bytes)
        .unwrap();
    assert_eq!(supplemental, "calibration v2");
}

#[test]
fn lossy_export_policy_is_an_explicit_choice() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::with_defaults("record");
    let exporter = Exporter::create(&pipeline, "lossy", dir.path()).unwrap();
    let stream = Generators::range(&pipeline, "seq", 0..100, TimeSpan::from_ticks(1));
    // The caller explicitly opts out of the lossless default.
    exporter
        .write_with_policy(&stream, "seq", DeliveryPolicy::Unlimited)
        .unwrap();
    pipeline.run(ReplayDescriptor::live()).unwrap();
    pipeline.shutdown();

    let reader = tempo_store::StoreReader::open("lossy", dir.path()).unwrap();
    assert_eq!(reader.stream("seq").unwrap().message_count, 100);
    let range = reader.originating_time_range().unwrap();
    assert!(range.0 <= range.1);
    assert_ne!(range.0, Time::MIN);
}
