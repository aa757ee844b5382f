//! End-to-end store behavior: round trips, maintenance operations, and
//! crash recovery.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use itertools::Itertools;
use tempfile::TempDir;

use tempo_store::{
    add_stream, copy_store, crop_store, edit_store, repair_store, StoreReader, StoreWriter,
    StoreWriterOptions, StreamEdit,
};
use tempo_time::{Envelope, Time, TimeInterval};

fn write_sample_store(name: &str, path: &Path, counts: &[(u32, i64)]) {
    let mut writer = StoreWriter::create(name, path, StoreWriterOptions::default()).unwrap();
    for &(id, _) in counts {
        writer.create_stream(id, &format!("stream{id}"), "i64").unwrap();
    }
    writer.set_supplemental(counts[0].0, "demo::Calibration", vec![4, 5, 6]).unwrap();
    for &(id, count) in counts {
        for i in 0..count {
            let time = Time::from_ticks(1_000 + i * 100);
            let envelope = Envelope::new(id, i as u64, time, time + tempo_time::TimeSpan::from_ticks(7));
            writer.write_message(&envelope, &i.to_le_bytes()).unwrap();
        }
    }
    writer.close(None).unwrap();
}

fn stream_values(reader: &mut StoreReader, stream_id: u32) -> Vec<i64> {
    reader
        .read_stream_messages(stream_id, TimeInterval::infinite())
        .unwrap()
        .into_iter()
        .map(|(_, payload)| i64::from_le_bytes(payload.try_into().unwrap()))
        .collect()
}

#[test]
fn write_and_read_back() {
    let dir = TempDir::new().unwrap();
    write_sample_store("demo", dir.path(), &[(0, 100), (1, 10)]);

    let mut reader = StoreReader::open("demo", dir.path()).unwrap();
    assert!(reader.is_closed());
    assert!(!reader.is_live());
    assert_eq!(reader.streams().count(), 2);

    let stream = reader.stream("stream0").unwrap();
    assert_eq!(stream.message_count, 100);
    assert_eq!(stream.message_size_cumulative_sum, 800);
    assert_eq!(stream.latency_cumulative_sum, 700);
    assert_eq!(stream.first_message_originating_time, Time::from_ticks(1_000));
    assert_eq!(stream.last_message_originating_time, Time::from_ticks(1_000 + 99 * 100));
    assert!(stream.is_closed);

    assert_eq!(stream_values(&mut reader, 0), (0..100).collect::<Vec<_>>());
    assert_eq!(stream_values(&mut reader, 1), (0..10).collect::<Vec<_>>());
}

#[test]
fn copy_reproduces_streams_and_metadata() {
    let source = TempDir::new().unwrap();
    let destination = TempDir::new().unwrap();
    write_sample_store("src", source.path(), &[(0, 25), (7, 5)]);

    copy_store("src", source.path(), "dst", destination.path()).unwrap();

    let mut original = StoreReader::open("src", source.path()).unwrap();
    let mut copied = StoreReader::open("dst", destination.path()).unwrap();

    for (a, b) in original.streams().zip_eq(copied.streams()) {
        assert_eq!(a, b);
    }
    // Envelope metadata survives bit for bit.
    let original_messages = original.read_stream_messages(0, TimeInterval::infinite()).unwrap();
    let copied_messages = copied.read_stream_messages(0, TimeInterval::infinite()).unwrap();
    assert_eq!(original_messages, copied_messages);
    assert_eq!(
        copied.stream_by_id(0).unwrap().supplemental_bytes,
        vec![4, 5, 6]
    );
}

#[test]
fn crop_retains_only_the_interval() {
    let source = TempDir::new().unwrap();
    let destination = TempDir::new().unwrap();
    write_sample_store("src", source.path(), &[(0, 50)]);

    // Messages sit at 1000, 1100, ... keep [1500, 2500].
    let interval = TimeInterval::closed(Time::from_ticks(1_500), Time::from_ticks(2_500));
    crop_store("src", source.path(), "cropped", destination.path(), interval).unwrap();

    let mut cropped = StoreReader::open("cropped", destination.path()).unwrap();
    let values = stream_values(&mut cropped, 0);
    assert_eq!(values, (5..=15).collect::<Vec<_>>());
    let messages = cropped.read_stream_messages(0, TimeInterval::infinite()).unwrap();
    // Sequence ids are those of the original messages.
    assert_eq!(messages[0].0.sequence_id, 5);
}

#[test]
fn edit_preserves_unedited_envelopes() {
    let source = TempDir::new().unwrap();
    let destination = TempDir::new().unwrap();
    write_sample_store("src", source.path(), &[(0, 10)]);

    let mut original = StoreReader::open("src", source.path()).unwrap();
    let before = original.read_stream_messages(0, TimeInterval::infinite()).unwrap();

    let mut edits = BTreeMap::new();
    edits.insert(
        0,
        vec![
            StreamEdit::Delete { time: Time::from_ticks(1_300) },
            StreamEdit::Update { time: Time::from_ticks(1_500), payload: vec![0xAB] },
            // Before the first and after the last original message.
            StreamEdit::Insert { time: Time::from_ticks(10), payload: vec![0x01] },
            StreamEdit::Insert { time: Time::from_ticks(9_999), payload: vec![0x02] },
        ],
    );
    edit_store("src", source.path(), "edited", destination.path(), &edits).unwrap();

    let mut edited = StoreReader::open("edited", destination.path()).unwrap();
    let after = edited.read_stream_messages(0, TimeInterval::infinite()).unwrap();
    assert_eq!(after.len(), 10 - 1 + 2);

    // Every unedited message keeps originating time, creation time, and
    // sequence id.
    for (envelope, payload) in &before {
        let time = envelope.originating_time;
        if time == Time::from_ticks(1_300) {
            assert!(after.iter().all(|(e, _)| e.originating_time != time));
            continue;
        }
        let (found, found_payload) = after
            .iter()
            .find(|(e, _)| e.originating_time == time)
            .unwrap();
        assert_eq!(found, envelope);
        if time == Time::from_ticks(1_500) {
            assert_eq!(found_payload, &vec![0xAB]);
        } else {
            assert_eq!(found_payload, payload);
        }
    }
    // Inserts landed at their given times, in order.
    assert_eq!(after.first().unwrap().0.originating_time, Time::from_ticks(10));
    assert_eq!(after.last().unwrap().0.originating_time, Time::from_ticks(9_999));
}

#[test]
fn add_stream_extends_a_store() {
    let source = TempDir::new().unwrap();
    let destination = TempDir::new().unwrap();
    write_sample_store("src", source.path(), &[(0, 5)]);

    add_stream(
        "src",
        source.path(),
        "extended",
        destination.path(),
        "annotations",
        "String",
        b"marker",
        Time::from_ticks(1_234),
        Some(("demo::Notes", vec![9])),
    )
    .unwrap();

    let mut extended = StoreReader::open("extended", destination.path()).unwrap();
    assert_eq!(extended.streams().count(), 2);
    let added = extended.stream("annotations").unwrap().clone();
    assert_eq!(added.id, 1);
    assert_eq!(added.supplemental_type_name.as_deref(), Some("demo::Notes"));
    let messages = extended.read_stream_messages(added.id, TimeInterval::infinite()).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1, b"marker");
}

#[test]
fn repair_recovers_an_unclosed_snapshot() {
    let dir = TempDir::new().unwrap();
    let snapshot = TempDir::new().unwrap();

    // Small extents keep the file-level snapshot cheap.
    let options = StoreWriterOptions { extent_size: 1 << 20, ..Default::default() };
    let mut writer = StoreWriter::create("live", dir.path(), options).unwrap();
    writer.create_stream(0, "seq", "i64").unwrap();
    let mut originals = Vec::new();
    for i in 0..20i64 {
        let time = Time::from_ticks(1_000 + i * 10);
        let envelope = Envelope::new(0, i as u64, time, time);
        originals.push(envelope);
        writer.write_message(&envelope, &i.to_le_bytes()).unwrap();
    }
    writer.flush().unwrap();

    // Snapshot every file except the exclusive liveness marker, as an
    // external backup of a crashed writer would.
    for entry in std::fs::read_dir(dir.path()).unwrap().flatten() {
        let file_name = entry.file_name();
        if file_name.to_string_lossy().ends_with(".Live") {
            continue;
        }
        std::fs::copy(entry.path(), snapshot.path().join(&file_name)).unwrap();
    }
    // Recreate the marker: the snapshot is of a store whose writer never
    // closed it.
    std::fs::write(snapshot.path().join("live.Live"), b"").unwrap();

    {
        let reader = StoreReader::open("live", snapshot.path()).unwrap();
        assert!(!reader.is_closed());
    }

    let report = repair_store("live", snapshot.path()).unwrap();
    assert_eq!(report.valid_messages, 20);

    let mut repaired = StoreReader::open("live", snapshot.path()).unwrap();
    assert!(repaired.is_closed());
    assert!(!repaired.is_live());
    let messages = repaired.read_stream_messages(0, TimeInterval::infinite()).unwrap();
    for (envelope, original) in messages.iter().map(|(e, _)| e).zip(originals.iter()).take(3) {
        assert_eq!(envelope.originating_time, original.originating_time);
        assert_eq!(envelope.sequence_id, original.sequence_id);
    }

    writer.close(None).unwrap();
}

#[test]
fn read_while_writing_tails_the_committed_cursor() {
    let dir = TempDir::new().unwrap();
    let mut writer = StoreWriter::create("tail", dir.path(), StoreWriterOptions::default()).unwrap();
    writer.create_stream(0, "seq", "i64").unwrap();
    for i in 0..5i64 {
        let time = Time::from_ticks(i * 10);
        writer.write_message(&Envelope::new(0, i as u64, time, time), &i.to_le_bytes()).unwrap();
    }
    writer.flush().unwrap();

    let mut reader = StoreReader::open("tail", dir.path()).unwrap();
    assert!(reader.is_live());
    assert!(!reader.is_closed());
    assert_eq!(reader.message_count(), 5);

    // EOF on a live store is not terminal: more arrives after a poll.
    let handle = std::thread::spawn(move || {
        assert!(reader.wait_for_messages(5, Duration::from_secs(5)).unwrap());
        reader
    });
    std::thread::sleep(Duration::from_millis(20));
    for i in 5..8i64 {
        let time = Time::from_ticks(i * 10);
        writer.write_message(&Envelope::new(0, i as u64, time, time), &i.to_le_bytes()).unwrap();
    }
    writer.flush().unwrap();
    let mut reader = handle.join().unwrap();
    assert!(reader.message_count() >= 8);

    writer.close(None).unwrap();
    reader.refresh().unwrap();
    assert!(reader.is_closed());
    assert_eq!(stream_values(&mut reader, 0), (0..8).collect::<Vec<_>>());
}

#[test]
fn incrementing_versions_never_overwrite() {
    let dir = TempDir::new().unwrap();
    let options = StoreWriterOptions { incrementing: true, ..Default::default() };

    for round in 0..3i64 {
        let mut writer = StoreWriter::create("versioned", dir.path(), options.clone()).unwrap();
        writer.create_stream(0, "seq", "i64").unwrap();
        let time = Time::from_ticks(100);
        writer.write_message(&Envelope::new(0, 0, time, time), &round.to_le_bytes()).unwrap();
        writer.close(None).unwrap();
    }
    assert!(dir.path().join("versioned.0000").exists());
    assert!(dir.path().join("versioned.0002").exists());

    // Opening by name resolves to the latest version.
    let mut reader = StoreReader::open("versioned", dir.path()).unwrap();
    assert_eq!(stream_values(&mut reader, 0), vec![2]);
}

#[test]
fn second_writer_is_rejected_while_live() {
    let dir = TempDir::new().unwrap();
    let writer = StoreWriter::create("solo", dir.path(), StoreWriterOptions::default()).unwrap();
    let error = StoreWriter::create("solo", dir.path(), StoreWriterOptions::default());
    assert!(matches!(error, Err(tempo_store::StoreError::AlreadyLive(_))));
    drop(writer);
}
