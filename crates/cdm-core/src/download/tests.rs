use super::*;
use crate::bucket::BucketPool;
use crate::checksum::ByteRange;
use crate::chunk::{WriteStatus, SAFETY_MARGIN};
use crate::memory::MemoryReporter;
use crate::storage::testing::MemStorageFactory;
use std::time::{Duration, Instant};

struct Env {
    factory: MemStorageFactory,
    pool: BucketPool,
    memory: MemoryReporter,
    min_chunk_size: u64,
    load_end_first: u64,
    offline: bool,
}

impl Env {
    fn new() -> Self {
        Self {
            factory: MemStorageFactory::default(),
            pool: BucketPool::new(-1),
            memory: MemoryReporter::new(1 << 30),
            min_chunk_size: 1000,
            load_end_first: 0,
            offline: false,
        }
    }

    fn ctx(&self) -> ResumeContext<'_> {
        ResumeContext {
            offline: self.offline,
            min_chunk_size: self.min_chunk_size,
            load_end_first: self.load_end_first,
            server_slots: None,
            buckets: &self.pool,
            server_speed_limit: -1,
            memory: self.memory.clone(),
        }
    }
}

fn download(max_chunks: usize) -> Download {
    Download::new(
        1,
        DownloadOptions {
            url: "http://example.com/files/data.bin".into(),
            destination_dir: "/nonexistent/cdm-test".into(),
            max_chunks,
            speed_limit: -1,
            ..Default::default()
        },
        4,
    )
    .unwrap()
}

fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Write up to `max` pattern bytes at the chunk's position; stops when the chunk is full.
fn feed(chunk: &SharedChunk, max: u64, now: Instant) -> u64 {
    let mut c = lock_chunk(chunk);
    let mut fed = 0;
    while fed < max {
        let pos = c.position();
        let n = (max - fed).min(4096);
        let buf: Vec<u8> = (pos..pos + n).map(pattern).collect();
        match c.write(&buf, now).unwrap() {
            WriteStatus::Accepted(k) => fed += k as u64,
            WriteStatus::Finished => break,
            WriteStatus::WouldBlock => panic!("unexpected suspend"),
        }
    }
    fed
}

fn respond_206(d: &mut Download, chunk: &SharedChunk, total: u64) {
    let info = ResponseInfo {
        status: 206,
        content_range: Some((0, total - 1, Some(total))),
        ..Default::default()
    };
    d.apply_response(chunk, &info).unwrap();
}

fn ranges(d: &Download) -> Vec<(u64, Option<u64>)> {
    d.chunks()
        .iter()
        .map(|c| {
            let c = lock_chunk(c);
            (c.start(), c.end())
        })
        .collect()
}

/// Start `d` and let the starter learn `total`; returns the starter.
fn started(env: &Env, d: &mut Download, total: u64) -> SharedChunk {
    let now = Instant::now();
    d.prepare_run(&env.factory, now).unwrap();
    let first = d.resume_download(&env.ctx()).unwrap();
    assert_eq!(first.len(), 1);
    respond_206(d, &first[0], total);
    first[0].clone()
}

#[test]
fn million_byte_download_splits_into_four_and_completes() {
    let env = Env::new();
    let mut d = download(4);
    let now = Instant::now();
    d.prepare_run(&env.factory, now).unwrap();

    let first = d.resume_download(&env.ctx()).unwrap();
    assert_eq!(first.len(), 1);
    assert!(lock_chunk(&first[0]).is_starter());
    assert_eq!(feed(&first[0], 1000, now), 1000);
    respond_206(&mut d, &first[0], 1_000_000);
    assert_eq!(d.total_size(), 1_000_000);
    assert!(d.resumable());

    let more = d.resume_download(&env.ctx()).unwrap();
    assert_eq!(more.len(), 3);
    assert_eq!(d.active_chunks(), 4);
    assert_eq!(
        ranges(&d),
        vec![
            (0, Some(250_750)),
            (250_751, Some(500_500)),
            (500_501, Some(750_250)),
            (750_251, Some(999_999)),
        ]
    );
    let covered: u64 = d.chunks().iter().map(|c| lock_chunk(c).total().unwrap()).sum();
    assert_eq!(covered, d.total_size());

    let chunks: Vec<SharedChunk> = d.chunks().to_vec();
    for c in &chunks {
        feed(c, u64::MAX, now);
        d.connection_finished(c, &ConnectionOutcome::Completed).unwrap();
    }
    assert_eq!(d.partial_size(), 1_000_000);
    assert!(d.is_transfer_complete());

    let job = d.finish_download();
    assert_eq!(job.total_size, 1_000_000);
    assert_eq!(d.chunks().len(), 1, "complete chunks are merged");
    let data = env.factory.get(&job.temp_path).unwrap().data();
    assert_eq!(data.len(), 1_000_000);
    assert!(data.iter().enumerate().all(|(i, b)| *b == pattern(i as u64)));

    d.finish_succeeded(&job.destination, 0);
    assert_eq!(d.state(), DownloadState::Complete);
    let states: Vec<(DownloadState, DownloadState)> =
        d.take_transitions().into_iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        states,
        vec![
            (DownloadState::Queued, DownloadState::Running),
            (DownloadState::Running, DownloadState::Finishing),
            (DownloadState::Finishing, DownloadState::Complete),
        ]
    );
}

#[test]
fn split_halves_the_remainder() {
    let env = Env::new();
    let mut d = download(2);
    let starter = started(&env, &mut d, 10_000);
    let now = Instant::now();
    feed(&starter, 2_000, now);
    let r = lock_chunk(&starter).remainder().unwrap();

    let more = d.resume_download(&env.ctx()).unwrap();
    assert_eq!(more.len(), 1);
    let front = lock_chunk(&d.chunks()[0]).remainder().unwrap();
    let back = lock_chunk(&d.chunks()[1]).remainder().unwrap();
    assert_eq!(front + back, r);
    assert!(front >= env.min_chunk_size && back >= env.min_chunk_size);
    assert_eq!(lock_chunk(&d.chunks()[1]).start(), 2_000 + r / 2 + 1);
}

#[test]
fn no_split_below_twice_min_chunk_size() {
    let env = Env::new();
    let mut d = download(4);
    started(&env, &mut d, 2_000);
    assert!(d.resume_download(&env.ctx()).unwrap().is_empty());
    assert_eq!(d.chunks().len(), 1);
}

#[test]
fn load_end_first_carves_tail() {
    let mut env = Env::new();
    env.load_end_first = 1_000;
    let mut d = download(2);
    started(&env, &mut d, 10_000);
    let more = d.resume_download(&env.ctx()).unwrap();
    assert_eq!(more.len(), 1);
    assert_eq!(ranges(&d), vec![(0, Some(8_999)), (9_000, Some(9_999))]);
}

#[test]
fn offline_starts_nothing() {
    let mut env = Env::new();
    env.offline = true;
    let mut d = download(4);
    d.prepare_run(&env.factory, Instant::now()).unwrap();
    assert!(d.resume_download(&env.ctx()).unwrap().is_empty());
    assert!(d.chunks().is_empty());
}

#[test]
fn paused_chunks_resume_before_new_splits() {
    let env = Env::new();
    let mut d = download(2);
    let starter = started(&env, &mut d, 100_000);
    let now = Instant::now();
    feed(&starter, 5_000, now);
    d.resume_download(&env.ctx()).unwrap();
    let before: Vec<SharedChunk> = d.chunks().to_vec();
    feed(&before[1], 3_000, now);

    d.pause();
    assert_eq!(d.state(), DownloadState::Paused);
    assert_eq!(d.active_chunks(), 0);
    // Both closes were incomplete and gave up the safety margin.
    assert_eq!(d.partial_size(), 5_000 + 3_000 - 2 * SAFETY_MARGIN);

    d.prepare_run(&env.factory, now).unwrap();
    let resumed = d.resume_download(&env.ctx()).unwrap();
    assert_eq!(resumed.len(), 2);
    assert_eq!(d.chunks().len(), 2, "no new split while paused chunks remain");
    for (old, new) in before.iter().zip(d.chunks()) {
        assert!(!Arc::ptr_eq(old, new), "reopened chunks are fresh clones");
    }
    let storage = env.factory.get(&d.temp_path()).unwrap();
    let opened = storage.with(|s| s.opened_at.clone());
    let back_start = lock_chunk(&d.chunks()[1]).start();
    assert!(opened.ends_with(&[5_000 - SAFETY_MARGIN, back_start + 3_000 - SAFETY_MARGIN]));
}

#[test]
fn lowering_max_chunks_cancels_surplus_but_spares_nearly_done() {
    let env = Env::new();
    let mut d = download(4);
    let starter = started(&env, &mut d, 1_000_000);
    let now = Instant::now();
    feed(&starter, 1_000, now);
    d.resume_download(&env.ctx()).unwrap();
    assert_eq!(d.active_chunks(), 4);

    let last = d.chunks()[3].clone();
    let left = lock_chunk(&last).remainder().unwrap();
    feed(&last, left - 5_000, now);

    assert!(!d.set_max_chunks(3).unwrap());
    assert_eq!(d.active_chunks(), 3);
    assert!(lock_chunk(&last).running());
    assert!(lock_chunk(&d.chunks()[2]).canceled());

    assert!(d.set_max_chunks(4).unwrap(), "raising the cap asks for a resume");
}

#[test]
fn non_resumable_download_keeps_one_chunk() {
    let env = Env::new();
    let mut d = download(4);
    d.prepare_run(&env.factory, Instant::now()).unwrap();
    let first = d.resume_download(&env.ctx()).unwrap();
    let info = ResponseInfo {
        status: 200,
        content_length: Some(1_000_000),
        ..Default::default()
    };
    d.apply_response(&first[0], &info).unwrap();
    assert!(!d.resumable());
    assert_eq!(d.total_size(), 1_000_000);
    assert!(d.resume_download(&env.ctx()).unwrap().is_empty());
}

#[test]
fn unknown_size_completes_when_stream_ends() {
    let env = Env::new();
    let mut d = download(4);
    let now = Instant::now();
    d.prepare_run(&env.factory, now).unwrap();
    let first = d.resume_download(&env.ctx()).unwrap();
    let info = ResponseInfo {
        status: 200,
        ..Default::default()
    };
    d.apply_response(&first[0], &info).unwrap();
    feed(&first[0], 12_345, now);
    assert!(!d.is_transfer_complete());
    d.connection_finished(&first[0], &ConnectionOutcome::Completed).unwrap();
    assert!(d.is_transfer_complete());
    let job = d.finish_download();
    assert_eq!(job.total_size, 12_345);
    assert_eq!(d.total_size(), 12_345);
}

#[test]
fn content_disposition_renames_unless_fixed() {
    let env = Env::new();
    let mut d = download(1);
    d.prepare_run(&env.factory, Instant::now()).unwrap();
    let temp = d.temp_path();
    let first = d.resume_download(&env.ctx()).unwrap();
    let info = ResponseInfo {
        status: 206,
        content_range: Some((0, 99, Some(100))),
        content_disposition: Some("attachment; filename=\"real.iso\"".into()),
        ..Default::default()
    };
    d.apply_response(&first[0], &info).unwrap();
    assert_eq!(d.file_name(), "real.iso");
    assert_eq!(d.temp_path(), temp, "temp file keeps its path");

    let mut fixed = Download::new(
        2,
        DownloadOptions {
            url: "http://example.com/x".into(),
            file_name: Some("mine.bin".into()),
            ..Default::default()
        },
        4,
    )
    .unwrap();
    fixed.suggest_file_name("attachment; filename=other.bin");
    assert_eq!(fixed.file_name(), "mine.bin");
}

#[test]
fn mask_shapes_destination_and_survives_reload() {
    let mut d = Download::new(
        12,
        DownloadOptions {
            url: "http://mirror.example/pool/main/tool.tar.gz".into(),
            destination_dir: "/downloads".into(),
            mask: Some("*site*/*subdirs*/*num*-*name*.*ext*".into()),
            ..Default::default()
        },
        4,
    )
    .unwrap();
    assert_eq!(
        d.destination(),
        std::path::PathBuf::from("/downloads/mirror.example/pool/main/012-tool.tar.gz")
    );
    assert_eq!(
        d.temp_path(),
        std::path::PathBuf::from("/downloads/tool.tar.gz.part"),
        "temp file stays next to the plain name"
    );

    let info = ResponseInfo {
        status: 200,
        content_disposition: Some("attachment; filename=\"tool-1.2.zip\"".into()),
        ..Default::default()
    };
    let env = Env::new();
    d.prepare_run(&env.factory, Instant::now()).unwrap();
    let first = d.resume_download(&env.ctx()).unwrap();
    d.apply_response(&first[0], &info).unwrap();
    assert!(d.destination().ends_with("mirror.example/pool/main/012-tool-1.2.zip"));

    let snap = d.to_snapshot();
    assert_eq!(snap.mask.as_deref(), Some("*site*/*subdirs*/*num*-*name*.*ext*"));
    let reloaded = Download::load(12, snap, 4).unwrap();
    assert_eq!(reloaded.destination(), d.destination());
}

#[test]
fn blank_mask_falls_back_to_file_name() {
    let d = Download::new(
        3,
        DownloadOptions {
            url: "http://example.com/a.iso".into(),
            destination_dir: "/downloads".into(),
            mask: Some("  ".into()),
            ..Default::default()
        },
        4,
    )
    .unwrap();
    assert!(d.mask().is_none());
    assert_eq!(d.destination(), std::path::PathBuf::from("/downloads/a.iso"));
}

#[test]
fn set_total_size_rejects_shrinking_below_received() {
    let env = Env::new();
    let mut d = download(1);
    let starter = started(&env, &mut d, 10_000);
    feed(&starter, 5_000, Instant::now());
    d.refresh_partial_size();
    assert!(matches!(
        d.set_total_size(4_000),
        Err(DownloadError::InvalidSize { .. })
    ));
    d.set_total_size(20_000).unwrap();
    let storage = env.factory.get(&d.temp_path()).unwrap();
    assert_eq!(storage.with(|s| s.preallocated), 20_000);
}

#[test]
fn speed_limit_applies_to_running_bucket() {
    let env = Env::new();
    let mut d = download(1);
    d.prepare_run(&env.factory, Instant::now()).unwrap();
    assert_eq!(d.bucket().unwrap().byte_rate(), -1);
    d.set_speed_limit(4096);
    assert_eq!(d.bucket().unwrap().byte_rate(), 4096);
    d.set_speed_limit(0);
    assert_eq!(d.speed_limit(), -1);
    d.pause();
    assert!(d.bucket().is_none(), "bucket is discarded when leaving running");
}

#[test]
fn pause_and_retry_arms_auto_retry_until_limit() {
    let env = Env::new();
    let mut d = download(1);
    let now = Instant::now();
    let retry = AutoRetry {
        interval: Duration::from_secs(60),
        max_retries: 1,
    };
    d.prepare_run(&env.factory, now).unwrap();
    d.pause_and_retry(now, retry);
    assert!(d.is_auto_retrying());
    assert!(!d.auto_retry(now + Duration::from_secs(30)));
    assert!(d.auto_retry(now + Duration::from_secs(60)));
    assert_eq!(d.state(), DownloadState::Queued);
    assert_eq!(d.auto_retries(), 1);

    d.prepare_run(&env.factory, now).unwrap();
    d.pause_and_retry(now, retry);
    assert_eq!(d.state(), DownloadState::Paused);
    assert!(!d.is_auto_retrying(), "limit reached");
}

#[test]
fn safe_retry_discards_progress() {
    let env = Env::new();
    let mut d = download(1);
    let starter = started(&env, &mut d, 10_000);
    feed(&starter, 5_000, Instant::now());
    d.fail(Failure::new(FailureKind::Network, "reset"));
    assert_eq!(d.state(), DownloadState::Canceled);
    assert_eq!(d.failure().unwrap().kind, FailureKind::Network);
    d.safe_retry();
    assert_eq!(d.state(), DownloadState::Queued);
    assert!(d.chunks().is_empty());
    assert_eq!(d.partial_size(), 0);
    assert!(d.failure().is_none());
}

#[test]
fn recover_partials_refetches_only_bad_ranges() {
    let env = Env::new();
    let mut d = download(2);
    let starter = started(&env, &mut d, 1_000);
    let now = Instant::now();
    feed(&starter, 1_000, now);
    d.connection_finished(&starter, &ConnectionOutcome::Completed).unwrap();
    d.finish_download();

    d.recover_partials(&[ByteRange { start: 300, end: 399 }, ByteRange { start: 900, end: 999 }])
        .unwrap();
    assert_eq!(d.state(), DownloadState::Queued);
    assert_eq!(
        ranges(&d),
        vec![
            (0, Some(299)),
            (300, Some(399)),
            (400, Some(899)),
            (900, Some(999))
        ]
    );
    assert_eq!(d.partial_size(), 800);

    d.prepare_run(&env.factory, now).unwrap();
    let reopened = d.resume_download(&env.ctx()).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(lock_chunk(&reopened[0]).start(), 300);
    assert_eq!(lock_chunk(&reopened[1]).start(), 900);
}

#[test]
fn snapshot_saves_running_as_queued_with_durable_marks() {
    let env = Env::new();
    let mut d = download(2);
    let starter = started(&env, &mut d, 100_000);
    feed(&starter, 7_000, Instant::now());
    d.resume_download(&env.ctx()).unwrap();

    let snap = d.to_snapshot();
    assert_eq!(snap.state, DownloadState::Queued);
    assert_eq!(snap.total_size, 100_000);
    assert_eq!(snap.chunks.len(), 2);
    assert_eq!(snap.chunks[0].written, lock_chunk(&d.chunks()[0]).safe_bytes());

    let json = serde_json::to_string(&snap).unwrap();
    let back: DownloadSnapshot = serde_json::from_str(&json).unwrap();
    let loaded = Download::load(9, back, 4).unwrap();
    assert_eq!(loaded.state(), DownloadState::Queued);
    assert_eq!(loaded.partial_size(), 7_000);
    assert_eq!(ranges(&loaded), ranges(&d));
}

#[test]
fn snapshot_of_non_resumable_drops_progress() {
    let env = Env::new();
    let mut d = download(1);
    d.prepare_run(&env.factory, Instant::now()).unwrap();
    let first = d.resume_download(&env.ctx()).unwrap();
    let info = ResponseInfo {
        status: 200,
        content_length: Some(500),
        ..Default::default()
    };
    d.apply_response(&first[0], &info).unwrap();
    d.pause();
    let snap = d.to_snapshot();
    assert_eq!(snap.state, DownloadState::Paused);
    assert_eq!(snap.total_size, 0);
    assert!(snap.chunks.is_empty());
}

#[test]
fn load_complete_and_finishing_records() {
    let complete = DownloadSnapshot {
        url: "http://example.com/a".into(),
        state: DownloadState::Complete,
        total_size: 42,
        ..Default::default()
    };
    let d = Download::load(1, complete, 4).unwrap();
    assert_eq!(d.partial_size(), 42);

    let finishing = DownloadSnapshot {
        url: "http://example.com/a".into(),
        state: DownloadState::Finishing,
        total_size: 100,
        chunks: vec![ChunkSnapshot {
            start: 0,
            end: Some(99),
            written: 100,
        }],
        ..Default::default()
    };
    let d = Download::load(2, finishing, 4).unwrap();
    assert_eq!(d.state(), DownloadState::Queued);
    assert!(d.is_transfer_complete());
}

#[test]
fn load_rejects_gapped_chunks() {
    let snap = DownloadSnapshot {
        url: "http://example.com/a".into(),
        total_size: 100,
        chunks: vec![
            ChunkSnapshot {
                start: 0,
                end: Some(49),
                written: 10,
            },
            ChunkSnapshot {
                start: 60,
                end: Some(99),
                written: 0,
            },
        ],
        ..Default::default()
    };
    let d = Download::load(1, snap, 4).unwrap();
    assert!(d.chunks().is_empty());
    assert_eq!(d.partial_size(), 0);
}

#[test]
fn snapshot_defaults_fill_missing_fields() {
    let snap: DownloadSnapshot = serde_json::from_str(r#"{"url":"http://example.com/a"}"#).unwrap();
    assert_eq!(snap.speed_limit, -1);
    assert!(snap.resumable);
    assert_eq!(snap.state, DownloadState::Queued);
}

#[test]
fn response_headers_parse_last_block() {
    let info = ResponseInfo::from_header_lines([
        "HTTP/1.1 301 Moved Permanently\r\n",
        "Location: /b\r\n",
        "HTTP/1.1 206 Partial Content\r\n",
        "Content-Range: bytes 100-199/1000\r\n",
        "Content-Length: 100\r\n",
        "Accept-Ranges: bytes\r\n",
        "Content-Encoding: gzip\r\n",
    ]);
    assert_eq!(info.status, 206);
    assert_eq!(info.content_range, Some((100, 199, Some(1000))));
    assert_eq!(info.content_length, Some(100));
    assert!(info.accept_ranges);
    assert_eq!(info.content_encoding.as_deref(), Some("gzip"));
    assert!(info.validate(100).is_ok());
    assert!(info.validate(0).is_err());
}

#[test]
fn validate_rules() {
    let ok200 = ResponseInfo {
        status: 200,
        ..Default::default()
    };
    assert!(ok200.validate(0).is_ok());
    assert!(matches!(
        ok200.validate(10),
        Err(crate::retry::ConnectionError::RangeRejected)
    ));
    let nf = ResponseInfo {
        status: 404,
        ..Default::default()
    };
    assert!(matches!(
        nf.validate(0),
        Err(crate::retry::ConnectionError::Http(404))
    ));
    assert_eq!(
        response::parse_content_range("bytes 0-9/*"),
        Some((0, 9, None))
    );
    assert_eq!(response::parse_content_range("bytes 9-0/10"), None);
}
