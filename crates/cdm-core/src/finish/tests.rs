use super::*;
use crate::checksum::PieceHashes;
use sha2::{Digest, Sha256};
use std::io::Write;

fn job(dir: &Path, data: &[u8]) -> FinishJob {
    let temp_path = dir.join("file.bin.part");
    std::fs::write(&temp_path, data).unwrap();
    FinishJob {
        id: 1,
        temp_path,
        destination: dir.join("out").join("file.bin"),
        total_size: data.len() as u64,
        hash: None,
        compression: None,
        conflicts: 0,
    }
}

fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[test]
fn moves_temp_file_into_place() {
    let dir = tempfile::tempdir().unwrap();
    let j = job(dir.path(), b"payload");
    let done = FileFinisher::default().finish(&j).unwrap();
    assert_eq!(done.path, dir.path().join("out/file.bin"));
    assert_eq!(std::fs::read(&done.path).unwrap(), b"payload");
    assert!(!j.temp_path.exists());
}

#[test]
fn existing_destination_gets_numbered_name() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("out")).unwrap();
    std::fs::write(dir.path().join("out/file.bin"), b"old").unwrap();
    std::fs::write(dir.path().join("out/file (1).bin"), b"old").unwrap();
    let j = job(dir.path(), b"new");
    let done = FileFinisher::default().finish(&j).unwrap();
    assert_eq!(done.path, dir.path().join("out/file (2).bin"));
    assert_eq!(done.conflicts, 2);
    assert_eq!(std::fs::read(dir.path().join("out/file.bin")).unwrap(), b"old");
}

#[test]
fn trims_preallocated_tail() {
    let dir = tempfile::tempdir().unwrap();
    let mut j = job(dir.path(), b"abcdefgh");
    j.total_size = 4;
    let done = FileFinisher::default().finish(&j).unwrap();
    assert_eq!(std::fs::read(&done.path).unwrap(), b"abcd");
}

#[test]
fn checksum_match_and_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut j = job(dir.path(), b"hello");
    j.hash = Some(HashSpec::sha256(digest(b"hello")));
    assert!(FileFinisher::default().finish(&j).is_ok());

    let mut j = job(dir.path(), b"hellx");
    j.destination = dir.path().join("other.bin");
    j.hash = Some(HashSpec::sha256(digest(b"hello")));
    match FileFinisher::default().finish(&j) {
        Err(FinishError::Verification { mismatches }) => assert!(mismatches.is_empty()),
        other => panic!("expected verification failure, got {other:?}"),
    }
    assert!(j.temp_path.exists(), "temp file stays for recovery");
}

#[test]
fn piece_hashes_locate_bad_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let good = vec![7u8; 40];
    let mut bad = good.clone();
    bad[15] = 0;
    let mut j = job(dir.path(), &bad);
    j.hash = Some(HashSpec {
        sha256: Some(digest(&good)),
        pieces: Some(PieceHashes {
            piece_size: 10,
            sha256: good.chunks(10).map(digest).collect(),
        }),
    });
    match FileFinisher::default().finish(&j) {
        Err(FinishError::Verification { mismatches }) => {
            assert_eq!(mismatches, vec![ByteRange { start: 10, end: 19 }])
        }
        other => panic!("expected verification failure, got {other:?}"),
    }
}

#[test]
fn keep_moves_despite_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut j = job(dir.path(), b"hellx");
    j.hash = Some(HashSpec::sha256(digest(b"hello")));
    let done = FileFinisher::new(VerifyErrorAction::Keep).finish(&j).unwrap();
    assert_eq!(std::fs::read(done.path).unwrap(), b"hellx");
}

#[test]
fn gzip_body_is_decompressed() {
    let dir = tempfile::tempdir().unwrap();
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(b"compressed text").unwrap();
    let gz = enc.finish().unwrap();
    let mut j = job(dir.path(), &gz);
    j.compression = Some(Compression::Gzip);
    let done = FileFinisher::default().finish(&j).unwrap();
    assert_eq!(std::fs::read(&done.path).unwrap(), b"compressed text");
    assert!(!j.temp_path.exists());
}

#[test]
fn raw_deflate_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(b"raw deflate").unwrap();
    let body = enc.finish().unwrap();
    let mut j = job(dir.path(), &body);
    j.compression = Some(Compression::Deflate);
    let done = FileFinisher::default().finish(&j).unwrap();
    assert_eq!(std::fs::read(&done.path).unwrap(), b"raw deflate");
}

#[test]
fn conflict_name_keeps_extension() {
    assert_eq!(
        conflict_name(Path::new("/d/a.iso"), 3),
        PathBuf::from("/d/a (3).iso")
    );
    assert_eq!(conflict_name(Path::new("/d/README"), 1), PathBuf::from("/d/README (1)"));
}
