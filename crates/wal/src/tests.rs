use super::*;
use pretty_assertions::assert_eq;
use std::fs;
use storage::MemStorage;
use tempfile::tempdir;

const PAGE_SIZE: u32 = 512;

fn page(fill: u8) -> Vec<u8> {
    vec![fill; PAGE_SIZE as usize]
}

fn wal_in(dir: &tempfile::TempDir) -> (Wal, std::path::PathBuf) {
    let path = dir.path().join("main.tusk-wal");
    let wal = Wal::open(&path, PAGE_SIZE).unwrap();
    (wal, path)
}

#[test]
fn open_creates_a_header_only_file() {
    let dir = tempdir().unwrap();
    let (wal, path) = wal_in(&dir);
    assert_eq!(wal.frame_count(), 0);
    assert_eq!(wal.checkpoint_seq(), 1);
    assert_eq!(fs::metadata(&path).unwrap().len(), WAL_HEADER_SIZE as u64);
}

#[test]
fn checksum_matches_the_reference_recurrence() {
    // One block (x0, x1) = (1, 2) from seed (0, 0):
    //   s0 = 0 + 1 + 0 = 1
    //   s1 = 0 + 2 + 1 = 3
    let mut data = Vec::new();
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&2u32.to_le_bytes());
    assert_eq!(checksum((0, 0), &data), (1, 3));

    // A second identical block continues the chain:
    //   s0 = 1 + 1 + 3 = 5
    //   s1 = 3 + 2 + 5 = 10
    assert_eq!(checksum((1, 3), &data), (5, 10));
}

#[test]
fn checksum_padding_is_zeros() {
    let padded = checksum((7, 9), &[0xab]);
    let explicit = checksum((7, 9), &[0xab, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(padded, explicit);
}

#[test]
fn frames_roundtrip_within_a_session() {
    let dir = tempdir().unwrap();
    let (wal, _path) = wal_in(&dir);

    assert_eq!(wal.write_frame(2, &page(0xaa), 0).unwrap(), 1);
    assert_eq!(wal.write_frame(3, &page(0xbb), 3).unwrap(), 2);

    let frame = wal.read_frame(1).unwrap();
    assert_eq!(frame.page_no, 2);
    assert!(!frame.is_commit());
    assert_eq!(frame.data, page(0xaa));

    let frame = wal.read_frame(2).unwrap();
    assert_eq!(frame.db_size_after_commit, 3);
    assert!(frame.is_commit());
}

#[test]
fn read_frame_rejects_out_of_range() {
    let dir = tempdir().unwrap();
    let (wal, _path) = wal_in(&dir);
    assert!(matches!(
        wal.read_frame(1).unwrap_err(),
        DbError::FrameNotFound(1)
    ));
    wal.write_frame(1, &page(1), 0).unwrap();
    assert!(matches!(
        wal.read_frame(2).unwrap_err(),
        DbError::FrameNotFound(2)
    ));
    assert!(matches!(
        wal.read_frame(0).unwrap_err(),
        DbError::FrameNotFound(0)
    ));
}

#[test]
fn write_frame_rejects_bad_input() {
    let dir = tempdir().unwrap();
    let (wal, _path) = wal_in(&dir);
    assert!(wal.write_frame(1, &[0u8; 100], 0).is_err());
    assert!(wal.write_frame(0, &page(0), 0).is_err());
}

#[test]
fn find_page_returns_the_newest_frame() {
    let dir = tempdir().unwrap();
    let (wal, _path) = wal_in(&dir);

    wal.write_frame(2, &page(1), 0).unwrap();
    wal.write_frame(3, &page(2), 0).unwrap();
    wal.write_frame(2, &page(3), 0).unwrap();

    assert_eq!(wal.find_page(2).unwrap(), 3);
    assert_eq!(wal.find_page(3).unwrap(), 2);
    assert!(matches!(
        wal.find_page(9).unwrap_err(),
        DbError::PageNotFound(_)
    ));
}

#[test]
fn valid_frames_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.tusk-wal");

    {
        let wal = Wal::open(&path, PAGE_SIZE).unwrap();
        wal.write_frame(1, &page(1), 0).unwrap();
        wal.write_frame(2, &page(2), 2).unwrap();
        wal.write_frame(3, &page(3), 0).unwrap();
    }

    let wal = Wal::open(&path, PAGE_SIZE).unwrap();
    assert_eq!(wal.frame_count(), 3);
    assert_eq!(wal.read_frame(3).unwrap().page_no, 3);
}

#[test]
fn bit_flip_invalidates_the_tail() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.tusk-wal");

    {
        let wal = Wal::open(&path, PAGE_SIZE).unwrap();
        for i in 1..=3 {
            wal.write_frame(i, &page(i as u8), 0).unwrap();
        }
        wal.sync().unwrap();
    }

    // Flip one bit in the second frame's page data.
    let mut bytes = fs::read(&path).unwrap();
    let frame_size = FRAME_HEADER_SIZE + PAGE_SIZE as usize;
    let offset = WAL_HEADER_SIZE + frame_size + FRAME_HEADER_SIZE + 17;
    bytes[offset] ^= 0x01;
    fs::write(&path, &bytes).unwrap();

    // The scan stops at the damaged frame; the intact frame 3 behind it
    // is unreachable because the chain is broken.
    let wal = Wal::open(&path, PAGE_SIZE).unwrap();
    assert_eq!(wal.frame_count(), 1);
    assert_eq!(wal.read_frame(1).unwrap().page_no, 1);
}

#[test]
fn torn_trailing_write_is_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.tusk-wal");

    {
        let wal = Wal::open(&path, PAGE_SIZE).unwrap();
        wal.write_frame(1, &page(1), 1).unwrap();
    }

    // Simulate a torn append: half a frame of garbage at the end.
    let mut bytes = fs::read(&path).unwrap();
    bytes.extend_from_slice(&vec![0xeeu8; 100]);
    fs::write(&path, &bytes).unwrap();

    let wal = Wal::open(&path, PAGE_SIZE).unwrap();
    assert_eq!(wal.frame_count(), 1);
}

#[test]
fn foreign_or_corrupt_header_starts_fresh() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.tusk-wal");

    fs::write(&path, vec![0x42u8; 200]).unwrap();
    let wal = Wal::open(&path, PAGE_SIZE).unwrap();
    assert_eq!(wal.frame_count(), 0);
    assert_eq!(wal.checkpoint_seq(), 1);
    assert_eq!(fs::metadata(&path).unwrap().len(), WAL_HEADER_SIZE as u64);
}

#[test]
fn page_size_mismatch_starts_fresh() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.tusk-wal");

    {
        let wal = Wal::open(&path, PAGE_SIZE).unwrap();
        wal.write_frame(1, &page(9), 1).unwrap();
    }

    let wal = Wal::open(&path, PAGE_SIZE * 2).unwrap();
    assert_eq!(wal.frame_count(), 0);
}

#[test]
fn checkpoint_applies_latest_images_and_resets() {
    let dir = tempdir().unwrap();
    let (wal, path) = wal_in(&dir);
    let seq_before = wal.checkpoint_seq();

    wal.write_frame(1, &page(0x11), 0).unwrap();
    wal.write_frame(2, &page(0x22), 0).unwrap();
    wal.write_frame(1, &page(0x33), 2).unwrap(); // overwrites page 1

    let mut main = MemStorage::new(2 * PAGE_SIZE as u64);
    let applied = wal.checkpoint(&mut main).unwrap();
    assert_eq!(applied, 2);

    assert_eq!(
        main.slice(0, PAGE_SIZE as usize).unwrap(),
        page(0x33).as_slice()
    );
    assert_eq!(
        main.slice(PAGE_SIZE as u64, PAGE_SIZE as usize).unwrap(),
        page(0x22).as_slice()
    );

    assert_eq!(wal.frame_count(), 0);
    assert_eq!(wal.checkpoint_seq(), seq_before + 1);
    assert_eq!(fs::metadata(&path).unwrap().len(), WAL_HEADER_SIZE as u64);
}

#[test]
fn log_accepts_frames_after_checkpoint() {
    let dir = tempdir().unwrap();
    let (wal, _path) = wal_in(&dir);

    wal.write_frame(1, &page(1), 1).unwrap();
    let mut main = MemStorage::new(PAGE_SIZE as u64);
    wal.checkpoint(&mut main).unwrap();

    wal.write_frame(1, &page(2), 1).unwrap();
    assert_eq!(wal.frame_count(), 1);
    assert_eq!(wal.read_frame(1).unwrap().data, page(2));
}

#[test]
fn recover_replays_up_to_the_last_commit() {
    let dir = tempdir().unwrap();
    let (wal, _path) = wal_in(&dir);

    wal.write_frame(1, &page(0x01), 0).unwrap();
    wal.write_frame(2, &page(0x02), 2).unwrap(); // commit
    wal.write_frame(1, &page(0x99), 0).unwrap(); // uncommitted tail

    let mut main = MemStorage::new(2 * PAGE_SIZE as u64);
    let db_size = wal.recover(&mut main).unwrap();
    assert_eq!(db_size, 2);

    // The committed images landed; the uncommitted overwrite did not.
    assert_eq!(
        main.slice(0, PAGE_SIZE as usize).unwrap(),
        page(0x01).as_slice()
    );
    assert_eq!(
        main.slice(PAGE_SIZE as u64, PAGE_SIZE as usize).unwrap(),
        page(0x02).as_slice()
    );
    assert_eq!(wal.frame_count(), 0);
}

#[test]
fn recover_without_a_commit_frame_does_nothing() {
    let dir = tempdir().unwrap();
    let (wal, _path) = wal_in(&dir);

    wal.write_frame(1, &page(1), 0).unwrap();
    wal.write_frame(2, &page(2), 0).unwrap();

    let mut main = MemStorage::new(2 * PAGE_SIZE as u64);
    assert_eq!(wal.recover(&mut main).unwrap(), 0);
    // Nothing applied, nothing reset.
    assert_eq!(main.slice(0, 4).unwrap(), &[0, 0, 0, 0]);
    assert_eq!(wal.frame_count(), 2);
}

#[test]
fn recover_grows_a_short_main_file() {
    let dir = tempdir().unwrap();
    let (wal, _path) = wal_in(&dir);

    wal.write_frame(4, &page(0x44), 4).unwrap();

    let mut main = MemStorage::new(PAGE_SIZE as u64);
    assert_eq!(wal.recover(&mut main).unwrap(), 4);
    assert_eq!(main.len(), 4 * PAGE_SIZE as u64);
    assert_eq!(
        main.slice(3 * PAGE_SIZE as u64, PAGE_SIZE as usize).unwrap(),
        page(0x44).as_slice()
    );
}

#[test]
fn inspect_reads_without_mutating() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.tusk-wal");

    {
        let wal = Wal::open(&path, PAGE_SIZE).unwrap();
        wal.write_frame(2, &page(1), 0).unwrap();
        wal.write_frame(3, &page(2), 3).unwrap();
    }
    let len_before = fs::metadata(&path).unwrap().len();

    let summary = inspect(&path).unwrap();
    assert_eq!(summary.page_size, PAGE_SIZE);
    assert_eq!(summary.checkpoint_seq, 1);
    assert_eq!(summary.frames.len(), 2);
    assert_eq!(summary.frames[0].page_no, 2);
    assert!(!summary.frames[0].is_commit());
    assert_eq!(summary.frames[1].db_size_after_commit, 3);

    // Inspection never touches the file.
    assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
}

#[test]
fn inspect_rejects_foreign_files_instead_of_recreating() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("junk");
    fs::write(&path, vec![0x55u8; 100]).unwrap();

    assert!(matches!(inspect(&path).unwrap_err(), DbError::Wal(_)));
    assert_eq!(fs::metadata(&path).unwrap().len(), 100);
}

#[test]
fn inspect_stops_at_a_broken_chain() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.tusk-wal");
    {
        let wal = Wal::open(&path, PAGE_SIZE).unwrap();
        for i in 1..=3 {
            wal.write_frame(i, &page(i as u8), 0).unwrap();
        }
    }

    let mut bytes = fs::read(&path).unwrap();
    let frame_size = FRAME_HEADER_SIZE + PAGE_SIZE as usize;
    bytes[WAL_HEADER_SIZE + frame_size + 40] ^= 0x80;
    fs::write(&path, &bytes).unwrap();

    assert_eq!(inspect(&path).unwrap().frames.len(), 1);
}

#[test]
fn reset_salts_invalidate_stale_frames() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("main.tusk-wal");

    let stale = {
        let wal = Wal::open(&path, PAGE_SIZE).unwrap();
        wal.write_frame(1, &page(7), 1).unwrap();
        fs::read(&path).unwrap()
    };

    {
        let wal = Wal::open(&path, PAGE_SIZE).unwrap();
        let mut main = MemStorage::new(PAGE_SIZE as u64);
        wal.checkpoint(&mut main).unwrap();
    }

    // Graft the pre-checkpoint frame bytes behind the fresh header, as if
    // the truncate had been lost. The salts no longer match, so the frame
    // must not be counted.
    let fresh_header = fs::read(&path).unwrap();
    let mut grafted = fresh_header.clone();
    grafted.extend_from_slice(&stale[WAL_HEADER_SIZE..]);
    fs::write(&path, &grafted).unwrap();

    let wal = Wal::open(&path, PAGE_SIZE).unwrap();
    assert_eq!(wal.frame_count(), 0);
}
