//! Write/read round-trip tests through the full protected-file stack.

use rand::Rng;
use std::io::SeekFrom;
use std::path::PathBuf;
use tempfile::TempDir;
use veristream::{
    checksum_of, ChecksumAlgorithm, IntegrityConfig, OpenFlags, ProtectedFile,
};

fn create_set(dir: &TempDir, block_length: u32) -> (PathBuf, PathBuf, IntegrityConfig) {
    let data_path = dir.path().join("payload.bin");
    let validation_path = dir.path().join("payload.vstream");
    let config = IntegrityConfig::new("round-trip-tests");
    ProtectedFile::create_validation_file(
        &validation_path,
        &config,
        &data_path,
        block_length,
        ChecksumAlgorithm::Crc32,
    )
    .unwrap();
    (data_path, validation_path, config)
}

fn create_flags() -> OpenFlags {
    OpenFlags {
        create: true,
        ..Default::default()
    }
}

#[test]
fn test_2500_bytes_over_1024_blocks() {
    let dir = TempDir::new().unwrap();
    let (_, validation_path, config) = create_set(&dir, 1024);

    let mut rng = rand::thread_rng();
    let data: Vec<u8> = (0..2500).map(|_| rng.gen()).collect();

    let mut protected = ProtectedFile::open(&validation_path, config.clone()).unwrap();
    protected.open_for_write("payload.bin", create_flags()).unwrap();
    assert_eq!(protected.write(&data).unwrap(), 2500);
    protected.sync().unwrap();
    protected.close().unwrap();

    // Exactly three checksums: two full blocks and a 452-byte tail.
    let checksums =
        ProtectedFile::get_checksums("payload.bin", &validation_path, &config).unwrap();
    assert_eq!(checksums.len(), 3);
    assert_eq!(
        checksums[0],
        checksum_of(ChecksumAlgorithm::Crc32, &data[..1024])
    );
    assert_eq!(
        checksums[1],
        checksum_of(ChecksumAlgorithm::Crc32, &data[1024..2048])
    );
    assert_eq!(
        checksums[2],
        checksum_of(ChecksumAlgorithm::Crc32, &data[2048..])
    );
    assert_eq!(data.len() - 2048, 452);

    // Reopen and read everything back.
    let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
    protected.open_for_read("payload.bin").unwrap();
    assert_eq!(protected.get_file_size("payload.bin").unwrap(), 2500);

    let mut read_back = vec![0u8; 4096];
    let n = protected.read(&mut read_back).unwrap();
    assert_eq!(n, 2500);
    assert_eq!(&read_back[..n], &data[..]);
    protected.close().unwrap();
}

#[test]
fn test_round_trip_with_caller_owned_buffer() {
    let dir = TempDir::new().unwrap();
    let (_, validation_path, config) = create_set(&dir, 256);

    // Two pages only: plenty of eviction traffic for 2 KiB of data. Both
    // buffers must outlive the manager that borrows them.
    let mut cache_buffer = vec![0u8; 512];
    let mut read_buffer = vec![0u8; 512];
    let data: Vec<u8> = (0..2048u32).map(|i| (i / 7) as u8).collect();

    let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
    protected
        .open_for_write_with_buffer("payload.bin", create_flags(), &mut cache_buffer)
        .unwrap();
    protected.write(&data).unwrap();

    // A write-only stream refuses reads.
    let mut read_back = vec![0u8; 2048];
    assert!(matches!(
        protected.read(&mut read_back),
        Err(veristream::VeristreamError::StreamNotReadable)
    ));
    protected.close().unwrap();

    protected
        .open_for_read_with_buffer("payload.bin", &mut read_buffer)
        .unwrap();
    assert_eq!(protected.read(&mut read_back).unwrap(), 2048);
    assert_eq!(read_back, data);
    protected.close().unwrap();
}

#[test]
fn test_read_write_stream_sees_its_own_writes() {
    let dir = TempDir::new().unwrap();
    let (_, validation_path, config) = create_set(&dir, 256);

    let data: Vec<u8> = (0..2048u32).map(|i| (i * 3) as u8).collect();

    let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
    protected
        .open_for_read_write("payload.bin", create_flags())
        .unwrap();
    protected.write(&data).unwrap();
    protected.seek(SeekFrom::Start(0)).unwrap();

    let mut read_back = vec![0u8; 2048];
    assert_eq!(protected.read(&mut read_back).unwrap(), 2048);
    assert_eq!(read_back, data);
    protected.close().unwrap();
}

#[test]
fn test_append_mode_extends_checksummed_file() {
    let dir = TempDir::new().unwrap();
    let (data_path, validation_path, config) = create_set(&dir, 512);

    let mut protected = ProtectedFile::open(&validation_path, config.clone()).unwrap();
    protected.open_for_write("payload.bin", create_flags()).unwrap();
    protected.write(&vec![0x01; 700]).unwrap();
    protected.close().unwrap();

    let mut protected = ProtectedFile::open(&validation_path, config.clone()).unwrap();
    protected
        .open_for_write(
            "payload.bin",
            OpenFlags {
                append: true,
                ..Default::default()
            },
        )
        .unwrap();
    protected.write(&vec![0x02; 400]).unwrap();
    protected.close().unwrap();

    let on_disk = std::fs::read(&data_path).unwrap();
    assert_eq!(on_disk.len(), 1100);
    assert!(on_disk[..700].iter().all(|&b| b == 0x01));
    assert!(on_disk[700..].iter().all(|&b| b == 0x02));

    // 1100 bytes over 512-byte blocks: 3 checksums, all still valid.
    let checksums =
        ProtectedFile::get_checksums("payload.bin", &validation_path, &config).unwrap();
    assert_eq!(checksums.len(), 3);
    let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
    protected.verify("payload.bin").unwrap();
}

#[test]
fn test_reopen_preserves_validation_across_sessions() {
    let dir = TempDir::new().unwrap();
    let (_, validation_path, config) = create_set(&dir, 1024);

    for round in 0..3u8 {
        let mut protected = ProtectedFile::open(&validation_path, config.clone()).unwrap();
        protected.open_for_write("payload.bin", create_flags()).unwrap();
        protected.seek(SeekFrom::Start(u64::from(round) * 1024)).unwrap();
        protected.write(&vec![round; 1024]).unwrap();
        protected.close().unwrap();
    }

    let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
    protected.verify("payload.bin").unwrap();
    protected.open_for_read("payload.bin").unwrap();
    let mut read_back = vec![0u8; 3 * 1024];
    assert_eq!(protected.read(&mut read_back).unwrap(), 3 * 1024);
    for round in 0..3usize {
        assert!(read_back[round * 1024..(round + 1) * 1024]
            .iter()
            .all(|&b| b == round as u8));
    }
    protected.close().unwrap();
}
