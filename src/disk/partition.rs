// Partition table reset and verification
//
// Replaces whatever partition table a stick carries (GPT, MBR, garbage) with
// a fresh GPT holding exactly one basic-data partition, then reads the table
// back and checks it byte-for-byte before anyone formats on top of it.

use crc32fast::Hasher;
use gpt::GptConfig;
use gpt::disk::LogicalBlockSize;
use gpt::partition_types;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Disk;
use super::common::{SECTOR_SIZE, bytes_to_mb, log_device_error, sync_file};
use crate::error::PartitionError;
use crate::models::Device;

const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const PROTECTIVE_MBR_TYPE: u8 = 0xEE;
const PRIMARY_HEADER_LBA: u64 = 1;
/// Protective MBR, primary header and a 128-entry array of 128-byte entries
const GPT_RESERVED_SECTORS: u64 = 34;
const GPT_ENTRY_SIZE: u64 = 128;
/// Largest entry array `verify` reads: 128 entries of 128 bytes
const MAX_ENTRY_ARRAY_BYTES: u64 = 128 * GPT_ENTRY_SIZE;

/// Partition table found on a disk before it is reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionTable {
    Gpt { disk_guid: Uuid, partitions: Vec<PartitionInfo> },
    LegacyMbr,
    /// Bytes that look like a table but do not parse
    Corrupt(String),
    Empty,
}

impl PartitionTable {
    pub fn partition_guids(&self) -> Vec<Uuid> {
        match self {
            PartitionTable::Gpt { partitions, .. } => partitions.iter().map(|p| p.guid).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub number: u32,
    pub name: String,
    pub guid: Uuid,
    pub is_basic_data: bool,
    pub first_lba: u64,
    /// Inclusive
    pub last_lba: u64,
}

impl PartitionInfo {
    pub fn offset(&self) -> u64 {
        self.first_lba * SECTOR_SIZE
    }

    pub fn size(&self) -> u64 {
        (self.last_lba + 1 - self.first_lba) * SECTOR_SIZE
    }
}

#[derive(Debug, Clone)]
pub struct ResetOutcome {
    pub partition: PartitionInfo,
    pub previous: PartitionTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCopy {
    Primary,
    Backup,
}

impl fmt::Display for HeaderCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderCopy::Primary => write!(f, "primary"),
            HeaderCopy::Backup => write!(f, "backup"),
        }
    }
}

/// One finding of the post-reset verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    Unreadable(String),
    MissingProtectiveMbr,
    BadSignature(HeaderCopy),
    HeaderCrcMismatch { copy: HeaderCopy, stored: u32, computed: u32 },
    EntriesCrcMismatch { copy: HeaderCopy, stored: u32, computed: u32 },
    BackupLocation { expected: u64, found: u64 },
    /// Entry array described by a header does not fit the disk or the GPT layout
    EntryArrayLayout { copy: HeaderCopy, entries_lba: u64, count: u32, entry_size: u32 },
    PartitionCount(usize),
    NotBasicData,
    Misaligned { first_lba: u64, alignment: u64 },
    OutOfRange { first_lba: u64, last_lba: u64 },
    GuidMismatch { expected: Uuid, found: Uuid },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::Unreadable(e) => write!(f, "table unreadable: {}", e),
            Problem::MissingProtectiveMbr => write!(f, "protective MBR missing"),
            Problem::BadSignature(copy) => write!(f, "{} GPT header has no signature", copy),
            Problem::HeaderCrcMismatch { copy, stored, computed } => write!(
                f,
                "{} header CRC32 {:08X} does not match computed {:08X}",
                copy, stored, computed
            ),
            Problem::EntriesCrcMismatch { copy, stored, computed } => write!(
                f,
                "{} partition entry array CRC32 {:08X} does not match computed {:08X}",
                copy, stored, computed
            ),
            Problem::BackupLocation { expected, found } => {
                write!(f, "backup header at LBA {} instead of {}", found, expected)
            }
            Problem::EntryArrayLayout { copy, entries_lba, count, entry_size } => write!(
                f,
                "{} header describes {} entries of {} bytes at LBA {}",
                copy, count, entry_size, entries_lba
            ),
            Problem::PartitionCount(n) => write!(f, "expected exactly one partition, found {}", n),
            Problem::NotBasicData => write!(f, "partition type is not basic data"),
            Problem::Misaligned { first_lba, alignment } => write!(
                f,
                "partition start {} is not aligned to {} sectors",
                first_lba, alignment
            ),
            Problem::OutOfRange { first_lba, last_lba } => write!(
                f,
                "partition {}..={} lies outside the usable range",
                first_lba, last_lba
            ),
            Problem::GuidMismatch { expected, found } => {
                write!(f, "partition GUID {} instead of {}", found, expected)
            }
        }
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Usable LBA range of a 512-byte-sector GPT disk, inclusive
fn usable_range(total_sectors: u64) -> (u64, u64) {
    (GPT_RESERVED_SECTORS, total_sectors.saturating_sub(GPT_RESERVED_SECTORS))
}

fn read_sector(file: &mut File, lba: u64) -> io::Result<[u8; SECTOR_SIZE as usize]> {
    let mut buf = [0u8; SECTOR_SIZE as usize];
    file.seek(SeekFrom::Start(lba * SECTOR_SIZE))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Byte offset and length of a header's entry array, if it is sane and inside the disk
fn entry_array_bounds(entries_lba: u64, count: u32, entry_size: u32, disk_bytes: u64) -> Option<(u64, usize)> {
    let entry_size = u64::from(entry_size);
    if entry_size == 0 || entry_size % GPT_ENTRY_SIZE != 0 || entry_size > SECTOR_SIZE {
        return None;
    }
    let len = u64::from(count).checked_mul(entry_size)?;
    if len > MAX_ENTRY_ARRAY_BYTES {
        return None;
    }
    let start = entries_lba.checked_mul(SECTOR_SIZE)?;
    if start.checked_add(len)? > disk_bytes {
        return None;
    }
    Some((start, usize::try_from(len).ok()?))
}

fn gpt_error(e: impl fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

/// Read whatever partition table the disk carries.
///
/// Only I/O failures are errors; a table that does not parse is reported as
/// `PartitionTable::Corrupt`.
pub fn load(disk: &mut Disk) -> io::Result<PartitionTable> {
    if disk.sectors() < 2 {
        return Ok(PartitionTable::Empty);
    }

    let lba0 = read_sector(disk.file_mut(), 0)?;
    let lba1 = read_sector(disk.file_mut(), PRIMARY_HEADER_LBA)?;

    if lba1[0..8] == GPT_SIGNATURE {
        let cfg = GptConfig::new()
            .writable(false)
            .logical_block_size(LogicalBlockSize::Lb512);
        return match cfg.open_from_device(Box::new(disk.try_clone_file()?)) {
            Ok(gpt_disk) => {
                let partitions = gpt_disk
                    .partitions()
                    .iter()
                    .filter(|(_, p)| p.is_used())
                    .map(|(number, p)| PartitionInfo {
                        number: *number,
                        name: p.name.clone(),
                        guid: p.part_guid,
                        is_basic_data: p.part_type_guid == partition_types::BASIC,
                        first_lba: p.first_lba,
                        last_lba: p.last_lba,
                    })
                    .collect();
                Ok(PartitionTable::Gpt {
                    disk_guid: *gpt_disk.guid(),
                    partitions,
                })
            }
            Err(e) => {
                debug!("GPT signature present but table does not parse: {}", e);
                Ok(PartitionTable::Corrupt(e.to_string()))
            }
        };
    }

    if lba0[510..512] == MBR_SIGNATURE {
        return Ok(PartitionTable::LegacyMbr);
    }

    if lba0.iter().chain(lba1.iter()).all(|b| *b == 0) {
        Ok(PartitionTable::Empty)
    } else {
        Ok(PartitionTable::Corrupt("unrecognized data in the first sectors".into()))
    }
}

/// The single partition of a disk prepared by `PartitionTableResetter`
pub fn locate_partition(disk: &mut Disk) -> io::Result<Option<PartitionInfo>> {
    match load(disk)? {
        PartitionTable::Gpt { mut partitions, .. } if partitions.len() == 1 => Ok(partitions.pop()),
        _ => Ok(None),
    }
}

/// Check the on-disk GPT against what a reset is supposed to produce
pub fn verify(
    disk: &mut Disk,
    expected_guid: Uuid,
    alignment: u64,
) -> Vec<Problem> {
    match verify_inner(disk, expected_guid, alignment) {
        Ok(problems) => problems,
        Err(e) => vec![Problem::Unreadable(e.to_string())],
    }
}

fn verify_inner(disk: &mut Disk, expected_guid: Uuid, alignment: u64) -> io::Result<Vec<Problem>> {
    let mut problems = Vec::new();
    let total_sectors = disk.sectors();
    let disk_bytes = disk.size();
    let Some(last_lba) = total_sectors.checked_sub(1) else {
        return Ok(vec![Problem::Unreadable(format!(
            "device of {} bytes holds no complete sector",
            disk_bytes
        ))]);
    };
    let file = disk.file_mut();

    let lba0 = read_sector(file, 0)?;
    // First partition record starts at byte 446, type byte at offset 4
    if lba0[510..512] != MBR_SIGNATURE || lba0[446 + 4] != PROTECTIVE_MBR_TYPE {
        problems.push(Problem::MissingProtectiveMbr);
    }

    for (copy, lba) in [(HeaderCopy::Primary, PRIMARY_HEADER_LBA), (HeaderCopy::Backup, last_lba)] {
        let header = read_sector(file, lba)?;
        if header[0..8] != GPT_SIGNATURE {
            problems.push(Problem::BadSignature(copy));
            continue;
        }

        let header_size = (u32_at(&header, 12) as usize).clamp(92, SECTOR_SIZE as usize);
        let stored = u32_at(&header, 16);
        let mut zeroed = header;
        zeroed[16..20].fill(0);
        let mut hasher = Hasher::new();
        hasher.update(&zeroed[..header_size]);
        let computed = hasher.finalize();
        if stored != computed {
            problems.push(Problem::HeaderCrcMismatch { copy, stored, computed });
        }

        if copy == HeaderCopy::Primary {
            let alternate = u64_at(&header, 32);
            if alternate != last_lba {
                problems.push(Problem::BackupLocation {
                    expected: last_lba,
                    found: alternate,
                });
            }
        }

        let entries_lba = u64_at(&header, 72);
        let entry_count = u32_at(&header, 80);
        let entry_size = u32_at(&header, 84);
        let stored = u32_at(&header, 88);
        let Some((entries_start, entries_len)) =
            entry_array_bounds(entries_lba, entry_count, entry_size, disk_bytes)
        else {
            problems.push(Problem::EntryArrayLayout {
                copy,
                entries_lba,
                count: entry_count,
                entry_size,
            });
            continue;
        };
        let mut entries = vec![0u8; entries_len];
        file.seek(SeekFrom::Start(entries_start))?;
        file.read_exact(&mut entries)?;
        let computed = crc32fast::hash(&entries);
        if stored != computed {
            problems.push(Problem::EntriesCrcMismatch { copy, stored, computed });
        }
    }

    let partitions = match load(disk)? {
        PartitionTable::Gpt { partitions, .. } => partitions,
        other => {
            problems.push(Problem::Unreadable(format!("expected GPT, found {:?}", other)));
            return Ok(problems);
        }
    };

    if partitions.len() != 1 {
        problems.push(Problem::PartitionCount(partitions.len()));
    }

    let (first_usable, last_usable) = usable_range(total_sectors);
    for part in &partitions {
        if !part.is_basic_data {
            problems.push(Problem::NotBasicData);
        }
        if alignment > 1 && part.first_lba % alignment != 0 {
            problems.push(Problem::Misaligned {
                first_lba: part.first_lba,
                alignment,
            });
        }
        if part.first_lba < first_usable || part.last_lba > last_usable || part.last_lba < part.first_lba {
            problems.push(Problem::OutOfRange {
                first_lba: part.first_lba,
                last_lba: part.last_lba,
            });
        }
        if part.guid != expected_guid {
            problems.push(Problem::GuidMismatch {
                expected: expected_guid,
                found: part.guid,
            });
        }
    }

    Ok(problems)
}

/// Rewrites a device's partition table to a single basic-data GPT partition
#[derive(Debug, Clone)]
pub struct PartitionTableResetter {
    alignment_sectors: u64,
    partition_name: String,
}

impl Default for PartitionTableResetter {
    fn default() -> Self {
        Self::new(2048, "bootstick")
    }
}

impl PartitionTableResetter {
    pub fn new(alignment_sectors: u64, partition_name: impl Into<String>) -> Self {
        Self {
            alignment_sectors: alignment_sectors.max(1),
            partition_name: partition_name.into(),
        }
    }

    pub fn alignment_sectors(&self) -> u64 {
        self.alignment_sectors
    }

    /// Lock `device` and reset its partition table
    pub async fn reset(&self, device: &Device) -> Result<ResetOutcome, PartitionError> {
        let path = device.path().to_path_buf();
        let mut disk = Disk::lock(device)
            .await
            .map_err(|source| PartitionError::LoadFailed {
                path: path.clone(),
                source,
            })?;

        let resetter = self.clone();
        tokio::task::spawn_blocking(move || resetter.reset_disk(&mut disk))
            .await
            .map_err(|e| PartitionError::LoadFailed {
                path,
                source: io::Error::other(e),
            })?
    }

    /// Find the single partition of a device that has already been reset
    pub async fn locate(&self, device: &Device) -> Result<PartitionInfo, PartitionError> {
        let path = device.path().to_path_buf();
        let load_failed = |source: io::Error| PartitionError::LoadFailed {
            path: path.clone(),
            source,
        };

        let mut disk = Disk::lock(device).await.map_err(load_failed)?;
        let table = tokio::task::spawn_blocking(move || load(&mut disk))
            .await
            .map_err(|e| load_failed(io::Error::other(e)))?
            .map_err(load_failed)?;

        match table {
            PartitionTable::Gpt { mut partitions, .. } if partitions.len() == 1 => {
                Ok(partitions.remove(0))
            }
            PartitionTable::Gpt { partitions, .. } => Err(PartitionError::VerifyFailed {
                problems: vec![Problem::PartitionCount(partitions.len())],
            }),
            other => Err(PartitionError::VerifyFailed {
                problems: vec![Problem::Unreadable(format!("expected GPT, found {:?}", other))],
            }),
        }
    }

    /// Reset the partition table of an already locked disk.
    ///
    /// On success the disk holds a protective MBR, valid primary and backup
    /// GPT headers and one basic-data partition whose GUID differs from every
    /// partition GUID present before the reset.
    pub fn reset_disk(&self, disk: &mut Disk) -> Result<ResetOutcome, PartitionError> {
        let path = disk.path().to_path_buf();
        let load_failed = |source: io::Error| PartitionError::LoadFailed {
            path: path.clone(),
            source,
        };

        let previous = load(disk).map_err(load_failed)?;
        match &previous {
            PartitionTable::Corrupt(reason) => warn!(
                "Existing partition table on {} is unreadable ({}), treating disk as empty",
                disk.path().display(),
                reason
            ),
            other => debug!("Existing partition table on {}: {:?}", disk.path().display(), other),
        }

        let (first_lba, last_lba) = self.partition_range(disk.sectors()).ok_or_else(|| {
            load_failed(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "device of {:.1} MB is too small for an aligned partition",
                    bytes_to_mb(disk.size())
                ),
            ))
        })?;

        let taken: HashSet<Uuid> = previous.partition_guids().into_iter().collect();
        let mut part_guid = Uuid::new_v4();
        while taken.contains(&part_guid) {
            part_guid = Uuid::new_v4();
        }

        self.write_table(disk, part_guid, first_lba, last_lba)
            .map_err(|e| {
                log_device_error("Partition table write", &e);
                load_failed(e)
            })?;
        disk.reread_partition_table();

        let problems = verify(disk, part_guid, self.alignment_sectors);
        if !problems.is_empty() {
            for problem in &problems {
                warn!("Partition table verification: {}", problem);
            }
            return Err(PartitionError::VerifyFailed { problems });
        }

        let partition = locate_partition(disk)
            .map_err(load_failed)?
            .ok_or_else(|| PartitionError::VerifyFailed {
                problems: vec![Problem::PartitionCount(0)],
            })?;

        info!(
            "Partition table of {} reset: partition {} at LBA {}..={} ({:.1} MB)",
            disk.path().display(),
            partition.guid,
            partition.first_lba,
            partition.last_lba,
            bytes_to_mb(partition.size())
        );

        Ok(ResetOutcome { partition, previous })
    }

    /// Aligned start through the last usable sector, inclusive
    fn partition_range(&self, total_sectors: u64) -> Option<(u64, u64)> {
        let (first_usable, last_usable) = usable_range(total_sectors);
        let first = align_up(first_usable, self.alignment_sectors);
        if first > last_usable {
            return None;
        }
        Some((first, last_usable))
    }

    fn write_table(&self, disk: &mut Disk, part_guid: Uuid, first_lba: u64, last_lba: u64) -> io::Result<()> {
        let total_sectors = disk.sectors();
        let file = disk.file_mut();

        // Clear both table locations so no stale backup header survives
        let zeros = vec![0u8; (GPT_RESERVED_SECTORS * SECTOR_SIZE) as usize];
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&zeros)?;
        file.seek(SeekFrom::Start((total_sectors - (GPT_RESERVED_SECTORS - 1)) * SECTOR_SIZE))?;
        file.write_all(&zeros[..((GPT_RESERVED_SECTORS - 1) * SECTOR_SIZE) as usize])?;

        let mbr = gpt::mbr::ProtectiveMBR::with_lb_size(
            u32::try_from(total_sectors - 1).unwrap_or(0xFF_FF_FF_FF),
        );
        mbr.overwrite_lba0(file).map_err(gpt_error)?;

        let mut gpt_disk = GptConfig::new()
            .writable(true)
            .initialized(false)
            .logical_block_size(LogicalBlockSize::Lb512)
            .create_from_device(Box::new(disk.try_clone_file()?), None)
            .map_err(gpt_error)?;

        let mut partitions = BTreeMap::new();
        partitions.insert(
            1,
            gpt::partition::Partition {
                part_type_guid: partition_types::BASIC,
                part_guid,
                first_lba,
                last_lba,
                flags: 0,
                name: self.partition_name.clone(),
            },
        );
        gpt_disk.update_partitions(partitions).map_err(gpt_error)?;
        gpt_disk.write().map_err(gpt_error)?;

        sync_file(disk.file_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::test_support::*;

    fn scribble(path: &std::path::Path, len: usize) {
        let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        let mut state: u32 = 0x1234_5678;
        let noise: Vec<u8> = (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect();
        file.write_all(&noise).unwrap();
        // Make it look like a GPT so the parser has to reject it
        file.seek(SeekFrom::Start(SECTOR_SIZE)).unwrap();
        file.write_all(&GPT_SIGNATURE).unwrap();
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(34, 2048), 2048);
        assert_eq!(align_up(2048, 2048), 2048);
        assert_eq!(align_up(2049, 2048), 4096);
        assert_eq!(align_up(34, 1), 34);
    }

    #[test]
    fn test_partition_range_is_aligned_and_usable() {
        let resetter = PartitionTableResetter::default();
        let total = 64 * MB / SECTOR_SIZE;
        let (first, last) = resetter.partition_range(total).unwrap();
        assert_eq!(first, 2048);
        assert_eq!(last, total - GPT_RESERVED_SECTORS);
        assert!(resetter.partition_range(2048).is_none());
        assert_eq!(resetter.partition_range(2048 + 35), Some((2048, 2049)));
    }

    #[tokio::test]
    async fn test_reset_blank_disk() {
        let stick = FakeStick::new(64 * MB);
        let outcome = PartitionTableResetter::default()
            .reset(&stick.device)
            .await
            .unwrap();

        assert_eq!(outcome.previous, PartitionTable::Empty);
        assert_eq!(outcome.partition.first_lba, 2048);
        // The partition runs to the last usable sector, not to an alignment boundary
        assert_eq!(outcome.partition.last_lba, 64 * MB / SECTOR_SIZE - GPT_RESERVED_SECTORS);
        assert!(outcome.partition.is_basic_data);
        assert_eq!(outcome.partition.name, "bootstick");

        let mut disk = Disk::lock(&stick.device).await.unwrap();
        assert!(verify(&mut disk, outcome.partition.guid, 2048).is_empty());
    }

    #[tokio::test]
    async fn test_reset_corrupt_table() {
        let stick = FakeStick::new(64 * MB);
        scribble(&stick.path(), MB as usize);

        let mut disk = Disk::lock(&stick.device).await.unwrap();
        assert!(matches!(load(&mut disk).unwrap(), PartitionTable::Corrupt(_)));

        let outcome = PartitionTableResetter::default().reset_disk(&mut disk).unwrap();
        assert!(matches!(outcome.previous, PartitionTable::Corrupt(_)));

        match load(&mut disk).unwrap() {
            PartitionTable::Gpt { partitions, .. } => {
                assert_eq!(partitions.len(), 1);
                assert!(partitions[0].is_basic_data);
                assert_eq!(partitions[0].guid, outcome.partition.guid);
            }
            other => panic!("expected GPT, found {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_generates_new_guid() {
        let stick = FakeStick::new(64 * MB);
        let resetter = PartitionTableResetter::default();
        let first = resetter.reset(&stick.device).await.unwrap();
        let second = resetter.reset(&stick.device).await.unwrap();

        assert_eq!(second.previous.partition_guids(), vec![first.partition.guid]);
        assert_ne!(first.partition.guid, second.partition.guid);
    }

    #[tokio::test]
    async fn test_verify_detects_damaged_header() {
        let stick = FakeStick::new(64 * MB);
        let outcome = PartitionTableResetter::default()
            .reset(&stick.device)
            .await
            .unwrap();

        {
            let mut file = std::fs::OpenOptions::new().write(true).open(stick.path()).unwrap();
            // Flip a byte of the disk GUID inside the primary header
            file.seek(SeekFrom::Start(SECTOR_SIZE + 60)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let mut disk = Disk::lock(&stick.device).await.unwrap();
        let problems = verify(&mut disk, outcome.partition.guid, 2048);
        assert!(problems.iter().any(|p| matches!(
            p,
            Problem::HeaderCrcMismatch { copy: HeaderCopy::Primary, .. }
        )));
    }

    #[tokio::test]
    async fn test_reset_legacy_mbr() {
        let stick = FakeStick::new(64 * MB);
        {
            let mut file = std::fs::OpenOptions::new().write(true).open(stick.path()).unwrap();
            // One FAT32 LBA partition record starting at sector 2048
            let mut record = [0u8; 16];
            record[4] = 0x0C;
            record[8..12].copy_from_slice(&2048u32.to_le_bytes());
            record[12..16].copy_from_slice(&(60 * 2048u32).to_le_bytes());
            file.seek(SeekFrom::Start(446)).unwrap();
            file.write_all(&record).unwrap();
            file.seek(SeekFrom::Start(510)).unwrap();
            file.write_all(&MBR_SIGNATURE).unwrap();
        }

        let mut disk = Disk::lock(&stick.device).await.unwrap();
        let outcome = PartitionTableResetter::default().reset_disk(&mut disk).unwrap();
        assert_eq!(outcome.previous, PartitionTable::LegacyMbr);

        let problems = verify(&mut disk, outcome.partition.guid, 2048);
        assert!(problems.is_empty(), "{:?}", problems);
    }

    #[tokio::test]
    async fn test_verify_rejects_oversized_entry_array() {
        let stick = FakeStick::new(64 * MB);
        let outcome = PartitionTableResetter::default()
            .reset(&stick.device)
            .await
            .unwrap();

        {
            let mut file = std::fs::OpenOptions::new().write(true).open(stick.path()).unwrap();
            // Entry count and entry size of the backup header
            let backup_header = (64 * MB / SECTOR_SIZE - 1) * SECTOR_SIZE;
            file.seek(SeekFrom::Start(backup_header + 80)).unwrap();
            file.write_all(&[0xFF; 8]).unwrap();
        }

        let mut disk = Disk::lock(&stick.device).await.unwrap();
        let problems = verify(&mut disk, outcome.partition.guid, 2048);
        assert!(problems.iter().any(|p| matches!(
            p,
            Problem::EntryArrayLayout {
                copy: HeaderCopy::Backup,
                count: u32::MAX,
                entry_size: u32::MAX,
                ..
            }
        )));
        assert!(problems.iter().any(|p| matches!(
            p,
            Problem::HeaderCrcMismatch { copy: HeaderCopy::Backup, .. }
        )));
    }

    #[test]
    fn test_entry_array_bounds() {
        let disk = 64 * MB;
        assert_eq!(entry_array_bounds(2, 128, 128, disk), Some((1024, 16384)));
        assert_eq!(entry_array_bounds(2, 128, 100, disk), None);
        assert_eq!(entry_array_bounds(2, 128, 1024, disk), None);
        assert_eq!(entry_array_bounds(2, 129, 128, disk), None);
        assert_eq!(entry_array_bounds(u64::MAX, 1, 128, disk), None);
        assert_eq!(entry_array_bounds(disk / SECTOR_SIZE - 1, 128, 128, disk), None);
    }

    #[tokio::test]
    async fn test_verify_sub_sector_device() {
        let stick = FakeStick::new(100);
        let mut disk = Disk::lock(&stick.device).await.unwrap();
        assert!(matches!(
            verify(&mut disk, Uuid::nil(), 2048).as_slice(),
            [Problem::Unreadable(_)]
        ));
    }

    #[tokio::test]
    async fn test_verify_reports_guid_mismatch() {
        let stick = FakeStick::new(64 * MB);
        PartitionTableResetter::default()
            .reset(&stick.device)
            .await
            .unwrap();

        let mut disk = Disk::lock(&stick.device).await.unwrap();
        let problems = verify(&mut disk, Uuid::nil(), 2048);
        assert!(matches!(problems.as_slice(), [Problem::GuidMismatch { .. }]));
    }

    #[tokio::test]
    async fn test_locate_after_reset() {
        let stick = FakeStick::new(64 * MB);
        let resetter = PartitionTableResetter::default();
        assert!(matches!(
            resetter.locate(&stick.device).await,
            Err(PartitionError::VerifyFailed { .. })
        ));

        let outcome = resetter.reset(&stick.device).await.unwrap();
        let found = resetter.locate(&stick.device).await.unwrap();
        assert_eq!(found, outcome.partition);
    }

    #[tokio::test]
    async fn test_reset_too_small_device() {
        let stick = FakeStick::new(64 * 1024);
        let err = PartitionTableResetter::default()
            .reset(&stick.device)
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::LoadFailed { .. }));
    }

    #[tokio::test]
    async fn test_reset_missing_device() {
        let stick = FakeStick::new(MB);
        std::fs::remove_file(stick.path()).unwrap();
        let err = PartitionTableResetter::default()
            .reset(&stick.device)
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::LoadFailed { .. }));
    }
}
