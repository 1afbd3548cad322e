//! Periodic integrity verification
//!
//! Every file in custody exists in three places: its primary storage, the
//! backup storage named `Backup <storage>`, and the archive. Verification
//! re-hashes all three and compares them with the digest recorded at ingest.
//!
//! ## Overview
//!
//! Verifying the whole corpus every day would be wasteful for large,
//! slowly-changing archives. Instead the record set is split into `N`
//! shards (one per day of the cycle) and each run verifies exactly one:
//!
//! 1. Fetch every Files record, newest first
//! 2. Slice out the shard selected by [`today_shard`]
//! 3. Verify the shard's files with a bounded number of concurrent workers
//! 4. Collect failures per file; one bad file never hides the others
//! 5. Fail with an aggregate [`CustodyError::Verification`] naming every
//!    failed file, or return a [`VerificationSummary`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! # async fn example(custody: custody::Custody) -> custody::Result<()> {
//! let summary = custody.daily_verify().await?;
//! println!("{}", summary.summary());
//! # Ok(())
//! # }
//! ```

use crate::custody::{backup_storage_name, name_and_storage, Custody};
use crate::database::Table;
use crate::error::{CustodyError, Result};
use crate::hash::{calculate_hash, HashAlgorithm};
use crate::types::{fields, Record, SortKey, ARCHIVE_PLACEHOLDER};
use crate::utils::format_elapsed;
use chrono::{Datelike, NaiveDate, Utc};
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Verification scheduling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Number of shards, i.e. days in one full verification cycle
    pub shards: usize,
    /// Files verified concurrently
    pub workers: usize,
    /// Archive files that have no archive copy instead of skipping them
    pub archive_missing: bool,
    /// How the current date picks a shard
    pub schedule: ShardSchedule,
}

/// Mapping from the current UTC date to a shard index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShardSchedule {
    /// Day of the month modulo the shard count. With 28 shards the 28th
    /// maps to shard 0 and days 29 to 31 repeat shards 1 to 3.
    #[default]
    DayOfMonth,
    /// Days since the Unix epoch modulo the shard count, which never
    /// repeats a shard early at month ends
    EpochDay,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            shards: 28,
            workers: 4,
            archive_missing: false,
            schedule: ShardSchedule::DayOfMonth,
        }
    }
}

/// Outcome of verifying one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCheck {
    /// All three copies match the recorded digest
    Verified,
    /// The file has no archive copy yet and was not checked
    Skipped,
    /// At least one copy differs from the recorded digest
    Mismatch {
        /// Digest recorded at ingest
        expected: String,
        /// Digest of the primary storage copy
        primary: String,
        /// Digest of the backup storage copy
        backup: String,
        /// Digest of the archived copy
        archive: String,
    },
}

impl FileCheck {
    /// Whether the file counts as passing
    pub fn is_valid(&self) -> bool {
        !matches!(self, FileCheck::Mismatch { .. })
    }
}

/// Result of a successful shard run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationSummary {
    /// Shard that was verified
    pub shard: usize,
    /// Records in the whole table at the time of the run
    pub total_records: usize,
    /// Number of files in the shard
    pub checked: usize,
    /// Files whose copies all matched
    pub passed: Vec<String>,
    /// Files skipped for lack of an archive copy
    pub skipped: Vec<String>,
}

impl VerificationSummary {
    /// One-line description for logs and the CLI
    pub fn summary(&self) -> String {
        format!(
            "Shard {}: {} of {} record(s) checked, {} verified, {} skipped",
            self.shard,
            self.checked,
            self.total_records,
            self.passed.len(),
            self.skipped.len()
        )
    }
}

/// Records of shard `index` when `total` records are split into `shards`
///
/// The first `total % shards` shards get one extra record, so shard sizes
/// differ by at most one and the shards tile `0..total` in order. An
/// out-of-range index yields an empty range.
///
/// # Example
///
/// ```rust
/// use custody::verification::shard_range;
///
/// assert_eq!(shard_range(10, 4, 0), 0..3);
/// assert_eq!(shard_range(10, 4, 1), 3..6);
/// assert_eq!(shard_range(10, 4, 2), 6..8);
/// assert_eq!(shard_range(10, 4, 3), 8..10);
/// ```
pub fn shard_range(total: usize, shards: usize, index: usize) -> Range<usize> {
    if shards == 0 || index >= shards {
        return total..total;
    }
    let size = total / shards;
    let extra = total % shards;
    let start = size * index + index.min(extra);
    let len = if index < extra { size + 1 } else { size };
    start..start + len
}

/// Shard for a day counted from the Unix epoch
pub fn shard_for_day(days_since_epoch: i64, shards: usize) -> usize {
    if shards == 0 {
        return 0;
    }
    days_since_epoch.rem_euclid(shards as i64) as usize
}

/// Shard due on `date` under `schedule`
///
/// # Example
///
/// ```rust
/// use chrono::NaiveDate;
/// use custody::verification::{shard_for_date, ShardSchedule};
///
/// let date = NaiveDate::from_ymd_opt(2024, 3, 28).unwrap();
/// assert_eq!(shard_for_date(date, 28, ShardSchedule::DayOfMonth), 0);
/// ```
pub fn shard_for_date(date: NaiveDate, shards: usize, schedule: ShardSchedule) -> usize {
    if shards == 0 {
        return 0;
    }
    match schedule {
        ShardSchedule::DayOfMonth => date.day() as usize % shards,
        ShardSchedule::EpochDay => {
            let days = date.signed_duration_since(NaiveDate::default()).num_days();
            shard_for_day(days, shards)
        }
    }
}

/// Shard due today (UTC)
pub fn today_shard(shards: usize, schedule: ShardSchedule) -> usize {
    shard_for_date(Utc::now().date_naive(), shards, schedule)
}

#[derive(Default)]
struct Progress {
    passed: Vec<String>,
    skipped: Vec<String>,
    failed: Vec<String>,
}

impl Custody {
    /// Check one file's three copies against its recorded digest
    ///
    /// The three downloads run concurrently and all of them are driven to
    /// completion before the digests are compared.
    ///
    /// # Errors
    ///
    /// Any failure to fetch or hash one of the copies is returned as is;
    /// a digest mismatch is reported as [`FileCheck::Mismatch`] instead.
    pub async fn verify_file(&self, record: &Record) -> Result<FileCheck> {
        let (name, storage_name) = name_and_storage(record)?;
        let expected = record
            .text(fields::SHA256)
            .ok_or_else(|| CustodyError::invalid_record(format!("record {} has no {}", record.id, fields::SHA256)))?
            .to_ascii_lowercase();

        let archive_url = match record.text(fields::INTERNET_ARCHIVE) {
            Some(url) if !url.is_empty() && url != ARCHIVE_PLACEHOLDER => url.to_string(),
            _ if self.verification_config().archive_missing => {
                info!("File `{}` has no archive copy, archiving it first", name);
                let files = self.files().await?;
                self.archive_record(files.as_ref(), record).await?
            }
            _ => {
                debug!("File `{}` has no archive copy, skipping", name);
                return Ok(FileCheck::Skipped);
            }
        };

        let primary = self.storage(storage_name)?;
        let backup = self.storage(&backup_storage_name(storage_name))?;
        let algorithm = HashAlgorithm::Sha256;

        let (primary_hash, backup_hash, archive_hash) = tokio::join!(
            async { calculate_hash(primary.get_file(name).await?, algorithm).await },
            async { calculate_hash(backup.get_file(name).await?, algorithm).await },
            async { calculate_hash(self.archive_client().retrieve(&archive_url).await?, algorithm).await },
        );
        let (primary_hash, backup_hash, archive_hash) = (primary_hash?, backup_hash?, archive_hash?);

        if primary_hash == expected && backup_hash == expected && archive_hash == expected {
            Ok(FileCheck::Verified)
        } else {
            Ok(FileCheck::Mismatch {
                expected,
                primary: primary_hash,
                backup: backup_hash,
                archive: archive_hash,
            })
        }
    }

    /// Verify a single record by id
    ///
    /// # Returns
    ///
    /// `true` if every copy matches (or the file was skipped), `false` on a
    /// digest mismatch.
    #[instrument(skip(self))]
    pub async fn verify(&self, record_id: &str) -> Result<bool> {
        let record = self.files().await?.get(record_id).await?;
        let check = self.verify_file(&record).await?;
        if let FileCheck::Mismatch { expected, primary, backup, archive } = &check {
            warn!(
                "Hash mismatch for file `{}`: expected {}, primary {}, backup {}, archive {}",
                record.display_name(),
                expected,
                primary,
                backup,
                archive
            );
        }
        Ok(check.is_valid())
    }

    /// Verify every file of shard `index`
    ///
    /// # Errors
    ///
    /// - [`CustodyError::InvalidConfiguration`] if `index` is not a shard
    /// - [`CustodyError::Verification`] naming every failed file, after the
    ///   whole shard has been processed
    /// - errors reading the Files table, unchanged
    #[instrument(skip(self))]
    pub async fn verify_shard(&self, index: usize) -> Result<VerificationSummary> {
        let config = self.verification_config();
        if index >= config.shards {
            return Err(CustodyError::InvalidConfiguration(format!(
                "shard {} out of range, there are {} shards",
                index, config.shards
            )));
        }

        let files = self.files().await?;
        let records: Vec<Record> = files
            .get_all(None, &[SortKey::desc(fields::CREATED)])
            .await?
            .try_collect()
            .await?;
        let total_records = records.len();
        let range = shard_range(total_records, config.shards, index);
        let shard: Vec<Record> = records.into_iter().skip(range.start).take(range.len()).collect();
        info!(
            "Verifying shard {} of {}: {} of {} file(s)",
            index,
            config.shards,
            shard.len(),
            total_records
        );

        let progress = Mutex::new(Progress::default());
        let progress_ref = &progress;
        futures::stream::iter(shard.iter())
            .for_each_concurrent(config.workers, |record| async move {
                let name = record.display_name();
                let started = Instant::now();
                info!("Start verifying file `{}`", name);
                match self.verify_file(record).await {
                    Ok(FileCheck::Verified) => {
                        info!("Verified file `{}` in {}", name, format_elapsed(started.elapsed()));
                        progress_ref.lock().passed.push(name);
                    }
                    Ok(FileCheck::Skipped) => {
                        info!("Skipped file `{}`: not archived yet", name);
                        progress_ref.lock().skipped.push(name);
                    }
                    Ok(FileCheck::Mismatch { expected, primary, backup, archive }) => {
                        error!(
                            "Hash mismatch for file `{}`: expected {}, primary {}, backup {}, archive {}",
                            name, expected, primary, backup, archive
                        );
                        progress_ref.lock().failed.push(name);
                    }
                    Err(e) => {
                        error!("Error while verifying file `{}`: {}", name, e);
                        progress_ref.lock().failed.push(name);
                    }
                }
            })
            .await;

        let mut progress = progress.into_inner();
        if !progress.failed.is_empty() {
            progress.failed.sort();
            error!(
                "Verification failed for the following files: {}",
                progress.failed.join(", ")
            );
            return Err(CustodyError::Verification { failed: progress.failed });
        }

        progress.passed.sort();
        progress.skipped.sort();
        let summary = VerificationSummary {
            shard: index,
            total_records,
            checked: shard.len(),
            passed: progress.passed,
            skipped: progress.skipped,
        };
        info!("{}", summary.summary());
        Ok(summary)
    }

    /// Verify the shard due today
    pub async fn daily_verify(&self) -> Result<VerificationSummary> {
        let config = self.verification_config();
        self.verify_shard(today_shard(config.shards, config.schedule)).await
    }
}
