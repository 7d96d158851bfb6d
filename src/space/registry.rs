//! On-disk space registry
//!
//! Enumerates the spaces under a base directory and reads or writes their
//! marker files. Readers never fail on a single bad space: unreadable
//! metadata marks the record damaged and the scan carries on.

use crate::error::{SpaceError, SpaceResult};
use crate::space::record::{files, EnvironmentSpec, SpaceName, SpaceRecord, SpaceStatus};
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Attempts at picking an unused directory name for a new space
const CREATE_ATTEMPTS: usize = 8;

/// Captured environment variables of a built space
pub type CapturedEnv = BTreeMap<String, String>;

/// Registry of the spaces stored under one base directory
#[derive(Debug, Clone)]
pub struct SpaceRegistry {
    base_dir: PathBuf,
}

impl SpaceRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn space_path(&self, name: &SpaceName) -> PathBuf {
        self.base_dir.join(name.as_str())
    }

    /// List every space under the base directory, sorted by name
    ///
    /// A missing base directory yields an empty list.
    pub fn list_spaces(&self) -> SpaceResult<Vec<SpaceRecord>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(SpaceError::io(
                    format!("reading spaces directory {}", self.base_dir.display()),
                    e,
                ))
            }
        };

        let mut records = vec![];
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", self.base_dir.display(), e);
                    continue;
                }
            };

            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let file_name = entry.file_name();
            let Some(raw) = file_name.to_str() else {
                warn!("Skipping space with non UTF-8 name: {:?}", file_name);
                continue;
            };
            if raw.starts_with('.') {
                continue;
            }

            match SpaceName::new(raw) {
                Ok(name) => records.push(self.read_record(name)),
                Err(e) => warn!("Skipping {}: {}", raw, e),
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Found {} spaces in {}", records.len(), self.base_dir.display());
        Ok(records)
    }

    /// Reload a single space from disk
    pub fn load(&self, name: &SpaceName) -> SpaceResult<SpaceRecord> {
        if !self.space_path(name).is_dir() {
            return Err(SpaceError::SpaceNotFound(name.to_string()));
        }
        Ok(self.read_record(name.clone()))
    }

    /// Read status, damage flag and requester pid without failing
    fn read_record(&self, name: SpaceName) -> SpaceRecord {
        let mut record = SpaceRecord::new(&self.base_dir, name);

        match fs::read_to_string(record.file(files::STATE)) {
            Ok(content) => match SpaceStatus::from_marker(&content) {
                Some(status) => record.status = status,
                None => {
                    warn!("Space {} has unknown state {:?}", record.name, content.trim());
                    record.damaged = true;
                }
            },
            Err(e) => {
                debug!("Space {} state unreadable: {}", record.name, e);
                record.damaged = true;
            }
        }

        if record.file(files::DAMAGED).exists() {
            record.damaged = true;
        }

        record.requested_pid = fs::read_to_string(record.file(files::REQUESTED_PID))
            .ok()
            .and_then(|s| s.trim().parse().ok());

        record
    }

    /// Load the last-usage timestamp of a space
    ///
    /// Legacy `time_<epoch>` markers are consolidated into the canonical
    /// marker on first read. When no marker exists at all, returns `None` if
    /// `none_if_not_found` is set; otherwise the space is marked damaged and
    /// its usage reset to now.
    pub fn load_last_usage(
        &self,
        record: &mut SpaceRecord,
        none_if_not_found: bool,
    ) -> SpaceResult<Option<DateTime<Utc>>> {
        if let Some(ts) = read_mtime(&record.file(files::LAST_USAGE))? {
            record.last_usage = Some(ts);
            return Ok(Some(ts));
        }

        if let Some(ts) = self.consolidate_legacy_usage(record)? {
            record.last_usage = Some(ts);
            return Ok(Some(ts));
        }

        if none_if_not_found {
            record.last_usage = None;
            return Ok(None);
        }

        warn!("Space {} has no usage marker, marking damaged", record.name);
        self.mark_damaged(record, "last usage marker missing")?;
        let now = self.update_last_usage(record)?;
        Ok(Some(now))
    }

    /// Fold legacy `time_<epoch>` files into the canonical usage marker
    ///
    /// The newest epoch wins. All legacy files are removed afterwards, so a
    /// second call finds nothing to do.
    fn consolidate_legacy_usage(
        &self,
        record: &SpaceRecord,
    ) -> SpaceResult<Option<DateTime<Utc>>> {
        let entries = match fs::read_dir(&record.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SpaceError::io(
                    format!("reading space directory {}", record.path.display()),
                    e,
                ))
            }
        };

        let legacy: Vec<(PathBuf, f64)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let epoch = name
                    .strip_prefix(files::LEGACY_USAGE_PREFIX)?
                    .parse::<f64>()
                    .ok()?;
                (epoch.is_finite() && epoch >= 0.0).then(|| (entry.path(), epoch))
            })
            .collect();

        let Some(newest) = legacy.iter().map(|(_, epoch)| *epoch).reduce(f64::max) else {
            return Ok(None);
        };

        let secs = newest.trunc() as i64;
        let nanos = (newest.fract() * 1e9) as u32;
        let marker = record.file(files::LAST_USAGE);

        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {
                filetime::set_file_mtime(&marker, FileTime::from_unix_time(secs, nanos))
                    .map_err(|e| SpaceError::io(format!("setting mtime of {}", marker.display()), e))?;
            }
            // A peer consolidated or touched first; its value is at least as new.
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(SpaceError::io(format!("creating {}", marker.display()), e));
            }
        }

        for (path, _) in &legacy {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != ErrorKind::NotFound {
                    return Err(SpaceError::io(format!("removing {}", path.display()), e));
                }
            }
        }

        debug!(
            "Consolidated {} legacy usage markers for space {}",
            legacy.len(),
            record.name
        );
        read_mtime(&marker)
    }

    /// Touch the usage marker and return the new timestamp
    ///
    /// The timestamp never moves backwards, even with concurrent callers.
    pub fn update_last_usage(&self, record: &mut SpaceRecord) -> SpaceResult<DateTime<Utc>> {
        let marker = record.file(files::LAST_USAGE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&marker)
            .map_err(|e| SpaceError::io(format!("opening {}", marker.display()), e))?;
        let metadata = file
            .metadata()
            .map_err(|e| SpaceError::io(format!("reading metadata of {}", marker.display()), e))?;
        drop(file);

        let target = FileTime::now().max(FileTime::from_last_modification_time(&metadata));
        filetime::set_file_mtime(&marker, target)
            .map_err(|e| SpaceError::io(format!("setting mtime of {}", marker.display()), e))?;

        let ts = filetime_to_datetime(target);
        record.last_usage = Some(ts);
        Ok(ts)
    }

    /// Create a new space directory with a fresh name in `Created` state
    pub fn create_space(&self) -> SpaceResult<SpaceRecord> {
        fs::create_dir_all(&self.base_dir).map_err(|e| {
            SpaceError::io(format!("creating directory {}", self.base_dir.display()), e)
        })?;

        for _ in 0..CREATE_ATTEMPTS {
            let mut record = SpaceRecord::new(&self.base_dir, SpaceName::generate());
            match fs::create_dir(&record.path) {
                Ok(()) => {
                    self.write_status(&mut record, SpaceStatus::Created)?;
                    debug!("Created space directory {}", record.path.display());
                    return Ok(record);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(SpaceError::io(
                        format!("creating directory {}", record.path.display()),
                        e,
                    ))
                }
            }
        }

        Err(SpaceError::Internal(
            "could not pick an unused space name".to_string(),
        ))
    }

    /// Delete a space directory and everything in it
    pub fn remove_space(&self, record: &SpaceRecord) -> SpaceResult<()> {
        match fs::remove_dir_all(&record.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpaceError::io(
                format!("removing space {}", record.path.display()),
                e,
            )),
        }
    }

    pub fn write_status(&self, record: &mut SpaceRecord, status: SpaceStatus) -> SpaceResult<()> {
        write_atomic(&record.file(files::STATE), status.as_marker())?;
        record.status = status;
        Ok(())
    }

    pub fn mark_damaged(&self, record: &mut SpaceRecord, reason: &str) -> SpaceResult<()> {
        write_atomic(&record.file(files::DAMAGED), reason)?;
        record.damaged = true;
        Ok(())
    }

    pub fn clear_damaged(&self, record: &mut SpaceRecord) -> SpaceResult<()> {
        remove_if_exists(&record.file(files::DAMAGED))?;
        record.damaged = false;
        Ok(())
    }

    /// Read the spec the space was last built from
    ///
    /// `Ok(None)` when either identity file is missing.
    pub fn read_identity(&self, record: &SpaceRecord) -> SpaceResult<Option<EnvironmentSpec>> {
        let Some(text) = read_optional(&record.file(files::SPEC_CONTENT))? else {
            return Ok(None);
        };
        let Some(path) = read_optional(&record.file(files::SPEC_PATH))? else {
            return Ok(None);
        };
        Ok(Some(EnvironmentSpec::new(text, path.trim())))
    }

    pub fn write_identity(&self, record: &SpaceRecord, spec: &EnvironmentSpec) -> SpaceResult<()> {
        write_atomic(&record.file(files::SPEC_CONTENT), &spec.text)?;
        write_atomic(
            &record.file(files::SPEC_PATH),
            &spec.path.to_string_lossy(),
        )
    }

    /// Remove identity, captured environment and usage marker
    pub fn clear_identity(&self, record: &mut SpaceRecord) -> SpaceResult<()> {
        for name in [
            files::SPEC_CONTENT,
            files::SPEC_PATH,
            files::CAPTURED_ENV,
            files::LAST_USAGE,
        ] {
            remove_if_exists(&record.file(name))?;
        }
        record.last_usage = None;
        Ok(())
    }

    pub fn read_captured_env(&self, record: &SpaceRecord) -> SpaceResult<Option<CapturedEnv>> {
        match read_optional(&record.file(files::CAPTURED_ENV))? {
            Some(content) => Ok(Some(serde_json::from_str(&content)?)),
            None => Ok(None),
        }
    }

    pub fn write_captured_env(&self, record: &SpaceRecord, env: &CapturedEnv) -> SpaceResult<()> {
        let content = serde_json::to_string_pretty(env)?;
        write_atomic(&record.file(files::CAPTURED_ENV), &content)
    }

    /// Record the current pid as requester (best effort)
    pub fn write_requested_pid(&self, record: &mut SpaceRecord) {
        let pid = std::process::id();
        match fs::write(record.file(files::REQUESTED_PID), pid.to_string()) {
            Ok(()) => record.requested_pid = Some(pid),
            Err(e) => debug!("Could not write requester pid for {}: {}", record.name, e),
        }
    }
}

fn filetime_to_datetime(ft: FileTime) -> DateTime<Utc> {
    DateTime::from_timestamp(ft.unix_seconds(), ft.nanoseconds()).unwrap_or_else(Utc::now)
}

fn read_mtime(path: &Path) -> SpaceResult<Option<DateTime<Utc>>> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(filetime_to_datetime(
            FileTime::from_last_modification_time(&metadata),
        ))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SpaceError::io(
            format!("reading metadata of {}", path.display()),
            e,
        )),
    }
}

fn read_optional(path: &Path) -> SpaceResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SpaceError::io(format!("reading {}", path.display()), e)),
    }
}

fn remove_if_exists(path: &Path) -> SpaceResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SpaceError::io(format!("removing {}", path.display()), e)),
    }
}

/// Write through a temp file and rename so readers never see a partial file
fn write_atomic(path: &Path, contents: &str) -> SpaceResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()));

    fs::write(&tmp, contents).map_err(|e| SpaceError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, path).map_err(|e| SpaceError::io(format!("renaming to {}", path.display()), e))
}
