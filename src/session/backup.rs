// Best-effort copy of a take's files to backup folders
//
// Never overwrites and never fails the take: every problem is logged and
// collected in the report.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupReport {
    /// Files written, at their destination
    pub copied: Vec<PathBuf>,
    /// Destination path (or folder) and the reason it was skipped
    pub failed: Vec<(PathBuf, String)>,
}

impl BackupReport {
    pub fn summary(&self) -> String {
        if self.failed.is_empty() {
            format!("Backup: {} files copied", self.copied.len())
        } else {
            format!(
                "Backup: {} files copied, {} failed",
                self.copied.len(),
                self.failed.len()
            )
        }
    }
}

/// Files of the take in `output_dir` whose names start with `prefix`
fn take_files(output_dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        let is_take = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix));
        if is_take && entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn copy_new(source: &Path, target: &Path) -> io::Result<u64> {
    let mut output = OpenOptions::new().write(true).create_new(true).open(target)?;
    let mut input = File::open(source)?;
    io::copy(&mut input, &mut output)
}

fn describe(error: &io::Error) -> String {
    match error.kind() {
        ErrorKind::NotFound => "folder does not exist".to_string(),
        ErrorKind::PermissionDenied => "permission denied".to_string(),
        ErrorKind::AlreadyExists => "already exists, not overwritten".to_string(),
        _ => error.to_string(),
    }
}

/// Copy every file of the take into each destination folder
pub fn copy_take(output_dir: &Path, prefix: &str, destinations: &[PathBuf]) -> BackupReport {
    let mut report = BackupReport::default();

    let files = match take_files(output_dir, prefix) {
        Ok(files) => files,
        Err(e) => {
            log::warn!("[Backup] cannot list {}: {}", output_dir.display(), e);
            report.failed.push((output_dir.to_path_buf(), describe(&e)));
            return report;
        }
    };

    for destination in destinations {
        for file in &files {
            let Some(name) = file.file_name() else { continue };
            let target = destination.join(name);
            match copy_new(file, &target) {
                Ok(bytes) => {
                    log::debug!("[Backup] {} ({} bytes)", target.display(), bytes);
                    report.copied.push(target);
                }
                Err(e) => {
                    let reason = describe(&e);
                    log::warn!("[Backup] {}: {}", target.display(), reason);
                    report.failed.push((target, reason));
                }
            }
        }
    }

    log::info!("[Backup] {}", report.summary());
    report
}
