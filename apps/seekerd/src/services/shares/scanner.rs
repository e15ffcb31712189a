//! Filesystem scanning for the share index.
//!
//! Expands configured roots into a fresh [`ShareSnapshot`], applying filter
//! rules to masked paths and extracting audio metadata. Scanning is
//! blocking work; the share service runs it on a blocking thread.

use lofty::prelude::*;
use lofty::probe::Probe;
use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ConflictPolicy;
use crate::error::{AppError, Result};

use super::index::{FileAttributes, FileRecord, ShareSnapshot};

/// A compiled filter rule. Rules apply to masked paths; a leading `!` in
/// the configured string marks an include rule, everything else excludes.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub include: bool,
    pub pattern: Regex,
}

impl FilterRule {
    pub fn parse(raw: &str) -> Result<Self> {
        let (include, pattern) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let pattern = Regex::new(pattern)
            .map_err(|e| AppError::BadRequest(format!("invalid share filter {}: {}", raw, e)))?;
        Ok(Self { include, pattern })
    }

    pub fn compile_all(raw: &[String]) -> Result<Vec<Self>> {
        raw.iter().map(|r| Self::parse(r)).collect()
    }
}

/// Whether a masked path survives the filter chain. Include rules override
/// earlier exclusions; the last matching rule wins.
fn permitted(masked_path: &str, filters: &[FilterRule]) -> bool {
    let mut allowed = true;
    for rule in filters {
        if rule.pattern.is_match(masked_path) {
            allowed = rule.include;
        }
    }
    allowed
}

/// Result of one full scan.
pub struct ScanOutcome {
    pub snapshot: ShareSnapshot,
    pub files: u64,
    pub directories: u64,
    pub excluded: u64,
}

/// Assign a stable mask to each root: the last path segment, disambiguated
/// with a numeric suffix on collision.
pub fn assign_masks(roots: &[PathBuf]) -> Vec<(String, PathBuf)> {
    let mut assigned: Vec<(String, PathBuf)> = Vec::with_capacity(roots.len());
    for root in roots {
        let base = root
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shares".to_string());

        let mut mask = base.clone();
        let mut suffix = 2;
        while assigned.iter().any(|(m, _)| *m == mask) {
            mask = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        assigned.push((mask, root.clone()));
    }
    assigned
}

/// Scan all roots into a fresh snapshot.
///
/// `progress` is invoked with whole percents, at integer boundaries and
/// phase transitions only, never per file.
pub fn scan(
    host: &str,
    roots: &[PathBuf],
    filters: &[FilterRule],
    on_conflict: ConflictPolicy,
    progress: &(dyn Fn(u8) + Send + Sync),
) -> Result<ScanOutcome> {
    let mut snapshot = ShareSnapshot::empty(host)?;
    let mut excluded: u64 = 0;

    progress(0);

    // Enumerate first so progress can be reported against a known total.
    let mut pending: Vec<(String, PathBuf)> = Vec::new();
    for (mask, root) in assign_masks(roots) {
        if !root.is_dir() {
            tracing::warn!(root = ?root, "Share root missing or not a directory, skipping");
            continue;
        }
        snapshot.add_mask(&mask, Some(&root))?;

        let mut walker = WalkDir::new(&root).follow_links(false).into_iter();
        loop {
            let entry = match walker.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    tracing::warn!(root = ?root, error = %e, "Skipping unreadable entry");
                    continue;
                }
                None => break,
            };
            if entry.depth() == 0 {
                continue;
            }

            let masked = masked_path(&mask, &root, entry.path());
            if !permitted(&masked, filters) {
                excluded += 1;
                if entry.file_type().is_dir() {
                    tracing::debug!(directory = %masked, "Excluded by filter");
                    walker.skip_current_dir();
                }
                continue;
            }

            if entry.file_type().is_file() {
                pending.push((masked, entry.path().to_path_buf()));
            }
        }
    }

    let total = pending.len();
    let mut last_percent: u8 = 0;
    for (i, (masked, path)) in pending.iter().enumerate() {
        match build_record(host, masked, path) {
            Some(record) => {
                let fresh = snapshot.insert_file(&record)?;
                if !fresh {
                    tracing::warn!(
                        masked = %masked,
                        "Duplicate masked path, keeping later insertion"
                    );
                    if on_conflict == ConflictPolicy::Error {
                        return Err(AppError::BadRequest(format!(
                            "duplicate masked path: {}",
                            masked
                        )));
                    }
                }
            }
            // I/O errors on individual files skip the file.
            None => excluded += 1,
        }

        let percent = (((i + 1) * 100) / total.max(1)) as u8;
        if percent != last_percent {
            last_percent = percent;
            progress(percent);
        }
    }

    progress(100);

    Ok(ScanOutcome {
        files: snapshot.file_count(),
        directories: snapshot.directory_count(),
        excluded,
        snapshot,
    })
}

/// `mask\relative\path` with backslash separators, as seen on the wire.
fn masked_path(mask: &str, root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let relative_str = relative.to_string_lossy().replace('/', "\\");
    if relative_str.is_empty() {
        mask.to_string()
    } else {
        format!("{}\\{}", mask, relative_str)
    }
}

fn build_record(host: &str, masked: &str, path: &Path) -> Option<FileRecord> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Failed to stat file, skipping");
            return None;
        }
    };

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let attributes = if is_audio_file(&extension) {
        extract_audio_attributes(path, &extension)
    } else {
        FileAttributes::default()
    };

    Some(FileRecord {
        host: host.to_string(),
        masked_path: masked.to_string(),
        size: metadata.len(),
        extension,
        attributes,
    })
}

/// Check if a file extension is a supported audio format.
fn is_audio_file(extension: &str) -> bool {
    matches!(
        extension,
        "mp3" | "flac" | "ogg" | "m4a" | "aac" | "wav" | "wma" | "ape" | "opus" | "aiff"
    )
}

fn is_lossless(extension: &str) -> bool {
    matches!(extension, "flac" | "wav" | "ape" | "aiff")
}

/// Extract audio attributes from a file using lofty.
fn extract_audio_attributes(path: &Path, extension: &str) -> FileAttributes {
    let probe_result = match Probe::open(path) {
        Ok(probe) => probe.read(),
        Err(e) => {
            tracing::trace!(path = ?path, error = %e, "Failed to probe audio file");
            return FileAttributes::default();
        }
    };

    let tagged_file = match probe_result {
        Ok(f) => f,
        Err(e) => {
            tracing::trace!(path = ?path, error = %e, "Failed to read audio metadata");
            return FileAttributes::default();
        }
    };

    let properties = tagged_file.properties();

    FileAttributes {
        bitrate: properties.audio_bitrate(),
        duration: Some(properties.duration().as_secs() as u32),
        sample_rate: properties.sample_rate(),
        bit_depth: properties.bit_depth().map(|b| b as u32),
        vbr: None, // lofty doesn't directly expose VBR info
        lossless: Some(is_lossless(extension)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn no_progress() -> impl Fn(u8) + Send + Sync {
        |_| {}
    }

    #[test]
    fn test_assign_masks_disambiguates() {
        let roots = vec![
            PathBuf::from("/m/music"),
            PathBuf::from("/backup/music"),
            PathBuf::from("/x/other"),
        ];
        let masks = assign_masks(&roots);
        assert_eq!(masks[0].0, "music");
        assert_eq!(masks[1].0, "music_2");
        assert_eq!(masks[2].0, "other");
    }

    #[test]
    fn test_scan_two_roots() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("song.mp3"), vec![0u8; 1024]).unwrap();
        fs::write(b.path().join("track.flac"), vec![0u8; 2048]).unwrap();

        let roots = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let outcome = scan(
            "local",
            &roots,
            &[],
            ConflictPolicy::Replace,
            &no_progress(),
        )
        .unwrap();

        assert_eq!(outcome.files, 2);
        assert_eq!(outcome.directories, 2);
        assert_eq!(outcome.excluded, 0);

        let results = outcome.snapshot.search("song").unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].masked_path.ends_with("song.mp3"));

        let resolved = outcome.snapshot.resolve(&results[0].masked_path).unwrap();
        assert_eq!(resolved, a.path().join("song.mp3"));
    }

    #[test]
    fn test_missing_root_degrades_gracefully() {
        let a = TempDir::new().unwrap();
        fs::write(a.path().join("kept.mp3"), b"data").unwrap();

        let roots = vec![a.path().to_path_buf(), PathBuf::from("/does/not/exist")];
        let outcome = scan(
            "local",
            &roots,
            &[],
            ConflictPolicy::Replace,
            &no_progress(),
        )
        .unwrap();
        assert_eq!(outcome.files, 1);
    }

    #[test]
    fn test_exclude_filter_counts() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("keep.mp3"), b"data").unwrap();
        fs::write(root.path().join("drop.tmp"), b"data").unwrap();

        let filters = FilterRule::compile_all(&[r"\.tmp$".to_string()]).unwrap();
        let outcome = scan(
            "local",
            &[root.path().to_path_buf()],
            &filters,
            ConflictPolicy::Replace,
            &no_progress(),
        )
        .unwrap();

        assert_eq!(outcome.files, 1);
        assert_eq!(outcome.excluded, 1);
    }

    #[test]
    fn test_include_rule_overrides_exclusion() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("one.tmp"), b"data").unwrap();
        fs::write(root.path().join("two.tmp"), b"data").unwrap();

        let filters =
            FilterRule::compile_all(&[r"\.tmp$".to_string(), r"!one\.tmp$".to_string()]).unwrap();
        let outcome = scan(
            "local",
            &[root.path().to_path_buf()],
            &filters,
            ConflictPolicy::Replace,
            &no_progress(),
        )
        .unwrap();

        assert_eq!(outcome.files, 1);
        assert_eq!(outcome.excluded, 1);
    }

    #[test]
    fn test_repeat_scan_is_indistinguishable() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("album")).unwrap();
        fs::write(root.path().join("album/one.mp3"), vec![1u8; 64]).unwrap();
        fs::write(root.path().join("album/two.mp3"), vec![2u8; 128]).unwrap();

        let roots = vec![root.path().to_path_buf()];
        let first = scan(
            "local",
            &roots,
            &[],
            ConflictPolicy::Replace,
            &no_progress(),
        )
        .unwrap();
        let second = scan(
            "local",
            &roots,
            &[],
            ConflictPolicy::Replace,
            &no_progress(),
        )
        .unwrap();

        assert_eq!(first.files, second.files);
        assert_eq!(first.directories, second.directories);
        for record in first.snapshot.search("mp3").unwrap() {
            assert_eq!(
                first.snapshot.resolve(&record.masked_path).unwrap(),
                second.snapshot.resolve(&record.masked_path).unwrap()
            );
        }
    }

    #[test]
    fn test_progress_reported_at_boundaries() {
        let root = TempDir::new().unwrap();
        for i in 0..7 {
            fs::write(root.path().join(format!("f{}.mp3", i)), b"x").unwrap();
        }

        let seen = std::sync::Mutex::new(Vec::new());
        let outcome = scan(
            "local",
            &[root.path().to_path_buf()],
            &[],
            ConflictPolicy::Replace,
            &|p| seen.lock().unwrap().push(p),
        )
        .unwrap();
        assert_eq!(outcome.files, 7);

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        // Whole percents only, strictly increasing after the initial 0.
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }
}
