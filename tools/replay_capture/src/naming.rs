//! Artifact file names and moves between the recorder, output and archive
//! directories.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, warn};

use crate::error::Result;

pub const DEFAULT_VIDEO_EXT: &str = "mp4";

#[must_use]
pub fn raw_artifact_name(index: usize, at: DateTime<Local>, ext: &str) -> String {
    format!("match_{index}_{}.{ext}", at.format("%Y%m%d_%H%M%S"))
}

#[must_use]
pub fn batch_summary_name(at: DateTime<Local>) -> String {
    format!("batch_{}.json", at.format("%Y%m%d_%H%M%S"))
}

/// `S<season>_<stage>_Match<N>_<YYYYmmdd>.<ext>`
#[must_use]
pub fn archive_file_name(
    season: &str,
    stage: &str,
    index: usize,
    at: DateTime<Local>,
    ext: &str,
) -> String {
    format!(
        "S{season}_{}_Match{index}_{}.{ext}",
        sanitize(stage),
        at.format("%Y%m%d")
    )
}

/// Archive destination under the season subdirectory, never overwriting an
/// existing file.
#[must_use]
pub fn archive_path(
    target_dir: &Path,
    season: &str,
    stage: &str,
    index: usize,
    at: DateTime<Local>,
    ext: &str,
) -> PathBuf {
    let season_dir = target_dir.join(format!("S{season}"));
    unique_path(season_dir.join(archive_file_name(season, stage, index, at, ext)))
}

/// `name.ext`, then `name_2.ext`, `name_3.ext`, ... until unused.
#[must_use]
pub fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut counter = 2;
    loop {
        let candidate = parent.join(format!("{stem}_{counter}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[must_use]
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_VIDEO_EXT.to_string())
}

/// Rename, falling back to copy + remove when the directories sit on
/// different volumes.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => {}
        Err(err) => {
            debug!(error = %err, "rename failed, copying instead");
            fs::copy(from, to)?;
            if let Err(err) = fs::remove_file(from) {
                warn!(path = %from.display(), error = %err, "source left behind after copy");
            }
        }
    }
    debug!(from = %from.display(), to = %to.display(), "moved artifact");
    Ok(())
}

fn sanitize(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{Local, TimeZone};

    use super::{archive_path, batch_summary_name, move_file, raw_artifact_name, unique_path};

    #[test]
    fn raw_name_carries_index_and_timestamp() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).single().expect("time");
        assert_eq!(raw_artifact_name(3, at, "mp4"), "match_3_20240309_070501.mp4");
        assert_eq!(batch_summary_name(at), "batch_20240309_070501.json");
    }

    #[test]
    fn archive_path_uses_season_dir_and_suffixes_collisions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let at = Local.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).single().expect("time");

        let first = archive_path(dir.path(), "7", "Top 8", 2, at, "mp4");
        assert_eq!(first, dir.path().join("S7").join("S7_Top_8_Match2_20240309.mp4"));

        fs::create_dir_all(first.parent().expect("parent")).expect("mkdir");
        fs::write(&first, b"x").expect("write");
        let second = archive_path(dir.path(), "7", "Top 8", 2, at, "mp4");
        assert_eq!(second, dir.path().join("S7").join("S7_Top_8_Match2_20240309_2.mp4"));

        fs::write(&second, b"x").expect("write");
        assert_eq!(
            unique_path(first),
            dir.path().join("S7").join("S7_Top_8_Match2_20240309_3.mp4")
        );
    }

    #[test]
    fn move_creates_destination_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let from = dir.path().join("clip.mkv");
        fs::write(&from, b"video").expect("write");
        let to = dir.path().join("out").join("match_1.mkv");
        move_file(&from, &to).expect("move");
        assert!(!from.exists());
        assert_eq!(fs::read(&to).expect("read"), b"video");
    }
}
