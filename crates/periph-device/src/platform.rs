//! Host platform selection for ffmpeg input/output devices.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }
}

/// `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.<ext>`
pub fn timestamped(dir: &Path, prefix: &str, ext: &str, now: DateTime<Local>) -> PathBuf {
    dir.join(format!("{prefix}_{}.{ext}", now.format("%Y%m%d_%H%M%S")))
}

/// Resolve a caller-supplied save path. A path without an extension, or one
/// ending in a separator, names a directory for a timestamped file.
pub fn resolve_output(
    requested: Option<&Path>,
    default_dir: &Path,
    prefix: &str,
    ext: &str,
    now: DateTime<Local>,
) -> PathBuf {
    match requested {
        None => timestamped(default_dir, prefix, ext, now),
        Some(path) if looks_like_dir(path) => timestamped(path, prefix, ext, now),
        Some(path) => path.to_path_buf(),
    }
}

fn looks_like_dir(path: &Path) -> bool {
    let raw = path.as_os_str().to_string_lossy();
    raw.ends_with('/') || raw.ends_with('\\') || path.extension().is_none()
}

/// Devices listed by ffmpeg's avfoundation or dshow `-list_devices`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListedDevices {
    /// `(index, name)` in listing order.
    pub video: Vec<(u32, String)>,
    pub audio: Vec<(u32, String)>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Video,
    Audio,
}

/// Strip ffmpeg's `[indev @ 0x...] ` log prefix.
fn strip_log_prefix(line: &str) -> &str {
    match line.find("] ") {
        Some(i) if line.starts_with('[') => &line[i + 2..],
        _ => line,
    }
}

/// Parse `ffmpeg -f avfoundation -list_devices true -i ""` stderr.
pub fn parse_avfoundation_devices(stderr: &str) -> ListedDevices {
    let mut listed = ListedDevices::default();
    let mut section = Section::None;
    for line in stderr.lines().map(strip_log_prefix) {
        if line.contains("AVFoundation video devices") {
            section = Section::Video;
            continue;
        }
        if line.contains("AVFoundation audio devices") {
            section = Section::Audio;
            continue;
        }
        let Some(rest) = line.strip_prefix('[') else {
            continue;
        };
        let Some((index, name)) = rest.split_once("] ") else {
            continue;
        };
        let Ok(index) = index.parse::<u32>() else {
            continue;
        };
        let entry = (index, name.trim().to_string());
        match section {
            Section::Video => listed.video.push(entry),
            Section::Audio => listed.audio.push(entry),
            Section::None => {}
        }
    }
    listed
}

/// Parse `ffmpeg -list_devices true -f dshow -i dummy` stderr. Handles both
/// the sectioned layout and the newer `"name" (video)` suffix layout.
pub fn parse_dshow_devices(stderr: &str) -> ListedDevices {
    let mut listed = ListedDevices::default();
    let mut section = Section::None;
    for line in stderr.lines().map(strip_log_prefix) {
        let line = line.trim();
        if line.starts_with("DirectShow video devices") {
            section = Section::Video;
            continue;
        }
        if line.starts_with("DirectShow audio devices") {
            section = Section::Audio;
            continue;
        }
        if line.starts_with("Alternative name") || !line.starts_with('"') {
            continue;
        }
        let Some(end) = line[1..].find('"') else {
            continue;
        };
        let name = line[1..=end].to_string();
        let kind = match line[end + 2..].trim() {
            "(video)" => Section::Video,
            "(audio)" => Section::Audio,
            "(audio, video)" | "(video, audio)" => Section::Video,
            _ => section,
        };
        match kind {
            Section::Video => {
                let index = listed.video.len() as u32;
                listed.video.push((index, name));
            }
            Section::Audio => {
                let index = listed.audio.len() as u32;
                listed.audio.push((index, name));
            }
            Section::None => {}
        }
    }
    listed
}
