use std::path::{Path, PathBuf};

/// Object keys look like `clients/wa/backups/<id>/files/...`.
const KEY_PREFIX_SEGMENTS: usize = 3;
const MIN_KEY_SEGMENTS: usize = 5;

/// Map an object key to its path relative to the download directory:
/// everything after `clients/wa/backups/`.
///
/// Keys that could escape the destination (empty, `.` or `..` segments,
/// backslashes, NULs) or that are too short to name a file are rejected.
pub fn relative_path_for_key(key: &str) -> Result<PathBuf, String> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() < MIN_KEY_SEGMENTS {
        return Err(format!("object key has too few segments: {:?}", key));
    }
    let mut path = PathBuf::new();
    for segment in &segments[KEY_PREFIX_SEGMENTS..] {
        if segment.is_empty()
            || *segment == "."
            || *segment == ".."
            || segment.contains('\\')
            || segment.contains('\0')
        {
            return Err(format!("object key has an unsafe segment: {:?}", key));
        }
        path.push(segment);
    }
    Ok(path)
}

/// Where a finished object lives.
pub fn local_path(directory: &Path, relative: &Path) -> PathBuf {
    directory.join(relative)
}

/// In-flight bytes are written next to the destination and renamed into
/// place once size and hash check out.
pub fn part_path(local: &Path) -> PathBuf {
    let mut name = local.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// `md5sum -c` expects forward slashes regardless of platform.
pub fn listing_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
