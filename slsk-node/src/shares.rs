//! Building a share index from directories on disk.

use std::path::{Path, PathBuf};

use slsk_core::InMemoryShareIndex;
use tracing::{debug, info};

/// Walk `dirs` and index every regular file. Each directory is shared under its own name, and
/// virtual paths use `\` separators (`Music\Album\01.mp3`).
pub fn scan(dirs: &[PathBuf]) -> std::io::Result<InMemoryShareIndex> {
    let mut index = InMemoryShareIndex::new();
    for dir in dirs {
        let root = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shared".to_owned());
        walk(dir, &root, &mut index)?;
    }
    let (folders, files) = slsk_core::ShareIndex::counts(&index);
    info!(folders, files, "shares indexed");
    Ok(index)
}

fn walk(dir: &Path, virtual_dir: &str, index: &mut InMemoryShareIndex) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = format!("{virtual_dir}\\{name}");
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), &path, index)?;
        } else if file_type.is_file() {
            index.add_file(&path, entry.metadata()?.len());
        } else {
            debug!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slsk_core::{SearchQuery, ShareIndex};

    #[test]
    fn indexes_nested_files() {
        let root = std::env::temp_dir().join(format!("slsk-shares-{}", rand::random::<u64>()));
        let album = root.join("Music").join("Album");
        std::fs::create_dir_all(&album).unwrap();
        std::fs::write(album.join("01 Intro.flac"), b"abcd").unwrap();
        std::fs::write(root.join("Music").join("notes.txt"), b"x").unwrap();

        let index = scan(&[root.join("Music")]).unwrap();
        assert_eq!(index.counts(), (2, 2));
        assert!(index.contains("Music\\Album\\01 Intro.flac"));
        let hits = index.search(&SearchQuery::parse("intro"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].size, 4);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn missing_dir_is_error() {
        assert!(scan(&[PathBuf::from("/nonexistent/slsk-share")]).is_err());
    }
}
