use crate::download::ExtensionFilter;
use crate::error::SyncError;
use std::fs;
use std::io;
use std::path::Path;

/// Counts the books already present in the target folder
#[cfg_attr(test, mockall::automock)]
pub trait FileCounter: Send + Sync {
    fn count(&self, folder: &Path, filter: &ExtensionFilter) -> Result<usize, SyncError>;
}

/// Recursive walk of the local target folder
///
/// A folder that does not exist yet holds zero books. Symlinks are not
/// followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FolderCounter;

impl FolderCounter {
    fn walk(dir: &Path, filter: &ExtensionFilter) -> io::Result<usize> {
        let mut total = 0;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                total += Self::walk(&entry.path(), filter)?;
            } else if file_type.is_file() && filter.matches(&entry.file_name().to_string_lossy()) {
                total += 1;
            }
        }

        Ok(total)
    }
}

impl FileCounter for FolderCounter {
    fn count(&self, folder: &Path, filter: &ExtensionFilter) -> Result<usize, SyncError> {
        if !folder.exists() {
            return Ok(0);
        }

        Self::walk(folder, filter).map_err(|source| SyncError::Count {
            folder: folder.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_counts_matching_files_recursively() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("a.epub").touch().unwrap();
        temp.child("B.EPUB").touch().unwrap();
        temp.child("notes.txt").touch().unwrap();
        temp.child("series/one/c.epub").touch().unwrap();
        temp.child("series/two/d.pdf").touch().unwrap();

        let filter = ExtensionFilter::new([".epub"]);
        assert_eq!(FolderCounter.count(temp.path(), &filter).unwrap(), 3);

        let filter = ExtensionFilter::new([".epub", ".pdf"]);
        assert_eq!(FolderCounter.count(temp.path(), &filter).unwrap(), 4);
    }

    #[test]
    fn test_missing_folder_counts_zero() {
        let temp = assert_fs::TempDir::new().unwrap();
        let filter = ExtensionFilter::new([".epub"]);

        let count = FolderCounter
            .count(&temp.path().join("does-not-exist"), &filter)
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_file_as_folder_is_count_error() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("plain.epub").touch().unwrap();
        let filter = ExtensionFilter::new([".epub"]);

        let result = FolderCounter.count(&temp.path().join("plain.epub"), &filter);
        assert_matches!(result, Err(SyncError::Count { .. }));
    }
}
