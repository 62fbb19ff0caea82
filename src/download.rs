//! Single-file download primitive plus the filename and extension rules
//! every source shares.
//!
//! Files are streamed into a temporary file created next to the final
//! destination, synced to disk and then renamed into place. A failure at any
//! point before the rename drops the temporary file, so the destination path
//! never holds a partially written book.

use crate::error::SyncError;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

/// Prefix of the temporary files created while a download is in flight
pub const TEMP_FILE_PREFIX: &str = "bookshift-";

/// Flags that apply to a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Log mutating actions instead of performing them
    pub dry_run: bool,
    /// Draw a progress bar for each file download
    pub show_progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            show_progress: true,
        }
    }
}

/// Turn an arbitrary remote name into a safe local file name
///
/// The name is lower-cased and reduced to its last path component. Spaces and
/// `&_=+:` become `-`, anything that is not an ASCII letter, digit, `-` or `.`
/// is dropped, and runs of `-` collapse into one.
pub fn sanitize_file_name(name: &str) -> String {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    static DISALLOWED: OnceLock<Regex> = OnceLock::new();
    static DASHES: OnceLock<Regex> = OnceLock::new();

    let separators = SEPARATORS.get_or_init(|| Regex::new(r"[ &_=+:]").expect("valid regex"));
    let disallowed = DISALLOWED.get_or_init(|| Regex::new(r"[^a-z0-9.\-]").expect("valid regex"));
    let dashes = DASHES.get_or_init(|| Regex::new(r"-{2,}").expect("valid regex"));

    let lowered = name.to_lowercase();
    let base = lowered.rsplit('/').next().unwrap_or_default().trim();

    let replaced = separators.replace_all(base, "-");
    let cleaned = disallowed.replace_all(&replaced, "");
    dashes.replace_all(&cleaned, "-").into_owned()
}

/// Case-insensitive file extension filter
///
/// Extensions are normalized to lower case with a leading dot. An empty filter
/// accepts every name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().to_lowercase())
            .filter(|e| !e.is_empty() && e != ".")
            .map(|e| if e.starts_with('.') { e } else { format!(".{}", e) })
            .collect();
        normalized.sort();
        normalized.dedup();

        Self {
            extensions: normalized,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }

        let lowered = name.to_lowercase();
        self.extensions.iter().any(|ext| lowered.ends_with(ext.as_str()))
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }
}

/// What a call to [`AtomicFileWriter::download`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The file was written to its final path
    Written { path: PathBuf, bytes: u64 },
    /// A file already existed and overwriting is disabled
    Skipped(PathBuf),
    /// Dry run; nothing was written
    DryRun(PathBuf),
}

impl DownloadOutcome {
    pub fn path(&self) -> &Path {
        match self {
            DownloadOutcome::Written { path, .. } => path,
            DownloadOutcome::Skipped(path) | DownloadOutcome::DryRun(path) => path,
        }
    }

    /// Whether the file is now present at its destination
    pub fn is_stored(&self) -> bool {
        !matches!(self, DownloadOutcome::DryRun(_))
    }
}

/// Writes byte streams into the target folder using temp-file-then-rename
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicFileWriter {
    options: RunOptions,
}

impl AtomicFileWriter {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    /// Download one file into `dest_folder/dest_name`
    ///
    /// `open` is only called once it is certain the file will be written, so a
    /// skipped file never opens a remote stream. `size_hint` sizes the progress
    /// bar; pass 0 when the size is unknown.
    pub fn download<R, F>(
        &self,
        dest_folder: &Path,
        dest_name: &str,
        overwrite: bool,
        size_hint: u64,
        open: F,
    ) -> Result<DownloadOutcome, SyncError>
    where
        R: Read,
        F: FnOnce() -> io::Result<R>,
    {
        let fail = |source: io::Error| SyncError::Download {
            name: dest_name.to_string(),
            folder: dest_folder.to_path_buf(),
            source,
        };

        if dest_name.is_empty() || dest_name == "." || dest_name == ".." {
            return Err(fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid destination file name {:?}", dest_name),
            )));
        }

        let dest_path = dest_folder.join(dest_name);

        if !dest_folder.exists() {
            if self.options.dry_run {
                info!("[dry-run] Would create local folder {}", dest_folder.display());
            } else {
                debug!("Creating local folder {}", dest_folder.display());
                std::fs::create_dir_all(dest_folder).map_err(fail)?;
            }
        }

        if dest_path.exists() && !overwrite {
            debug!("Skipping {}, file already exists", dest_path.display());
            return Ok(DownloadOutcome::Skipped(dest_path));
        }

        if self.options.dry_run {
            info!("[dry-run] Would download {} to {}", dest_name, dest_path.display());
            return Ok(DownloadOutcome::DryRun(dest_path));
        }

        let mut reader = open().map_err(fail)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .tempfile_in(dest_folder)
            .map_err(fail)?;

        let progress = self.progress_bar(dest_name, size_hint);
        let copied = io::copy(&mut reader, &mut progress.wrap_write(temp.as_file_mut()));
        progress.finish_and_clear();
        let bytes = copied.map_err(fail)?;

        temp.as_file().sync_all().map_err(fail)?;
        temp.persist(&dest_path).map_err(|e| fail(e.error))?;

        info!("Downloaded {} ({} bytes)", dest_path.display(), bytes);
        Ok(DownloadOutcome::Written {
            path: dest_path,
            bytes,
        })
    }

    fn progress_bar(&self, name: &str, size: u64) -> ProgressBar {
        if !self.options.show_progress || size == 0 {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(size);
        if let Ok(style) =
            ProgressStyle::with_template("{msg} [{bar:30}] {bytes}/{total_bytes} ({eta})")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(name.to_string());
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_matches::assert_matches;
    use predicates::prelude::*;
    use quickcheck_macros::quickcheck;

    /// Reader that yields some bytes and then fails
    struct FailingReader {
        sent: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away"));
            }
            self.sent = true;
            let chunk = b"partial";
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    fn writer() -> AtomicFileWriter {
        AtomicFileWriter::new(RunOptions {
            dry_run: false,
            show_progress: false,
        })
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(TEMP_FILE_PREFIX))
            .collect()
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("Hello World.epub"), "hello-world.epub");
        assert_eq!(sanitize_file_name("../../weird\\path?.txt"), "weirdpath.txt");
        assert_eq!(
            sanitize_file_name("multi--dash  name .kepub"),
            "multi-dash-name-.kepub"
        );
        assert_eq!(sanitize_file_name("UPPER_case+Name.PDF"), "upper-case-name.pdf");
        assert_eq!(sanitize_file_name("  padded.epub  "), "padded.epub");
        assert_eq!(sanitize_file_name("a:b&c=d.epub"), "a-b-c-d.epub");
    }

    #[quickcheck]
    fn prop_sanitized_names_are_safe(name: String) -> bool {
        let safe = sanitize_file_name(&name);
        !safe.contains('/')
            && !safe.contains("--")
            && safe
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    }

    #[quickcheck]
    fn prop_sanitize_is_idempotent(name: String) -> bool {
        let once = sanitize_file_name(&name);
        sanitize_file_name(&once) == once
    }

    #[test]
    fn test_extension_filter_is_case_insensitive() {
        let filter = ExtensionFilter::new([".epub", "PDF", " .Kepub "]);
        assert_eq!(filter.extensions(), &[".epub", ".kepub", ".pdf"]);

        assert!(filter.matches("REPORT.EPUB"));
        assert!(filter.matches("scan.pdf"));
        assert!(filter.matches("book.kepub"));
        assert!(!filter.matches("notes.txt"));
        assert!(!filter.matches("epub"));
    }

    #[test]
    fn test_empty_extension_filter_matches_everything() {
        let filter = ExtensionFilter::new(Vec::<String>::new());
        assert!(filter.matches("anything.bin"));
    }

    #[quickcheck]
    fn prop_extension_match_ignores_case(stem: String) -> bool {
        let filter = ExtensionFilter::new([".epub"]);
        let lower = format!("{}.epub", stem);
        let upper = format!("{}.EPUB", stem);
        filter.matches(&lower) && filter.matches(&upper)
    }

    #[test]
    fn test_download_creates_folder_and_writes_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let folder = temp.path().join("nested").join("books");

        let outcome = writer()
            .download(&folder, "book.epub", false, 3, || Ok(&b"abc"[..]))
            .unwrap();

        assert_matches!(outcome, DownloadOutcome::Written { bytes: 3, .. });
        temp.child("nested/books/book.epub").assert("abc");
        assert!(temp_files(&folder).is_empty());
    }

    #[test]
    fn test_download_skips_existing_without_overwrite() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("book.epub").write_str("old").unwrap();

        let outcome = writer()
            .download(temp.path(), "book.epub", false, 3, || -> io::Result<&'static [u8]> {
                panic!("remote stream must not be opened for a skipped file")
            })
            .unwrap();

        assert_matches!(outcome, DownloadOutcome::Skipped(_));
        temp.child("book.epub").assert("old");
    }

    #[test]
    fn test_download_overwrites_when_enabled() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("book.epub").write_str("old").unwrap();

        writer()
            .download(temp.path(), "book.epub", true, 4, || Ok(&b"newer"[..4]))
            .unwrap();

        temp.child("book.epub").assert("newe");
    }

    #[test]
    fn test_failed_copy_leaves_no_partial_file() {
        let temp = assert_fs::TempDir::new().unwrap();

        let result = writer().download(temp.path(), "book.epub", false, 100, || {
            Ok(FailingReader { sent: false })
        });

        assert_matches!(result, Err(SyncError::Download { .. }));
        temp.child("book.epub").assert(predicate::path::missing());
        assert!(temp_files(temp.path()).is_empty());
    }

    #[test]
    fn test_failed_open_is_download_error() {
        let temp = assert_fs::TempDir::new().unwrap();

        let result = writer().download(temp.path(), "book.epub", false, 0, || -> io::Result<&'static [u8]> {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        });

        assert_matches!(result, Err(SyncError::Download { ref name, .. }) if name == "book.epub");
        temp.child("book.epub").assert(predicate::path::missing());
    }

    #[test]
    fn test_invalid_destination_names_rejected() {
        let temp = assert_fs::TempDir::new().unwrap();
        for name in ["", ".", ".."] {
            let result = writer().download(temp.path(), name, true, 0, || Ok(&b"x"[..]));
            assert_matches!(result, Err(SyncError::Download { .. }));
        }
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let temp = assert_fs::TempDir::new().unwrap();
        let folder = temp.path().join("missing");
        let dry = AtomicFileWriter::new(RunOptions {
            dry_run: true,
            show_progress: false,
        });

        let outcome = dry
            .download(&folder, "book.epub", false, 3, || -> io::Result<&'static [u8]> {
                panic!("dry run must not open the remote stream")
            })
            .unwrap();

        assert_matches!(outcome, DownloadOutcome::DryRun(_));
        assert!(!outcome.is_stored());
        assert!(!folder.exists());
    }
}
