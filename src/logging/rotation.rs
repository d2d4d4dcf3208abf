use std::{
    collections::VecDeque,
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use eyre::ensure;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::{
    config::DATE_PLACEHOLDER,
    error::{ErrorChannel, LogError},
};

const GZ_EXTENSION: &str = "gz";

/// A filename pattern split around its single date placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePattern {
    prefix: String,
    suffix: String,
}

impl FilePattern {
    pub fn parse(pattern: &str) -> eyre::Result<Self> {
        ensure!(
            !pattern.contains(['/', '\\']),
            "'{}' must be a file name, not a path",
            pattern
        );
        ensure!(
            pattern.matches(DATE_PLACEHOLDER).count() == 1,
            "'{}' must contain {} exactly once",
            pattern,
            DATE_PLACEHOLDER
        );

        let (prefix, suffix) = pattern
            .split_once(DATE_PLACEHOLDER)
            .unwrap_or((pattern, ""));

        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    pub fn file_name(&self, date: NaiveDate, date_pattern: &str) -> String {
        format!("{}{}{}", self.prefix, date.format(date_pattern), self.suffix)
    }

    /// Recover the date from a file produced by this pattern, compressed or not.
    pub fn date_of(&self, file_name: &str, date_pattern: &str) -> Option<NaiveDate> {
        let name = file_name
            .strip_suffix(".gz")
            .unwrap_or(file_name)
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;

        NaiveDate::parse_from_str(name, date_pattern).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedFile {
    pub date: NaiveDate,
    pub path: PathBuf,
}

/// Bookkeeping for one sink's daily files. The open handle itself lives with the sink.
#[derive(Debug)]
pub struct RotationState {
    pub current_date: NaiveDate,
    pub current_path: PathBuf,
    retained: VecDeque<RetainedFile>,
    max_retained: usize,
}

impl RotationState {
    pub fn new(current_date: NaiveDate, current_path: PathBuf, max_retained: usize) -> Self {
        Self {
            current_date,
            current_path,
            retained: VecDeque::new(),
            max_retained,
        }
    }

    /// Daily granularity. Records stamped before the active day stay in the active file.
    pub fn should_rotate(&self, date: NaiveDate) -> bool {
        date > self.current_date
    }

    pub fn retained(&self) -> impl Iterator<Item = &RetainedFile> {
        self.retained.iter()
    }

    /// Retire the active file and make `next_path` the active one. Returns the entry
    /// for the retired file so the caller can compress it once its handle is closed.
    pub fn advance(&mut self, date: NaiveDate, next_path: PathBuf) -> RetainedFile {
        let retired = RetainedFile {
            date: self.current_date,
            path: std::mem::replace(&mut self.current_path, next_path),
        };
        self.current_date = date;
        self.retained.push_back(retired.clone());
        retired
    }

    pub fn replace_retained_path(&mut self, date: NaiveDate, path: PathBuf) {
        if let Some(entry) = self.retained.iter_mut().find(|f| f.date == date) {
            entry.path = path;
        }
    }

    /// Drop the oldest entries over the cap, returning them for deletion.
    pub fn evict(&mut self) -> Vec<RetainedFile> {
        let excess = self.retained.len().saturating_sub(self.max_retained);
        self.retained.drain(..excess).collect()
    }

    /// Register files left behind by earlier runs, oldest first.
    pub fn adopt(&mut self, mut found: Vec<RetainedFile>) {
        found.retain(|f| f.date < self.current_date && f.path != self.current_path);
        found.sort_by_key(|f| f.date);
        found.dedup_by_key(|f| f.date);
        for file in found.into_iter().rev() {
            self.retained.push_front(file);
        }
    }
}

/// Scan `dir` for files belonging to `pattern`, plain or compressed.
pub fn discover(
    dir: &Path,
    pattern: &FilePattern,
    date_pattern: &str,
) -> io::Result<Vec<RetainedFile>> {
    let mut found: Vec<RetainedFile> = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| pattern.date_of(n, date_pattern))
        else {
            continue;
        };

        found.push(RetainedFile { date, path });
    }

    Ok(found)
}

/// Collapse days found both plain and compressed to a single file. Such a pair means
/// compression was interrupted: the archive is kept when it decodes completely,
/// otherwise the plain file is kept. The other copy is deleted. Days on or after
/// `before` are left alone.
pub fn settle_duplicates(
    mut found: Vec<RetainedFile>,
    before: NaiveDate,
    errors: &ErrorChannel,
) -> Vec<RetainedFile> {
    // Plain before compressed within a day.
    found.sort_by_key(|f| (f.date, is_compressed(&f.path)));

    let mut settled: Vec<RetainedFile> = Vec::with_capacity(found.len());
    for file in found {
        match settled.last_mut() {
            Some(plain) if plain.date == file.date && file.date < before => {
                if is_complete_archive(&file.path) {
                    if let Err(e) = remove(plain) {
                        errors.report(e);
                    }
                    plain.path = file.path;
                } else if let Err(e) = remove(&file) {
                    errors.report(e);
                }
            }
            _ => settled.push(file),
        }
    }

    settled
}

fn is_complete_archive(path: &Path) -> bool {
    File::open(path)
        .map(|file| GzDecoder::new(BufReader::new(file)))
        .and_then(|mut decoder| io::copy(&mut decoder, &mut io::sink()))
        .is_ok()
}

fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == GZ_EXTENSION)
}

fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(GZ_EXTENSION);
    PathBuf::from(name)
}

/// Gzip a retired file next to itself and remove the original.
pub fn compress(path: &Path) -> Result<PathBuf, LogError> {
    let target = gz_path(path);
    let fail = |cause| LogError::Compression {
        path: path.to_path_buf(),
        cause,
    };

    let mut reader = BufReader::new(File::open(path).map_err(fail)?);
    let mut encoder = GzEncoder::new(File::create(&target).map_err(fail)?, Compression::default());

    let written = io::copy(&mut reader, &mut encoder).and_then(|_| encoder.finish());
    if let Err(cause) = written {
        let _ = fs::remove_file(&target);
        return Err(fail(cause));
    }

    fs::remove_file(path).map_err(fail)?;
    Ok(target)
}

pub fn remove(file: &RetainedFile) -> Result<(), LogError> {
    match fs::remove_file(&file.path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(cause) => Err(LogError::Rotation {
            path: file.path.clone(),
            cause,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn retained(d: u32, path: &str) -> RetainedFile {
        RetainedFile {
            date: day(d),
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn pattern_renders_and_recovers_dates() {
        let pattern = FilePattern::parse("%DATE%.error.log").unwrap();
        let name = pattern.file_name(day(5), "%Y-%m-%d");

        assert_eq!(name, "2024-03-05.error.log");
        assert_eq!(pattern.date_of(&name, "%Y-%m-%d"), Some(day(5)));
        assert_eq!(
            pattern.date_of("2024-03-05.error.log.gz", "%Y-%m-%d"),
            Some(day(5))
        );
        assert_eq!(pattern.date_of("2024-03-05.log", "%Y-%m-%d"), None);
        assert_eq!(pattern.date_of("notes.error.log", "%Y-%m-%d"), None);
    }

    #[test]
    fn rotates_only_forward() {
        let state = RotationState::new(day(5), PathBuf::from("a.log"), 3);

        assert!(!state.should_rotate(day(5)));
        assert!(state.should_rotate(day(6)));
        assert!(!state.should_rotate(day(4)));
    }

    #[test]
    fn evicts_oldest_first() {
        let mut state = RotationState::new(day(1), PathBuf::from("1.log"), 2);

        let mut evicted = Vec::new();
        for d in 2..=6 {
            state.advance(day(d), PathBuf::from(format!("{}.log", d)));
            evicted.extend(state.evict());
            assert!(state.retained().count() <= 2);
        }

        let evicted: Vec<_> = evicted.into_iter().map(|f| f.date).collect();
        assert_eq!(evicted, vec![day(1), day(2), day(3)]);

        let kept: Vec<_> = state.retained().map(|f| f.date).collect();
        assert_eq!(kept, vec![day(4), day(5)]);
    }

    #[test]
    fn adopt_skips_active_and_future_files() {
        let mut state = RotationState::new(day(5), PathBuf::from("5.log"), 10);
        state.adopt(vec![
            retained(3, "3.log"),
            retained(5, "5.log"),
            retained(1, "1.log.gz"),
            retained(9, "9.log"),
        ]);

        let kept: Vec<_> = state.retained().map(|f| f.date).collect();
        assert_eq!(kept, vec![day(1), day(3)]);
    }

    #[test]
    fn discover_finds_plain_and_compressed_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "2024-03-01.log",
            "2024-03-01.log.gz",
            "2024-03-02.log",
            "2024-03-02.error.log",
            "readme.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let pattern = FilePattern::parse("%DATE%.log").unwrap();
        let mut found = discover(dir.path(), &pattern, "%Y-%m-%d").unwrap();
        found.sort_by_key(|f| f.date);

        let names: Vec<_> = found
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(found.len(), 3);
        assert!(names.contains(&"2024-03-01.log".to_string()));
        assert!(names.contains(&"2024-03-01.log.gz".to_string()));
        assert!(names.contains(&"2024-03-02.log".to_string()));
    }

    #[test]
    fn interrupted_compression_keeps_a_complete_archive() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("2024-03-01.log");
        fs::write(&plain, "line\n").unwrap();
        let archive = compress(&plain).unwrap();
        fs::write(&plain, "line\n").unwrap();

        let errors = ErrorChannel::new();
        let pattern = FilePattern::parse("%DATE%.log").unwrap();
        let found = discover(dir.path(), &pattern, "%Y-%m-%d").unwrap();
        let settled = settle_duplicates(found, day(5), &errors);

        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].date, day(1));
        assert_eq!(settled[0].path, archive);
        assert!(!plain.exists());
        assert!(archive.exists());
        assert_eq!(errors.reported(), 0);
    }

    #[test]
    fn interrupted_compression_drops_a_truncated_archive() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("2024-03-01.log");
        let archive = dir.path().join("2024-03-01.log.gz");
        fs::write(&plain, "line\n").unwrap();
        fs::write(&archive, [0x1f, 0x8b, 0x08]).unwrap();

        let errors = ErrorChannel::new();
        let pattern = FilePattern::parse("%DATE%.log").unwrap();
        let found = discover(dir.path(), &pattern, "%Y-%m-%d").unwrap();
        let settled = settle_duplicates(found, day(5), &errors);

        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].path, plain);
        assert!(plain.exists());
        assert!(!archive.exists());
    }

    #[test]
    fn compress_replaces_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-03-01.log");
        fs::write(&path, "first line\nsecond line\n").unwrap();

        let target = compress(&path).unwrap();

        assert_eq!(target, dir.path().join("2024-03-01.log.gz"));
        assert!(!path.exists());

        let mut contents = String::new();
        GzDecoder::new(File::open(&target).unwrap())
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "first line\nsecond line\n");
    }

    #[test]
    fn compress_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = compress(&dir.path().join("gone.log")).unwrap_err();

        assert!(matches!(err, LogError::Compression { .. }));
    }
}
