//! Per-file pipeline and batch driver.
//!
//! Each file runs homogenization, then dealiasing and superobing when
//! enabled. Errors recorded by a stage abandon the file; the batch always
//! continues with the next one.

use crate::core::dealias::Dealiaser;
use crate::core::diagnostics::Diagnostics;
use crate::core::homogenize::Homogenizer;
use crate::core::superob::Superober;
use crate::io::container::RadarContainer;
use crate::io::h5file::H5Container;
use crate::io::namelist::Settings;
use crate::types::{HoofError, HoofResult};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Number of trailing file stem characters holding the site code
const SITE_CODE_LEN: usize = 5;

/// Outcome of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Completed,
    /// A stage recorded errors; later stages did not run
    Abandoned { stage: &'static str },
    /// An unexpected error or panic escaped the pipeline
    Failed(String),
}

impl FileStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, FileStatus::Completed)
    }
}

/// Wall-clock time of each processing step
#[derive(Debug, Default)]
struct StageTimer {
    last: Option<Instant>,
    steps: Vec<(&'static str, Duration)>,
}

impl StageTimer {
    fn start() -> Self {
        Self {
            last: Some(Instant::now()),
            steps: Vec::new(),
        }
    }

    fn lap(&mut self, label: &'static str) {
        let now = Instant::now();
        if let Some(last) = self.last {
            self.steps.push((label, now - last));
        }
        self.last = Some(now);
    }

    fn report(&self) {
        log::info!("Timings:");
        for (label, duration) in &self.steps {
            log::info!("   {:<32}{} ms", format!("{}:", label), duration.as_millis());
        }
    }
}

/// Write the stage's messages and tell whether the file must be abandoned
fn flush_stage(diagnostics: &mut Diagnostics, log: &mut dyn Write, settings: &Settings) -> HoofResult<Option<FileStatus>> {
    let abandoned = diagnostics.has_errors();
    let stage = diagnostics.stage();
    diagnostics.write_to(log, &settings.log)?;
    if abandoned {
        log::warn!("{} failed, file abandoned", stage);
        Ok(Some(FileStatus::Abandoned { stage }))
    } else {
        Ok(None)
    }
}

/// Run all enabled stages from `source` into `target`, writing diagnostics to `log`
pub fn process_volume(
    settings: &Settings,
    site: &str,
    source: &dyn RadarContainer,
    target: &mut dyn RadarContainer,
    log: &mut dyn Write,
) -> HoofResult<FileStatus> {
    let mut timer = StageTimer::start();

    log::info!("Homogenizing data ...");
    let mut homogenizer = Homogenizer::new(settings, site);
    let quantities = homogenizer.sort(source)?;
    timer.lap("Homogenization");

    log::info!("Checking and writing homogenized data to file ...");
    homogenizer.check_and_write(source, target, &quantities)?;
    if let Some(status) = flush_stage(homogenizer.diagnostics_mut(), log, settings)? {
        return Ok(status);
    }
    timer.lap("Homogenization check/write");

    if !settings.dealias.enabled && !settings.superob.enabled {
        finish(settings, &timer);
        return Ok(FileStatus::Completed);
    }

    log::info!("Storing homogenized data for further use ...");
    let mut snapshot = homogenizer.store_data(source, &*target, &quantities)?;
    if let Some(status) = flush_stage(homogenizer.diagnostics_mut(), log, settings)? {
        return Ok(status);
    }
    timer.lap("Storing homogenized data");

    if settings.dealias.enabled {
        let mut dealiaser = Dealiaser::new(settings);
        log::info!("Checking VRAD data for dealiasing ...");
        dealiaser.check_data(&snapshot);
        if let Some(status) = flush_stage(dealiaser.diagnostics_mut(), log, settings)? {
            return Ok(status);
        }
        timer.lap("Checking dealiasing data");

        log::info!("Dealiasing ...");
        dealiaser.dealias(&mut snapshot);
        timer.lap("Dealiasing");

        log::info!("Writing dealiased data to file ...");
        dealiaser.write(&snapshot, target)?;
        if let Some(status) = flush_stage(dealiaser.diagnostics_mut(), log, settings)? {
            return Ok(status);
        }
        timer.lap("Writing dealiased data");
    }

    if settings.superob.enabled {
        let mut superober = Superober::new(settings);
        log::info!("Checking data for superobing ...");
        superober.check_data(&snapshot);
        if let Some(status) = flush_stage(superober.diagnostics_mut(), log, settings)? {
            return Ok(status);
        }
        timer.lap("Checking superobing data");

        log::info!("Superobing ...");
        superober.superob(&mut snapshot);
        timer.lap("Superobing");

        log::info!("Writing superobed data ...");
        superober.write(&snapshot, target)?;
        if let Some(status) = flush_stage(superober.diagnostics_mut(), log, settings)? {
            return Ok(status);
        }
        timer.lap("Writing superobed data");
    }

    finish(settings, &timer);
    Ok(FileStatus::Completed)
}

fn finish(settings: &Settings, timer: &StageTimer) {
    if settings.log.timing_to_console {
        timer.report();
    }
}

/// Per-file log, removed on drop when nothing was written to it
pub struct FileLog {
    file: Option<File>,
    path: PathBuf,
}

impl FileLog {
    pub fn create<P: AsRef<Path>>(path: P) -> HoofResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self { file: Some(file), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for FileLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "log file already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        // Close before inspecting the size
        drop(self.file.take());
        let empty = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(false);
        if empty {
            if let Err(e) = fs::remove_file(&self.path) {
                log::debug!("Could not remove empty log {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Site code of an input file: the last five characters of its stem
pub fn site_code(path: &Path) -> HoofResult<String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| HoofError::InvalidFormat(format!("no file stem in {}", path.display())))?;
    let chars: Vec<char> = stem.chars().collect();
    if chars.len() < SITE_CODE_LEN {
        return Err(HoofError::InvalidFormat(format!(
            "file name {} is too short to hold a site code",
            path.display()
        )));
    }
    Ok(chars[chars.len() - SITE_CODE_LEN..].iter().collect())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Process one HDF5 file into `output_dir`, catching anything that escapes the pipeline
pub fn process_file(settings: &Settings, input: &Path, output_dir: &Path) -> HoofResult<FileStatus> {
    let file_name = input
        .file_name()
        .ok_or_else(|| HoofError::InvalidFormat(format!("no file name in {}", input.display())))?;
    let stem = input.file_stem().unwrap_or(file_name).to_string_lossy().to_string();
    let mut log = FileLog::create(output_dir.join(format!("{}.log", stem)))?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> HoofResult<FileStatus> {
        let site = site_code(input)?;
        log::info!("Reading input file ...");
        let source = H5Container::open(input)?;
        let mut target = H5Container::create(output_dir.join(file_name))?;
        process_volume(settings, &site, &source, &mut target, &mut log)
    }));

    let reason = match outcome {
        Ok(Ok(status)) => return Ok(status),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    log::error!("Unknown error: {}", reason);
    writeln!(log, "{}: Unknown error: {}", settings.log.error_tag, reason)?;
    Ok(FileStatus::Failed(reason))
}

/// Counts and duration of a batch run
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub good: usize,
    pub all: usize,
    pub elapsed: Duration,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HOOF successfully analysed {} out of {} files in {} ms",
            self.good,
            self.all,
            self.elapsed.as_millis()
        )
    }
}

/// Input files directly inside `input_dir` with an accepted extension, in file name order
pub fn input_files(settings: &Settings, input_dir: &Path) -> HoofResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(input_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| HoofError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let accepted = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| settings.accepts_extension(e))
            .unwrap_or(false);
        if accepted {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Process every accepted file of `input_dir` one after another
pub fn run_batch(settings: &Settings, input_dir: &Path, output_dir: &Path) -> HoofResult<BatchSummary> {
    let start = Instant::now();
    let files = input_files(settings, input_dir)?;
    log::info!("Found {} input files in {}", files.len(), input_dir.display());

    let mut good = 0;
    for path in &files {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        log::info!("--------------- processing file {}", name);
        let file_start = Instant::now();

        match process_file(settings, path, output_dir) {
            Ok(FileStatus::Completed) => {
                good += 1;
                log::info!("{} done in {} ms", name, file_start.elapsed().as_millis());
            }
            Ok(status) => log::warn!("{} not completed: {:?}", name, status),
            Err(e) => log::error!("Unknown error: {}", e),
        }
    }

    Ok(BatchSummary {
        good,
        all: files.len(),
        elapsed: start.elapsed(),
    })
}
