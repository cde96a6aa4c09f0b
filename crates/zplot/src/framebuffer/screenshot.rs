use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Extension of raw framebuffer dumps; `fbload` reads the same format back.
pub const EXTENSION: &str = "fb";

/// File name for a dump taken at `now`, e.g. `zplot_20240131_142501.250.fb`.
pub fn file_name<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("zplot_{}.{EXTENSION}", now.format("%Y%m%d_%H%M%S%.3f"))
}

/// Writes the raw device bytes to `dir`, creating it if needed.
pub fn write_screenshot<Tz>(dir: &Path, contents: &[u8], now: &DateTime<Tz>) -> io::Result<PathBuf>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    fs::create_dir_all(dir)?;
    let path = dir.join(file_name(now));
    fs::write(&path, contents)?;
    Ok(path)
}
