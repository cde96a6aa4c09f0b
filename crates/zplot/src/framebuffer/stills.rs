//! Pre-formatted still images: raw dumps in the device's native layout,
//! as written by the screenshot action.

use super::screenshot::EXTENSION;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Numeric sort key made of every digit in the file name, so `frame_2.fb`
/// sorts before `frame_10.fb`. Names without digits sort first.
pub fn digit_key(path: &Path) -> u128 {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| {
            name.chars()
                .filter_map(|c| c.to_digit(10))
                .fold(0u128, |acc, d| acc.saturating_mul(10).saturating_add(d as u128))
        })
        .unwrap_or(0)
}

/// `.fb` files directly inside `dir`, in numeric order.
pub fn splash_frames(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|e| e == EXTENSION) {
            frames.push(path.to_path_buf());
        }
    }
    frames.sort_by(|a, b| digit_key(a).cmp(&digit_key(b)).then_with(|| a.cmp(b)));
    Ok(frames)
}

/// Play order for a splash: forward up to the last frame, then all the way
/// back, so the last frame is shown once and the sequence ends on the first.
pub fn bounce<T: Clone>(frames: &[T]) -> Vec<T> {
    let Some((_, head)) = frames.split_last() else {
        return Vec::new();
    };
    head.iter().chain(frames.iter().rev()).cloned().collect()
}
