use std::path::Path;
use walkdir::WalkDir;

/// Counts corpus entries below `dirs`: regular, non-empty files.
///
/// Missing directories count as empty; libFuzzer ignores empty inputs.
pub fn count_seeds<P: AsRef<Path>>(dirs: &[P]) -> u64 {
    dirs.iter()
        .map(|dir| {
            WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| entry.metadata().map(|m| m.len() > 0).unwrap_or(false))
                .count() as u64
        })
        .sum()
}
