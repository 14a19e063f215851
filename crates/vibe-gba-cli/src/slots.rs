use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// `game.gba` slot 3 -> `game.ss3`, inside `dir` when given.
pub fn slot_path(rom: &Path, dir: Option<&Path>, slot: u8) -> PathBuf {
    let file = rom.with_extension(format!("ss{slot}"));
    match (dir, file.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => file,
    }
}

pub fn write_slot(path: &Path, blob: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, blob)
}

pub fn read_slot(path: &Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}
