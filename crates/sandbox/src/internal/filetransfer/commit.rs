use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Marker written into the temporary spool once an intermediate download is complete.
pub const COMMIT_FILENAME: &str = ".ccommit.con";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Directory receiving intermediate files before they are committed into `spool`.
pub fn tmp_spool_for(spool: &Path) -> PathBuf {
    with_suffix(spool, ".tmp")
}

pub fn swap_dir_for(spool: &Path) -> PathBuf {
    with_suffix(spool, ".swap")
}

pub(crate) fn write_commit_marker(tmp_spool: &Path) -> io::Result<()> {
    fs::write(tmp_spool.join(COMMIT_FILENAME), b"")
}

/// Moves completely received intermediate files from the temporary spool into `spool`.
///
/// Nothing happens unless the commit marker exists, so an interrupted download is
/// never committed. All files already present in `spool` are moved aside into the
/// swap directory before the first new file is renamed into place, and removed only
/// after every new file is in place. If moving aside fails, the files moved so far
/// are put back and the temporary spool is left untouched for another attempt.
pub fn commit_files(spool: &Path) -> io::Result<bool> {
    let tmp_spool = tmp_spool_for(spool);
    if !tmp_spool.join(COMMIT_FILENAME).exists() {
        return Ok(false);
    }
    let swap = swap_dir_for(spool);
    fs::create_dir_all(spool)?;
    fs::create_dir_all(&swap)?;

    let mut staged = Vec::new();
    for entry in fs::read_dir(&tmp_spool)? {
        let name = entry?.file_name();
        if name != COMMIT_FILENAME {
            staged.push(name);
        }
    }
    staged.sort();

    let mut moved_aside = Vec::new();
    for name in &staged {
        let target = spool.join(name);
        if fs::symlink_metadata(&target).is_err() {
            continue;
        }
        if let Err(error) = fs::rename(&target, swap.join(name)) {
            restore_moved_aside(spool, &swap, &moved_aside);
            return Err(error);
        }
        moved_aside.push(name);
    }

    for name in &staged {
        let target = spool.join(name);
        fs::rename(tmp_spool.join(name), &target)?;
        log::debug!("Committed {} into {}", target.display(), spool.display());
    }

    fs::remove_dir_all(&swap)?;
    fs::remove_dir_all(&tmp_spool)?;
    Ok(true)
}

fn restore_moved_aside(spool: &Path, swap: &Path, names: &[&OsString]) {
    for name in names {
        if let Err(error) = fs::rename(swap.join(name), spool.join(name)) {
            log::error!(
                "Cannot restore {} into {}: {error}",
                Path::new(name).display(),
                spool.display()
            );
        }
    }
}
