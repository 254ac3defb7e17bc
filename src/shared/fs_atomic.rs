use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

// Process-wide counter keeping concurrent staging files for the same target
// from colliding.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

fn staging_path_for(target: &Path) -> io::Result<(PathBuf, &Path)> {
    let Some(dir) = target.parent() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no directory to stage {} in", target.display()),
        ));
    };
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed");
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    let staged = dir.join(format!("{name}.wip.{}.{seq}", std::process::id()));
    Ok((staged, dir))
}

/// Publish `content` at `path` via a staging file in the same directory plus
/// a rename, so a concurrent reader sees either the previous content or the
/// new content in full. A staging file that fails mid-write is removed.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> io::Result<()> {
    let (staged, dir) = staging_path_for(path)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staged)?;
    if let Err(err) = file.write_all(content).and_then(|()| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(&staged);
        return Err(err);
    }
    drop(file);

    fs::rename(&staged, path)?;
    if cfg!(unix) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Like [`atomic_write_file`] but refuses to replace an existing file. Used
/// for write-once records (requests, acks).
pub fn atomic_write_new(path: &Path, content: &[u8]) -> io::Result<()> {
    if path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("refusing to overwrite {}", path.display()),
        ));
    }
    atomic_write_file(path, content)
}

/// Last `limit` lines of a text file, tolerant of invalid UTF-8.
pub fn tail_lines(path: &Path, limit: usize) -> io::Result<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.split(b'\n') {
        let raw = line?;
        lines.push(String::from_utf8_lossy(&raw).into_owned());
        if lines.len() > limit {
            lines.remove(0);
        }
    }
    if lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    Ok(lines)
}
