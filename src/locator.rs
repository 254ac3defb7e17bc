use crate::protocol::{Candidate, LocatorMode};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};

pub const DESCRIPTOR_EXT: &str = "enc";

pub const REASON_DIRECT_MATCH: &str = "direct_match";
pub const REASON_UNIQUE_SCAN: &str = "unique_scan_result";
pub const REASON_USER_SELECTED: &str = "user_selected";

/// A resolved design database: the descriptor file plus its companion data
/// sibling (`<name>.enc.dat`, file or directory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignPair {
    pub enc_path: PathBuf,
    pub enc_dat_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocateOutcome {
    Selected {
        mode: LocatorMode,
        pair: DesignPair,
        candidates: Vec<Candidate>,
        selection_reason: &'static str,
    },
    /// More than one candidate; the caller must pick one and resume the job.
    NeedsSelection {
        mode: LocatorMode,
        candidates: Vec<Candidate>,
    },
    Failed {
        mode: LocatorMode,
        reason: String,
    },
}

/// Resolves a user query to a descriptor/data pair. Queries carrying a path
/// separator or an `.enc` suffix are treated as explicit paths; anything else
/// triggers a bounded-depth name scan below the working directory. Results
/// are sorted by path so repeated scans are deterministic.
#[derive(Debug, Clone)]
pub struct Locator {
    cwd: PathBuf,
    scan_depth: usize,
}

impl Locator {
    pub fn new(cwd: impl Into<PathBuf>, scan_depth: usize) -> Self {
        Self {
            cwd: cwd.into(),
            scan_depth,
        }
    }

    pub fn locate(&self, query: &str) -> LocateOutcome {
        if is_explicit_path(query) {
            self.locate_explicit(query)
        } else {
            self.locate_scan(query)
        }
    }

    fn locate_explicit(&self, query: &str) -> LocateOutcome {
        let mode = LocatorMode::ExplicitPath;
        let raw = Path::new(query);
        let enc_path = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.cwd.join(raw)
        };

        if !enc_path.is_file() {
            return LocateOutcome::Failed {
                mode,
                reason: format!("explicit_path_not_found: {}", enc_path.display()),
            };
        }
        let Some(enc_dat_path) = companion_for(&enc_path) else {
            return LocateOutcome::Failed {
                mode,
                reason: format!("enc_dat_missing: {}.dat", enc_path.display()),
            };
        };

        let pair = DesignPair {
            enc_path: absolute(&enc_path),
            enc_dat_path: absolute(&enc_dat_path),
        };
        let candidates = candidate_for(&pair.enc_path).into_iter().collect();
        LocateOutcome::Selected {
            mode,
            pair,
            candidates,
            selection_reason: REASON_DIRECT_MATCH,
        }
    }

    fn locate_scan(&self, query: &str) -> LocateOutcome {
        let mode = LocatorMode::NameScan;
        let wanted = format!("{query}.{DESCRIPTOR_EXT}");
        let mut hits = Vec::new();
        scan_for_descriptors(&self.cwd, &wanted, self.scan_depth, 0, &mut hits);
        hits.sort();

        let mut missing_companion = 0usize;
        let mut candidates = Vec::new();
        for enc_path in &hits {
            if companion_for(enc_path).is_none() {
                missing_companion += 1;
                continue;
            }
            if let Some(candidate) = candidate_for(enc_path) {
                candidates.push(candidate);
            }
        }
        candidates.sort_by(|a, b| a.path.cmp(&b.path));

        match candidates.len() {
            0 => {
                let reason = if missing_companion > 0 {
                    format!("enc_dat_missing: {missing_companion} descriptor(s) without data sibling")
                } else {
                    format!("no_candidates: no `{wanted}` within depth {}", self.scan_depth)
                };
                LocateOutcome::Failed { mode, reason }
            }
            1 => {
                let selected = &candidates[0];
                match pair_for_path(Path::new(&selected.path)) {
                    Ok(pair) => LocateOutcome::Selected {
                        mode,
                        pair,
                        candidates: candidates.clone(),
                        selection_reason: REASON_UNIQUE_SCAN,
                    },
                    Err(reason) => LocateOutcome::Failed { mode, reason },
                }
            }
            _ => LocateOutcome::NeedsSelection { mode, candidates },
        }
    }
}

fn is_explicit_path(query: &str) -> bool {
    query.contains('/')
        || query.contains('\\')
        || query.ends_with(&format!(".{DESCRIPTOR_EXT}"))
}

/// Companion data sibling of a descriptor: `<descriptor>.dat`, accepted as a
/// regular file or a directory.
pub fn companion_for(enc_path: &Path) -> Option<PathBuf> {
    let mut name = enc_path.as_os_str().to_os_string();
    name.push(".dat");
    let candidate = PathBuf::from(name);
    candidate.exists().then_some(candidate)
}

/// Rebuild a [`DesignPair`] from a previously recorded candidate path,
/// re-checking that both halves still exist. Used when a paused job resumes
/// with a user selection.
pub fn pair_for_path(enc_path: &Path) -> Result<DesignPair, String> {
    if !enc_path.is_file() {
        return Err(format!("explicit_path_not_found: {}", enc_path.display()));
    }
    let enc_dat_path = companion_for(enc_path)
        .ok_or_else(|| format!("enc_dat_missing: {}.dat", enc_path.display()))?;
    Ok(DesignPair {
        enc_path: absolute(enc_path),
        enc_dat_path: absolute(&enc_dat_path),
    })
}

fn scan_for_descriptors(
    dir: &Path,
    wanted: &str,
    max_depth: usize,
    depth: usize,
    hits: &mut Vec<PathBuf>,
) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if depth < max_depth {
                scan_for_descriptors(&path, wanted, max_depth, depth + 1, hits);
            }
        } else if file_type.is_file() && entry.file_name().to_str() == Some(wanted) {
            hits.push(absolute(&path));
        }
    }
}

fn candidate_for(enc_path: &Path) -> Option<Candidate> {
    let metadata = fs::metadata(enc_path).ok()?;
    let mtime = metadata
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();
    Some(Candidate {
        path: absolute(enc_path).display().to_string(),
        mtime,
        size: metadata.len(),
    })
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
