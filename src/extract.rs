use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use verbosio::verbose;
use walkdir::WalkDir;

use crate::error::{Result, TpmError};

/// Archive kinds accepted from upstream releases, dispatched on filename
/// suffix. Anything unrecognized is treated as a single executable blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarBz2,
    TarXz,
    Tar,
    Zip,
    Binary,
}

pub fn detect_format(name: &str) -> ArchiveFormat {
    let name = name.to_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        ArchiveFormat::TarGz
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
        ArchiveFormat::TarBz2
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        ArchiveFormat::TarXz
    } else if name.ends_with(".tar") {
        ArchiveFormat::Tar
    } else if name.ends_with(".zip") {
        ArchiveFormat::Zip
    } else {
        ArchiveFormat::Binary
    }
}

/// Unpacks `archive` into `dest`. Release archives routinely wrap all
/// content in a single top-level directory; when that is the case the
/// wrapper is flattened away so callers always see the payload directly.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let format = detect_format(&name);
    fs::create_dir_all(dest).map_err(|e| TpmError::fs(dest, e))?;
    verbose!(1, "extracting {} as {:?}", name, format);

    match format {
        ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::TarXz | ArchiveFormat::Tar => {
            let file = File::open(archive).map_err(|e| TpmError::fs(archive, e))?;
            let reader: Box<dyn Read> = match format {
                ArchiveFormat::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
                ArchiveFormat::TarBz2 => Box::new(bzip2::read::BzDecoder::new(file)),
                ArchiveFormat::TarXz => Box::new(xz2::read::XzDecoder::new(file)),
                _ => Box::new(file),
            };
            let mut tar = tar::Archive::new(reader);
            tar.set_preserve_permissions(true);
            tar.unpack(dest)
                .map_err(|e| TpmError::Integrity(format!("corrupt archive {name}: {e}")))?;
        }
        ArchiveFormat::Zip => {
            let file = File::open(archive).map_err(|e| TpmError::fs(archive, e))?;
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| TpmError::Integrity(format!("corrupt archive {name}: {e}")))?;
            for i in 0..zip.len() {
                let mut entry = zip
                    .by_index(i)
                    .map_err(|e| TpmError::Integrity(format!("corrupt archive {name}: {e}")))?;
                let Some(enclosed) = entry.enclosed_name().map(|p| dest.join(p)) else {
                    continue;
                };
                if entry.is_dir() {
                    fs::create_dir_all(&enclosed).map_err(|e| TpmError::fs(&enclosed, e))?;
                    continue;
                }
                if let Some(parent) = enclosed.parent() {
                    fs::create_dir_all(parent).map_err(|e| TpmError::fs(parent, e))?;
                }
                let mut out = File::create(&enclosed).map_err(|e| TpmError::fs(&enclosed, e))?;
                io::copy(&mut entry, &mut out)
                    .map_err(|e| TpmError::Integrity(format!("corrupt archive {name}: {e}")))?;
                if let Some(mode) = entry.unix_mode() {
                    fs::set_permissions(&enclosed, fs::Permissions::from_mode(mode))
                        .map_err(|e| TpmError::fs(&enclosed, e))?;
                }
            }
        }
        ArchiveFormat::Binary => {
            let target = dest.join(&name);
            fs::copy(archive, &target).map_err(|e| TpmError::fs(&target, e))?;
            return Ok(());
        }
    }

    flatten_single_top_level(dest).map_err(|e| TpmError::fs(dest, e))?;
    Ok(())
}

/// If the extraction produced exactly one top-level entry and it is a
/// directory, moves its contents up and removes it.
fn flatten_single_top_level(dest: &Path) -> io::Result<()> {
    let entries: Vec<_> = fs::read_dir(dest)?.collect::<io::Result<Vec<_>>>()?;
    if entries.len() != 1 {
        return Ok(());
    }
    let top = entries[0].path();
    if !top.is_dir() || top.symlink_metadata()?.file_type().is_symlink() {
        return Ok(());
    }
    // Rename the wrapper aside first so a child may reuse its name.
    let staging = dest.join(format!(".tpm-strip-{}", std::process::id()));
    fs::rename(&top, &staging)?;
    for child in fs::read_dir(&staging)? {
        let child = child?;
        fs::rename(child.path(), dest.join(child.file_name()))?;
    }
    fs::remove_dir(&staging)
}

// Binary identification scoring, kept as data so field-discovered edge
// cases can be patched without touching the walk.
const SCORE_EXACT_NAME: i32 = 100;
const SCORE_LOWERCASE: i32 = 20;
const SCORE_NO_DOT: i32 = 15;
const SCORE_ALNUM: i32 = 10;
const SCORE_NATIVE_MAGIC: i32 = 50;
const SCORE_SCRIPT: i32 = -30;
const SCORE_SIZE_RANGE: i32 = 15;
const PATH_SIGNALS: &[(&str, i32)] = &[("/bin/", 25), ("/sbin/", 20), ("/usr/", -10)];
const SIZE_RANGE: std::ops::RangeInclusive<u64> = 10 * 1024..=50 * 1024 * 1024;

const EXCLUDED_SUFFIXES: &[&str] = &[
    ".dylib", ".dll", ".a", ".la", ".md", ".txt", ".png", ".jpg", ".jpeg", ".gif",
    ".svg", ".ico", ".html", ".css", ".pdf", ".1", ".5", ".8", ".json", ".yml",
    ".yaml", ".toml", ".sig", ".asc",
];
const EXCLUDED_PREFIXES: &[&str] = &["readme", "license", "licence", "copying", "changelog"];

/// Picks the principal executable out of an extracted tree by scoring every
/// candidate file. Returns `NotFound` when nothing plausible exists.
pub fn locate_binary(root: &Path, expected: Option<&str>) -> Result<PathBuf> {
    let mut best = pick(root, expected, true);
    if best.is_none() {
        // Some archives ship binaries without the executable bit set.
        best = pick(root, expected, false);
    }
    best.ok_or_else(|| {
        TpmError::NotFound(format!(
            "no executable candidate found under {}",
            root.display()
        ))
    })
}

fn pick(root: &Path, expected: Option<&str>, executables_only: bool) -> Option<PathBuf> {
    let mut best: Option<(PathBuf, i32, bool)> = None;
    for entry in WalkDir::new(root).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if is_excluded(&name) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if executables_only && meta.permissions().mode() & 0o111 == 0 {
            continue;
        }
        let score = score_candidate(path, root, &name, expected, meta.len());
        let contains_expected = expected
            .map(|e| name.to_lowercase().contains(&e.to_lowercase()))
            .unwrap_or(false);
        let better = match &best {
            None => true,
            Some((_, s, c)) => score > *s || (score == *s && contains_expected && !c),
        };
        if better {
            best = Some((path.to_path_buf(), score, contains_expected));
        }
    }
    best.map(|(path, score, _)| {
        verbose!(1, "selected binary {} (score {})", path.display(), score);
        path
    })
}

fn is_excluded(name: &str) -> bool {
    if name.starts_with('.') {
        return true;
    }
    let lower = name.to_lowercase();
    if lower.ends_with(".so") || lower.contains(".so.") {
        return true;
    }
    if EXCLUDED_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
        return true;
    }
    EXCLUDED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

fn score_candidate(
    path: &Path,
    root: &Path,
    name: &str,
    expected: Option<&str>,
    size: u64,
) -> i32 {
    let mut score = 0;
    if let Some(expected) = expected {
        if name == expected {
            score += SCORE_EXACT_NAME;
        }
    }
    if name.to_lowercase() == *name {
        score += SCORE_LOWERCASE;
    }
    if !name.contains('.') {
        score += SCORE_NO_DOT;
    }
    if name.chars().all(|c| c.is_ascii_alphanumeric()) {
        score += SCORE_ALNUM;
    }
    score += magic_score(path);
    let rel = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();
    let rel = format!("/{rel}");
    for (needle, delta) in PATH_SIGNALS {
        if rel.contains(needle) {
            score += delta;
        }
    }
    if SIZE_RANGE.contains(&size) {
        score += SCORE_SIZE_RANGE;
    }
    score
}

/// In-process magic sniff: native executables score up, interpreter
/// scripts score down, anything else is neutral.
fn magic_score(path: &Path) -> i32 {
    let mut head = [0u8; 4];
    let Ok(mut file) = File::open(path) else { return 0 };
    let Ok(n) = file.read(&mut head) else { return 0 };
    if n >= 4 && head == [0x7f, b'E', b'L', b'F'] {
        return SCORE_NATIVE_MAGIC;
    }
    if n >= 4 && is_macho_magic(&head) {
        return SCORE_NATIVE_MAGIC;
    }
    if n >= 2 && head[0] == b'#' && head[1] == b'!' {
        return SCORE_SCRIPT;
    }
    0
}

fn is_macho_magic(head: &[u8; 4]) -> bool {
    matches!(
        u32::from_be_bytes(*head),
        0xfeed_face | 0xfeed_facf | 0xcefa_edfe | 0xcffa_edfe | 0xcafe_babe
    )
}
