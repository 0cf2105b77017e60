use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use verbosio::verbose;
use walkdir::WalkDir;

use crate::error::{Result, TpmError};

/// `owner/repo` pair used as the primary key across all persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolId {
    pub owner: String,
    pub repo: String,
}

impl ToolId {
    pub fn new(owner: &str, repo: &str) -> Result<ToolId> {
        if !valid_component(owner) || !valid_component(repo) {
            return Err(TpmError::Usage(format!(
                "invalid tool id '{owner}/{repo}', expected owner/repo with [A-Za-z0-9_.-]"
            )));
        }
        Ok(ToolId {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }
}

fn valid_component(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl FromStr for ToolId {
    type Err = TpmError;

    fn from_str(s: &str) -> Result<ToolId> {
        let Some((owner, repo)) = s.split_once('/') else {
            return Err(TpmError::Usage(format!(
                "invalid tool id '{s}', expected owner/repo"
            )));
        };
        ToolId::new(owner, repo)
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// One installed tool as recorded in the manifest file. Unknown keys read
/// from disk are kept in `extras` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledTool {
    pub tool: ToolId,
    pub version: String,
    pub binary: String,
    pub store_path: PathBuf,
    pub symlink_path: PathBuf,
    pub installed_at: String,
    pub checksum: Option<String>,
    pub files: Vec<PathBuf>,
    pub extras: BTreeMap<String, String>,
}

impl InstalledTool {
    pub fn new(
        tool: ToolId,
        version: &str,
        binary: &str,
        store_path: PathBuf,
        symlink_path: PathBuf,
    ) -> InstalledTool {
        InstalledTool {
            tool,
            version: version.to_string(),
            binary: binary.to_string(),
            store_path,
            symlink_path,
            installed_at: String::new(),
            checksum: None,
            files: Vec::new(),
            extras: BTreeMap::new(),
        }
    }
}

/// Partial update for a manifest record; `None` fields are preserved.
#[derive(Debug, Default, Clone)]
pub struct ToolPatch {
    pub tool: Option<ToolId>,
    pub version: Option<String>,
    pub binary: Option<String>,
    pub store_path: Option<PathBuf>,
    pub symlink_path: Option<PathBuf>,
    pub installed_at: Option<String>,
    pub checksum: Option<String>,
    pub files: Option<Vec<PathBuf>>,
}

/// The installed-tools manifest: an ordered set of records keyed by ToolId,
/// persisted as `---`-delimited `key=value` blocks.
pub struct Manifest {
    path: PathBuf,
    records: Vec<InstalledTool>,
    dirty: bool,
}

const FIELD_ORDER: &[&str] = &[
    "tool",
    "version",
    "binary",
    "store_path",
    "symlink_path",
    "installed_at",
    "checksum",
    "files",
];

impl Manifest {
    /// Loads the manifest, returning an empty one if the file does not
    /// exist yet. Blocks without a `tool` key are skipped with a warning.
    pub fn load(path: impl Into<PathBuf>) -> Result<Manifest> {
        let path = path.into();
        let mut manifest = Manifest {
            path: path.clone(),
            records: Vec::new(),
            dirty: false,
        };
        if !path.exists() {
            return Ok(manifest);
        }
        let content = fs::read_to_string(&path).map_err(|e| TpmError::fs(&path, e))?;
        let mut block: Vec<(String, String)> = Vec::new();
        for line in content.lines().chain(std::iter::once("---")) {
            let line = line.trim();
            if line == "---" {
                if !block.is_empty() {
                    match parse_block(&block) {
                        Some(record) => {
                            if manifest.find(&record.tool).is_some() {
                                eprintln!(
                                    "warning: duplicate manifest entry for {}, keeping the first",
                                    record.tool
                                );
                            } else {
                                manifest.records.push(record);
                            }
                        }
                        None => eprintln!("warning: skipping manifest block without a tool key"),
                    }
                    block.clear();
                }
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                block.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        verbose!(1, "loaded {} manifest record(s)", manifest.records.len());
        Ok(manifest)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn records(&self) -> &[InstalledTool] {
        &self.records
    }

    pub fn installed(&self, id: &ToolId) -> bool {
        self.find(id).is_some()
    }

    pub fn get(&self, id: &ToolId) -> Result<&InstalledTool> {
        self.find(id)
            .ok_or_else(|| TpmError::NotFound(format!("{id} is not installed")))
    }

    fn find(&self, id: &ToolId) -> Option<&InstalledTool> {
        self.records.iter().find(|r| &r.tool == id)
    }

    /// Adds a record. `installed_at` defaults to now, `files` to a scan of
    /// the record's version directory.
    pub fn add(&mut self, mut record: InstalledTool) -> Result<()> {
        if self.installed(&record.tool) {
            return Err(TpmError::AlreadyExists(format!(
                "{} is already in the manifest",
                record.tool
            )));
        }
        for (name, value) in [
            ("version", record.version.as_str()),
            ("binary", record.binary.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(TpmError::Internal(format!(
                    "manifest record for {} is missing required field '{name}'",
                    record.tool
                )));
            }
        }
        if record.store_path.as_os_str().is_empty() || record.symlink_path.as_os_str().is_empty() {
            return Err(TpmError::Internal(format!(
                "manifest record for {} is missing a path field",
                record.tool
            )));
        }
        if record.installed_at.is_empty() {
            record.installed_at = chrono::Utc::now().to_rfc3339();
        }
        if record.files.is_empty() {
            record.files = scan_version_dir(&record.store_path);
        }
        self.records.push(record);
        self.dirty = true;
        Ok(())
    }

    /// Applies a patch to an existing record. The tool id itself is
    /// immutable.
    pub fn update(&mut self, id: &ToolId, patch: ToolPatch) -> Result<()> {
        if let Some(new_id) = &patch.tool {
            if new_id != id {
                return Err(TpmError::Usage(format!(
                    "the tool id of a manifest record cannot change ({id} -> {new_id})"
                )));
            }
        }
        let record = self
            .records
            .iter_mut()
            .find(|r| &r.tool == id)
            .ok_or_else(|| TpmError::NotFound(format!("{id} is not installed")))?;
        if let Some(v) = patch.version {
            record.version = v;
        }
        if let Some(b) = patch.binary {
            record.binary = b;
        }
        if let Some(p) = patch.store_path {
            record.store_path = p;
        }
        if let Some(p) = patch.symlink_path {
            record.symlink_path = p;
        }
        if let Some(t) = patch.installed_at {
            record.installed_at = t;
        }
        if let Some(c) = patch.checksum {
            record.checksum = Some(c);
        }
        if let Some(f) = patch.files {
            record.files = f;
        }
        self.dirty = true;
        Ok(())
    }

    pub fn remove(&mut self, id: &ToolId) -> Result<InstalledTool> {
        let pos = self
            .records
            .iter()
            .position(|r| &r.tool == id)
            .ok_or_else(|| TpmError::NotFound(format!("{id} is not installed")))?;
        self.dirty = true;
        Ok(self.records.remove(pos))
    }

    /// Writes the manifest if it has in-memory changes. A timestamped
    /// backup copy is taken before the rewrite and removed once the write
    /// lands.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| TpmError::fs(parent, e))?;
        }
        let backup = if self.path.exists() {
            let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
            let backup = self.path.with_extension(format!("bak.{stamp}"));
            fs::copy(&self.path, &backup).map_err(|e| TpmError::fs(&backup, e))?;
            Some(backup)
        } else {
            None
        };

        let mut out = String::from("# tpm manifest - do not edit while tpm is running\n");
        for record in &self.records {
            out.push_str(&render_block(record));
            out.push_str("---\n");
        }
        fs::write(&self.path, out).map_err(|e| TpmError::fs(&self.path, e))?;
        let mut perms = fs::metadata(&self.path)
            .map_err(|e| TpmError::fs(&self.path, e))?
            .permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o600);
        fs::set_permissions(&self.path, perms).map_err(|e| TpmError::fs(&self.path, e))?;

        if let Some(backup) = backup {
            let _ = fs::remove_file(backup);
        }
        self.dirty = false;
        verbose!(1, "manifest saved to {}", self.path.display());
        Ok(())
    }

    /// Checks every record against the filesystem and returns the problems
    /// found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for record in &self.records {
            if record.version.is_empty() || record.binary.is_empty() {
                errors.push(format!("{}: record is missing required fields", record.tool));
            }
            if !record.store_path.exists() {
                errors.push(format!(
                    "{}: store path {} is missing",
                    record.tool,
                    record.store_path.display()
                ));
                continue;
            }
            match record.symlink_path.symlink_metadata() {
                Ok(m) if m.file_type().is_symlink() => {
                    if !symlink_resolves_to(&record.symlink_path, &record.store_path) {
                        errors.push(format!(
                            "{}: symlink {} does not resolve to {}",
                            record.tool,
                            record.symlink_path.display(),
                            record.store_path.display()
                        ));
                    }
                }
                Ok(_) => errors.push(format!(
                    "{}: {} exists but is not a symlink",
                    record.tool,
                    record.symlink_path.display()
                )),
                Err(_) => errors.push(format!(
                    "{}: symlink {} is missing",
                    record.tool,
                    record.symlink_path.display()
                )),
            }
        }
        errors
    }

    /// Recreates every missing or misdirected PATH symlink and returns how
    /// many were repaired.
    pub fn repair_symlinks(&mut self) -> Result<usize> {
        let mut repaired = 0;
        for record in &self.records {
            let link = &record.symlink_path;
            let healthy = link
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
                && symlink_resolves_to(link, &record.store_path);
            if healthy {
                continue;
            }
            if link.symlink_metadata().is_ok() {
                match link.symlink_metadata() {
                    Ok(m) if m.is_dir() => fs::remove_dir_all(link),
                    _ => fs::remove_file(link),
                }
                .map_err(|e| TpmError::fs(link, e))?;
            }
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent).map_err(|e| TpmError::fs(parent, e))?;
            }
            std::os::unix::fs::symlink(&record.store_path, link)
                .map_err(|e| TpmError::fs(link, e))?;
            println!("repaired {} -> {}", link.display(), record.store_path.display());
            repaired += 1;
        }
        Ok(repaired)
    }
}

pub fn symlink_resolves_to(link: &Path, target: &Path) -> bool {
    match (fs::canonicalize(link), fs::canonicalize(target)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// All files under the version directory that `store_path` belongs to
/// (`.../<version>/bin/<binary>` -> `.../<version>`).
fn scan_version_dir(store_path: &Path) -> Vec<PathBuf> {
    let Some(version_dir) = store_path.parent().and_then(Path::parent) else {
        return Vec::new();
    };
    WalkDir::new(version_dir)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn parse_block(pairs: &[(String, String)]) -> Option<InstalledTool> {
    let tool_value = pairs.iter().find(|(k, _)| k == "tool").map(|(_, v)| v)?;
    let tool = ToolId::from_str(tool_value).ok()?;
    let mut record = InstalledTool::new(tool, "", "", PathBuf::new(), PathBuf::new());
    for (key, value) in pairs {
        match key.as_str() {
            "tool" => {}
            "version" => record.version = value.clone(),
            "binary" => record.binary = value.clone(),
            "store_path" => record.store_path = PathBuf::from(value),
            "symlink_path" => record.symlink_path = PathBuf::from(value),
            "installed_at" => record.installed_at = value.clone(),
            "checksum" => record.checksum = Some(value.clone()),
            "files" => {
                record.files = value
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect();
            }
            _ => {
                record.extras.insert(key.clone(), value.clone());
            }
        }
    }
    Some(record)
}

fn render_block(record: &InstalledTool) -> String {
    let files = record
        .files
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mut out = String::new();
    for key in FIELD_ORDER {
        let value = match *key {
            "tool" => record.tool.to_string(),
            "version" => record.version.clone(),
            "binary" => record.binary.clone(),
            "store_path" => record.store_path.to_string_lossy().to_string(),
            "symlink_path" => record.symlink_path.to_string_lossy().to_string(),
            "installed_at" => record.installed_at.clone(),
            "checksum" => record.checksum.clone().unwrap_or_default(),
            "files" => files.clone(),
            _ => unreachable!(),
        };
        if !value.is_empty() {
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    for (key, value) in &record.extras {
        if !value.is_empty() {
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    out
}
