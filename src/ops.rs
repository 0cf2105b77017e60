use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use verbosio::verbose;

use crate::config::Config;
use crate::error::{Result, TpmError};
use crate::github::{self, GithubClient};
use crate::lock::OpLock;
use crate::manifest::{InstalledTool, Manifest, ToolId, ToolPatch};
use crate::store::Store;
use crate::transaction::Transaction;

/// How many versions of a tool survive a cleanup pass.
pub const KEEP_VERSIONS: usize = 3;

const STALE_TMP_AGE: Duration = Duration::from_secs(3600);

/// Everything an operation needs, constructed once and passed explicitly.
pub struct Context {
    pub config: Config,
    pub manifest: Manifest,
    pub tx: Transaction,
    pub github: GithubClient,
    pub store: Store,
}

impl Context {
    pub fn new(config: Config) -> Result<Context> {
        for dir in [&config.store_root, &config.tmp_dir, &config.bin_dir] {
            fs::create_dir_all(dir).map_err(|e| TpmError::fs(dir, e))?;
        }
        let manifest = Manifest::load(&config.manifest_file)?;
        let tx = Transaction::new(config.backup_root());
        let github = GithubClient::new(&config)?;
        let store = Store::new(&config);
        Ok(Context {
            config,
            manifest,
            tx,
            github,
            store,
        })
    }

    /// End-of-run hook: persists manifest changes that an operation left
    /// in memory, retrying once as a failed save leaves disk state stale.
    pub fn finish(&mut self) -> Result<()> {
        if !self.manifest.is_dirty() {
            return Ok(());
        }
        if let Err(e) = self.manifest.save() {
            eprintln!("warning: manifest save failed ({e}), retrying once");
            return self.manifest.save();
        }
        Ok(())
    }

    /// Runs `body` inside a transaction; any failure rolls back and is
    /// wrapped with the rollback outcome.
    fn transact<T>(
        &mut self,
        kind: &str,
        id: &ToolId,
        body: impl FnOnce(&mut Context) -> Result<T>,
    ) -> Result<T> {
        self.tx.begin(kind, &id.to_string())?;
        match body(self) {
            Ok(value) => {
                self.tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let rollback_failures = self.tx.rollback();
                Err(TpmError::TransactionAborted {
                    context: format!("{kind} {id}"),
                    rollback_failures,
                    source: Box::new(e),
                })
            }
        }
    }
}

/// Resolves the latest release, downloads the best asset and installs it
/// into the store, publishing a PATH symlink and a manifest record.
pub fn install(ctx: &mut Context, id: &ToolId, force: bool) -> Result<()> {
    let _lock = OpLock::acquire(ctx.config.locks_dir(), &id.to_string())?;
    if ctx.manifest.installed(id) && !force {
        return Err(TpmError::AlreadyExists(format!(
            "{id} is already installed (use --force to reinstall)"
        )));
    }

    println!("installing {id}");
    let record = ctx.transact("install", id, |ctx| install_version(ctx, id, None))?;
    let version = record.version.clone();
    if ctx.manifest.installed(id) {
        ctx.manifest.update(id, patch_from(record))?;
    } else {
        ctx.manifest.add(record)?;
    }
    save_reporting(ctx);
    println!("installed {id} {version}");
    Ok(())
}

/// Brings one tool to the latest release, keeping the previous version in
/// the store and pruning old ones after the switch.
pub fn update(ctx: &mut Context, id: &ToolId) -> Result<()> {
    let _lock = OpLock::acquire(ctx.config.locks_dir(), &id.to_string())?;
    let current = ctx.manifest.get(id)?.clone();
    let release = ctx.github.get_latest_release(&id.owner, &id.repo)?;
    if crate::version::eq(&release.tag_name, &current.version) {
        println!("{id} is already at {}", current.version);
        return Ok(());
    }

    println!("updating {id} {} -> {}", current.version, release.tag_name);
    let record = ctx.transact("update", id, |ctx| {
        // The published binary name can change between releases; drop the
        // old PATH entry when it does.
        let record = install_version(ctx, id, Some(release.clone()))?;
        if current.symlink_path != record.symlink_path && current.symlink_path.exists() {
            ctx.tx.record_remove(&current.symlink_path)?;
            fs::remove_file(&current.symlink_path)
                .map_err(|e| TpmError::fs(&current.symlink_path, e))?;
        }
        Ok(record)
    })?;
    ctx.manifest.update(id, patch_from(record))?;
    save_reporting(ctx);

    let removed = ctx.store.cleanup_old_versions(id, KEEP_VERSIONS)?;
    if !removed.is_empty() {
        verbose!(1, "pruned {} old version(s) of {}", removed.len(), id);
    }
    println!("updated {id} to {}", release.tag_name);
    Ok(())
}

/// Updates every installed tool. A failing tool is reported and skipped;
/// the last failure propagates so the exit code reflects the partial
/// result.
pub fn update_all(ctx: &mut Context) -> Result<()> {
    let ids: Vec<ToolId> = ctx.manifest.records().iter().map(|r| r.tool.clone()).collect();
    if ids.is_empty() {
        println!("nothing installed");
        return Ok(());
    }
    let total = ids.len();
    let mut last_err = None;
    let mut failed = 0;
    for id in ids {
        if let Err(e) = update(ctx, &id) {
            eprintln!("error: update of {id} failed: {e}");
            failed += 1;
            last_err = Some(e);
        }
    }
    match last_err {
        None => Ok(()),
        Some(e) => {
            eprintln!("{} of {total} tool(s) updated, {failed} failed", total - failed);
            Err(e)
        }
    }
}

/// Shared install path: resolve (unless the caller already did), download,
/// place into the store, link, repoint `current`. Returns the record to
/// put in the manifest; the caller commits and saves.
fn install_version(
    ctx: &mut Context,
    id: &ToolId,
    release: Option<github::Release>,
) -> Result<InstalledTool> {
    let release = match release {
        Some(r) => r,
        None => ctx.github.get_latest_release(&id.owner, &id.repo)?,
    };
    let asset = github::select_asset(&release, ctx.config.arch)?.clone();
    let checksum = github::find_checksum(&release, &asset.name);
    verbose!(1, "selected {} ({} bytes)", asset.name, asset.size);

    let archive = ctx.config.tmp_dir.join(&asset.name);
    ctx.github.download_asset(
        &mut ctx.tx,
        &asset.browser_download_url,
        &archive,
        checksum.as_deref(),
    )?;

    let (store_path, binary) = ctx.store.install_to_store(
        &mut ctx.tx,
        id,
        &release.tag_name,
        &archive,
        Some(&id.repo),
    )?;
    let symlink_path = ctx.store.create_symlink(&mut ctx.tx, &store_path, &binary)?;
    ctx.store.set_current(&mut ctx.tx, id, &release.tag_name)?;

    let mut record = InstalledTool::new(
        id.clone(),
        &release.tag_name,
        &binary,
        store_path,
        symlink_path,
    );
    record.checksum = checksum;
    Ok(record)
}

fn patch_from(record: InstalledTool) -> ToolPatch {
    ToolPatch {
        tool: None,
        version: Some(record.version),
        binary: Some(record.binary),
        store_path: Some(record.store_path),
        symlink_path: Some(record.symlink_path),
        installed_at: Some(chrono::Utc::now().to_rfc3339()),
        checksum: record.checksum,
        files: None,
    }
}

/// Removes a tool's PATH symlink, its store subtree and its manifest
/// record.
pub fn remove(ctx: &mut Context, id: &ToolId) -> Result<()> {
    let _lock = OpLock::acquire(ctx.config.locks_dir(), &id.to_string())?;
    let record = ctx.manifest.get(id)?.clone();

    ctx.transact("remove", id, |ctx| {
        if record.symlink_path.symlink_metadata().is_ok() {
            ctx.tx.record_remove(&record.symlink_path)?;
            fs::remove_file(&record.symlink_path)
                .map_err(|e| TpmError::fs(&record.symlink_path, e))?;
        }
        ctx.store.remove_tool(&mut ctx.tx, id)
    })?;
    ctx.manifest.remove(id)?;
    save_reporting(ctx);
    println!("removed {id}");
    Ok(())
}

/// Recreates missing or misdirected symlinks and reports anything the
/// store walk still flags.
pub fn repair(ctx: &mut Context) -> Result<()> {
    let _lock = OpLock::acquire(ctx.config.locks_dir(), "manifest")?;
    let repaired = ctx.manifest.repair_symlinks()?;

    // A dangling `current` with a live version directory is repairable
    // too.
    let mut current_fixed = 0;
    let records: Vec<(ToolId, String)> = ctx
        .manifest
        .records()
        .iter()
        .map(|r| (r.tool.clone(), r.version.clone()))
        .collect();
    for (id, version) in records {
        let link = ctx.store.current_link(&id);
        if fs::canonicalize(&link).is_ok() {
            continue;
        }
        let vdir = ctx.store.version_dir(&id, &version);
        if vdir.is_dir() {
            let _ = fs::remove_file(&link);
            let sanitized = crate::version::sanitize(&version);
            std::os::unix::fs::symlink(&sanitized, &link).map_err(|e| TpmError::fs(&link, e))?;
            println!("repaired current link for {id}");
            current_fixed += 1;
        }
    }

    let problems = ctx.store.validate_store();
    for p in &problems {
        eprintln!("warning: {p}");
    }
    let manifest_problems = ctx.manifest.validate();
    for p in &manifest_problems {
        eprintln!("warning: {p}");
    }
    println!(
        "repaired {} symlink(s), {} current link(s); {} issue(s) remain",
        repaired,
        current_fixed,
        problems.len() + manifest_problems.len()
    );
    Ok(())
}

/// Prunes old store versions for every tool and clears stale staging,
/// cache and backup entries under `TMP_DIR`.
pub fn cleanup(ctx: &mut Context) -> Result<()> {
    let _lock = OpLock::acquire(ctx.config.locks_dir(), "manifest")?;
    let mut pruned = 0;
    for id in store_tool_ids(&ctx.config.store_root) {
        pruned += ctx.store.cleanup_old_versions(&id, KEEP_VERSIONS)?.len();
    }
    let swept = sweep_tmp(&ctx.config);
    println!("pruned {pruned} old version(s), swept {swept} stale temp entr(ies)");
    Ok(())
}

/// Every `(owner, repo)` present in the store tree.
fn store_tool_ids(store_root: &Path) -> Vec<ToolId> {
    let mut ids = Vec::new();
    let Ok(owners) = fs::read_dir(store_root) else {
        return ids;
    };
    for owner in owners.flatten().filter(|e| e.path().is_dir()) {
        let Ok(repos) = fs::read_dir(owner.path()) else {
            continue;
        };
        for repo in repos.flatten().filter(|e| e.path().is_dir()) {
            if let Ok(id) = ToolId::new(
                &owner.file_name().to_string_lossy(),
                &repo.file_name().to_string_lossy(),
            ) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Removes leftovers under `TMP_DIR` that are older than an hour: aborted
/// extraction stagings, downloaded archives, expired cache files and
/// orphaned backups. The `locks`, `cache` and `backup` directories
/// themselves stay; only their stale contents go.
fn sweep_tmp(config: &Config) -> usize {
    let mut swept = 0;
    let cutoff = SystemTime::now() - STALE_TMP_AGE;
    let Ok(entries) = fs::read_dir(&config.tmp_dir) else {
        return swept;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        match name.as_str() {
            "locks" => {}
            "cache" | "backup" => swept += sweep_dir_contents(&entry.path(), cutoff),
            _ => swept += sweep_entry(&entry, cutoff),
        }
    }
    swept
}

fn sweep_dir_contents(dir: &Path, cutoff: SystemTime) -> usize {
    let Ok(entries) = fs::read_dir(dir) else { return 0 };
    entries
        .flatten()
        .map(|entry| sweep_entry(&entry, cutoff))
        .sum()
}

fn sweep_entry(entry: &fs::DirEntry, cutoff: SystemTime) -> usize {
    let old = entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|t| t < cutoff)
        .unwrap_or(false);
    if !old {
        return 0;
    }
    let path = entry.path();
    let removed = if path.is_dir() {
        fs::remove_dir_all(&path).is_ok()
    } else {
        fs::remove_file(&path).is_ok()
    };
    usize::from(removed)
}

/// Prints the installed tools, one per line; verbose mode adds the full
/// record.
pub fn list(ctx: &Context, verbose_listing: bool) {
    if ctx.manifest.records().is_empty() {
        println!("no tools installed");
        return;
    }
    for record in ctx.manifest.records() {
        println!("{} {}", record.tool, record.version);
        if verbose_listing {
            println!("  binary:    {}", record.binary);
            println!("  store:     {}", record.store_path.display());
            println!("  symlink:   {}", record.symlink_path.display());
            println!("  installed: {}", record.installed_at);
            if let Some(checksum) = &record.checksum {
                println!("  checksum:  {checksum}");
            }
        }
    }
}

/// Prints every manifest field of one tool, preserved unknown keys
/// included.
pub fn info(ctx: &Context, id: &ToolId) -> Result<()> {
    let record = ctx.manifest.get(id)?;
    println!("tool:         {}", record.tool);
    println!("version:      {}", record.version);
    println!("binary:       {}", record.binary);
    println!("store_path:   {}", record.store_path.display());
    println!("symlink_path: {}", record.symlink_path.display());
    println!("installed_at: {}", record.installed_at);
    if let Some(checksum) = &record.checksum {
        println!("checksum:     {checksum}");
    }
    if !record.files.is_empty() {
        println!("files:        {}", record.files.len());
    }
    for (key, value) in &record.extras {
        println!("{key}: {value}");
    }
    let current = ctx.store.current_version(id).unwrap_or_else(|| {
        // The manifest is the fallback when the current link is unreadable.
        crate::version::sanitize(&record.version)
    });
    println!("current:      {current}");
    Ok(())
}

fn save_reporting(ctx: &mut Context) {
    // Save after commit; a failure leaves the mutation in memory and the
    // end-of-run hook retries.
    if let Err(e) = ctx.manifest.save() {
        eprintln!("warning: manifest save failed, will retry on exit: {e}");
    }
}
