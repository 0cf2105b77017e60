use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use sha2::Digest;
use verbosio::verbose;

use crate::config::{Arch, Config};
use crate::error::{Result, TpmError};
use crate::transaction::Transaction;

const API_ROOT: &str = "https://api.github.com";
const CACHE_TTL: Duration = Duration::from_secs(300);
const RETRY_DELAY: Duration = Duration::from_secs(1);
const USER_AGENT: &str = concat!("tpm/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(default)]
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// Minimal client for the release API: one request path with an on-disk
/// response cache and header-driven rate-limit bookkeeping.
pub struct GithubClient {
    http: reqwest::blocking::Client,
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
    max_retries: u32,
    rate_remaining: Option<u64>,
    rate_reset: Option<u64>,
}

impl GithubClient {
    pub fn new(config: &Config) -> Result<GithubClient> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.timeout)
            .timeout(config.timeout * 3)
            .build()
            .map_err(|e| TpmError::Network(format!("could not build http client: {e}")))?;
        Ok(GithubClient {
            http,
            cache_dir: config.cache_dir(),
            tmp_dir: config.tmp_dir.clone(),
            max_retries: config.max_retries,
            rate_remaining: None,
            rate_reset: None,
        })
    }

    /// Updates the rate-limit counters, normally from response headers.
    pub fn note_rate_limit(&mut self, remaining: u64, reset_epoch: u64) {
        self.rate_remaining = Some(remaining);
        self.rate_reset = Some(reset_epoch);
    }

    pub fn get_latest_release(&mut self, owner: &str, repo: &str) -> Result<Release> {
        let body = self.api_request(&format!("repos/{owner}/{repo}/releases/latest"))?;
        parse_release(&body)
    }

    pub fn get_release_by_tag(&mut self, owner: &str, repo: &str, tag: &str) -> Result<Release> {
        let body = self.api_request(&format!("repos/{owner}/{repo}/releases/tags/{tag}"))?;
        parse_release(&body)
    }

    /// GETs an API endpoint through the response cache and the rate-limit
    /// gate, returning the raw JSON body.
    pub fn api_request(&mut self, endpoint: &str) -> Result<String> {
        if let Some(cached) = self.read_cache(endpoint) {
            verbose!(1, "cache hit for {}", endpoint);
            return Ok(cached);
        }

        let now = unix_now();
        if let (Some(remaining), Some(reset)) = (self.rate_remaining, self.rate_reset) {
            if remaining <= 1 && now < reset {
                return Err(TpmError::RateLimited {
                    wait_seconds: reset - now + 5,
                });
            }
        }

        let url = format!("{API_ROOT}/{endpoint}");
        let response = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .map_err(|e| TpmError::Network(format!("request to {url} failed: {e}")))?;

        if let Some(remaining) = header_u64(&response, "x-ratelimit-remaining") {
            let reset = header_u64(&response, "x-ratelimit-reset").unwrap_or(0);
            self.note_rate_limit(remaining, reset);
        }

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| TpmError::Network(format!("could not read response from {url}: {e}")))?;

        if status.as_u16() == 404 {
            return Err(TpmError::NotFound(format!("no such endpoint: {endpoint}")));
        }
        if status.as_u16() == 403 && self.rate_remaining == Some(0) {
            let reset = self.rate_reset.unwrap_or(now);
            return Err(TpmError::RateLimited {
                wait_seconds: reset.saturating_sub(now) + 5,
            });
        }
        if !status.is_success() {
            return Err(TpmError::Network(format!(
                "{url} answered HTTP {status}: {}",
                api_error_message(&body).unwrap_or_default()
            )));
        }
        // The host reports some errors with a 2xx body carrying only a
        // message object.
        if let Some(message) = api_error_message(&body) {
            return Err(TpmError::Network(format!("{url} answered: {message}")));
        }

        self.write_cache(endpoint, &body);
        Ok(body)
    }

    fn cache_file(&self, endpoint: &str) -> PathBuf {
        let sanitized: String = endpoint
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.cache_dir.join(format!("{sanitized}.json"))
    }

    fn read_cache(&self, endpoint: &str) -> Option<String> {
        let path = self.cache_file(endpoint);
        let age = path.metadata().and_then(|m| m.modified()).ok()?;
        if SystemTime::now().duration_since(age).ok()? > CACHE_TTL {
            return None;
        }
        fs::read_to_string(path).ok()
    }

    fn write_cache(&self, endpoint: &str, body: &str) {
        // Atomic write so concurrent readers never see partial JSON.
        let path = self.cache_file(endpoint);
        let write = || -> std::io::Result<()> {
            fs::create_dir_all(&self.cache_dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
            tmp.write_all(body.as_bytes())?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        };
        if let Err(e) = write() {
            eprintln!("warning: could not cache response for {endpoint}: {e}");
        }
    }

    /// Downloads `url` to `out_path` through a temp file, verifying the
    /// checksum when one is known, publishing via the transactional
    /// safe-move.
    pub fn download_asset(
        &self,
        tx: &mut Transaction,
        url: &str,
        out_path: &Path,
        expected_checksum: Option<&str>,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                thread::sleep(RETRY_DELAY);
                verbose!(1, "retrying download ({}/{})", attempt, self.max_retries);
            }
            match self.download_once(url, expected_checksum) {
                Ok(tmp_path) => {
                    tx.safe_move(&tmp_path, out_path)?;
                    return Ok(());
                }
                // A checksum mismatch will not heal on retry.
                Err(e @ TpmError::Integrity(_)) => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| TpmError::Network(format!("download of {url} failed"))))
    }

    fn download_once(&self, url: &str, expected_checksum: Option<&str>) -> Result<PathBuf> {
        fs::create_dir_all(&self.tmp_dir).map_err(|e| TpmError::fs(&self.tmp_dir, e))?;
        let mut response = self
            .http
            .get(url)
            .send()
            .map_err(|e| TpmError::Network(format!("download of {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(TpmError::Network(format!(
                "download of {url} failed: HTTP {}",
                response.status()
            )));
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&self.tmp_dir)
            .map_err(|e| TpmError::fs(&self.tmp_dir, e))?;
        let mut hasher = sha2::Sha256::new();
        let mut buffer = vec![0_u8; 64 * 1024];
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|e| TpmError::Network(format!("stream error for {url}: {e}")))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            tmp.write_all(&buffer[..read])
                .map_err(|e| TpmError::fs(tmp.path(), e))?;
        }

        if let Some(expected) = expected_checksum {
            self.verify_checksum(&hex::encode(hasher.finalize()), expected, url)?;
        }

        let (_, path) = tmp
            .keep()
            .map_err(|e| TpmError::fs(&self.tmp_dir, e.error))?;
        Ok(path)
    }

    fn verify_checksum(&self, actual_sha256: &str, expected: &str, url: &str) -> Result<()> {
        let Some((algo, hex_digest)) = expected.split_once(':') else {
            eprintln!("warning: malformed checksum '{expected}', skipping verification");
            return Ok(());
        };
        match algo {
            "sha256" => {
                if !actual_sha256.eq_ignore_ascii_case(hex_digest) {
                    return Err(TpmError::Integrity(format!(
                        "checksum mismatch for {url}: expected sha256:{hex_digest}, got sha256:{actual_sha256}"
                    )));
                }
                verbose!(1, "checksum verified for {}", url);
                Ok(())
            }
            "sha1" | "md5" => {
                eprintln!("warning: no in-process {algo} support, accepting {url} unverified");
                Ok(())
            }
            other => {
                eprintln!("warning: unknown checksum algorithm '{other}', accepting {url} unverified");
                Ok(())
            }
        }
    }
}

fn parse_release(body: &str) -> Result<Release> {
    let release: Release = serde_json::from_str(body)
        .map_err(|e| TpmError::Network(format!("malformed release metadata: {e}")))?;
    if release.tag_name.trim().is_empty() {
        return Err(TpmError::Network("release metadata has no tag_name".to_string()));
    }
    Ok(release)
}

fn api_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let obj = value.as_object()?;
    if obj.contains_key("message") && !obj.contains_key("tag_name") && !obj.contains_key("assets") {
        return obj.get("message")?.as_str().map(|s| s.to_string());
    }
    None
}

fn header_u64(response: &reqwest::blocking::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Asset selection: scoring signals kept as data. A row fires at most once
// per asset; rows carrying a hard penalty (foreign OS, source, debug)
// disqualify the asset from selection outright.
const ARCH_MATCH: i32 = 50;
const DISQUALIFY: i32 = -100;
const NAME_SIGNALS: &[(&[&str], i32)] = &[
    (&["linux"], 30),
    (&["gnu"], 5),
    (&["musl"], -10),
    (&["darwin", "macos"], -100),
    (&["windows", "win32", "win64", "-win-", "_win_"], -100),
    (&["freebsd", "openbsd", "netbsd", "dragonfly"], -50),
    (&["source", "src"], -200),
    (&["debug", "dbg"], -150),
    (&["static"], 10),
    (&["minimal", "standalone"], 5),
];
const SUFFIX_SIGNALS: &[(&[&str], i32)] = &[
    (&[".tar.gz", ".tgz"], 20),
    (&[".tar.xz", ".txz", ".tar.bz2", ".tbz2"], 15),
    (&[".zip"], 10),
];

/// Scores a release asset name against the host arch. Higher is better;
/// anything at or below the disqualification threshold is unusable.
pub fn score_asset(name: &str, arch: Arch) -> i32 {
    let name = name.to_lowercase();
    let mut score = 0;
    if arch_matches(&name, arch) {
        score += ARCH_MATCH;
    }
    for (tokens, delta) in NAME_SIGNALS {
        if tokens.iter().any(|t| name.contains(t)) {
            score += delta;
        }
    }
    for (suffixes, delta) in SUFFIX_SIGNALS {
        if suffixes.iter().any(|s| name.ends_with(s)) {
            score += delta;
            break;
        }
    }
    score
}

fn arch_matches(name: &str, arch: Arch) -> bool {
    match arch {
        Arch::Arm64 => name.contains("arm64") || name.contains("aarch64"),
        Arch::Arm => {
            name.contains("arm") && !name.contains("arm64") && !name.contains("aarch64")
        }
        Arch::I686 => {
            name.contains("i686")
                || name.contains("386")
                || (name.contains("x86") && !name.contains("x86_64"))
        }
        Arch::X86_64 => name.contains("x86_64") || name.contains("amd64"),
    }
}

fn disqualified(name: &str) -> bool {
    let name = name.to_lowercase();
    NAME_SIGNALS
        .iter()
        .filter(|(_, delta)| *delta <= DISQUALIFY)
        .any(|(tokens, _)| tokens.iter().any(|t| name.contains(t)))
}

/// Picks the best-scoring usable asset for the host arch. A top score below
/// zero is accepted with a warning; no usable asset at all is an error that
/// lists everything the release offered.
pub fn select_asset<'a>(release: &'a Release, arch: Arch) -> Result<&'a ReleaseAsset> {
    let mut best: Option<(&ReleaseAsset, i32)> = None;
    for asset in &release.assets {
        if asset.name.is_empty() || asset.browser_download_url.is_empty() {
            continue;
        }
        if disqualified(&asset.name) {
            verbose!(1, "skipping {} (wrong platform or non-binary)", asset.name);
            continue;
        }
        let score = score_asset(&asset.name, arch);
        verbose!(1, "asset {} scored {}", asset.name, score);
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((asset, score));
        }
    }
    match best {
        Some((asset, score)) => {
            if score < 0 {
                eprintln!(
                    "warning: best asset {} scored {score}, it may not fit this platform",
                    asset.name
                );
            }
            Ok(asset)
        }
        None => {
            let names = release
                .assets
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Err(TpmError::NotFound(format!(
                "no suitable asset for {} in release {} (assets: {names})",
                arch, release.tag_name
            )))
        }
    }
}

/// Scans the release notes for `<algo> <hex> <asset>` lines and returns the
/// checksum as `algo:hex`. Sibling checksum assets (SHA256SUMS and friends)
/// are recognized but not fetched.
pub fn find_checksum(release: &Release, asset_name: &str) -> Option<String> {
    if release
        .assets
        .iter()
        .any(|a| a.name.to_lowercase().contains("sums") || a.name.to_lowercase().contains("checksum"))
    {
        verbose!(1, "release ships a checksum file asset (not fetched)");
    }
    let body = release.body.as_deref()?;
    let pattern = format!(
        r"(?mi)^\s*(sha256|sha1|md5)[:=\s]+([0-9a-f]{{32,64}})\s+\*?{}\s*$",
        regex::escape(asset_name)
    );
    let re = regex::Regex::new(&pattern).ok()?;
    let caps = re.captures(body)?;
    Some(format!(
        "{}:{}",
        caps[1].to_lowercase(),
        caps[2].to_lowercase()
    ))
}
