use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TpmError};

const DEFAULT_PREFIX: &str = "/data/data/com.termux/files/usr";

/// Host architecture tag used for release asset matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    Arm,
    I686,
    X86_64,
}

impl Arch {
    /// Detects the host arch: `TERMUX_ARCH` first, then the machine string
    /// the toolchain reports.
    pub fn detect() -> Result<Arch> {
        let machine = match env::var("TERMUX_ARCH") {
            Ok(hint) if !hint.trim().is_empty() => hint,
            _ => env::consts::ARCH.to_string(),
        };
        Arch::from_machine(&machine)
    }

    pub fn from_machine(machine: &str) -> Result<Arch> {
        match machine.trim().to_lowercase().as_str() {
            "aarch64" | "arm64" => Ok(Arch::Arm64),
            "armv7l" | "arm" | "armhf" | "armv8" => Ok(Arch::Arm),
            "i686" | "x86" | "i386" => Ok(Arch::I686),
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            other => Err(TpmError::UnsupportedArch(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::I686 => "i686",
            Arch::X86_64 => "x86_64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Color policy carried in config; output helpers consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorPolicy {
    Auto,
    Always,
    Never,
}

/// Immutable configuration resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub prefix: PathBuf,
    pub bin_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub store_root: PathBuf,
    pub tmp_dir: PathBuf,
    pub manifest_file: PathBuf,
    pub timeout: Duration,
    pub max_retries: u32,
    pub color: ColorPolicy,
    pub arch: Arch,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let prefix = PathBuf::from(
            env::var("PREFIX").unwrap_or_else(|_| DEFAULT_PREFIX.to_string()),
        );
        let home = PathBuf::from(
            env::var("HOME").map_err(|_| TpmError::Internal("HOME is not set".to_string()))?,
        );

        let color = if env::var_os("NO_COLOR").is_some() {
            ColorPolicy::Never
        } else {
            match env::var("TPM_COLOR").as_deref() {
                Ok("always") => ColorPolicy::Always,
                Ok("never") => ColorPolicy::Never,
                _ => ColorPolicy::Auto,
            }
        };

        Ok(Config {
            bin_dir: prefix.join("bin"),
            lib_dir: prefix.join("lib").join("tpm"),
            store_root: prefix.join("tpm").join("store"),
            tmp_dir: prefix.join("tpm").join("tmp"),
            manifest_file: home.join(".tpm").join("manifest"),
            prefix,
            timeout: Duration::from_secs(30),
            max_retries: 2,
            color,
            arch: Arch::detect()?,
        })
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.tmp_dir.join("locks")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.tmp_dir.join("cache")
    }

    pub fn backup_root(&self) -> PathBuf {
        self.tmp_dir.join("backup")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_string_mapping() {
        assert_eq!(Arch::from_machine("aarch64").unwrap(), Arch::Arm64);
        assert_eq!(Arch::from_machine("arm64").unwrap(), Arch::Arm64);
        assert_eq!(Arch::from_machine("armv7l").unwrap(), Arch::Arm);
        assert_eq!(Arch::from_machine("armhf").unwrap(), Arch::Arm);
        assert_eq!(Arch::from_machine("i386").unwrap(), Arch::I686);
        assert_eq!(Arch::from_machine("amd64").unwrap(), Arch::X86_64);
        assert_eq!(Arch::from_machine("X86_64").unwrap(), Arch::X86_64);
    }

    #[test]
    fn unknown_machine_is_rejected() {
        assert!(matches!(
            Arch::from_machine("riscv64"),
            Err(TpmError::UnsupportedArch(_))
        ));
    }
}
