//! Module source resolution and caching.
//!
//! Sources come in three kinds: local paths, VCS URLs (git, with `ref=`
//! query parameters and the `URL//subpath` idiom), and registry
//! coordinates (`tfr://HOST/NAMESPACE/NAME/PROVIDER?version=...`).
//!
//! Remote fetches land in a content-addressable cache keyed on the
//! canonicalised descriptor. Multiple units share one entry; concurrent
//! access is arbitrated by a per-key lock and a fetch-to-temp,
//! rename-into-place pattern so readers never observe partial writes.
//! Invalidation is explicit (`stratus cache clear`), never time-based.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use crate::config::{absolute, normalize_path};
use crate::error::{StratusError, StratusResult};

/// Default registry host when a `tfr://` source names none.
pub const DEFAULT_REGISTRY: &str = "registry.opentofu.org";

/// A parsed source descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Filesystem path, already made absolute.
    Local(PathBuf),
    /// Git-style URL with optional ref and subdirectory.
    Git {
        url: String,
        reference: Option<String>,
        subdir: Option<String>,
    },
    /// Registry coordinate.
    Registry {
        host: String,
        namespace: String,
        name: String,
        provider: String,
        version: Option<String>,
    },
}

impl SourceKind {
    /// Canonical string form, used as the cache key input.
    pub fn canonical(&self) -> String {
        match self {
            Self::Local(path) => format!("local:{}", path.display()),
            Self::Git {
                url,
                reference,
                subdir,
            } => format!(
                "git:{url}?ref={}//{}",
                reference.as_deref().unwrap_or(""),
                subdir.as_deref().unwrap_or("")
            ),
            Self::Registry {
                host,
                namespace,
                name,
                provider,
                version,
            } => format!(
                "tfr:{host}/{namespace}/{name}/{provider}?version={}",
                version.as_deref().unwrap_or("")
            ),
        }
    }

    /// Stable hash of the canonical descriptor.
    pub fn cache_key(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        // 16 bytes of hex keeps directory names readable.
        digest[..16].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Parses a raw source string. Relative paths resolve against `base_dir`.
pub fn parse_source(raw: &str, base_dir: &Path) -> StratusResult<SourceKind> {
    if let Some(rest) = raw.strip_prefix("tfr://") {
        return parse_registry(raw, rest);
    }

    let (forced_git, stripped) = match raw.strip_prefix("git::") {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let looks_remote = forced_git
        || stripped.starts_with("https://")
        || stripped.starts_with("http://")
        || stripped.starts_with("ssh://")
        || stripped.starts_with("git@");

    if looks_remote {
        return parse_git(raw, stripped);
    }

    Ok(SourceKind::Local(normalize_path(&absolute(
        Path::new(raw),
        base_dir,
    ))))
}

fn parse_git(raw: &str, stripped: &str) -> StratusResult<SourceKind> {
    // Split off `//subdir` after the host part; the `//` in the scheme
    // separator does not count.
    let scheme_end = stripped.find("://").map(|i| i + 3).unwrap_or(0);
    let (base, subdir) = match stripped[scheme_end..].find("//") {
        Some(pos) => {
            let split = scheme_end + pos;
            (&stripped[..split], Some(stripped[split + 2..].to_string()))
        }
        None => (stripped, None),
    };

    let (mut url, mut reference) = (base.to_string(), None);
    let (mut subdir, mut sub_ref) = (subdir, None);
    if let Some(sub) = subdir.take() {
        match sub.split_once('?') {
            Some((path, query)) => {
                sub_ref = query_param(query, "ref");
                subdir = Some(path.to_string());
            }
            None => subdir = Some(sub),
        }
    }
    if let Some((base_url, query)) = base.split_once('?') {
        url = base_url.to_string();
        reference = query_param(query, "ref");
    }
    let reference = reference.or(sub_ref);

    if url.is_empty() {
        return Err(StratusError::SourceFetch {
            source_desc: raw.to_string(),
            message: "empty VCS URL".to_string(),
        });
    }
    Ok(SourceKind::Git {
        url,
        reference,
        subdir: subdir.filter(|s| !s.is_empty()),
    })
}

fn parse_registry(raw: &str, rest: &str) -> StratusResult<SourceKind> {
    let (path_part, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    let version = query.and_then(|q| query_param(q, "version"));

    let segments: Vec<&str> = path_part.split('/').filter(|s| !s.is_empty()).collect();
    let (host, coords) = match segments.len() {
        // HOST/NAMESPACE/NAME/PROVIDER
        4 => (segments[0].to_string(), &segments[1..]),
        // NAMESPACE/NAME/PROVIDER with the default registry; this is the
        // shape `tfr:///ns/name/provider` produces.
        3 if path_part.starts_with('/') || !segments[0].contains('.') => {
            (DEFAULT_REGISTRY.to_string(), &segments[..])
        }
        _ => {
            return Err(StratusError::SourceFetch {
                source_desc: raw.to_string(),
                message: "registry source must be tfr://HOST/NAMESPACE/NAME/PROVIDER".to_string(),
            })
        }
    };

    Ok(SourceKind::Registry {
        host,
        namespace: coords[0].to_string(),
        name: coords[1].to_string(),
        provider: coords[2].to_string(),
        version,
    })
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// Fetches and caches module sources.
///
/// Fetching shells out to `git`; registry coordinates are resolved through
/// the registry HTTP API to a VCS URL first. All operations are blocking;
/// async callers run them under `spawn_blocking`.
pub struct SourceFetcher {
    cache_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SourceFetcher {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            cache_root: cache_root.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a source to a local directory, fetching and caching remote
    /// sources on first use. Local sources resolve to themselves.
    pub fn fetch(&self, source: &SourceKind) -> StratusResult<PathBuf> {
        match source {
            SourceKind::Local(path) => {
                if path.is_dir() {
                    Ok(path.clone())
                } else {
                    Err(StratusError::SourceFetch {
                        source_desc: path.display().to_string(),
                        message: "local source directory does not exist".to_string(),
                    })
                }
            }
            SourceKind::Git {
                url,
                reference,
                subdir,
            } => {
                let checkout = self.fetch_git(source, url, reference.as_deref())?;
                match subdir {
                    Some(sub) => {
                        let dir = checkout.join(sub);
                        if dir.is_dir() {
                            Ok(dir)
                        } else {
                            Err(StratusError::SourceFetch {
                                source_desc: source.canonical(),
                                message: format!("subdirectory {sub} not found in checkout"),
                            })
                        }
                    }
                    None => Ok(checkout),
                }
            }
            SourceKind::Registry { .. } => {
                let git_source = self.resolve_registry(source)?;
                self.fetch(&git_source)
            }
        }
    }

    /// Removes every cached checkout.
    pub fn clear(&self) -> StratusResult<()> {
        let modules = self.cache_root.join("modules");
        if modules.exists() {
            std::fs::remove_dir_all(&modules)?;
        }
        info!("cleared module cache at {}", modules.display());
        Ok(())
    }

    fn fetch_git(
        &self,
        source: &SourceKind,
        url: &str,
        reference: Option<&str>,
    ) -> StratusResult<PathBuf> {
        let key = source.cache_key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().unwrap();

        let target = self.cache_root.join("modules").join(&key);
        if target.is_dir() {
            debug!("cache hit for {}", source.canonical());
            return Ok(target);
        }
        std::fs::create_dir_all(target.parent().unwrap())?;

        // Clone into a temp sibling, then rename into place so concurrent
        // readers never see a partial checkout.
        let staging = self
            .cache_root
            .join("modules")
            .join(format!(".tmp-{}", uuid::Uuid::new_v4()));

        let mut cmd = std::process::Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(reference) = reference {
            cmd.arg("--branch").arg(reference);
        }
        cmd.arg(url).arg(&staging);
        debug!("fetching {}", source.canonical());
        let output = cmd.output().map_err(|e| StratusError::SourceFetch {
            source_desc: source.canonical(),
            message: format!("failed to spawn git: {e}"),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A ref that is not a branch or tag needs a full clone.
            let fetched = reference.is_some()
                && stderr.contains("Remote branch")
                && self.clone_at_commit(url, reference.unwrap(), &staging).is_ok();
            if !fetched {
                std::fs::remove_dir_all(&staging).ok();
                return Err(StratusError::SourceFetch {
                    source_desc: source.canonical(),
                    message: stderr.trim().to_string(),
                });
            }
        }

        std::fs::rename(&staging, &target)?;
        Ok(target)
    }

    fn clone_at_commit(&self, url: &str, commit: &str, staging: &Path) -> StratusResult<()> {
        std::fs::remove_dir_all(staging).ok();
        let run = |args: &[&str], dir: Option<&Path>| -> StratusResult<()> {
            let mut cmd = std::process::Command::new("git");
            cmd.args(args);
            if let Some(dir) = dir {
                cmd.current_dir(dir);
            }
            let output = cmd.output().map_err(|e| StratusError::SourceFetch {
                source_desc: url.to_string(),
                message: e.to_string(),
            })?;
            if output.status.success() {
                Ok(())
            } else {
                Err(StratusError::SourceFetch {
                    source_desc: url.to_string(),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        };
        run(&["clone", url, &staging.to_string_lossy()], None)?;
        run(&["checkout", commit], Some(staging))
    }

    /// Asks the registry for the module's download location, which is
    /// itself a source descriptor (typically `git::`).
    fn resolve_registry(&self, source: &SourceKind) -> StratusResult<SourceKind> {
        let SourceKind::Registry {
            host,
            namespace,
            name,
            provider,
            version,
        } = source
        else {
            unreachable!("resolve_registry called with a non-registry source");
        };
        let version = version.as_deref().ok_or_else(|| StratusError::SourceFetch {
            source_desc: source.canonical(),
            message: "registry source needs an explicit ?version=".to_string(),
        })?;

        let endpoint = format!(
            "https://{host}/v1/modules/{namespace}/{name}/{provider}/{version}/download"
        );
        let url = Url::parse(&endpoint).map_err(|e| StratusError::SourceFetch {
            source_desc: source.canonical(),
            message: e.to_string(),
        })?;

        let client = reqwest::blocking::Client::new();
        let response = client
            .get(url)
            .send()
            .map_err(|e| StratusError::SourceFetch {
                source_desc: source.canonical(),
                message: format!("registry request failed: {e}"),
            })?;

        let location = response
            .headers()
            .get("x-terraform-get")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StratusError::SourceFetch {
                source_desc: source.canonical(),
                message: format!(
                    "registry returned {} without a download location",
                    response.status()
                ),
            })?;

        parse_source(&location, Path::new("/"))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Recursively copies a fetched module into a destination directory,
/// skipping orchestrator-owned cache directories.
pub fn copy_tree(src: &Path, dst: &Path) -> StratusResult<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str == ".terragrunt-cache" || name_str == ".git" {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_relative() {
        let parsed = parse_source("../modules/vpc", Path::new("/repo/app")).unwrap();
        assert_eq!(parsed, SourceKind::Local(PathBuf::from("/repo/modules/vpc")));
    }

    #[test]
    fn test_parse_git_with_ref_and_subdir() {
        let parsed = parse_source(
            "git::https://github.com/acme/modules.git//vpc?ref=v1.2.0",
            Path::new("/repo"),
        )
        .unwrap();
        assert_eq!(
            parsed,
            SourceKind::Git {
                url: "https://github.com/acme/modules.git".to_string(),
                reference: Some("v1.2.0".to_string()),
                subdir: Some("vpc".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_git_ref_on_base_url() {
        let parsed = parse_source(
            "https://github.com/acme/modules.git?ref=main",
            Path::new("/repo"),
        )
        .unwrap();
        assert_eq!(
            parsed,
            SourceKind::Git {
                url: "https://github.com/acme/modules.git".to_string(),
                reference: Some("main".to_string()),
                subdir: None,
            }
        );
    }

    #[test]
    fn test_parse_registry() {
        let parsed = parse_source(
            "tfr://registry.example.com/acme/vpc/aws?version=3.1.0",
            Path::new("/repo"),
        )
        .unwrap();
        assert_eq!(
            parsed,
            SourceKind::Registry {
                host: "registry.example.com".to_string(),
                namespace: "acme".to_string(),
                name: "vpc".to_string(),
                provider: "aws".to_string(),
                version: Some("3.1.0".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_registry_default_host() {
        let parsed = parse_source("tfr:///acme/vpc/aws?version=3.1.0", Path::new("/repo")).unwrap();
        match parsed {
            SourceKind::Registry { host, .. } => assert_eq!(host, DEFAULT_REGISTRY),
            other => panic!("expected registry source, got {other:?}"),
        }
    }

    #[test]
    fn test_cache_key_stable_and_ref_sensitive() {
        let a = parse_source(
            "git::https://example.com/m.git//vpc?ref=v1",
            Path::new("/"),
        )
        .unwrap();
        let b = parse_source(
            "git::https://example.com/m.git//vpc?ref=v2",
            Path::new("/"),
        )
        .unwrap();
        assert_eq!(a.cache_key(), a.cache_key());
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_fetch_local_missing_dir() {
        let fetcher = SourceFetcher::new(Path::new("/tmp/stratus-cache-test"));
        let err = fetcher
            .fetch(&SourceKind::Local(PathBuf::from("/does/not/exist")))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SourceFetch);
    }

    #[test]
    fn test_copy_tree_skips_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join(".terragrunt-cache/deep")).unwrap();
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("main.tf"), "x").unwrap();
        std::fs::write(src.join("sub/out.tf"), "y").unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert!(dst.join("main.tf").is_file());
        assert!(dst.join("sub/out.tf").is_file());
        assert!(!dst.join(".terragrunt-cache").exists());
    }
}
