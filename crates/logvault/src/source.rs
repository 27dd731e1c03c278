//! Truss extraction per source kind
//!
//! Self-describing containers yield one truss per recordset from their
//! header. Raw imports yield a single placeholder truss; everything else
//! about them is only known after the device parser ran.
//!
//! Self-describing sources may be link files: either an OS symlink or a
//! small text file starting with [`LINK_MARKER`] followed by the target path.
//! Links whose target cannot be reached are deleted.

use crate::container;
use crate::context::DeviceProfile;
use crate::error::{ParseError, Result, VaultError};
use crate::parser::FormatParser;
use crate::types::{SourceFile, SourceKind, Truss, Vault};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, warn};

/// First bytes of a link file
pub const LINK_MARKER: &str = "@link ";

/// Files larger than this are never treated as link files
const MAX_LINK_FILE_BYTES: u64 = 4096;

/// Inputs shared by all extractions of one rebuild
#[derive(Debug, Clone)]
pub struct ExtractContext {
    pub device: DeviceProfile,
    pub channel_number: u32,
    pub dead_link_threshold: Duration,
}

/// Recordset the host should open for a vault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub path: PathBuf,
    pub kind: SourceKind,
    /// Ordinal inside a container; raw imports are selected by name instead
    pub recordset_ordinal: Option<u32>,
    pub recordset_base_name: String,
}

impl SourceKind {
    pub fn supports_link(&self) -> bool {
        matches!(self, SourceKind::SelfDescribing)
    }

    /// Lightweight trusses for one scanned file. Failures yield no trusses.
    pub fn extract_trusses(&self, file: &SourceFile, ctx: &ExtractContext) -> Vec<Truss> {
        let result = match self {
            SourceKind::SelfDescribing => extract_container_trusses(file, ctx),
            SourceKind::ImportRaw => extract_import_truss(file, ctx).map(|t| vec![t]),
        };
        match result {
            Ok(trusses) => trusses,
            Err(VaultError::DeadLink(link)) => {
                debug!(link = %link.display(), "Dead link yields no trusses");
                Vec::new()
            }
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "Truss extraction failed");
                Vec::new()
            }
        }
    }

    /// Full parse of one job through the format parser
    pub fn read_vaults(
        &self,
        parser: &dyn FormatParser,
        path: &Path,
        trusses: &[Truss],
    ) -> std::result::Result<Vec<Vault>, ParseError> {
        parser.parse(*self, path, trusses)
    }

    /// Describe how the host opens the recordset behind `vault`
    pub fn load(&self, vault: &Vault) -> Result<LoadRequest> {
        let path = vault.truss.resolved_path.clone();
        if !path.exists() {
            return Err(VaultError::FileNotFound(path));
        }
        Ok(LoadRequest {
            path,
            kind: *self,
            recordset_ordinal: match self {
                SourceKind::SelfDescribing => Some(vault.truss.recordset_ordinal),
                SourceKind::ImportRaw => None,
            },
            recordset_base_name: vault.truss.recordset_base_name.clone(),
        })
    }
}

/// Outcome of link resolution for a scanned file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkResolution {
    Direct(PathBuf),
    Linked { link: PathBuf, target: PathBuf },
}

/// Resolve symlinks and link files. A dead link is deleted and reported as
/// [`VaultError::DeadLink`].
pub fn resolve_link(path: &Path, dead_link_threshold: Duration) -> Result<LinkResolution> {
    let start = Instant::now();
    let target = match read_link_target(path) {
        Ok(Some(target)) => target,
        Ok(None) => return Ok(LinkResolution::Direct(path.to_path_buf())),
        Err(e) => {
            // unreadable marker: only give up on the link if resolving it also took long
            if start.elapsed() > dead_link_threshold {
                delete_dead_link(path, &format!("unresolvable: {}", e));
                return Err(VaultError::DeadLink(path.to_path_buf()));
            }
            debug!(path = %path.display(), error = %e, "Treating unreadable link candidate as a plain file");
            return Ok(LinkResolution::Direct(path.to_path_buf()));
        }
    };

    let reachable = target.is_file();
    let elapsed = start.elapsed();
    if !reachable {
        delete_dead_link(path, "target missing");
        return Err(VaultError::DeadLink(path.to_path_buf()));
    }
    if elapsed > dead_link_threshold {
        debug!(
            link = %path.display(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Slow link resolution"
        );
    }
    Ok(LinkResolution::Linked {
        link: path.to_path_buf(),
        target,
    })
}

fn read_link_target(path: &Path) -> std::io::Result<Option<PathBuf>> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        return Ok(Some(absolutize(path, target)));
    }
    if meta.len() > MAX_LINK_FILE_BYTES {
        return Ok(None);
    }

    let mut content = String::new();
    match fs::File::open(path)?.read_to_string(&mut content) {
        Ok(_) => {}
        // binary content is never a link file
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => return Ok(None),
        Err(e) => return Err(e),
    }
    let Some(rest) = content.strip_prefix(LINK_MARKER) else {
        return Ok(None);
    };
    let target = rest.lines().next().unwrap_or_default().trim();
    if target.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "link file names no target",
        ));
    }
    Ok(Some(absolutize(path, PathBuf::from(target))))
}

fn absolutize(link: &Path, target: PathBuf) -> PathBuf {
    if target.is_absolute() {
        return target;
    }
    link.parent().map(|p| p.join(&target)).unwrap_or(target)
}

fn delete_dead_link(link: &Path, reason: &str) {
    match fs::remove_file(link) {
        Ok(()) => warn!(link = %link.display(), reason, "Deleted dead link"),
        Err(e) => warn!(link = %link.display(), reason, error = %e, "Failed to delete dead link"),
    }
}

fn file_size_and_mtime(path: &Path) -> Result<(u64, i64)> {
    let meta = fs::metadata(path)?;
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok((meta.len(), modified_ms))
}

/// Enclosing folder name, or empty if that folder is the device folder
fn object_directory(path: &Path, device: &DeviceProfile) -> String {
    let name = path
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.eq_ignore_ascii_case(device.pure_name()) {
        String::new()
    } else {
        name
    }
}

fn extract_container_trusses(file: &SourceFile, ctx: &ExtractContext) -> Result<Vec<Truss>> {
    let (resolved, link) = match resolve_link(&file.path, ctx.dead_link_threshold)? {
        LinkResolution::Direct(path) => (path, None),
        LinkResolution::Linked { link, target } => (target, Some(link)),
    };

    let header = container::read_header(&resolved).map_err(|e| match e {
        ParseError::Io(io) => VaultError::Io(io),
        other => VaultError::InvalidState(other.to_string()),
    })?;
    let (file_size, file_modified_ms) = file_size_and_mtime(&resolved)?;
    let object_directory = object_directory(&file.path, &ctx.device);

    Ok(header
        .recordsets
        .iter()
        .map(|recordset| Truss {
            device_name: header.device.clone(),
            channel_number: recordset.channel,
            object_key: header.object_key.clone(),
            start_timestamp_ms: recordset.start_ms,
            recordset_ordinal: recordset.ordinal,
            recordset_base_name: recordset.name.clone(),
            source_path: file.path.clone(),
            resolved_path: resolved.clone(),
            link_path: link.clone(),
            object_directory: object_directory.clone(),
            file_size,
            file_modified_ms,
            kind: SourceKind::SelfDescribing,
            complete: false,
        })
        .collect())
}

fn extract_import_truss(file: &SourceFile, ctx: &ExtractContext) -> Result<Truss> {
    let (file_size, file_modified_ms) = file_size_and_mtime(&file.path)?;
    let object_directory = object_directory(&file.path, &ctx.device);
    let stem = file
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Truss {
        device_name: ctx.device.name.clone(),
        channel_number: ctx.channel_number,
        object_key: object_directory.clone(),
        start_timestamp_ms: file_modified_ms,
        recordset_ordinal: 0,
        recordset_base_name: format!("{} {}", ctx.device.channel_label(ctx.channel_number), stem),
        source_path: file.path.clone(),
        resolved_path: file.path.clone(),
        link_path: None,
        object_directory,
        file_size,
        file_modified_ms,
        kind: SourceKind::ImportRaw,
        complete: false,
    })
}

/// Extract trusses for all files on scoped worker threads
pub fn extract_all(files: &[SourceFile], ctx: &ExtractContext, threads: usize) -> Vec<Truss> {
    if files.is_empty() {
        return Vec::new();
    }
    let chunk_size = files.len().div_ceil(threads.max(1));
    std::thread::scope(|scope| {
        let handles: Vec<_> = files
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .flat_map(|file| file.kind.extract_trusses(file, ctx))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    warn!("Truss extraction worker panicked");
                    Vec::new()
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{write_container, ContainerHeader, RecordsetHeader};
    use crate::types::DirectoryType;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    struct TestEnv {
        _temp: TempDir,
        root: PathBuf,
    }

    impl TestEnv {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().to_path_buf();
            Self { _temp: temp, root }
        }

        fn container(&self, rel: &str, recordsets: usize) -> PathBuf {
            let path = self.root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            let header = ContainerHeader {
                device: "Dev".to_string(),
                object_key: "Plane".to_string(),
                recordsets: (0..recordsets as u32)
                    .map(|i| RecordsetHeader {
                        ordinal: i,
                        name: format!("{}) Flight", i + 1),
                        channel: 1,
                        start_ms: 1_000 + i64::from(i),
                    })
                    .collect(),
            };
            write_container(&path, &header, &[]).unwrap();
            path
        }

        fn write_file(&self, rel: &str, content: &str) -> PathBuf {
            let path = self.root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }
    }

    fn ctx() -> ExtractContext {
        ExtractContext {
            device: DeviceProfile::new("Dev").with_channel_label(1, "Receiver"),
            channel_number: 1,
            dead_link_threshold: Duration::from_millis(555),
        }
    }

    fn source(path: PathBuf, kind: SourceKind) -> SourceFile {
        let extension = crate::scanner::lowercase_extension(&path);
        SourceFile {
            path,
            directory_type: DirectoryType::Data,
            extension,
            kind,
        }
    }

    #[test]
    fn test_container_yields_one_truss_per_recordset() {
        let env = TestEnv::new();
        let path = env.container("Dev/A.lvc", 3);

        let trusses = SourceKind::SelfDescribing.extract_trusses(&source(path.clone(), SourceKind::SelfDescribing), &ctx());

        assert_eq!(trusses.len(), 3);
        assert!(trusses.iter().all(|t| t.resolved_path == path && t.link_path.is_none()));
        assert!(trusses.iter().all(|t| !t.complete && t.object_key == "Plane"));
        // device folder is not an object directory
        assert_eq!(trusses[0].object_directory, "");
        assert_eq!(trusses[2].recordset_ordinal, 2);
    }

    #[test]
    fn test_link_file_resolves_to_target() {
        let env = TestEnv::new();
        let target = env.container("store/A.lvc", 1);
        let link = env.write_file("Dev/plane1/B.lvc", &format!("{}{}\n", LINK_MARKER, target.display()));

        let trusses = SourceKind::SelfDescribing.extract_trusses(&source(link.clone(), SourceKind::SelfDescribing), &ctx());

        assert_eq!(trusses.len(), 1);
        assert_eq!(trusses[0].resolved_path, target);
        assert_eq!(trusses[0].link_path.as_deref(), Some(link.as_path()));
        assert_eq!(trusses[0].source_path, link);
        assert_eq!(trusses[0].object_directory, "plane1");
    }

    #[test]
    fn test_relative_link_resolves_against_link_folder() {
        let env = TestEnv::new();
        let target = env.container("Dev/A.lvc", 1);
        let link = env.write_file("Dev/B.lvc", "@link A.lvc\n");

        match resolve_link(&link, Duration::from_millis(555)).unwrap() {
            LinkResolution::Linked { target: t, .. } => assert_eq!(t, target),
            other => panic!("expected link, got {:?}", other),
        }
    }

    #[test]
    fn test_dead_link_is_deleted() {
        let env = TestEnv::new();
        let link = env.write_file("Dev/B.lvc", "@link /definitely/not/here.lvc\n");

        let trusses = SourceKind::SelfDescribing.extract_trusses(&source(link.clone(), SourceKind::SelfDescribing), &ctx());

        assert!(trusses.is_empty());
        assert!(!link.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_deleted() {
        let env = TestEnv::new();
        let link = env.root.join("B.lvc");
        std::os::unix::fs::symlink(env.root.join("gone.lvc"), &link).unwrap();

        assert!(matches!(
            resolve_link(&link, Duration::from_millis(555)),
            Err(VaultError::DeadLink(_))
        ));
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn test_import_truss_placeholder() {
        let env = TestEnv::new();
        let path = env.write_file("import/plane7/flight_01.bin", "raw");
        set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

        let trusses = SourceKind::ImportRaw.extract_trusses(&source(path.clone(), SourceKind::ImportRaw), &ctx());

        assert_eq!(trusses.len(), 1);
        let truss = &trusses[0];
        assert_eq!(truss.object_key, "plane7");
        assert_eq!(truss.channel_number, 1);
        assert_eq!(truss.start_timestamp_ms, 1_600_000_000_000);
        assert_eq!(truss.recordset_base_name, "Receiver flight_01");
        assert_eq!(truss.file_size, 3);
        assert!(!SourceKind::ImportRaw.supports_link());
    }

    #[test]
    fn test_unreadable_header_yields_nothing() {
        let env = TestEnv::new();
        let path = env.write_file("Dev/broken.lvc", "not a container");

        let trusses = SourceKind::SelfDescribing.extract_trusses(&source(path.clone(), SourceKind::SelfDescribing), &ctx());
        assert!(trusses.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn test_extract_all_runs_every_file() {
        let env = TestEnv::new();
        let files: Vec<SourceFile> = (0..7)
            .map(|i| source(env.container(&format!("Dev/{}.lvc", i), 2), SourceKind::SelfDescribing))
            .collect();

        assert_eq!(extract_all(&files, &ctx(), 3).len(), 14);
        assert!(extract_all(&[], &ctx(), 3).is_empty());
    }

    #[test]
    fn test_load_request() {
        let env = TestEnv::new();
        let path = env.container("Dev/A.lvc", 2);
        let trusses = SourceKind::SelfDescribing.extract_trusses(&source(path.clone(), SourceKind::SelfDescribing), &ctx());
        let vault = Vault::from_truss(trusses[1].clone());

        let request = SourceKind::SelfDescribing.load(&vault).unwrap();
        assert_eq!(request.path, path);
        assert_eq!(request.recordset_ordinal, Some(1));

        fs::remove_file(&path).unwrap();
        assert!(matches!(
            SourceKind::SelfDescribing.load(&vault),
            Err(VaultError::FileNotFound(_))
        ));
    }
}
