//! Application packaging seam.
//!
//! Trimming proper is performed by the external package pipeline; this seam
//! selects the transfer set for a build output folder against the reported
//! device OS version.

use crate::deploy::DeployError;
use crate::util::CancelToken;
use std::path::{Path, PathBuf};

pub const APP_BINARY: &str = "App.dll";

pub trait Packager: Send {
    /// Produce the ordered list of files to transfer.
    fn prepare(
        &self,
        folder: &Path,
        os_version: &str,
        debugging: bool,
        token: &CancelToken,
    ) -> Result<Vec<PathBuf>, DeployError>;
}

/// Default packager: the application binary plus its runtime payload from
/// the build output folder. Debug symbols travel only when debugging.
pub struct AppPackager;

impl Packager for AppPackager {
    fn prepare(
        &self,
        folder: &Path,
        os_version: &str,
        debugging: bool,
        token: &CancelToken,
    ) -> Result<Vec<PathBuf>, DeployError> {
        token.checkpoint()?;

        let app = folder.join(APP_BINARY);
        if !app.is_file() {
            return Err(DeployError::AppBinaryNotFound(app));
        }

        log::info!(target: "deploy", "packaging {} against OS v{os_version}", app.display());

        let mut files = vec![app.clone()];
        let mut entries: Vec<_> = std::fs::read_dir(folder)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && *path != app)
            .collect();
        entries.sort();

        for path in entries {
            token.checkpoint()?;
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            let include = match ext.as_str() {
                "dll" | "exe" | "json" | "bin" | "txt" | "yaml" => true,
                "pdb" => debugging,
                _ => false,
            };
            if include {
                files.push(path);
            }
        }

        Ok(files)
    }
}
