//! Launch configuration parsing and validation.

use crate::protocol::LaunchArguments;
use crate::util::fix_path_separators;
use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_CONFIGURATION: &str = "Debug";
pub const DEFAULT_DEBUG_PORT: u16 = 55555;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("{0} is not valid")]
    InvalidField(&'static str),
    #[error("msbuildPropertyFile does not exist at: {0}")]
    PropertyFileMissing(PathBuf),
    #[error("no valid key=value properties found in build properties file: {0}")]
    PropertyFileEmpty(PathBuf),
    #[error("failed to read build properties file: {0}")]
    PropertyFileUnreadable(#[from] std::io::Error),
}

/// Validated launch configuration. Immutable once [`LaunchData::validate`]
/// has succeeded.
#[derive(Debug, Default)]
pub struct LaunchData {
    pub project_path: String,
    pub project_configuration: String,
    pub debug_port: u16,
    pub serial: String,
    pub msbuild_property_file: PathBuf,
    pub skip_deploy: bool,
    properties: HashMap<String, String>,
}

impl LaunchData {
    /// Extract the recognized keys from the launch request arguments,
    /// applying defaults. Validation is a separate step so a structured
    /// error can be surfaced before any device interaction.
    pub fn parse(args: &LaunchArguments) -> LaunchData {
        let non_blank = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        LaunchData {
            project_path: non_blank(&args.project_path).unwrap_or_default(),
            project_configuration: non_blank(&args.project_configuration)
                .unwrap_or_else(|| DEFAULT_CONFIGURATION.to_string()),
            debug_port: args.debug_port.unwrap_or(DEFAULT_DEBUG_PORT),
            serial: non_blank(&args.serial).unwrap_or_default(),
            msbuild_property_file: non_blank(&args.msbuild_property_file)
                .map(|p| PathBuf::from(fix_path_separators(&p)))
                .unwrap_or_default(),
            skip_deploy: args.skip_deploy.unwrap_or(false),
            properties: HashMap::new(),
        }
    }

    /// Check required fields and load the build-properties file.
    pub fn validate(&mut self) -> Result<(), LaunchError> {
        if self.project_path.is_empty() {
            return Err(LaunchError::InvalidField("projectPath"));
        }
        if self.project_configuration.is_empty() {
            return Err(LaunchError::InvalidField("projectConfiguration"));
        }
        if self.serial.is_empty() {
            return Err(LaunchError::InvalidField("serial"));
        }
        if self.msbuild_property_file.as_os_str().is_empty() {
            return Err(LaunchError::InvalidField("msbuildPropertyFile"));
        }
        if !self.msbuild_property_file.is_file() {
            return Err(LaunchError::PropertyFileMissing(
                self.msbuild_property_file.clone(),
            ));
        }

        self.properties = parse_properties(&std::fs::read_to_string(&self.msbuild_property_file)?);
        if self.properties.is_empty() {
            return Err(LaunchError::PropertyFileEmpty(
                self.msbuild_property_file.clone(),
            ));
        }
        Ok(())
    }

    /// Look up an MSBuild-evaluated property. Keys are case-insensitive.
    pub fn build_property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(&name.to_lowercase())
            .map(String::as_str)
    }
}

/// One `key=value` per line; later occurrences win, blank lines and lines
/// without `=` are skipped.
fn parse_properties(content: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            properties.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    properties
}
