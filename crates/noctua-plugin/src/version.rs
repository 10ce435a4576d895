//! Plugin API version negotiation.

use semver::Version;

use crate::abi::{PLUGIN_API_VERSION_MAJOR, PLUGIN_API_VERSION_MINOR, PLUGIN_API_VERSION_PATCH};
use crate::error::{PluginError, Result};

/// The plugin API version implemented by this host
pub fn api_version() -> Version {
    Version::new(
        PLUGIN_API_VERSION_MAJOR,
        PLUGIN_API_VERSION_MINOR,
        PLUGIN_API_VERSION_PATCH,
    )
}

/// Check whether a version the plugin requires is compatible with the host.
///
/// Same major number, and the required version must not be newer than the
/// host's. The error names both versions.
pub fn check_required_version(required: &Version) -> Result<()> {
    let host = api_version();
    if required.major != host.major || *required > host {
        return Err(PluginError::load(format!(
            "plugin requires API version {required} which is not compatible with the host API version {host}"
        )));
    }
    Ok(())
}

/// Parse a version string coming off the ABI
pub fn parse_version(which: &str, s: &str) -> Result<Version> {
    Version::parse(s).map_err(|e| {
        PluginError::load(format!("plugin provided an invalid {which} string '{s}': {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_version_is_compatible() {
        assert!(check_required_version(&api_version()).is_ok());
    }

    #[test]
    fn test_major_mismatch_is_rejected() {
        let required = Version::new(PLUGIN_API_VERSION_MAJOR + 1, 0, 0);
        let err = check_required_version(&required).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(&required.to_string()));
        assert!(msg.contains(&api_version().to_string()));
    }

    #[test]
    fn test_newer_minor_is_rejected() {
        let required = Version::new(PLUGIN_API_VERSION_MAJOR, PLUGIN_API_VERSION_MINOR + 1, 0);
        assert!(check_required_version(&required).is_err());
    }

    #[test]
    fn test_newer_patch_is_rejected() {
        let required = Version::new(
            PLUGIN_API_VERSION_MAJOR,
            PLUGIN_API_VERSION_MINOR,
            PLUGIN_API_VERSION_PATCH + 1,
        );
        assert!(check_required_version(&required).is_err());
    }

    #[test]
    fn test_invalid_version_string() {
        assert!(parse_version("version", "not-a-version").is_err());
        assert_eq!(
            parse_version("version", "1.2.3").unwrap(),
            Version::new(1, 2, 3)
        );
    }
}
