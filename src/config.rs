//! Boot-time configuration.
//!
//! There is no runtime configuration surface: the host boots this process
//! with everything compiled in, and the replaced-path predicate is a fixed
//! allowlist. The predicate is the single source of truth for which opens
//! are satisfied from external storage instead of the real filesystem.

/// Compiled-in policy of the emulation layer.
#[derive(Clone, Debug)]
pub struct Config {
    /// Write a copy of the log to `log.txt` on the designated drive.
    pub file_log: bool,
    /// Stricter predicate variant: additionally claim the filesystem
    /// content map, so writes to it land on external storage instead of
    /// the real internal filesystem. Off by default, which keeps the
    /// observable allowlist to the save-data paths alone.
    pub protect_content_map: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            file_log: true,
            protect_content_map: false,
        }
    }
}

/// Save-data directories served from external storage. One entry is a
/// prefix (the title's whole data directory), the rest match exactly.
const REPLACED_PREFIXES: &[&str] = &["/title/00010004/524d4350/data/"];

const REPLACED_EXACT: &[&str] = &[
    "/title/00010004/524d4345/data/",
    "/title/00010004/524d434a/data/",
    "/title/00010004/524d434b/data/",
];

/// Map of the internal filesystem's contents; the strict predicate keeps
/// the real one out of reach by claiming the path.
const CONTENT_MAP_PATH: &str = "/shared1/content.map";

impl Config {
    /// Whether an internal-filesystem path is served from FAT storage.
    ///
    /// Pure: the decision depends on nothing but the path text and the
    /// compiled-in policy, so two identical opens always dispatch the
    /// same way.
    pub fn is_path_replaced(&self, path: &str) -> bool {
        if !is_path_valid(path) {
            return false;
        }
        if self.protect_content_map && path == CONTENT_MAP_PATH {
            return true;
        }
        if REPLACED_PREFIXES.iter().any(|p| path.starts_with(p)) {
            return true;
        }
        REPLACED_EXACT.contains(&path)
    }
}

/// Path validity as the real filesystem defines it: rooted and shorter
/// than the 64-byte buffer the service copies it into.
pub(crate) fn is_path_valid(path: &str) -> bool {
    path.starts_with('/') && path.len() < crate::abi::FS_MAX_PATH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_prefix_is_replaced() {
        let config = Config::default();
        assert!(config.is_path_replaced("/title/00010004/524d4350/data/save.bin"));
        assert!(config.is_path_replaced("/title/00010004/524d4350/data/"));
        // The sibling regions only replace the directory itself.
        assert!(config.is_path_replaced("/title/00010004/524d4345/data/"));
        assert!(!config.is_path_replaced("/title/00010004/524d4345/data/save.bin"));
    }

    #[test]
    fn unrelated_paths_pass_through() {
        let config = Config::default();
        assert!(!config.is_path_replaced("/tmp/xyz"));
        assert!(!config.is_path_replaced("/title/00010004/12345678/data/x"));
        assert!(!config.is_path_replaced("/dev/fs"));
    }

    #[test]
    fn malformed_paths_never_match() {
        let config = Config::default();
        assert!(!config.is_path_replaced("title/00010004/524d4350/data/x"));
        let long = format!("/title/00010004/524d4350/data/{}", "a".repeat(64));
        assert!(!config.is_path_replaced(&long));
    }

    #[test]
    fn predicate_is_pure() {
        let config = Config::default();
        let p = "/title/00010004/524d4350/data/rksys.dat";
        assert_eq!(config.is_path_replaced(p), config.is_path_replaced(p));
    }

    #[test]
    fn content_map_follows_the_policy_knob() {
        let permissive = Config::default();
        assert!(!permissive.is_path_replaced(CONTENT_MAP_PATH));

        let strict = Config {
            protect_content_map: true,
            ..Config::default()
        };
        assert!(strict.is_path_replaced(CONTENT_MAP_PATH));
        // The knob claims exactly that path, nothing else nearby.
        assert!(!strict.is_path_replaced("/shared1/content.map.bak"));
        assert!(!strict.is_path_replaced("/shared1/00000000.app"));
    }
}
