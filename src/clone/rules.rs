//! The fixed include/exclude policy shared by rsync and mksquashfs.
//!
//! Patterns use rsync syntax. A leading `/` anchors the pattern at the
//! source root; a trailing `/*` excludes a directory's contents while the
//! directory itself is kept. Unanchored patterns match a file name at any
//! depth and may start with `*`.

use std::path::Path;

const SYSTEM_EXCLUDES: &[&str] = &[
    "/etc/udev/rules.d/70-persistent-cd.rules",
    "/etc/udev/rules.d/70-persistent-net.rules",
    "/etc/mtab",
    "/etc/fstab",
    "/dev/*",
    "/proc/*",
    "/sys/*",
    "/tmp/*",
    "/run/*",
    "/mnt/*",
    "/media/*",
    "/lost+found",
    "rootfs.img",
    "*rootfs1.img",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeRules {
    patterns: Vec<String>,
}

impl ExcludeRules {
    /// No exclusions.
    pub fn none() -> Self {
        Self::default()
    }

    /// The live-system policy. If `staging` sits inside `source_root` it is
    /// excluded too, so a clone never copies itself.
    pub fn system(source_root: &Path, staging: &Path) -> Self {
        let mut rules = Self {
            patterns: SYSTEM_EXCLUDES.iter().map(|p| p.to_string()).collect(),
        };
        if let Ok(nested) = staging.strip_prefix(source_root) {
            if !nested.as_os_str().is_empty() {
                rules.patterns.push(format!("/{}", nested.display()));
            }
        }
        rules
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(pattern.to_string());
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// `--exclude=<pattern>` arguments.
    pub fn rsync_args(&self) -> Vec<String> {
        self.patterns
            .iter()
            .map(|p| format!("--exclude={}", p))
            .collect()
    }

    /// `-wildcards -e <pattern>...` arguments for mksquashfs.
    ///
    /// mksquashfs matches relative to the source root, so anchors are
    /// stripped and unanchored patterns get the `...` any-depth prefix.
    pub fn mksquashfs_args(&self) -> Vec<String> {
        if self.patterns.is_empty() {
            return Vec::new();
        }
        let mut args = vec!["-wildcards".to_string(), "-e".to_string()];
        args.extend(self.patterns.iter().map(|p| match p.strip_prefix('/') {
            Some(anchored) => anchored.to_string(),
            None => format!("... {}", p),
        }));
        args
    }

    /// Whether `relative` (a path below the source root) is left out.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        let rel = relative.to_string_lossy();
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            return false;
        }
        let name = rel.rsplit('/').next().unwrap_or(rel);
        self.patterns.iter().any(|pattern| match pattern.strip_prefix('/') {
            Some(anchored) => match anchored.strip_suffix("/*") {
                Some(dir) => rel
                    .strip_prefix(dir)
                    .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/')),
                None => rel == anchored || rel.starts_with(&format!("{}/", anchored)),
            },
            None => match pattern.strip_prefix('*') {
                Some(suffix) => name.ends_with(suffix),
                None => name == pattern,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ExcludeRules {
        ExcludeRules::system(Path::new("/"), Path::new("/home/demo/clone/clone_system_temp"))
    }

    #[test]
    fn virtual_mount_contents_are_excluded_but_not_the_directory() {
        let rules = rules();
        assert!(!rules.is_excluded(Path::new("proc")));
        assert!(rules.is_excluded(Path::new("proc/1")));
        assert!(rules.is_excluded(Path::new("proc/1/status")));
        assert!(!rules.is_excluded(Path::new("processes.txt")));
        assert!(rules.is_excluded(Path::new("dev/null")));
    }

    #[test]
    fn single_files_and_artifacts() {
        let rules = rules();
        assert!(rules.is_excluded(Path::new("etc/fstab")));
        assert!(!rules.is_excluded(Path::new("etc/fstab.d")));
        assert!(rules.is_excluded(Path::new("lost+found")));
        assert!(rules.is_excluded(Path::new("home/demo/rootfs.img")));
        assert!(rules.is_excluded(Path::new("srv/old-rootfs1.img")));
        assert!(!rules.is_excluded(Path::new("home/user/file.txt")));
    }

    #[test]
    fn nested_staging_is_excluded() {
        let rules = rules();
        assert!(rules.is_excluded(Path::new("home/demo/clone/clone_system_temp")));
        assert!(rules.is_excluded(Path::new("home/demo/clone/clone_system_temp/etc/hosts")));
        assert!(!rules.is_excluded(Path::new("home/demo/clone")));
    }

    #[test]
    fn staging_outside_source_adds_nothing() {
        let rules = ExcludeRules::system(Path::new("/mnt/src"), Path::new("/var/tmp/stage"));
        assert_eq!(rules.patterns().len(), SYSTEM_EXCLUDES.len());
    }

    #[test]
    fn mksquashfs_rendering() {
        let args = ExcludeRules::none()
            .with_pattern("/proc/*")
            .with_pattern("rootfs.img")
            .mksquashfs_args();
        assert_eq!(args, vec!["-wildcards", "-e", "proc/*", "... rootfs.img"]);
        assert!(ExcludeRules::none().mksquashfs_args().is_empty());
    }
}
