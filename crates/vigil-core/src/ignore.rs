//! Directories the crawler should not descend into.
//!
//! Two tiers: fully-ignored directories (`ignore_dirs` config) are invisible
//! to the engine, while VCS directories (`ignore_vcs`, defaulting to `.git`,
//! `.svn` and `.hg`) are watched shallowly — we need to see their lock files
//! appear and vanish — but never crawled recursively.

use vigil_path::PathString;

use crate::config::Config;

pub(crate) struct IgnoreSet {
    full_ignores: Vec<PathString>,
    vcs_ignores: Vec<PathString>,
}

impl IgnoreSet {
    pub(crate) fn new(root_path: &PathString, config: &Config) -> Self {
        let full_ignores = config
            .get_array("ignore_dirs")
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|name| root_path.path_cat(name.split('/')))
                    .collect()
            })
            .unwrap_or_default();

        let vcs_ignores = match config.get_array("ignore_vcs") {
            Some(entries) => entries
                .iter()
                .filter_map(|v| v.as_str())
                .map(|name| root_path.join(name))
                .collect(),
            None => vec![
                root_path.join(".git"),
                root_path.join(".svn"),
                root_path.join(".hg"),
            ],
        };

        Self {
            full_ignores,
            vcs_ignores,
        }
    }

    /// Paths inside a fully-ignored directory are dropped outright.
    pub(crate) fn is_ignore_dir(&self, path: &PathString) -> bool {
        self.full_ignores.iter().any(|dir| path.starts_with(dir))
    }

    /// Is this path a VCS directory (or inside one)?
    pub(crate) fn is_ignore_vcs(&self, path: &PathString) -> bool {
        self.vcs_ignores.iter().any(|dir| path.starts_with(dir))
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use vigil_path::PathString;

    use super::IgnoreSet;
    use crate::config::Config;

    #[test]
    fn test_vcs_defaults() {
        let root = PathString::new("/r");
        let ignores = IgnoreSet::new(&root, &Config::default());
        assert!(ignores.is_ignore_vcs(&PathString::new("/r/.git")));
        assert!(ignores.is_ignore_vcs(&PathString::new("/r/.git/objects")));
        assert!(!ignores.is_ignore_vcs(&PathString::new("/r/.gitignore")));
        assert!(!ignores.is_ignore_dir(&PathString::new("/r/.git")));
    }

    #[test]
    fn test_configured_ignores() {
        let root = PathString::new("/r");
        let config = Config::from_value(json!({
            "ignore_dirs": ["node_modules"],
            "ignore_vcs": [".sl"],
        }))
        .unwrap();
        let ignores = IgnoreSet::new(&root, &config);
        assert!(ignores.is_ignore_dir(&PathString::new("/r/node_modules/dep")));
        assert!(ignores.is_ignore_vcs(&PathString::new("/r/.sl")));
        assert!(!ignores.is_ignore_vcs(&PathString::new("/r/.git")));
    }
}
