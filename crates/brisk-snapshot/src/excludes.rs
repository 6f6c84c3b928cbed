use std::collections::HashSet;

/// SCM and editor files that are never part of a snapshot.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/%*%",
    "**/.git/**",
    "**/.gitattributes",
    "**/.gitignore",
    "**/.gitmodules",
    "**/.hg/**",
    "**/.hgignore",
    "**/.hgsub",
    "**/.hgsubstate",
    "**/.hgtags",
    "**/.svn/**",
    "**/.bzr/**",
    "**/.bzrignore",
    "**/CVS/**",
    "**/.cvsignore",
    "**/SCCS/**",
    "**/vssver.scc",
    "**/.DS_Store",
    "**/#*#",
    "**/._*",
    "**/.#*",
    "**/*~",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct NameMatcher {
    prefix: String,
    suffix: String,
}

impl NameMatcher {
    fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.prefix) && name.ends_with(&self.suffix)
    }
}

/// Name-based excludes applied to every walk.
///
/// Each pattern is one of:
/// - `**/name/**`: a directory name, pruned with everything below it
/// - `**/name`: an exact file name
/// - `**/pre*suf`: a file name with a single `*` wildcard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultExcludes {
    file_names: HashSet<String>,
    dir_names: HashSet<String>,
    file_matchers: Vec<NameMatcher>,
}

impl DefaultExcludes {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut file_names = HashSet::new();
        let mut dir_names = HashSet::new();
        let mut file_matchers = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let pattern = pattern.strip_prefix("**/").unwrap_or(pattern);
            if let Some(dir) = pattern.strip_suffix("/**") {
                dir_names.insert(dir.to_string());
                continue;
            }
            match pattern.split_once('*') {
                None => {
                    file_names.insert(pattern.to_string());
                }
                Some((prefix, suffix)) => file_matchers.push(NameMatcher {
                    prefix: prefix.to_string(),
                    suffix: suffix.to_string(),
                }),
            }
        }
        Self {
            file_names,
            dir_names,
            file_matchers,
        }
    }

    /// Excludes nothing.
    pub fn none() -> Self {
        Self::new(std::iter::empty::<&str>())
    }

    pub fn excludes_dir(&self, name: &str) -> bool {
        self.dir_names.contains(name)
    }

    pub fn excludes_file(&self, name: &str) -> bool {
        self.file_names.contains(name) || self.file_matchers.iter().any(|m| m.matches(name))
    }
}

impl Default for DefaultExcludes {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDES)
    }
}
