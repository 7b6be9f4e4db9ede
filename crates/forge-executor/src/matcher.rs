//! Resource claim overlap detection and glob expansion.
//!
//! Claims are repository-relative paths or glob patterns. Two claims overlap
//! when they may name a common file: identical paths, a glob matching a path,
//! a directory containing a path, or two globs whose base directories nest.

use forge_core::IgnoreLock as _;
use forge_core::config::DEFAULT_STATE_DIR;
use glob::{MatchOptions, Pattern, PatternError};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Characters that turn a claim into a glob pattern.
const GLOB_CHARS: [char; 4] = ['*', '?', '[', '{'];

/// `*` stays within one path component, `**` spans directories, dot files match.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

type ExpansionCache = HashMap<(PathBuf, String), Vec<String>>;

/// Decides claim overlap and expands glob claims to concrete files.
#[derive(Debug)]
pub struct ResourceMatcher {
    excluded: Vec<String>,
    cache: Mutex<ExpansionCache>,
}

impl Default for ResourceMatcher {
    fn default() -> Self {
        Self::new(vec![".git".to_owned(), DEFAULT_STATE_DIR.to_owned()])
    }
}

impl ResourceMatcher {
    /// Create a matcher whose expansion walk skips the `excluded` directory names.
    pub fn new(excluded: Vec<String>) -> Self {
        Self {
            excluded,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether two claims may refer to a common file.
    pub fn overlaps(first: &str, second: &str) -> bool {
        let norm_first = Self::normalize_path(first);
        let norm_second = Self::normalize_path(second);

        if norm_first == norm_second {
            return true;
        }

        let first_glob = Self::is_glob(&norm_first);
        let second_glob = Self::is_glob(&norm_second);

        if first_glob && Self::glob_covers(&norm_first, &norm_second) {
            return true;
        }
        if second_glob && Self::glob_covers(&norm_second, &norm_first) {
            return true;
        }

        if Self::is_ancestor(&norm_first, &norm_second)
            || Self::is_ancestor(&norm_second, &norm_first)
        {
            return true;
        }

        if first_glob && second_glob {
            let first_base = Self::base_directory(&norm_first);
            let second_base = Self::base_directory(&norm_second);
            return Self::is_ancestor(&first_base, &second_base)
                || Self::is_ancestor(&second_base, &first_base);
        }

        false
    }

    /// Whether `ancestor` is `descendant` or one of its parent directories.
    ///
    /// Glob suffixes are stripped from both sides; `.` and the empty path are
    /// ancestors of everything.
    pub fn is_ancestor(ancestor: &str, descendant: &str) -> bool {
        let clean_ancestor = Self::normalize_path(&Self::strip_glob(ancestor));
        let clean_descendant = Self::normalize_path(&Self::strip_glob(descendant));

        if clean_ancestor == "." || clean_ancestor == "/" {
            return true;
        }
        if clean_ancestor == clean_descendant {
            return true;
        }

        let with_separator = if clean_ancestor.ends_with('/') {
            clean_ancestor
        } else {
            format!("{clean_ancestor}/")
        };
        clean_descendant.starts_with(&with_separator)
    }

    /// Whether a concrete file `path` falls under `claim`.
    ///
    /// Unlike [`Self::overlaps`] this is exact: a glob must match the path and a
    /// literal must be the path or one of its directories.
    pub fn claim_covers(claim: &str, path: &str) -> bool {
        let normalized = Self::normalize_path(claim);
        if !Self::is_glob(&normalized) {
            return Self::is_ancestor(&normalized, path);
        }
        let file = Self::normalize_path(path);
        Self::compile(&normalized).map_or_else(
            |_| normalized == file,
            |patterns| {
                patterns
                    .iter()
                    .any(|pattern| pattern.matches_with(&file, MATCH_OPTIONS))
            },
        )
    }

    /// Whether a claim contains glob syntax.
    pub fn is_glob(claim: &str) -> bool {
        claim.contains(GLOB_CHARS)
    }

    /// Literal directory prefix of a glob pattern; `.` when the pattern starts with a glob.
    pub fn base_directory(pattern: &str) -> String {
        let stripped = Self::strip_glob(pattern);
        if stripped.is_empty() {
            ".".to_owned()
        } else {
            stripped
        }
    }

    /// Normalize separators, drop `./` and resolve `..` segments.
    ///
    /// The empty path normalizes to `.`.
    pub fn normalize_path(path: &str) -> String {
        let unified = path.replace('\\', "/");
        let absolute = unified.starts_with('/');
        let mut segments: Vec<&str> = Vec::new();

        for segment in unified.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.last().is_some_and(|last| *last != "..") {
                        segments.pop();
                    } else if !absolute {
                        segments.push("..");
                    }
                }
                other => segments.push(other),
            }
        }

        let joined = segments.join("/");
        match (absolute, joined.is_empty()) {
            (true, _) => format!("/{joined}"),
            (false, true) => ".".to_owned(),
            (false, false) => joined,
        }
    }

    /// Expand claims to repository-relative files, deduplicated and sorted.
    ///
    /// Literal claims pass through unchanged. Glob expansions are cached per
    /// `(repo_root, claim)` until [`Self::invalidate_cache`] or [`Self::clear_cache`].
    pub async fn expand_claims(&self, repo_root: &Path, claims: &[String]) -> Vec<String> {
        let mut expanded = BTreeSet::new();

        for claim in claims {
            let key = (repo_root.to_path_buf(), claim.clone());
            let cached = self.cache.lock_ignore_poison().get(&key).cloned();
            let files = if let Some(files) = cached {
                files
            } else {
                let files = self.expand_uncached(repo_root, claim).await;
                self.cache.lock_ignore_poison().insert(key, files.clone());
                files
            };
            expanded.extend(files);
        }

        expanded.into_iter().collect()
    }

    /// Expand one claim without consulting the cache.
    ///
    /// Invalid patterns and unreadable roots degrade to the literal claim.
    pub async fn expand_uncached(&self, repo_root: &Path, claim: &str) -> Vec<String> {
        if !Self::is_glob(claim) {
            return vec![claim.to_owned()];
        }

        let normalized = Self::normalize_path(claim);
        let patterns = match Self::compile(&normalized) {
            Ok(patterns) => patterns,
            Err(error) => {
                warn!("Invalid glob pattern {claim}: {error}; treating it as a literal path");
                return vec![claim.to_owned()];
            }
        };

        if !repo_root.is_dir() {
            warn!(
                "Cannot expand {claim}: {} is not a directory; treating it as a literal path",
                repo_root.display()
            );
            return vec![claim.to_owned()];
        }

        let root = repo_root.to_path_buf();
        let base = Self::base_directory(&normalized);
        let excluded = self.excluded.clone();
        let walk = spawn_blocking(move || Self::walk_matches(&root, &base, &patterns, &excluded));

        match walk.await {
            Ok(files) => {
                debug!("Expanded {claim} to {} files", files.len());
                files
            }
            Err(error) => {
                warn!("Glob expansion of {claim} failed: {error}; treating it as a literal path");
                vec![claim.to_owned()]
            }
        }
    }

    /// Drop cached expansions for one repository.
    pub fn invalidate_cache(&self, repo_root: &Path) {
        self.cache
            .lock_ignore_poison()
            .retain(|(root, _), _| root != repo_root);
    }

    /// Drop every cached expansion.
    pub fn clear_cache(&self) {
        self.cache.lock_ignore_poison().clear();
    }

    /// Number of cached `(root, claim)` expansions.
    pub fn cached_entries(&self) -> usize {
        self.cache.lock_ignore_poison().len()
    }

    fn glob_covers(pattern: &str, path: &str) -> bool {
        let matched = Self::compile(pattern).is_ok_and(|patterns| {
            patterns
                .iter()
                .any(|compiled| compiled.matches_with(path, MATCH_OPTIONS))
        });
        matched || Self::is_ancestor(&Self::base_directory(pattern), path)
    }

    fn compile(pattern: &str) -> Result<Vec<Pattern>, PatternError> {
        expand_braces(pattern)
            .iter()
            .map(|alternative| Pattern::new(alternative))
            .collect()
    }

    fn strip_glob(path: &str) -> String {
        path.find(GLOB_CHARS).map_or_else(
            || path.to_owned(),
            |index| path[..index].trim_end_matches(['/', '\\']).to_owned(),
        )
    }

    fn walk_matches(
        root: &Path,
        base: &str,
        patterns: &[Pattern],
        excluded: &[String],
    ) -> Vec<String> {
        let start = if base == "." {
            root.to_path_buf()
        } else {
            root.join(base)
        };
        if !start.exists() {
            return Vec::new();
        }

        let is_excluded = |entry: &DirEntry| {
            entry.depth() > 0
                && entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| excluded.iter().any(|skip| skip == name))
        };

        let mut files = Vec::new();
        for entry in WalkDir::new(&start)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_excluded(entry))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    debug!("Skipping unreadable entry during expansion: {error}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = entry
                .path()
                .strip_prefix(root)
                .ok()
                .and_then(|relative| relative.to_str())
                .map(|relative| relative.replace('\\', "/"))
            else {
                continue;
            };
            if patterns
                .iter()
                .any(|pattern| pattern.matches_with(&relative, MATCH_OPTIONS))
            {
                files.push(relative);
            }
        }

        files.sort();
        files
    }
}

/// Expand `{a,b}` alternatives into separate patterns.
///
/// Nested groups are expanded recursively; an unbalanced `{` is kept literally.
fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_owned()];
    };

    let mut depth = 0usize;
    let mut close = None;
    let mut splits = Vec::new();
    for (offset, character) in pattern[open..].char_indices() {
        let index = open + offset;
        match character {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(index);
                    break;
                }
            }
            ',' if depth == 1 => splits.push(index),
            _ => {}
        }
    }

    let Some(close) = close else {
        return vec![pattern.to_owned()];
    };

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    let mut bounds = vec![open];
    bounds.extend(splits);
    bounds.push(close);

    bounds
        .windows(2)
        .flat_map(|window| {
            let alternative = &pattern[window[0] + 1..window[1]];
            expand_braces(&format!("{prefix}{alternative}{suffix}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io};
    use tempfile::TempDir;

    #[test]
    fn test_overlaps_exact_and_glob() {
        assert!(ResourceMatcher::overlaps("src/file.ts", "src/file.ts"));
        assert!(ResourceMatcher::overlaps("src/**", "src/api/server.ts"));
        assert!(ResourceMatcher::overlaps("src/api/server.ts", "src/**"));
        assert!(ResourceMatcher::overlaps("src/*.ts", "src/file.ts"));
        assert!(ResourceMatcher::overlaps("src/**/*.ts", "src/api/handler.ts"));
        assert!(ResourceMatcher::overlaps("docs/*.md", "docs/README.md"));
    }

    #[test]
    fn test_overlaps_hierarchy() {
        assert!(ResourceMatcher::overlaps("src", "src/api/server.ts"));
        assert!(ResourceMatcher::overlaps("src/api", "src"));
        assert!(ResourceMatcher::overlaps("a/b/c/d", "a/b/c/d/e/f/g/h/file.ts"));
        assert!(ResourceMatcher::overlaps(".", "src/file.ts"));
        assert!(ResourceMatcher::overlaps("", ""));
    }

    #[test]
    fn test_overlaps_disjoint() {
        assert!(!ResourceMatcher::overlaps("src/**", "tests/**"));
        assert!(!ResourceMatcher::overlaps("src/api", "src/lib"));
        assert!(!ResourceMatcher::overlaps("src/file1.ts", "src/file2.ts"));
        assert!(!ResourceMatcher::overlaps("tests/integration.test.ts", "src/file.ts"));
        assert!(!ResourceMatcher::overlaps("src/mcp/tools/**", "src/mcp/execution/manager.ts"));
    }

    #[test]
    fn test_overlaps_glob_pairs() {
        assert!(ResourceMatcher::overlaps("src/**", "src/**/*.ts"));
        assert!(ResourceMatcher::overlaps("src/api/**", "src/**"));
        assert!(ResourceMatcher::overlaps("src/{api,lib}/*.ts", "src/lib/util.ts"));
    }

    #[test]
    fn test_overlaps_normalizes() {
        assert!(ResourceMatcher::overlaps("./src/file.ts", "src/file.ts"));
        assert!(ResourceMatcher::overlaps("src/api/../file.ts", "src/file.ts"));
        assert!(ResourceMatcher::overlaps("src\\file.ts", "src/file.ts"));
    }

    #[test]
    fn test_is_ancestor() {
        assert!(ResourceMatcher::is_ancestor("src", "src/file.ts"));
        assert!(ResourceMatcher::is_ancestor("src/api", "src/api/handlers/user.ts"));
        assert!(ResourceMatcher::is_ancestor("src/**", "src/api/file.ts"));
        assert!(ResourceMatcher::is_ancestor("src", "src/**/*.ts"));
        assert!(ResourceMatcher::is_ancestor("src", "src"));
        assert!(ResourceMatcher::is_ancestor(".", "tests/test.ts"));
        assert!(!ResourceMatcher::is_ancestor("src/api", "src/lib"));
        assert!(!ResourceMatcher::is_ancestor("src/ap", "src/api/file.ts"));
        assert!(!ResourceMatcher::is_ancestor("tests", "src/file.ts"));
    }

    #[test]
    fn test_normalize_and_base_directory() {
        assert_eq!(ResourceMatcher::normalize_path("./src//a/./b.ts"), "src/a/b.ts");
        assert_eq!(ResourceMatcher::normalize_path(""), ".");
        assert_eq!(ResourceMatcher::normalize_path("../x"), "../x");
        assert_eq!(ResourceMatcher::normalize_path("src\\api\\..\\main.ts"), "src/main.ts");
        assert_eq!(ResourceMatcher::base_directory("src/**/*.ts"), "src");
        assert_eq!(ResourceMatcher::base_directory("*.ts"), ".");
        assert!(ResourceMatcher::is_glob("src/{a,b}.ts"));
        assert!(!ResourceMatcher::is_glob("src/a.ts"));
    }

    #[test]
    fn test_claim_covers() {
        assert!(ResourceMatcher::claim_covers("src/**/*.ts", "src/api/server.ts"));
        assert!(ResourceMatcher::claim_covers("src/*.ts", "src/main.ts"));
        assert!(!ResourceMatcher::claim_covers("src/*.ts", "src/api/server.ts"));
        assert!(!ResourceMatcher::claim_covers("src/**/*.ts", "src/readme.md"));
        assert!(ResourceMatcher::claim_covers("src", "src/readme.md"));
        assert!(ResourceMatcher::claim_covers("./notes.md", "notes.md"));
        assert!(!ResourceMatcher::claim_covers("notes.md", "other.md"));
    }

    #[test]
    fn test_expand_braces() {
        assert_eq!(expand_braces("src/{a,b}.ts"), vec!["src/a.ts", "src/b.ts"]);
        assert_eq!(
            expand_braces("{x,y/{1,2}}.md"),
            vec!["x.md", "y/1.md", "y/2.md"]
        );
        assert_eq!(expand_braces("src/{a.ts"), vec!["src/{a.ts"]);
    }

    #[tokio::test]
    async fn test_expand_literal_claims() {
        let matcher = ResourceMatcher::default();
        let claims = vec!["src/file.ts".to_owned(), "src/file.ts".to_owned()];
        let expanded = matcher.expand_claims(Path::new("/tmp/repo"), &claims).await;
        assert_eq!(expanded, vec!["src/file.ts"]);

        let empty = matcher.expand_claims(Path::new("/tmp/repo"), &[]).await;
        assert!(empty.is_empty());
    }

    /// Tests glob expansion against a real tree, exclusions and caching.
    ///
    /// # Errors
    /// Returns an error if the fixture tree cannot be written.
    #[tokio::test]
    async fn test_expand_glob_claims() -> io::Result<()> {
        let tmp_dir = TempDir::new()?;
        let root = tmp_dir.path();
        fs::create_dir_all(root.join("src/api"))?;
        fs::create_dir_all(root.join(".git"))?;
        fs::write(root.join("src/main.ts"), "main")?;
        fs::write(root.join("src/api/server.ts"), "server")?;
        fs::write(root.join("src/api/.env"), "secret")?;
        fs::write(root.join("src/readme.md"), "docs")?;
        fs::write(root.join(".git/config.ts"), "git")?;

        let matcher = ResourceMatcher::default();
        let claims = vec!["src/**/*.ts".to_owned()];
        let expanded = matcher.expand_claims(root, &claims).await;
        assert_eq!(expanded, vec!["src/api/server.ts", "src/main.ts"]);

        let top_level = matcher.expand_claims(root, &["src/*".to_owned()]).await;
        assert_eq!(top_level, vec!["src/main.ts", "src/readme.md"]);

        let everything = matcher.expand_claims(root, &["**".to_owned()]).await;
        assert!(everything.contains(&"src/api/.env".to_owned()));
        assert!(!everything.iter().any(|file| file.starts_with(".git")));

        assert_eq!(matcher.cached_entries(), 3);
        fs::write(root.join("src/new.ts"), "new")?;
        let stale = matcher.expand_claims(root, &claims).await;
        assert_eq!(stale.len(), 2);

        matcher.invalidate_cache(root);
        assert_eq!(matcher.cached_entries(), 0);
        let fresh = matcher.expand_claims(root, &claims).await;
        assert_eq!(fresh.len(), 3);

        matcher.clear_cache();
        assert_eq!(matcher.cached_entries(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_pattern_degrades_to_literal() {
        let matcher = ResourceMatcher::default();
        let expanded = matcher
            .expand_uncached(Path::new("/tmp"), "src/**.ts[")
            .await;
        assert_eq!(expanded, vec!["src/**.ts["]);
    }
}
