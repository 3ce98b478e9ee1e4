//! The glob generator.
//!
//! A query's glob set may contain redundant components — `some/deep/a.h` and
//! `some/deep/b.h` share a prefix we only want to walk once — so the
//! patterns are compiled into a tree, split on `/`. Execution walks the
//! pattern tree and the directory tree in lockstep, pruning whole subtrees
//! as soon as a component cannot match. `**` segments are the unhappy path:
//! they swallow the remainder of their pattern, get parked on a separate
//! `doublestar_children` bucket, and force a recursive walk that tries each
//! such pattern against every candidate below.

use tracing::warn;
use vigil_path::PathString;
use vigil_wildmatch::{wildmatch, WildFlags};

use crate::{
    errors::QueryError,
    query::{process_file, CaseSensitivity, QueryCtx},
    view::DirId,
};

#[derive(Debug, Default)]
pub(crate) struct GlobNode {
    pattern: String,
    is_leaf: bool,
    had_specials: bool,
    children: Vec<GlobNode>,
    doublestar_children: Vec<GlobNode>,
}

impl GlobNode {
    fn new(pattern: &str, had_specials: bool) -> Self {
        Self {
            pattern: pattern.to_string(),
            is_leaf: false,
            had_specials,
            children: Vec::new(),
            doublestar_children: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct GlobTree {
    root: GlobNode,
}

/// Look ahead for the next `/`, noting whether any wildmatch special
/// characters appear before it.
fn find_sep_and_specials(pattern: &[u8]) -> (Option<usize>, bool) {
    let mut had_specials = false;
    for (idx, &byte) in pattern.iter().enumerate() {
        match byte {
            b'*' | b'?' | b'[' | b'\\' => had_specials = true,
            b'/' => return (Some(idx), had_specials),
            _ => {}
        }
    }
    (None, had_specials)
}

fn add_glob(node: &mut GlobNode, pattern: &str) {
    if pattern.is_empty() {
        return;
    }
    let bytes = pattern.as_bytes();
    let (sep, had_specials) = find_sep_and_specials(bytes);

    // A double-star segment swallows the remainder of the pattern: the
    // recursive walk has to try the whole tail against every node below.
    let is_doublestar = had_specials && bytes.len() >= 2 && bytes[0] == b'*' && bytes[1] == b'*';
    let end = if is_doublestar {
        pattern.len()
    } else {
        sep.unwrap_or(pattern.len())
    };
    let segment = &pattern[..end];

    let container = if is_doublestar {
        &mut node.doublestar_children
    } else {
        &mut node.children
    };
    let idx = match container.iter().position(|kid| kid.pattern == segment) {
        Some(idx) => idx,
        None => {
            container.push(GlobNode::new(segment, had_specials));
            container.len() - 1
        }
    };
    let child = &mut container[idx];

    // No separator in the remainder means this segment can match files;
    // remember that so dir-only interior nodes don't match files.
    if sep.is_none() {
        child.is_leaf = true;
    }

    if end < pattern.len() {
        add_glob(child, &pattern[end + 1..]);
    }
}

impl GlobTree {
    pub(crate) fn compile<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tree = GlobTree::default();
        for pattern in patterns {
            add_glob(&mut tree.root, pattern);
        }
        tree
    }
}

fn segment_flags(ctx: &QueryCtx<'_>) -> WildFlags {
    let mut flags = ctx.query.glob_flags;
    if ctx.query.case_sensitive == CaseSensitivity::Insensitive {
        flags |= WildFlags::CASEFOLD;
    }
    flags
}

pub(crate) fn glob_generator(ctx: &mut QueryCtx<'_>) -> Result<(), QueryError> {
    let view = ctx.view;
    let scope = ctx
        .query
        .relative_root
        .clone()
        .unwrap_or_else(|| view.root_path.clone());
    let Some(dir) = view.resolve_dir(&scope) else {
        return Err(QueryError::Exec(format!(
            "glob_generator could not resolve {}, check your relative_root parameter!",
            scope
        )));
    };
    let Some(tree) = ctx.query.glob.as_ref() else {
        warn!("glob generator invoked without a glob set");
        return Ok(());
    };
    glob_tree_walk(ctx, &tree.root, dir);
    Ok(())
}

/// Match each child pattern of `node` against the children of `dir`.
fn glob_tree_walk(ctx: &mut QueryCtx<'_>, node: &GlobNode, dir: DirId) {
    let view = ctx.view;

    if !node.doublestar_children.is_empty() {
        glob_doublestar_walk(ctx, node, dir, "");
    }

    for child_node in &node.children {
        // Consider child dirs for recursion even on leaf segments: a glob
        // set like ["some_dir", "some_dir/file"] must not preclude the
        // latter.
        if !view.dir(dir).dirs.is_empty() {
            if !child_node.had_specials
                && ctx.query.case_sensitive == CaseSensitivity::Sensitive
            {
                // Special-free segment: direct child-map lookup.
                if let Some(child_dir) = view.child_dir(dir, &child_node.pattern) {
                    glob_tree_walk(ctx, child_node, child_dir);
                }
            } else {
                let child_dirs: Vec<DirId> = view.dir(dir).dirs.values().copied().collect();
                for child_dir in child_dirs {
                    // Globs can only match files in dirs that exist.
                    if !view.dir(child_dir).last_check_existed {
                        continue;
                    }
                    if wildmatch(
                        &child_node.pattern,
                        view.dir(child_dir).name.as_str(),
                        segment_flags(ctx),
                    ) {
                        glob_tree_walk(ctx, child_node, child_dir);
                    }
                }
            }
        }

        // Leaf segments are in a position to match files.
        if child_node.is_leaf && !view.dir(dir).files.is_empty() {
            if !child_node.had_specials
                && ctx.query.case_sensitive == CaseSensitivity::Sensitive
            {
                if let Some(fid) = view.child_file(dir, &child_node.pattern) {
                    // Globs can only match files that exist.
                    if view.file(fid).exists {
                        process_file(ctx, fid);
                    } else {
                        ctx.num_walked += 1;
                    }
                }
            } else {
                let files: Vec<crate::view::FileId> =
                    view.dir(dir).files.values().copied().collect();
                for fid in files {
                    if !view.file(fid).exists {
                        ctx.num_walked += 1;
                        continue;
                    }
                    if wildmatch(
                        &child_node.pattern,
                        view.file(fid).name.as_str(),
                        segment_flags(ctx),
                    ) {
                        process_file(ctx, fid);
                    }
                }
            }
        }
    }
}

/// The recursive walk for `**` patterns. Coalesces all doublestar patterns
/// hanging off `node` into a single traversal, matching each candidate file
/// against the pattern list and stopping at the first hit.
fn glob_doublestar_walk(ctx: &mut QueryCtx<'_>, node: &GlobNode, dir: DirId, dir_name: &str) {
    let view = ctx.view;

    let files: Vec<crate::view::FileId> = view.dir(dir).files.values().copied().collect();
    for fid in files {
        let file = view.file(fid);
        if !file.exists {
            ctx.num_walked += 1;
            continue;
        }
        let subject = join_subject(dir_name, &file.name);
        let flags = segment_flags(ctx) | WildFlags::PATHNAME;
        for child_node in &node.doublestar_children {
            if wildmatch(&child_node.pattern, &subject, flags) {
                process_file(ctx, fid);
                // No sense running the other patterns once one matched.
                break;
            }
        }
    }

    let child_dirs: Vec<DirId> = view.dir(dir).dirs.values().copied().collect();
    for child_dir in child_dirs {
        if !view.dir(child_dir).last_check_existed {
            continue;
        }
        let subject = join_subject(dir_name, &view.dir(child_dir).name);
        glob_doublestar_walk(ctx, node, child_dir, &subject);
    }
}

fn join_subject(dir_name: &str, name: &PathString) -> String {
    if dir_name.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir_name, name)
    }
}

#[cfg(test)]
mod test {
    use super::GlobTree;

    #[test]
    fn test_common_prefixes_share_nodes() {
        let tree = GlobTree::compile(["some/deep/foo.h", "some/deep/bar.h"]);
        assert_eq!(tree.root.children.len(), 1);
        let some = &tree.root.children[0];
        assert_eq!(some.pattern, "some");
        assert!(!some.is_leaf);
        let deep = &some.children[0];
        assert_eq!(deep.children.len(), 2);
        assert!(deep.children.iter().all(|kid| kid.is_leaf));
    }

    #[test]
    fn test_doublestar_lands_in_its_own_bucket() {
        let tree = GlobTree::compile(["src/**/*.h"]);
        let src = &tree.root.children[0];
        assert_eq!(src.pattern, "src");
        assert!(src.children.is_empty());
        assert_eq!(src.doublestar_children.len(), 1);
        assert_eq!(src.doublestar_children[0].pattern, "**/*.h");
    }

    #[test]
    fn test_specials_are_detected_per_segment() {
        let tree = GlobTree::compile(["plain/w*ld.c"]);
        let plain = &tree.root.children[0];
        assert!(!plain.had_specials);
        assert!(plain.children[0].had_specials);
        assert!(plain.children[0].is_leaf);
    }

    #[test]
    fn test_duplicate_doublestar_patterns_coalesce() {
        let tree = GlobTree::compile(["foo/**/*.h", "foo/**/*.h"]);
        assert_eq!(tree.root.children[0].doublestar_children.len(), 1);
    }
}
