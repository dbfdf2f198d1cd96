//! Change impact analysis.
//!
//! Classify each changed path as docs-only, global, or project-scoped
//! (longest-prefix match on project roots), then propagate impact along the
//! reverse dependency graph: if project X changed, every project requiring
//! X's module path is impacted too. Unknown ownership widens to global —
//! uncertainty expands the plan, never shrinks it.

use std::collections::BTreeMap;

use super::discovery::Project;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    Docs,
    Global,
    Project(usize),
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct ImpactAnalysis {
    /// Impacted project index -> reason, ordered by index for determinism.
    pub impacted: BTreeMap<usize, String>,
    /// True when every changed path is documentation.
    pub docs_only: bool,
}

fn is_docs_path(path: &str) -> bool {
    path.starts_with("docs/") || path.ends_with(".md")
}

fn is_global_path(path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    path.starts_with(".github/")
        || path == "ci.ai.yaml"
        || file_name == "go.mod"
        || file_name == "go.sum"
        || file_name.starts_with("go.work")
        || path == "Makefile"
        || path == "Dockerfile"
}

/// Longest-prefix project owner of a path, if any.
fn owner_of(path: &str, projects: &[Project]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, project) in projects.iter().enumerate() {
        let matches = project.root == "." || path.starts_with(&format!("{}/", project.root));
        if matches {
            let len = if project.root == "." { 0 } else { project.root.len() };
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((idx, len));
            }
        }
    }
    best.map(|(idx, _)| idx)
}

pub fn classify_path(path: &str, projects: &[Project]) -> PathClass {
    if is_docs_path(path) {
        return PathClass::Docs;
    }
    if is_global_path(path) {
        return PathClass::Global;
    }
    match owner_of(path, projects) {
        Some(idx) => PathClass::Project(idx),
        None => PathClass::Unknown,
    }
}

pub fn analyze(changed: &[String], projects: &[Project]) -> ImpactAnalysis {
    let mut impacted: BTreeMap<usize, String> = BTreeMap::new();
    let mut docs_only = true;
    let mut global = false;

    for path in changed {
        match classify_path(path, projects) {
            PathClass::Docs => {
                // Documentation still belongs to a project for build purposes.
                if let Some(idx) = owner_of(path, projects) {
                    impacted
                        .entry(idx)
                        .or_insert_with(|| format!("changed path {path}"));
                }
            }
            PathClass::Global => {
                docs_only = false;
                global = true;
            }
            PathClass::Project(idx) => {
                docs_only = false;
                impacted
                    .entry(idx)
                    .or_insert_with(|| format!("changed path {path}"));
            }
            PathClass::Unknown => {
                // No owner and no known class: treat as global.
                docs_only = false;
                global = true;
            }
        }
    }

    if projects.is_empty() {
        return ImpactAnalysis {
            impacted,
            docs_only,
        };
    }

    if global {
        for (idx, _) in projects.iter().enumerate() {
            impacted
                .entry(idx)
                .or_insert_with(|| "global change affects all projects".to_string());
        }
        return ImpactAnalysis {
            impacted,
            docs_only: false,
        };
    }

    // Reverse-dependency propagation to a fixed point.
    loop {
        let mut added = Vec::new();
        for (idx, project) in projects.iter().enumerate() {
            if impacted.contains_key(&idx) {
                continue;
            }
            for (impacted_idx, _) in impacted.iter() {
                let impacted_module = &projects[*impacted_idx].module_path;
                if !impacted_module.is_empty() && project.requires.contains(impacted_module) {
                    added.push((
                        idx,
                        format!("depends on impacted module {impacted_module}"),
                    ));
                    break;
                }
            }
        }
        if added.is_empty() {
            break;
        }
        for (idx, reason) in added {
            impacted.insert(idx, reason);
        }
    }

    ImpactAnalysis {
        impacted,
        docs_only,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(root: &str, module: &str, requires: &[&str]) -> Project {
        Project {
            root: root.to_string(),
            module_path: module.to_string(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn docs_only_diff_impacts_owner_without_clearing_docs_flag() {
        let projects = vec![project(".", "example.com/root", &[])];
        let analysis = analyze(&["docs/README.md".to_string()], &projects);
        assert!(analysis.docs_only);
        assert_eq!(analysis.impacted.len(), 1);
        assert!(analysis.impacted.contains_key(&0));
    }

    #[test]
    fn markdown_anywhere_counts_as_docs() {
        let projects = vec![project(".", "example.com/root", &[])];
        let analysis = analyze(&["CONTRIBUTING.md".to_string()], &projects);
        assert!(analysis.docs_only);
    }

    #[test]
    fn code_change_clears_docs_flag() {
        let projects = vec![project(".", "example.com/root", &[])];
        let analysis = analyze(
            &["docs/README.md".to_string(), "main.go".to_string()],
            &projects,
        );
        assert!(!analysis.docs_only);
    }

    #[test]
    fn module_files_are_global() {
        let projects = vec![
            project("apps/app", "example.com/app", &[]),
            project("libs/lib", "example.com/lib", &[]),
        ];
        let analysis = analyze(&["libs/lib/go.mod".to_string()], &projects);
        assert_eq!(analysis.impacted.len(), 2);
        assert!(analysis
            .impacted
            .values()
            .any(|r| r.contains("global change")));
    }

    #[test]
    fn github_workflows_are_global() {
        let projects = vec![project(".", "m", &[])];
        let analysis = analyze(&[".github/workflows/ci.yml".to_string()], &projects);
        assert_eq!(analysis.impacted.len(), 1);
        assert!(!analysis.docs_only);
    }

    #[test]
    fn longest_prefix_wins_ownership() {
        let projects = vec![
            project(".", "example.com/root", &[]),
            project("apps/app", "example.com/app", &[]),
        ];
        assert_eq!(
            classify_path("apps/app/main.go", &projects),
            PathClass::Project(1)
        );
        assert_eq!(classify_path("cmd/tool.go", &projects), PathClass::Project(0));
    }

    #[test]
    fn unknown_ownership_expands_to_global() {
        let projects = vec![project("apps/app", "example.com/app", &[])];
        let analysis = analyze(&["scripts/deploy.sh".to_string()], &projects);
        // No owner: everything is impacted.
        assert_eq!(analysis.impacted.len(), 1);
        assert!(!analysis.docs_only);
    }

    #[test]
    fn impact_propagates_along_reverse_dependencies() {
        let projects = vec![
            project("apps/app", "example.com/app", &["example.com/lib"]),
            project("libs/lib", "example.com/lib", &[]),
        ];
        let analysis = analyze(&["libs/lib/lib.go".to_string()], &projects);
        assert_eq!(analysis.impacted.len(), 2);
        assert!(analysis.impacted[&0].contains("example.com/lib"));
        assert!(analysis.impacted[&1].contains("libs/lib/lib.go"));
    }

    #[test]
    fn propagation_is_transitive() {
        let projects = vec![
            project("a", "m/a", &["m/b"]),
            project("b", "m/b", &["m/c"]),
            project("c", "m/c", &[]),
        ];
        let analysis = analyze(&["c/main.go".to_string()], &projects);
        assert_eq!(analysis.impacted.len(), 3);
    }
}
