//! Repository discovery: find projects via module files, parse module
//! paths and require edges, and collect fingerprint inputs.
//!
//! Only a small, line-oriented subset of the go.mod / go.work grammar is
//! needed: `module`, `require` (single and block form), and `use` lists.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A buildable project inside the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Repo-relative root, `.` for the repository root itself.
    pub root: String,
    /// Declared module path, e.g. `example.com/lib`.
    pub module_path: String,
    /// Module paths this project requires.
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Projects sorted by root for deterministic plan output.
    pub projects: Vec<Project>,
    pub has_ci_config: bool,
    /// Repo-relative fingerprint input paths, sorted.
    pub fingerprint_inputs: Vec<String>,
}

const FINGERPRINT_FILES: &[&str] = &["go.mod", "go.sum", "go.work", "go.work.sum", "ci.ai.yaml"];

/// Scan a repository snapshot for well-known inputs.
pub fn discover(repo_dir: &Path) -> Result<Discovery> {
    let mut module_files = Vec::new();
    let mut fingerprint_inputs = Vec::new();
    walk(repo_dir, repo_dir, &mut module_files, &mut fingerprint_inputs)?;
    fingerprint_inputs.sort();

    let has_ci_config = repo_dir.join("ci.ai.yaml").is_file();

    // A workspace `use` list restricts which modules are projects.
    let workspace_roots = match fs::read_to_string(repo_dir.join("go.work")) {
        Ok(content) => Some(parse_go_work_use(&content)),
        Err(_) => None,
    };

    let mut projects = Vec::new();
    for rel_dir in module_files {
        if let Some(roots) = &workspace_roots {
            if !roots.contains(&rel_dir) {
                continue;
            }
        }
        let go_mod_path = if rel_dir == "." {
            repo_dir.join("go.mod")
        } else {
            repo_dir.join(&rel_dir).join("go.mod")
        };
        let content = fs::read_to_string(&go_mod_path)
            .with_context(|| format!("failed to read {}", go_mod_path.display()))?;
        let (module_path, requires) = parse_go_mod(&content);
        projects.push(Project {
            root: rel_dir,
            module_path,
            requires,
        });
    }
    projects.sort_by(|a, b| a.root.cmp(&b.root));

    Ok(Discovery {
        projects,
        has_ci_config,
        fingerprint_inputs,
    })
}

fn walk(
    repo_dir: &Path,
    dir: &Path,
    module_files: &mut Vec<String>,
    fingerprint_inputs: &mut Vec<String>,
) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        if path.is_dir() {
            if name == ".git" || name == "vendor" || name == "node_modules" {
                continue;
            }
            walk(repo_dir, &path, module_files, fingerprint_inputs)?;
            continue;
        }

        if FINGERPRINT_FILES.contains(&name.as_str()) {
            fingerprint_inputs.push(relative(repo_dir, &path));
        }
        if name == "go.mod" {
            let parent = path.parent().unwrap_or(repo_dir);
            module_files.push(relative_dir(repo_dir, parent));
        }
    }

    Ok(())
}

fn relative(repo_dir: &Path, path: &Path) -> String {
    path.strip_prefix(repo_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn relative_dir(repo_dir: &Path, dir: &Path) -> String {
    let rel = relative(repo_dir, dir);
    if rel.is_empty() {
        ".".to_string()
    } else {
        rel
    }
}

/// Parse `module` and `require` entries out of a go.mod file.
pub fn parse_go_mod(content: &str) -> (String, Vec<String>) {
    let mut module_path = String::new();
    let mut requires = Vec::new();
    let mut in_require_block = false;

    for line in content.lines() {
        let line = line.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if in_require_block {
            if line == ")" {
                in_require_block = false;
                continue;
            }
            if let Some(path) = line.split_whitespace().next() {
                requires.push(path.to_string());
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("module ") {
            module_path = rest.trim().to_string();
        } else if line == "require (" {
            in_require_block = true;
        } else if let Some(rest) = line.strip_prefix("require ") {
            if let Some(path) = rest.split_whitespace().next() {
                requires.push(path.to_string());
            }
        }
    }

    (module_path, requires)
}

/// Parse the `use` list out of a go.work file into repo-relative roots.
pub fn parse_go_work_use(content: &str) -> Vec<String> {
    let mut roots = Vec::new();
    let mut in_use_block = false;

    for line in content.lines() {
        let line = line.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if in_use_block {
            if line == ")" {
                in_use_block = false;
                continue;
            }
            roots.push(normalize_use_path(line));
            continue;
        }

        if line == "use (" {
            in_use_block = true;
        } else if let Some(rest) = line.strip_prefix("use ") {
            roots.push(normalize_use_path(rest.trim()));
        }
    }

    roots
}

fn normalize_use_path(raw: &str) -> String {
    let trimmed = raw.trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_and_block_requires() {
        let content = r#"
module example.com/app

go 1.22

require (
    example.com/lib v1.2.3
    github.com/stretchr/testify v1.9.0 // indirect
)
"#;
        let (module, requires) = parse_go_mod(content);
        assert_eq!(module, "example.com/app");
        assert_eq!(
            requires,
            vec![
                "example.com/lib".to_string(),
                "github.com/stretchr/testify".to_string()
            ]
        );
    }

    #[test]
    fn parses_single_line_require() {
        let (module, requires) = parse_go_mod("module m\nrequire example.com/dep v0.1.0\n");
        assert_eq!(module, "m");
        assert_eq!(requires, vec!["example.com/dep".to_string()]);
    }

    #[test]
    fn parses_go_work_use_block() {
        let content = "go 1.22\n\nuse (\n    ./apps/app\n    ./libs/lib\n)\n";
        assert_eq!(
            parse_go_work_use(content),
            vec!["apps/app".to_string(), "libs/lib".to_string()]
        );
    }

    #[test]
    fn parses_go_work_single_use() {
        assert_eq!(parse_go_work_use("use ./svc\n"), vec!["svc".to_string()]);
        assert_eq!(parse_go_work_use("use .\n"), vec![".".to_string()]);
    }

    #[test]
    fn discovers_projects_in_fixture_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("apps/app")).unwrap();
        fs::create_dir_all(root.join("libs/lib")).unwrap();
        fs::write(
            root.join("apps/app/go.mod"),
            "module example.com/app\nrequire example.com/lib v1.0.0\n",
        )
        .unwrap();
        fs::write(root.join("libs/lib/go.mod"), "module example.com/lib\n").unwrap();

        let discovered = discover(root).unwrap();
        assert_eq!(discovered.projects.len(), 2);
        assert_eq!(discovered.projects[0].root, "apps/app");
        assert_eq!(discovered.projects[0].requires, vec!["example.com/lib"]);
        assert_eq!(discovered.projects[1].root, "libs/lib");
        assert!(!discovered.has_ci_config);
        assert_eq!(
            discovered.fingerprint_inputs,
            vec!["apps/app/go.mod".to_string(), "libs/lib/go.mod".to_string()]
        );
    }

    #[test]
    fn workspace_use_list_restricts_projects() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("a/go.mod"), "module example.com/a\n").unwrap();
        fs::write(root.join("b/go.mod"), "module example.com/b\n").unwrap();
        fs::write(root.join("go.work"), "use ./a\n").unwrap();

        let discovered = discover(root).unwrap();
        assert_eq!(discovered.projects.len(), 1);
        assert_eq!(discovered.projects[0].root, "a");
    }

    #[test]
    fn ci_config_is_detected_at_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("go.mod"), "module example.com/root\n").unwrap();
        fs::write(root.join("ci.ai.yaml"), "jobs: []\n").unwrap();

        let discovered = discover(root).unwrap();
        assert!(discovered.has_ci_config);
        assert_eq!(discovered.projects[0].root, ".");
    }
}
