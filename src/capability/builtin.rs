//! Built-in local capabilities
//!
//! The product team's own toolbox: planning helpers, code generators, and a
//! handful of file operations. File operations resolve relative paths
//! against the workspace directory handed to `builtin_capabilities`, never
//! against the process working directory, and refuse any path that leads
//! outside it (absolute paths, `..`, symlinks pointing elsewhere).
//!
//! Failures (missing file, permission denied) are returned as handler
//! errors, so they surface as `CapabilityExecution` in the run log.

use serde_json::{json, Value};
use std::fs;
use std::path::{Component, Path, PathBuf};

use super::{Arguments, Capability, CapabilityRegistry, ParamType, Parameter};
use crate::error::Result;

fn text<'a>(args: &'a Arguments, name: &str) -> &'a str {
    args.get(name).and_then(Value::as_str).unwrap_or_default()
}

/// Resolve `requested` under `workspace`, refusing anything that escapes it
///
/// The target may not exist yet (create_directory, create_file), so the
/// deepest existing ancestor is canonicalized and checked instead.
fn confine(workspace: &Path, requested: &str) -> std::result::Result<PathBuf, String> {
    let relative = Path::new(requested);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(format!("{} is outside the workspace", requested));
    }

    let root = workspace
        .canonicalize()
        .map_err(|e| format!("workspace {}: {}", workspace.display(), e))?;
    let candidate = root.join(relative);

    let mut existing = candidate.as_path();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    let resolved = existing
        .canonicalize()
        .map_err(|e| format!("{}: {}", requested, e))?;
    if !resolved.starts_with(&root) {
        return Err(format!("{} is outside the workspace", requested));
    }
    Ok(candidate)
}

fn param(name: &str, description: &str) -> Parameter {
    Parameter::required(name, ParamType::String).describe(description)
}

fn planning() -> Vec<Capability> {
    vec![
        Capability::local(
            "suggest_tech_stack",
            "Recommends a technology stack for a mobile platform.",
            vec![
                param("platform", "Target platform, e.g. iOS or Android"),
                param("app_type", "Kind of app being built"),
            ],
            ParamType::String,
            |args| {
                let stack = if text(args, "platform").eq_ignore_ascii_case("ios") {
                    "For a modern iOS app, I recommend Swift with SwiftUI."
                } else {
                    "For cross-platform, consider Flutter."
                };
                Ok(json!(stack))
            },
        ),
        Capability::local(
            "design_database_schema",
            "Designs a simple database schema based on app features.",
            vec![param("features", "Comma-separated feature list")],
            ParamType::String,
            |args| {
                Ok(json!(format!(
                    "Schema for '{}':\n- Users Table (user_id, etc.)\n- Main Feature Table (feature_id, etc.)",
                    text(args, "features")
                )))
            },
        ),
        Capability::local(
            "create_user_stories",
            "Creates user stories from a feature description.",
            vec![param("feature_description", "Feature to break down")],
            ParamType::Array,
            |_| Ok(json!(["As a user, I want to log in, so that I can access my data."])),
        ),
        Capability::local(
            "get_design_tool_instructions",
            "Returns instructions for using a given design tool.",
            vec![param("tool_name", "Design tool, e.g. Figma")],
            ParamType::String,
            |args| {
                let instructions = match text(args, "tool_name").to_lowercase().as_str() {
                    "figma" => "Here are some instructions for using Figma...",
                    "adobe xd" => "Here are some instructions for using Adobe XD...",
                    _ => "Sorry, I don't have instructions for that tool.",
                };
                Ok(json!(instructions))
            },
        ),
        Capability::local(
            "suggest_alternative_tools",
            "Suggests alternative tools or resources.",
            vec![],
            ParamType::Array,
            |_| Ok(json!(["Balsamiq", "Sketch", "InVision"])),
        ),
    ]
}

fn coding() -> Vec<Capability> {
    vec![
        Capability::local(
            "generate_swift_code",
            "Generates a Swift code snippet based on a description.",
            vec![param("description", "What the code should do")],
            ParamType::String,
            |args| {
                Ok(json!(format!(
                    "// Swift code for: {}\n\nfunc example() {{ print(\"Hello, World!\") }}",
                    text(args, "description")
                )))
            },
        ),
        Capability::local(
            "generate_kotlin_code",
            "Generates Kotlin code for a given UI description and layout type.",
            vec![
                param("description", "UI to build"),
                param("layout_type", "Compose or XML"),
            ],
            ParamType::String,
            |args| {
                Ok(json!(format!(
                    "// Placeholder for generated {} code for: {}",
                    text(args, "layout_type"),
                    text(args, "description")
                )))
            },
        ),
        Capability::local(
            "review_code_for_bugs",
            "Analyzes code for potential bugs.",
            vec![param("code", "Source to review")],
            ParamType::String,
            |_| Ok(json!("Code review: Looks good. Consider adding error handling.")),
        ),
        Capability::local(
            "write_unit_tests",
            "Generates placeholder unit tests for a function.",
            vec![
                param("code_snippet", "Code under test"),
                param("function_name", "Function to test"),
            ],
            ParamType::String,
            |args| {
                Ok(json!(format!(
                    "// Unit test for {}\n\nfunc testExample() {{ XCTAssertTrue(true) }}",
                    text(args, "function_name")
                )))
            },
        ),
        Capability::local(
            "add_placeholder_data",
            "Adds placeholder data to the given UI code.",
            vec![param("code", "UI code")],
            ParamType::String,
            |args| Ok(json!(format!("{}\n\n// Placeholder data added", text(args, "code")))),
        ),
    ]
}

fn files(workspace: &Path) -> Vec<Capability> {
    let root = workspace.to_path_buf();
    let read_root = root.clone();
    let mkdir_root = root.clone();
    let write_root = root.clone();

    vec![
        Capability::local(
            "read_file_content",
            "Reads the content of a file.",
            vec![param("file_path", "File to read")],
            ParamType::String,
            move |args| {
                let path = confine(&read_root, text(args, "file_path"))?;
                fs::read_to_string(&path)
                    .map(Value::String)
                    .map_err(|e| format!("Failed to read {}: {}", path.display(), e))
            },
        ),
        Capability::local(
            "create_directory",
            "Creates a new directory at the specified path.",
            vec![param("directory_path", "Directory to create")],
            ParamType::String,
            move |args| {
                let path = confine(&mkdir_root, text(args, "directory_path"))?;
                fs::create_dir_all(&path)
                    .map(|_| json!(format!("Directory created at {}", path.display())))
                    .map_err(|e| format!("Failed to create {}: {}", path.display(), e))
            },
        ),
        Capability::local(
            "create_file",
            "Creates a new file with the specified content.",
            vec![
                param("file_path", "File to write"),
                param("content", "Full file content"),
            ],
            ParamType::String,
            move |args| {
                let path = confine(&write_root, text(args, "file_path"))?;
                fs::write(&path, text(args, "content"))
                    .map(|_| json!(format!("File created at {}", path.display())))
                    .map_err(|e| format!("Failed to write {}: {}", path.display(), e))
            },
        ),
        Capability::local(
            "list_files",
            "Lists all files and directories in the specified path.",
            vec![param("directory_path", "Directory to list")],
            ParamType::Array,
            move |args| {
                let path = confine(&root, text(args, "directory_path"))?;
                let entries = fs::read_dir(&path)
                    .map_err(|e| format!("Failed to list {}: {}", path.display(), e))?;
                let mut names: Vec<String> = entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                Ok(json!(names))
            },
        ),
    ]
}

/// Every built-in capability, file operations anchored at `workspace`
pub fn builtin_capabilities(workspace: &Path) -> Vec<Capability> {
    let mut all = planning();
    all.extend(coding());
    all.extend(files(workspace));
    all
}

/// Register the built-ins, returning their names
pub async fn register_builtins(registry: &CapabilityRegistry, workspace: &Path) -> Result<Vec<String>> {
    let capabilities = builtin_capabilities(workspace);
    let names = capabilities.iter().map(|c| c.name.clone()).collect();
    registry.register_all(capabilities).await?;
    tracing::debug!(workspace = %workspace.display(), "Registered built-in capabilities");
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ReplacePolicy;

    #[tokio::test]
    async fn test_register_builtins() {
        let registry = CapabilityRegistry::new(ReplacePolicy::Strict);
        let names = register_builtins(&registry, Path::new("/tmp")).await.unwrap();
        assert_eq!(names.len(), 14);
        assert!(registry.contains("generate_kotlin_code").await);
        assert!(!registry.contains("run_command").await);

        // Strict registry rejects a second load
        assert!(register_builtins(&registry, Path::new("/tmp")).await.is_err());
    }

    #[tokio::test]
    async fn test_tech_stack_by_platform() {
        let registry = CapabilityRegistry::default();
        register_builtins(&registry, Path::new("/tmp")).await.unwrap();

        let ios = registry
            .invoke("suggest_tech_stack", json!({"platform": "iOS", "app_type": "social"}))
            .await
            .unwrap();
        assert_eq!(ios, json!("For a modern iOS app, I recommend Swift with SwiftUI."));

        let other = registry
            .invoke("suggest_tech_stack", json!({"platform": "web", "app_type": "social"}))
            .await
            .unwrap();
        assert_eq!(other, json!("For cross-platform, consider Flutter."));
    }

    #[tokio::test]
    async fn test_file_operations_are_workspace_relative() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CapabilityRegistry::default();
        register_builtins(&registry, dir.path()).await.unwrap();

        registry
            .invoke("create_directory", json!({"directory_path": "app/src"}))
            .await
            .unwrap();
        registry
            .invoke(
                "create_file",
                json!({"file_path": "app/src/Main.kt", "content": "fun main() {}"}),
            )
            .await
            .unwrap();
        assert!(dir.path().join("app/src/Main.kt").exists());

        let listing = registry
            .invoke("list_files", json!({"directory_path": "app/src"}))
            .await
            .unwrap();
        assert_eq!(listing, json!(["Main.kt"]));

        let content = registry
            .invoke("read_file_content", json!({"file_path": "app/src/Main.kt"}))
            .await
            .unwrap();
        assert_eq!(content, json!("fun main() {}"));
    }

    #[tokio::test]
    async fn test_file_operations_stay_in_workspace() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "hunter2").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let registry = CapabilityRegistry::default();
        register_builtins(&registry, dir.path()).await.unwrap();

        let absolute = outside.path().join("secret.txt").display().to_string();
        let attempts = [
            ("read_file_content", json!({"file_path": absolute})),
            ("read_file_content", json!({"file_path": "../secret.txt"})),
            ("list_files", json!({"directory_path": ".."})),
            ("create_directory", json!({"directory_path": "a/../../escaped"})),
            ("create_file", json!({"file_path": "../escaped.txt", "content": "x"})),
        ];
        for (capability, args) in attempts {
            let err = registry.invoke(capability, args).await.unwrap_err();
            assert!(
                matches!(err, crate::error::MasterpieceError::CapabilityExecution { .. }),
                "{}: {:?}",
                capability,
                err
            );
            assert!(err.to_string().contains("outside the workspace"));
        }
        assert!(!dir.path().parent().unwrap().join("escaped.txt").exists());
        assert!(!dir.path().parent().unwrap().join("escaped").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_workspace_is_refused() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "hunter2").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let registry = CapabilityRegistry::default();
        register_builtins(&registry, dir.path()).await.unwrap();

        let err = registry
            .invoke("read_file_content", json!({"file_path": "link/secret.txt"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the workspace"));

        let err = registry
            .invoke("create_file", json!({"file_path": "link/new.txt", "content": "x"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the workspace"));
        assert!(!outside.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_execution_failure() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CapabilityRegistry::default();
        register_builtins(&registry, dir.path()).await.unwrap();

        let err = registry
            .invoke("read_file_content", json!({"file_path": "nope.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::MasterpieceError::CapabilityExecution { .. }));
        assert!(err.to_string().contains("nope.txt"));
    }

    #[tokio::test]
    async fn test_kotlin_generation_requires_layout() {
        let registry = CapabilityRegistry::default();
        register_builtins(&registry, Path::new("/tmp")).await.unwrap();

        let err = registry
            .invoke("generate_kotlin_code", json!({"description": "login screen"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("layout_type"));

        let code = registry
            .invoke(
                "generate_kotlin_code",
                json!({"description": "login screen", "layout_type": "Compose"}),
            )
            .await
            .unwrap();
        assert_eq!(code, json!("// Placeholder for generated Compose code for: login screen"));
    }
}
