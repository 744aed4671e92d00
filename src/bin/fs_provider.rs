// masterpiece-fs-provider: reference subprocess capability provider
//
// Speaks newline-delimited JSON frames on stdin/stdout and exposes two
// read-only capabilities confined to one directory tree:
// - list_directory { path? } -> [{ "name", "kind" }]
// - read_file { path } -> file content as a string
//
// The scope directory is the last command-line argument and must be absolute.
// Logs go to stderr; stdout carries frames only.

use anyhow::{bail, Context};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use masterpiece::capability::{ParamType, Parameter};
use masterpiece::provider::protocol::{encode_line, RequestBody, RequestFrame, ResponseFrame};
use masterpiece::provider::{CapabilityDescriptor, PROTOCOL_VERSION};

fn descriptors() -> Vec<CapabilityDescriptor> {
    vec![
        CapabilityDescriptor {
            name: "list_directory".to_string(),
            description: "Lists the entries of a directory inside the provider scope.".to_string(),
            parameters: vec![Parameter::optional("path", ParamType::String)
                .describe("Directory relative to the scope; the scope itself when omitted")],
            input_schema: None,
            output: ParamType::Array,
        },
        CapabilityDescriptor {
            name: "read_file".to_string(),
            description: "Reads a UTF-8 file inside the provider scope.".to_string(),
            parameters: vec![Parameter::required("path", ParamType::String)
                .describe("File relative to the scope")],
            input_schema: None,
            output: ParamType::String,
        },
    ]
}

/// Resolve `requested` under `scope`, refusing anything that escapes it
fn confine(scope: &Path, requested: &str) -> Result<PathBuf, String> {
    let candidate = scope.join(requested);
    let resolved = candidate
        .canonicalize()
        .map_err(|e| format!("{}: {}", requested, e))?;
    if !resolved.starts_with(scope) {
        return Err(format!("{} is outside the provider scope", requested));
    }
    Ok(resolved)
}

fn list_directory(scope: &Path, args: &Value) -> Result<Value, String> {
    let requested = args.get("path").and_then(Value::as_str).unwrap_or(".");
    let dir = confine(scope, requested)?;
    let entries = std::fs::read_dir(&dir).map_err(|e| format!("{}: {}", requested, e))?;

    let mut listing: Vec<(String, &'static str)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let kind = match entry.file_type() {
                Ok(t) if t.is_dir() => "directory",
                _ => "file",
            };
            (entry.file_name().to_string_lossy().into_owned(), kind)
        })
        .collect();
    listing.sort();

    Ok(Value::Array(
        listing
            .into_iter()
            .map(|(name, kind)| json!({ "name": name, "kind": kind }))
            .collect(),
    ))
}

fn read_file(scope: &Path, args: &Value) -> Result<Value, String> {
    let Some(requested) = args.get("path").and_then(Value::as_str) else {
        return Err("missing 'path'".to_string());
    };
    let file = confine(scope, requested)?;
    std::fs::read_to_string(&file)
        .map(Value::String)
        .map_err(|e| format!("{}: {}", requested, e))
}

fn handle(scope: &Path, frame: RequestFrame) -> ResponseFrame {
    let id = frame.id;
    let outcome = match frame.body {
        RequestBody::Initialize {
            client_name,
            protocol_version,
            ..
        } => {
            tracing::info!(client = %client_name, protocol = %protocol_version, "Initialize");
            if protocol_version != PROTOCOL_VERSION {
                Err(format!("unsupported protocol version {}", protocol_version))
            } else {
                Ok(json!({
                    "name": "masterpiece-fs-provider",
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": PROTOCOL_VERSION,
                }))
            }
        }
        RequestBody::ListCapabilities => Ok(json!({ "capabilities": descriptors() })),
        RequestBody::Call { capability, args } => match capability.as_str() {
            "list_directory" => list_directory(scope, &args),
            "read_file" => read_file(scope, &args),
            other => Err(format!("unknown capability '{}'", other)),
        },
        RequestBody::Shutdown => Ok(Value::Null),
    };

    match outcome {
        Ok(result) => ResponseFrame::success(id, result),
        Err(message) => ResponseFrame::failure(id, message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let Some(scope) = std::env::args().skip(1).last() else {
        bail!("usage: masterpiece-fs-provider [options] <absolute scope directory>");
    };
    let scope = PathBuf::from(scope);
    if !scope.is_absolute() {
        bail!("scope must be an absolute path, got {:?}", scope);
    }
    let scope = scope
        .canonicalize()
        .with_context(|| format!("scope {:?} is not accessible", scope))?;
    tracing::info!(scope = %scope.display(), "Provider ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let frame: RequestFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                // Without an id there is nothing to answer to
                tracing::error!("Dropping malformed frame: {}", e);
                continue;
            }
        };

        let shutdown = matches!(frame.body, RequestBody::Shutdown);
        let response = handle(&scope, frame);
        stdout.write_all(encode_line(&response)?.as_bytes()).await?;
        stdout.flush().await?;

        if shutdown {
            tracing::info!("Shutdown requested");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confine_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let scope = dir.path().canonicalize().unwrap();
        std::fs::write(scope.join("a.txt"), "alpha").unwrap();

        assert!(confine(&scope, "a.txt").is_ok());
        assert!(confine(&scope, "../").unwrap_err().contains("outside"));
        assert!(confine(&scope, "missing.txt").is_err());
    }

    #[test]
    fn test_handle_call() {
        let dir = tempfile::tempdir().unwrap();
        let scope = dir.path().canonicalize().unwrap();
        std::fs::create_dir(scope.join("src")).unwrap();
        std::fs::write(scope.join("README.md"), "hello").unwrap();

        let listing = handle(
            &scope,
            RequestFrame {
                id: 4,
                body: RequestBody::Call {
                    capability: "list_directory".into(),
                    args: json!({}),
                },
            },
        );
        assert_eq!(listing.id, 4);
        assert_eq!(
            listing.result,
            Some(json!([
                { "name": "README.md", "kind": "file" },
                { "name": "src", "kind": "directory" }
            ]))
        );

        let unknown = handle(
            &scope,
            RequestFrame {
                id: 5,
                body: RequestBody::Call {
                    capability: "delete_everything".into(),
                    args: json!({}),
                },
            },
        );
        assert!(unknown.error.is_some());
    }
}
