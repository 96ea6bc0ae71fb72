// src/stage/params.rs

//! Default call-parameter post-processing.

use std::path::Path;

use serde_json::Value;

/// Rewrite relative paths in `parameters` to absolute ones under `root`.
///
/// Applies to string values whose key is `path` or ends in `_path`, and to
/// every string in an array stored under a `paths` / `*_paths` key, at any
/// nesting depth. Absolute paths are left alone.
pub fn resolve_storage_paths(parameters: Value, root: &Path) -> Value {
    match parameters {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) if is_path_key(&key) => resolve(s, root),
                        Value::Array(items) if is_paths_key(&key) => Value::Array(
                            items
                                .into_iter()
                                .map(|item| match item {
                                    Value::String(s) => resolve(s, root),
                                    other => resolve_storage_paths(other, root),
                                })
                                .collect(),
                        ),
                        other => resolve_storage_paths(other, root),
                    };
                    (key, value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| resolve_storage_paths(item, root))
                .collect(),
        ),
        other => other,
    }
}

fn is_path_key(key: &str) -> bool {
    key == "path" || key.ends_with("_path")
}

fn is_paths_key(key: &str) -> bool {
    key == "paths" || key.ends_with("_paths")
}

fn resolve(raw: String, root: &Path) -> Value {
    let path = Path::new(&raw);
    if path.is_absolute() {
        Value::String(raw)
    } else {
        Value::String(root.join(path).to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relative_paths_are_anchored_at_root() {
        let params = json!({
            "input_paths": ["l1/a.dat", "/abs/b.dat"],
            "model": { "weights_path": "models/w.bin", "name": "keep/me" },
            "path": "out",
            "count": 3
        });

        let resolved = resolve_storage_paths(params, Path::new("/data"));

        assert_eq!(
            resolved,
            json!({
                "input_paths": ["/data/l1/a.dat", "/abs/b.dat"],
                "model": { "weights_path": "/data/models/w.bin", "name": "keep/me" },
                "path": "/data/out",
                "count": 3
            })
        );
    }
}
