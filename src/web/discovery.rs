// Worker artifact discovery

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::sys_warn;
use crate::types::{LlamaModel, ModelServerStatus};
use crate::web::worker::supervisor::is_valid_model_id;

const WINDOWS_EXE_SUFFIX: &str = ".exe";

/// Where the worker binary for `model_id` is expected to live.
pub fn worker_binary_path(workers_dir: &Path, model_id: &str) -> PathBuf {
    if cfg!(windows) {
        workers_dir.join(format!("{model_id}{WINDOWS_EXE_SUFFIX}"))
    } else {
        workers_dir.join(model_id)
    }
}

/// Inverse of [`worker_binary_path`]: the model id a file in the workers
/// directory would be started as, if it is a valid id at all.
pub fn model_id_for(file_name: &str) -> Option<&str> {
    let id = if cfg!(windows) {
        file_name.strip_suffix(WINDOWS_EXE_SUFFIX)?
    } else {
        file_name
    };
    is_valid_model_id(id).then_some(id)
}

/// True when `path` is a regular file this process can open for reading.
pub fn is_readable_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => fs::File::open(path).is_ok(),
        _ => false,
    }
}

/// List every regular file directly inside `dir` whose name maps to a
/// model id, sorted by id. Each listed id resolves back to its file through
/// [`worker_binary_path`].
///
/// A missing directory yields an empty catalog.
pub fn discover_workers(dir: &Path) -> Vec<LlamaModel> {
    if !dir.is_dir() {
        return Vec::new();
    }

    let mut models: Vec<LlamaModel> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                sys_warn!("[DISCOVERY] Skipping unreadable entry in {}: {}", dir.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| describe(entry.path()))
        .collect();

    models.sort_by(|a, b| a.id.cmp(&b.id));
    models
}

fn describe(path: &Path) -> Option<LlamaModel> {
    let name = path.file_name()?.to_str()?.to_string();
    let id = model_id_for(&name)?.to_string();
    let meta = fs::metadata(path).ok()?;

    let model_type = path
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_else(|| "binary".to_string());
    let modified_at = meta
        .modified()
        .ok()
        .map(|time| DateTime::<Utc>::from(time).to_rfc3339());

    Some(LlamaModel {
        id,
        name,
        size: meta.len(),
        model_type,
        modified_at,
        available: is_readable_file(path),
        status: ModelServerStatus::Initial,
    })
}
