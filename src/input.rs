//! Task file loading.
//!
//! Task sets are JSON (either a bare array or `{"tasks": [...]}`) or TOML
//! (`[[tasks]]` tables). Required fields must be present; only
//! `max_retries` has a default. Graph-level checks happen in the batcher.

use std::path::Path;

use serde::Deserialize;

use crate::clog_debug;
use crate::core::task::TaskDefinition;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskFile {
    tasks: Vec<TaskDefinition>,
}

/// Task file formats, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => Ok(Format::Json),
            Some("toml") => Ok(Format::Toml),
            _ => Err(Error::UnsupportedFormat(path.display().to_string())),
        }
    }
}

pub fn load_tasks(path: &Path) -> Result<Vec<TaskDefinition>> {
    let format = Format::from_path(path)?;
    let contents = std::fs::read_to_string(path)?;
    let tasks = parse_tasks(&contents, format)?;
    clog_debug!("Loaded {} task(s) from {}", tasks.len(), path.display());
    Ok(tasks)
}

pub fn parse_tasks(contents: &str, format: Format) -> Result<Vec<TaskDefinition>> {
    match format {
        Format::Json => {
            let value: serde_json::Value = serde_json::from_str(contents)?;
            if value.is_array() {
                Ok(serde_json::from_value(value)?)
            } else {
                Ok(serde_json::from_value::<TaskFile>(value)?.tasks)
            }
        }
        Format::Toml => Ok(toml::from_str::<TaskFile>(contents)?.tasks),
    }
}
