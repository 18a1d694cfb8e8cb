//! `qemu-img info` probing.

use crate::utils::{Result, SupervisorError};
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "virtual-size", default)]
    pub virtual_size: u64,
    #[serde(default)]
    pub format: String,
    #[serde(rename = "format-specific", default)]
    pub format_specific: Option<FormatSpecific>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatSpecific {
    #[serde(default)]
    pub data: Option<FormatData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatData {
    #[serde(default)]
    pub bitmaps: Vec<Bitmap>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bitmap {
    pub name: String,
}

impl ImageInfo {
    /// Whether the image carries a persistent bitmap with this name
    pub fn has_bitmap(&self, name: &str) -> bool {
        self.format_specific
            .as_ref()
            .and_then(|f| f.data.as_ref())
            .is_some_and(|d| d.bitmaps.iter().any(|b| b.name == name))
    }
}

/// Run `{tool} info --output=json -U {path}`. `-U` skips the image lock so
/// images in use by the running guest can be inspected.
pub async fn image_info(tool: &str, path: &Path) -> Result<ImageInfo> {
    debug!("Inspecting image {}", path.display());
    let output = Command::new(tool)
        .arg("info")
        .arg("--output=json")
        .arg("-U")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(SupervisorError::Io(std::io::Error::other(format!(
            "{} info {} failed: {}",
            tool,
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }

    Ok(serde_json::from_slice(&output.stdout)?)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Write an executable shell script standing in for an external tool.
    pub fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }
}
