//! Disk image tooling, at its external interface only.
//!
//! Everything here is a thin argv layer over `qemu-img` and the host's
//! mount tooling; the image formats themselves are somebody else's
//! problem.

use std::collections::HashMap;

use serde::Deserialize;

use crate::process::ToolRunner;
use crate::{Error, Result};

/// Parsed `qemu-img info` output.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskInfo {
    pub format: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "backing-filename")]
    pub backing: Option<String>,
}

/// Create a qcow2 image of the given size (suffix-form, e.g. `10G`).
pub async fn create(tools: &dyn ToolRunner, dst: &str, size: &str) -> Result<()> {
    let argv = vec![
        "qemu-img".to_string(),
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        dst.to_string(),
        size.to_string(),
    ];
    tools.run(&argv).await.map(|_| ())
}

/// Create a qcow2 snapshot backed by `src`.
pub async fn snapshot(tools: &dyn ToolRunner, src: &str, dst: &str) -> Result<()> {
    let argv = vec![
        "qemu-img".to_string(),
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        "-b".to_string(),
        src.to_string(),
        dst.to_string(),
    ];
    tools.run(&argv).await.map(|_| ())
}

/// Inspect an image.
pub async fn info(tools: &dyn ToolRunner, image: &str) -> Result<DiskInfo> {
    let argv = vec![
        "qemu-img".to_string(),
        "info".to_string(),
        "--output=json".to_string(),
        image.to_string(),
    ];
    let output = tools.run(&argv).await?;
    serde_json::from_str(&output.stdout)
        .map_err(|e| Error::Validation(format!("qemu-img info parse: {}", e)))
}

/// Copy files into an image by loop-mounting its first partition.
///
/// `files` maps host source paths to image-relative destinations. NTFS
/// images fall back to `ntfs-3g` when the plain mount refuses.
pub async fn inject(
    tools: &dyn ToolRunner,
    image: &str,
    partition_offset: Option<u64>,
    files: &HashMap<String, String>,
) -> Result<()> {
    let mount_dir = tempfile::tempdir()?;
    let mount_point = mount_dir.path().display().to_string();

    let mut options = "loop".to_string();
    if let Some(offset) = partition_offset {
        options.push_str(&format!(",offset={}", offset));
    }
    let mount = vec![
        "mount".to_string(),
        "-o".to_string(),
        options.clone(),
        image.to_string(),
        mount_point.clone(),
    ];
    if tools.run(&mount).await.is_err() {
        let ntfs = vec![
            "ntfs-3g".to_string(),
            "-o".to_string(),
            options,
            image.to_string(),
            mount_point.clone(),
        ];
        tools.run(&ntfs).await?;
    }

    let mut result = Ok(());
    for (src, dst) in files {
        let cp = vec![
            "cp".to_string(),
            "-a".to_string(),
            src.clone(),
            format!("{}/{}", mount_point, dst),
        ];
        if let Err(e) = tools.run(&cp).await {
            result = Err(e);
            break;
        }
    }

    let umount = vec!["umount".to_string(), mount_point];
    let unmounted = tools.run(&umount).await;
    result?;
    unmounted.map(|_| ())
}
