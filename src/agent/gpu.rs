//! Local GPU inventory.
//!
//! Queried once at agent startup via nvidia-smi. A host without the tool
//! reports zero GPUs and stays registered for CPU-only use.

use tokio::process::Command;

use crate::error::{MgpuError, Result};
use crate::protocol::GpuDesc;

pub async fn detect_gpus() -> Vec<GpuDesc> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            parse_query_output(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => {
            tracing::warn!(code = ?out.status.code(), "nvidia-smi failed, reporting zero GPUs");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "nvidia-smi not available, reporting zero GPUs");
            Vec::new()
        }
    }
}

fn parse_query_output(text: &str) -> Vec<GpuDesc> {
    let mut gpus = Vec::new();
    for line in text.lines() {
        let parts: Vec<&str> = line.splitn(3, ',').map(str::trim).collect();
        if parts.len() != 3 {
            continue;
        }
        let (Ok(index), Ok(memory_mb)) = (parts[0].parse::<u32>(), parts[2].parse::<u64>()) else {
            tracing::warn!(line, "skipping unparsable nvidia-smi line");
            continue;
        };
        gpus.push(GpuDesc {
            index,
            model: parts[1].to_string(),
            memory_mb,
        });
    }
    gpus
}

/// Parse a `--gpus-override` value of the form `model:mem_mb,model:mem_mb,…`
/// into a sequentially-indexed inventory.
pub fn parse_gpu_override(value: &str) -> Result<Vec<GpuDesc>> {
    let mut gpus = Vec::new();
    for (index, entry) in value.split(',').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (model, mem) = entry
            .rsplit_once(':')
            .ok_or_else(|| MgpuError::InvalidSpec(format!("bad GPU override entry: {entry}")))?;
        let memory_mb = mem
            .parse::<u64>()
            .map_err(|_| MgpuError::InvalidSpec(format!("bad GPU memory in override: {entry}")))?;
        gpus.push(GpuDesc {
            index: index as u32,
            model: model.to_string(),
            memory_mb,
        });
    }
    if gpus.is_empty() {
        return Err(MgpuError::InvalidSpec(
            "GPU override names no GPUs".to_string(),
        ));
    }
    Ok(gpus)
}

/// Comma-joined physical indices, the CUDA_VISIBLE_DEVICES value.
pub fn visible_devices(gpu_ids: &[u32]) -> String {
    gpu_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_output() {
        let text = "0, NVIDIA A100-SXM4-40GB, 40960\n1, NVIDIA A100-SXM4-40GB, 40960\n";
        let gpus = parse_query_output(text);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[1].model, "NVIDIA A100-SXM4-40GB");
        assert_eq!(gpus[1].memory_mb, 40960);
    }

    #[test]
    fn skips_garbage_lines() {
        let gpus = parse_query_output("not,a,gpu\n0, RTX 4090, 24564\n");
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].memory_mb, 24564);
    }

    #[test]
    fn parses_override() {
        let gpus = parse_gpu_override("A100:40960,A100:40960").unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[1].index, 1);
        assert_eq!(gpus[0].model, "A100");

        assert!(parse_gpu_override("A100").is_err());
        assert!(parse_gpu_override("").is_err());
    }

    #[test]
    fn joins_visible_devices() {
        assert_eq!(visible_devices(&[2, 5]), "2,5");
        assert_eq!(visible_devices(&[]), "");
    }
}
