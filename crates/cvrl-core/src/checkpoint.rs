//! Safetensors persistence for model weights.
//!
//! Tensors are stored by dotted name. `F32` and `I64` are supported; anything
//! else is converted to `F32` on save.
//!
//! Two load modes:
//! - **strict** ([`load_strict`]): every target must be present and every stored
//!   name must have a target. Used to resume contrastive training.
//! - **partial** ([`load_partial`]): stored names are mapped through a prefix;
//!   missing and unexpected names are reported, not rejected. Used to pull a
//!   frozen encoder out of a pre-training checkpoint.
//!
//! Both modes check every shape before writing anything, so a failed load
//! leaves the targets untouched.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use tracing::{debug, info};

use crate::error::{CvrlError, CvrlResult};

fn checkpoint_err(message: String) -> CvrlError {
    CvrlError::Checkpoint { message }
}

/// All vars of a map as `(prefix + name, var)`, sorted by name.
pub fn named_vars(varmap: &VarMap, prefix: &str) -> Vec<(String, Var)> {
    let data = varmap.data().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (format!("{}{}", prefix, name), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

enum Payload {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

impl Payload {
    fn dtype(&self) -> safetensors::Dtype {
        match self {
            Payload::F32(_) => safetensors::Dtype::F32,
            Payload::I64(_) => safetensors::Dtype::I64,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Payload::F32(data) => bytemuck::cast_slice(data.as_slice()),
            Payload::I64(data) => bytemuck::cast_slice(data.as_slice()),
        }
    }
}

/// Write named tensors to a safetensors file, creating parent directories.
pub fn save_tensors(path: &Path, tensors: &[(String, Tensor)]) -> CvrlResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tensor_data: Vec<(String, Payload, Vec<usize>)> = tensors
        .iter()
        .map(|(name, tensor)| {
            let flat = tensor
                .flatten_all()
                .map_err(|e| checkpoint_err(format!("Flatten '{}' failed: {}", name, e)))?;
            let payload = match tensor.dtype() {
                DType::I64 => Payload::I64(
                    flat.to_vec1()
                        .map_err(|e| checkpoint_err(format!("to_vec1 '{}' failed: {}", name, e)))?,
                ),
                _ => Payload::F32(
                    flat.to_dtype(DType::F32)
                        .and_then(|t| t.to_vec1())
                        .map_err(|e| checkpoint_err(format!("to_vec1 '{}' failed: {}", name, e)))?,
                ),
            };
            Ok((name.clone(), payload, tensor.dims().to_vec()))
        })
        .collect::<CvrlResult<Vec<_>>>()?;

    let views: Vec<(String, safetensors::tensor::TensorView<'_>)> = tensor_data
        .iter()
        .map(|(name, payload, shape)| {
            let view = safetensors::tensor::TensorView::new(payload.dtype(), shape.clone(), payload.bytes())
                .map_err(|e| checkpoint_err(format!("TensorView for '{}' failed: {}", name, e)))?;
            Ok((name.clone(), view))
        })
        .collect::<CvrlResult<Vec<_>>>()?;

    safetensors::tensor::serialize_to_file(
        views.iter().map(|(k, v)| (k.clone(), v.clone())),
        &None::<HashMap<String, String>>,
        path,
    )
    .map_err(|e| checkpoint_err(format!("Failed to write '{}': {}", path.display(), e)))?;

    info!("Saved {} tensors to {}", tensors.len(), path.display());
    Ok(())
}

/// Read every tensor of a safetensors file onto `device`.
pub fn load_tensors(path: &Path, device: &Device) -> CvrlResult<BTreeMap<String, Tensor>> {
    let data = std::fs::read(path)
        .map_err(|e| checkpoint_err(format!("Failed to read '{}': {}", path.display(), e)))?;
    let file = safetensors::SafeTensors::deserialize(&data)
        .map_err(|e| checkpoint_err(format!("Failed to deserialize '{}': {}", path.display(), e)))?;

    let mut tensors = BTreeMap::new();
    for (name, view) in file.tensors() {
        let shape = view.shape().to_vec();
        // pod_collect copies, so unaligned views are fine.
        let tensor = match view.dtype() {
            safetensors::Dtype::F32 => {
                let values: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
                Tensor::from_vec(values, shape, device)
            }
            safetensors::Dtype::I64 => {
                let values: Vec<i64> = bytemuck::pod_collect_to_vec(view.data());
                Tensor::from_vec(values, shape, device)
            }
            other => {
                return Err(checkpoint_err(format!(
                    "Tensor '{}' has unsupported dtype {:?}",
                    name, other
                )))
            }
        }
        .map_err(|e| CvrlError::tensor("checkpoint load", e))?;
        tensors.insert(name, tensor);
    }

    debug!("Read {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

/// Outcome of a partial load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Target names that received stored values.
    pub loaded: Vec<String>,
    /// Target names with no stored value; they keep their initialization.
    pub missing: Vec<String>,
    /// Stored names (as written in the file) with no target.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

fn check_shape(name: &str, var: &Var, tensor: &Tensor) -> CvrlResult<()> {
    if var.dims() != tensor.dims() {
        return Err(CvrlError::ShapeMismatch {
            context: format!("checkpoint tensor '{}'", name),
            expected: var.dims().to_vec(),
            actual: tensor.dims().to_vec(),
        });
    }
    Ok(())
}

fn assign(name: &str, var: &Var, tensor: &Tensor) -> CvrlResult<()> {
    let value = tensor
        .to_dtype(var.dtype())
        .map_err(|e| CvrlError::tensor(name, e))?;
    var.set(&value).map_err(|e| CvrlError::tensor(name, e))
}

/// Load `tensors` into `targets`, requiring an exact name and shape match.
pub fn load_strict(targets: &[(String, Var)], tensors: &BTreeMap<String, Tensor>) -> CvrlResult<()> {
    let target_names: BTreeMap<&str, &Var> = targets.iter().map(|(n, v)| (n.as_str(), v)).collect();

    let missing: Vec<String> = target_names
        .keys()
        .filter(|name| !tensors.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    let unexpected: Vec<String> = tensors
        .keys()
        .filter(|name| !target_names.contains_key(name.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(CvrlError::CheckpointMismatch { missing, unexpected });
    }

    for (name, var) in &target_names {
        check_shape(name, var, &tensors[*name])?;
    }
    for (name, var) in &target_names {
        assign(name, var, &tensors[*name])?;
    }
    Ok(())
}

/// Load stored tensors whose name is `prefix + target_name` into `targets`.
///
/// Names absent on either side are reported. A name present on both sides
/// with different shapes is an error.
pub fn load_partial(
    targets: &[(String, Var)],
    tensors: &BTreeMap<String, Tensor>,
    prefix: &str,
) -> CvrlResult<LoadReport> {
    let target_names: BTreeMap<&str, &Var> = targets.iter().map(|(n, v)| (n.as_str(), v)).collect();

    let mut report = LoadReport::default();
    let mut matched: Vec<(&str, &Var, &Tensor)> = Vec::new();
    for (name, var) in &target_names {
        match tensors.get(&format!("{}{}", prefix, name)) {
            Some(tensor) => {
                check_shape(name, var, tensor)?;
                matched.push((*name, *var, tensor));
            }
            None => report.missing.push(name.to_string()),
        }
    }
    report.unexpected = tensors
        .keys()
        .filter(|stored| {
            stored
                .strip_prefix(prefix)
                .map_or(true, |name| !target_names.contains_key(name))
        })
        .cloned()
        .collect();

    for (name, var, tensor) in matched {
        assign(name, var, tensor)?;
        report.loaded.push(name.to_string());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarBuilder};

    fn map_with(names: &[(&str, usize)]) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (name, size) in names {
            vb.get_with_hints(*size, name, Init::Const(0.0)).unwrap();
        }
        varmap
    }

    fn ones(n: usize) -> Tensor {
        Tensor::ones(n, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_save_and_load_preserves_dtypes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ckpt.safetensors");
        let weights = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let ptr = Tensor::new(&[512i64], &Device::Cpu).unwrap();
        save_tensors(
            &path,
            &[("w".to_string(), weights), ("queue_ptr".to_string(), ptr)],
        )
        .unwrap();

        let loaded = load_tensors(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded["w"].to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(loaded["queue_ptr"].dtype(), DType::I64);
        assert_eq!(loaded["queue_ptr"].to_vec1::<i64>().unwrap(), vec![512]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_tensors(&dir.path().join("absent.safetensors"), &Device::Cpu).unwrap_err();
        assert!(matches!(err, CvrlError::Checkpoint { .. }));
    }

    #[test]
    fn test_strict_rejects_extra_and_missing() {
        let varmap = map_with(&[("a", 2), ("b", 2)]);
        let targets = named_vars(&varmap, "");
        let mut tensors = BTreeMap::new();
        tensors.insert("a".to_string(), ones(2));
        tensors.insert("c".to_string(), ones(2));

        match load_strict(&targets, &tensors).unwrap_err() {
            CvrlError::CheckpointMismatch { missing, unexpected } => {
                assert_eq!(missing, vec!["b".to_string()]);
                assert_eq!(unexpected, vec!["c".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Nothing written.
        assert_eq!(targets[0].1.to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_strict_shape_mismatch_leaves_targets() {
        let varmap = map_with(&[("a", 2), ("b", 2)]);
        let targets = named_vars(&varmap, "");
        let mut tensors = BTreeMap::new();
        tensors.insert("a".to_string(), ones(2));
        tensors.insert("b".to_string(), ones(3));

        assert!(matches!(
            load_strict(&targets, &tensors),
            Err(CvrlError::ShapeMismatch { .. })
        ));
        assert_eq!(targets[0].1.to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_partial_maps_prefix_and_reports() {
        let varmap = map_with(&[("f.w", 2), ("f.v", 2)]);
        let targets = named_vars(&varmap, "");
        let mut tensors = BTreeMap::new();
        tensors.insert("encoder_q.f.w".to_string(), ones(2));
        tensors.insert("encoder_k.f.w".to_string(), ones(2));
        tensors.insert("queue".to_string(), ones(4));

        let report = load_partial(&targets, &tensors, "encoder_q.").unwrap();
        assert_eq!(report.loaded, vec!["f.w".to_string()]);
        assert_eq!(report.missing, vec!["f.v".to_string()]);
        assert_eq!(report.unexpected.len(), 2);
        assert!(!report.is_complete());

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["f.w"].to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_partial_shape_mismatch_is_error() {
        let varmap = map_with(&[("f.w", 2)]);
        let targets = named_vars(&varmap, "");
        let mut tensors = BTreeMap::new();
        tensors.insert("f.w".to_string(), ones(5));
        assert!(matches!(
            load_partial(&targets, &tensors, ""),
            Err(CvrlError::ShapeMismatch { .. })
        ));
    }
}
