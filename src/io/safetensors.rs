use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use safetensors::serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Maps our variable names onto the key layout of a checkpoint.
///
/// Hub checkpoints come either bare (`wte.weight`) or under a `transformer.`
/// prefix, sometimes nested deeper by whatever wrapped the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResolver {
    prefix: String,
}

impl KeyResolver {
    pub fn infer<'a>(names: impl IntoIterator<Item = &'a String>) -> Result<Self> {
        let mut sample = Vec::new();
        for name in names {
            if let Some(prefix) = name.strip_suffix("wte.weight") {
                return Ok(Self {
                    prefix: prefix.to_string(),
                });
            }
            if sample.len() < 20 {
                sample.push(name.clone());
            }
        }
        sample.sort();
        bail!("could not find a key ending with wte.weight. Sample keys: {sample:?}");
    }

    pub fn resolve(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// Copy checkpoint tensors into every variable of `varmap`.
///
/// Keys in the file that the model does not use (`attn.bias` buffers, an
/// untied `lm_head.weight`) are ignored; a missing or misshapen variable is an
/// error.
pub fn load_into_varmap<P: AsRef<Path>>(varmap: &VarMap, path: P, device: &Device) -> Result<()> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to read weights: {}", path.display()))?;
    let resolver = KeyResolver::infer(tensors.keys())?;

    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("VarMap lock poisoned"))?;

    for (name, var) in data.iter() {
        let key = resolver.resolve(name);
        let tensor = tensors
            .get(&key)
            .ok_or_else(|| anyhow!("Checkpoint {} has no tensor {}", path.display(), key))?;
        if tensor.dims() != var.dims() {
            bail!(
                "Shape mismatch for {}: checkpoint {:?}, model {:?}",
                key,
                tensor.dims(),
                var.dims()
            );
        }
        var.set(&tensor.to_dtype(var.dtype())?)
            .with_context(|| format!("Failed to assign {}", key))?;
    }

    log::info!("Loaded {} tensors from {}", data.len(), path.display());
    Ok(())
}

/// Save every variable in safetensors format with string metadata
pub fn save_varmap<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    metadata: HashMap<String, String>,
) -> Result<()> {
    let path = path.as_ref();

    let tensors: HashMap<String, Tensor> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("VarMap lock poisoned"))?;
        data.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().to_dtype(DType::F32)?.contiguous()?)))
            .collect::<candle_core::Result<_>>()?
    };

    let data = serialize(&tensors, &Some(metadata))
        .context("Failed to serialize model tensors to safetensors format")?;
    fs::write(path, data).with_context(|| format!("Failed to write model file: {}", path.display()))?;

    log::info!("Model saved to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_bare_and_prefixed_layouts() {
        let bare = vec!["h.0.attn.bias".to_string(), "wte.weight".to_string()];
        assert_eq!(KeyResolver::infer(&bare).unwrap().resolve("ln_f.bias"), "ln_f.bias");

        let prefixed = vec!["lm_head.weight".to_string(), "transformer.wte.weight".to_string()];
        assert_eq!(
            KeyResolver::infer(&prefixed).unwrap().resolve("ln_f.bias"),
            "transformer.ln_f.bias"
        );
    }

    #[test]
    fn unknown_layout_is_an_error() {
        let keys = vec!["model.embed_tokens.weight".to_string()];
        assert!(KeyResolver::infer(&keys).is_err());
    }
}
