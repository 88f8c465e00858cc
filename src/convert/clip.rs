//! LDM conditioning stage → CLIP text model keys

use crate::loader::StateDict;

pub(super) const LDM_PREFIX: &str = "cond_stage_model.transformer.";

pub(super) fn convert(raw: &StateDict) -> StateDict {
    raw.iter()
        .filter_map(|(key, tensor)| {
            let rest = key.strip_prefix(LDM_PREFIX)?;
            let mapped = if rest.starts_with("text_model.") {
                rest.to_string()
            } else {
                format!("text_model.{rest}")
            };
            Some((mapped, tensor.clone()))
        })
        .collect()
}
