//! LDM first stage model → diffusers autoencoder keys

use super::{rename_prefix, replace_all, split_indexed};
use crate::loader::StateDict;
use candle_core::{Result, Tensor};
use std::collections::BTreeSet;

pub(super) const LDM_PREFIX: &str = "first_stage_model.";

const TOP_LEVEL: &[(&str, &str)] = &[
    ("encoder.conv_in.", "encoder.conv_in."),
    ("encoder.conv_out.", "encoder.conv_out."),
    ("encoder.norm_out.", "encoder.conv_norm_out."),
    ("decoder.conv_in.", "decoder.conv_in."),
    ("decoder.conv_out.", "decoder.conv_out."),
    ("decoder.norm_out.", "decoder.conv_norm_out."),
    ("quant_conv.", "quant_conv."),
    ("post_quant_conv.", "post_quant_conv."),
];

const RESNET_RENAMES: &[(&str, &str)] = &[("nin_shortcut", "conv_shortcut")];

pub(super) fn convert(raw: &StateDict) -> Result<StateDict> {
    let vae: Vec<(&str, &Tensor)> = raw
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(LDM_PREFIX).map(|k| (k, v)))
        .collect();

    let num_up_blocks = vae
        .iter()
        .filter_map(|(k, _)| split_indexed(k, "decoder.up", 1).map(|(idx, _)| idx[0]))
        .collect::<BTreeSet<_>>()
        .len();

    let mut out = StateDict::new();
    for (key, tensor) in vae {
        let Some(mapped) = map_key(key, num_up_blocks) else {
            continue;
        };
        let tensor = if is_attention_projection(&mapped) {
            conv_to_linear(tensor)?
        } else {
            tensor.clone()
        };
        out.insert(mapped, tensor);
    }
    Ok(out)
}

fn map_key(key: &str, num_up_blocks: usize) -> Option<String> {
    if let Some(mapped) = rename_prefix(TOP_LEVEL, key) {
        return Some(mapped);
    }

    let (side, rest) = key.split_once('.')?;
    if side != "encoder" && side != "decoder" {
        return None;
    }

    if let Some(mid) = rest.strip_prefix("mid.") {
        return map_mid(side, mid);
    }

    match side {
        "encoder" => {
            let (idx, rest) = split_indexed(rest, "down", 1)?;
            let block = idx[0];
            if let Some(param) = rest.strip_prefix("downsample.") {
                return Some(format!("encoder.down_blocks.{block}.downsamplers.0.{param}"));
            }
            let (j, param) = split_indexed(rest, "block", 1)?;
            Some(format!(
                "encoder.down_blocks.{block}.resnets.{}.{}",
                j[0],
                replace_all(RESNET_RENAMES, param)
            ))
        }
        _ => {
            let (idx, rest) = split_indexed(rest, "up", 1)?;
            // LDM counts decoder blocks from the lowest resolution upward
            let block = num_up_blocks.checked_sub(idx[0] + 1)?;
            if let Some(param) = rest.strip_prefix("upsample.") {
                return Some(format!("decoder.up_blocks.{block}.upsamplers.0.{param}"));
            }
            let (j, param) = split_indexed(rest, "block", 1)?;
            Some(format!(
                "decoder.up_blocks.{block}.resnets.{}.{}",
                j[0],
                replace_all(RESNET_RENAMES, param)
            ))
        }
    }
}

fn map_mid(side: &str, mid: &str) -> Option<String> {
    if let Some(param) = mid.strip_prefix("attn_1.") {
        let (name, tail) = param.split_once('.')?;
        let name = match name {
            "norm" => "group_norm",
            "q" => "to_q",
            "k" => "to_k",
            "v" => "to_v",
            "proj_out" => "to_out.0",
            _ => return None,
        };
        return Some(format!("{side}.mid_block.attentions.0.{name}.{tail}"));
    }

    let (n, param) = mid.strip_prefix("block_")?.split_once('.')?;
    let n: usize = n.parse().ok()?;
    let index = n.checked_sub(1)?;
    Some(format!(
        "{side}.mid_block.resnets.{index}.{}",
        replace_all(RESNET_RENAMES, param)
    ))
}

fn is_attention_projection(key: &str) -> bool {
    key.contains(".mid_block.attentions.0.to_") && key.ends_with(".weight")
}

/// View a `[out, in, 1, 1]` (or `[out, in, 1]`) conv weight as `[out, in]`
fn conv_to_linear(tensor: &Tensor) -> Result<Tensor> {
    match tensor.rank() {
        4 => tensor.squeeze(3)?.squeeze(2),
        3 => tensor.squeeze(2),
        _ => Ok(tensor.clone()),
    }
}
