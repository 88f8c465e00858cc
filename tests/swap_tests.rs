//! Base model and motion module swapping against on-disk fixtures

mod common;

use candle_animate::store::{CheckpointKind, CheckpointStore};
use candle_animate::swap::{SwapController, SwapError, SwapOutcome};
use candle_animate::{KeyTranslator, ModelState, ModuleKind};
use candle_core::{DType, Device};
use common::{fixture_path, values, Fixture, CKPT_KEYS, PRETRAINED};
use std::collections::BTreeMap;

fn load_state(fixture: &Fixture) -> ModelState {
    ModelState::load_pretrained(&fixture.config, &fixture.inference, &Device::Cpu, DType::F32).unwrap()
}

fn controller(fixture: &Fixture) -> SwapController {
    SwapController::new(KeyTranslator::new(fixture.inference.denoiser.layers_per_block))
}

fn store(fixture: &Fixture) -> CheckpointStore {
    CheckpointStore::new(&fixture.config.base_model_dir, &fixture.config.motion_module_dir)
}

/// Snapshot of every denoiser weight whose name matches `keep`
fn snapshot(state: &ModelState, keep: impl Fn(&str) -> bool) -> BTreeMap<String, Vec<f32>> {
    state
        .denoiser
        .keys()
        .filter(|k| keep(*k))
        .map(|k| (k.to_string(), values(state.denoiser.get(k).unwrap())))
        .collect()
}

fn is_temporal(name: &str) -> bool {
    name.contains(".motion_modules.")
}

#[test]
fn test_pretrained_state_declares_zeroed_temporal_layers() {
    let fixture = Fixture::new();
    let state = load_state(&fixture);

    assert!(state.base_model().is_none());
    assert!(state.motion_module().is_none());

    let temporal = snapshot(&state, is_temporal);
    assert_eq!(temporal.len(), common::motion_module(0.0).len());
    assert!(temporal.values().flatten().all(|v| *v == 0.0));

    let spatial = snapshot(&state, |k| !is_temporal(k));
    assert_eq!(spatial.len(), 5);
    assert!(spatial.values().flatten().all(|v| *v == PRETRAINED));
}

#[test]
fn test_base_model_swap_updates_all_modules() {
    let fixture = Fixture::new();
    let mut state = load_state(&fixture);
    let swap = controller(&fixture);
    let record = store(&fixture).find_base_model("alpha.safetensors").unwrap();

    let outcome = swap.swap_base_model(&mut state, &record).unwrap();
    let SwapOutcome::Swapped(reports) = outcome else {
        panic!("expected a swap");
    };
    assert_eq!(reports.len(), 3);
    for (kind, report) in &reports {
        let expected = match kind {
            ModuleKind::Autoencoder => 4,
            ModuleKind::TextEncoder => 2,
            ModuleKind::Denoiser => 5,
        };
        assert_eq!(report.loaded, expected, "{kind}");
        assert!(report.unexpected.is_empty(), "{kind}: {:?}", report.unexpected);
    }

    assert_eq!(state.base_model(), Some(&record));
    assert_eq!(values(state.autoencoder.get("decoder.mid_block.attentions.0.to_q.weight").unwrap()), vec![1.0; 4]);
    assert_eq!(values(state.text_encoder.get("text_model.final_layer_norm.weight").unwrap()), vec![1.0; 2]);
    assert_eq!(values(state.denoiser.get("down_blocks.0.resnets.0.norm1.weight").unwrap()), vec![1.0; 4]);

    // Temporal layers are not part of a base model
    assert!(snapshot(&state, is_temporal).values().flatten().all(|v| *v == 0.0));
}

#[test]
fn test_base_model_swap_is_idempotent_without_io() {
    let fixture = Fixture::new();
    let mut state = load_state(&fixture);
    let swap = controller(&fixture);
    let record = store(&fixture).find_base_model("alpha.safetensors").unwrap();

    swap.swap_base_model(&mut state, &record).unwrap();
    let before = snapshot(&state, |_| true);

    // A second selection must not touch the file
    std::fs::remove_file(fixture.base_model_path("alpha.safetensors")).unwrap();
    let outcome = swap.swap_base_model(&mut state, &record).unwrap();

    assert!(outcome.is_unchanged());
    assert_eq!(snapshot(&state, |_| true), before);
    assert_eq!(state.base_model(), Some(&record));
}

#[test]
fn test_switching_base_models() {
    let fixture = Fixture::new();
    let mut state = load_state(&fixture);
    let swap = controller(&fixture);
    let store = store(&fixture);

    let alpha = store.find_base_model("alpha.safetensors").unwrap();
    let beta = store.find_base_model("beta.safetensors").unwrap();
    swap.swap_base_model(&mut state, &alpha).unwrap();
    swap.swap_base_model(&mut state, &beta).unwrap();

    assert_eq!(state.base_model().map(|r| r.name.as_str()), Some("beta.safetensors"));
    assert_eq!(values(state.denoiser.get("conv_in.bias").unwrap()), vec![2.0; 4]);
}

#[test]
fn test_base_model_tolerates_unknown_keys() {
    let fixture = Fixture::new();
    let mut state = load_state(&fixture);
    let swap = controller(&fixture);

    // input_blocks.1.1 is a spatial transformer the tiny denoiser does not declare
    let mut tensors = common::ldm_base_model(3.0);
    tensors.push((
        "model.diffusion_model.input_blocks.1.1.proj_in.weight".to_string(),
        3.0,
        vec![4, 4],
    ));
    common::write_safetensors(&fixture.base_model_path("gamma.safetensors"), &tensors);
    let record = store(&fixture).find_base_model("gamma.safetensors").unwrap();

    let SwapOutcome::Swapped(reports) = swap.swap_base_model(&mut state, &record).unwrap() else {
        panic!("expected a swap");
    };
    let (_, denoiser) = reports
        .iter()
        .find(|(kind, _)| *kind == ModuleKind::Denoiser)
        .unwrap();
    assert_eq!(denoiser.loaded, 5);
    assert_eq!(denoiser.unexpected, vec!["down_blocks.0.attentions.0.proj_in.weight"]);
    assert!(!state.denoiser.contains("down_blocks.0.attentions.0.proj_in.weight"));

    assert_eq!(state.base_model(), Some(&record));
    assert_eq!(values(state.denoiser.get("conv_in.bias").unwrap()), vec![3.0; 4]);
}

#[test]
fn test_motion_module_leaves_spatial_weights_untouched() {
    let fixture = Fixture::new();
    let mut state = load_state(&fixture);
    let swap = controller(&fixture);
    let store = store(&fixture);

    swap.swap_base_model(&mut state, &store.find_base_model("alpha.safetensors").unwrap())
        .unwrap();
    let spatial_before = snapshot(&state, |k| !is_temporal(k));

    let record = store.find_motion_module("mm_a.safetensors").unwrap();
    let outcome = swap.swap_motion_module(&mut state, &record).unwrap();
    assert!(!outcome.is_unchanged());

    assert_eq!(snapshot(&state, |k| !is_temporal(k)), spatial_before);
    assert!(snapshot(&state, is_temporal).values().flatten().all(|v| *v == 0.5));
    assert_eq!(state.motion_module(), Some(&record));
    assert_eq!(state.base_model().map(|r| r.name.as_str()), Some("alpha.safetensors"));
}

#[test]
fn test_unexpected_motion_keys_abort_before_mutation() {
    let fixture = Fixture::new();
    let mut state = load_state(&fixture);
    let swap = controller(&fixture);
    let store = store(&fixture);

    let good = store.find_motion_module("mm_a.safetensors").unwrap();
    swap.swap_motion_module(&mut state, &good).unwrap();
    let before = snapshot(&state, |_| true);

    let bad = store.find_motion_module("mm_bad.safetensors").unwrap();
    let err = swap.swap_motion_module(&mut state, &bad).unwrap_err();
    match err {
        SwapError::UnexpectedMotionKeys { name, unexpected } => {
            assert_eq!(name, "mm_bad.safetensors");
            assert_eq!(
                unexpected,
                vec!["down_blocks.0.motion_modules.7.temporal_transformer.norm.weight"]
            );
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(snapshot(&state, |_| true), before);
    assert_eq!(state.motion_module(), Some(&good));
}

#[test]
fn test_motion_module_swap_is_idempotent() {
    let fixture = Fixture::new();
    let mut state = load_state(&fixture);
    let swap = controller(&fixture);
    let store = store(&fixture);

    let a = store.find_motion_module("mm_a.safetensors").unwrap();
    let b = store.find_motion_module("mm_b.safetensors").unwrap();
    swap.swap_motion_module(&mut state, &a).unwrap();
    assert!(swap.swap_motion_module(&mut state, &a).unwrap().is_unchanged());

    swap.swap_motion_module(&mut state, &b).unwrap();
    assert!(snapshot(&state, is_temporal).values().flatten().all(|v| *v == 0.25));
}

#[test]
fn test_wrong_record_kind_is_refused() {
    let fixture = Fixture::new();
    let mut state = load_state(&fixture);
    let swap = controller(&fixture);

    let record = store(&fixture).find_base_model("alpha.safetensors").unwrap();
    assert_eq!(record.kind, CheckpointKind::BaseModel);
    assert!(matches!(
        swap.swap_motion_module(&mut state, &record),
        Err(SwapError::WrongKind { .. })
    ));
    assert!(state.motion_module().is_none());
}

fn swap_ckpt_motion_module(file: &str, value: f32) {
    let fixture = Fixture::new();
    let mut state = load_state(&fixture);
    let swap = controller(&fixture);
    std::fs::copy(fixture_path(file), fixture.config.motion_module_dir.join(file)).unwrap();

    let store = store(&fixture);
    assert!(store.list_motion_modules().iter().any(|r| r.name == file));
    let spatial_before = snapshot(&state, |k| !is_temporal(k));

    let record = store.find_motion_module(file).unwrap();
    let SwapOutcome::Swapped(reports) = swap.swap_motion_module(&mut state, &record).unwrap() else {
        panic!("expected a swap");
    };
    assert_eq!(reports[0].1.loaded, CKPT_KEYS.len());
    assert_eq!(state.motion_module(), Some(&record));

    for key in CKPT_KEYS {
        let loaded = values(state.denoiser.get(key).unwrap());
        assert!(loaded.iter().all(|v| *v == value), "{key}: {loaded:?}");
    }
    // Keys the checkpoint does not carry keep their zero init
    let rest = snapshot(&state, |k| is_temporal(k) && !CKPT_KEYS.contains(&k));
    assert!(!rest.is_empty());
    assert!(rest.values().flatten().all(|v| *v == 0.0));
    assert_eq!(snapshot(&state, |k| !is_temporal(k)), spatial_before);
}

#[test]
fn test_ckpt_motion_module_swap() {
    swap_ckpt_motion_module("mm_flat.ckpt", 0.5);
}

#[test]
fn test_ckpt_motion_module_with_nested_state_dict() {
    swap_ckpt_motion_module("mm_lightning.ckpt", 0.25);
}
