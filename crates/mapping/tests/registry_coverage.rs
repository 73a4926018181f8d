//! Every built-in architecture resolves completely in both layouts

use shardconv_mapping::{Architecture, Direction, MappingError, MappingRegistry};

#[test]
fn test_every_internal_path_resolves_to_exactly_one_entry() {
    let registry = MappingRegistry::builtin();
    for arch in Architecture::ALL {
        let dims = arch.hub_config();
        for stacked in [true, false] {
            let spec = registry
                .resolve(arch.key(), stacked, &dims, Direction::ToExternal)
                .unwrap();
            for path in spec.internal_paths() {
                let matches = spec.match_internal(&path);
                assert_eq!(matches.len(), 1, "{} ({}, stacked={}) has {} matches", path, arch, stacked, matches.len());
            }
        }
    }
}

#[test]
fn test_every_external_name_has_a_shape_and_one_entry() {
    let registry = MappingRegistry::builtin();
    for arch in Architecture::ALL {
        let dims = arch.hub_config();
        let spec = registry
            .resolve(arch.key(), false, &dims, Direction::ToInternal)
            .unwrap();
        let names = spec.external_names();
        assert!(!names.is_empty());
        for name in names {
            assert!(spec.expected_shape(&name).is_some(), "{} has no shape", name);
            assert_eq!(spec.match_external(&name).len(), 1, "{}", name);
        }
    }
}

#[test]
fn test_stacked_layout_expands_to_layer_count() {
    let registry = MappingRegistry::builtin();
    let dims = Architecture::Qwen3_0_6B.hub_config();
    let stacked = registry
        .resolve("qwen3-0.6b", true, &dims, Direction::ToExternal)
        .unwrap();
    let slicer = stacked.stack_slicer().unwrap();
    assert_eq!(slicer.axis, 0);
    assert_eq!(slicer.num_layers, 28);

    let per_layer = registry
        .resolve("qwen3-0.6b", false, &dims, Direction::ToExternal)
        .unwrap();
    assert!(per_layer.stack_slicer().is_none());

    // Both layouts cover the same external names
    let mut a = stacked.external_names();
    let mut b = per_layer.external_names();
    a.sort();
    b.sort();
    assert_eq!(a, b);

    // One stacked internal leaf per block parameter, one per layer otherwise
    assert_eq!(stacked.internal_paths().len(), 2 + 11);
    assert_eq!(per_layer.internal_paths().len(), 2 + 11 * 28);
}

#[test]
fn test_unknown_key_fails_before_dims_are_checked() {
    let registry = MappingRegistry::builtin();
    let mut dims = Architecture::Llama3_1_8B.hub_config();
    dims.num_attention_heads = 0;
    let err = registry
        .resolve("mistral-7b", true, &dims, Direction::ToExternal)
        .unwrap_err();
    assert!(matches!(err, MappingError::UnknownArchitecture { .. }));
}
