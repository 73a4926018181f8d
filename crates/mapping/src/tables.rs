//! Static per-family mapping tables
//!
//! Internal names follow the training framework's module tree
//! (`decoder/layers/...` when layers are stacked along a leading axis,
//! `decoder/layers_{i}/...` otherwise). External names follow the hub
//! `model.layers.{i}...` scheme. Hooks are written for export; [`crate::MappingSpec`]
//! inverts them for import.

use crate::config::ModelDims;
use crate::hook::{Hook, HookOp};

pub type ParamTableFn = fn(&ModelDims, bool) -> Vec<(String, String)>;
pub type ShapeTableFn = fn(&ModelDims) -> Vec<(String, Vec<usize>)>;
pub type HookTableFn = fn(&ModelDims) -> Vec<(String, Hook)>;

/// The (param, shape, hook) table triple registered for one architecture
#[derive(Clone, Copy)]
pub struct ArchitectureTables {
    pub params: ParamTableFn,
    pub shapes: ShapeTableFn,
    pub hooks: HookTableFn,
}

impl std::fmt::Debug for ArchitectureTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchitectureTables").finish_non_exhaustive()
    }
}

pub const LLAMA3: ArchitectureTables = ArchitectureTables {
    params: llama3_params,
    shapes: llama3_shapes,
    hooks: llama3_hooks,
};

pub const QWEN3: ArchitectureTables = ArchitectureTables {
    params: qwen3_params,
    shapes: qwen3_shapes,
    hooks: qwen3_hooks,
};

/// Block-level (internal suffix, external suffix) pairs shared by both families
const BLOCK_PARAMS: [(&str, &str); 9] = [
    ("pre_self_attention_layer_norm/scale", "input_layernorm.weight"),
    ("self_attention/query/kernel", "self_attn.q_proj.weight"),
    ("self_attention/key/kernel", "self_attn.k_proj.weight"),
    ("self_attention/value/kernel", "self_attn.v_proj.weight"),
    ("self_attention/out/kernel", "self_attn.o_proj.weight"),
    ("post_self_attention_layer_norm/scale", "post_attention_layernorm.weight"),
    ("mlp/wi_0/kernel", "mlp.gate_proj.weight"),
    ("mlp/wi_1/kernel", "mlp.up_proj.weight"),
    ("mlp/wo/kernel", "mlp.down_proj.weight"),
];

const QK_NORM_PARAMS: [(&str, &str); 2] = [
    ("self_attention/query_norm/scale", "self_attn.q_norm.weight"),
    ("self_attention/key_norm/scale", "self_attn.k_norm.weight"),
];

const EMBED: &str = "model.embed_tokens.weight";
const FINAL_NORM: &str = "model.norm.weight";
const LM_HEAD: &str = "lm_head.weight";

fn layer(suffix: &str) -> String {
    format!("model.layers.{{i}}.{}", suffix)
}

fn block_path(stacked: bool, suffix: &str) -> String {
    if stacked {
        format!("decoder/layers/{}", suffix)
    } else {
        format!("decoder/layers_{{i}}/{}", suffix)
    }
}

fn common_params(dims: &ModelDims, stacked: bool, block: &[(&str, &str)]) -> Vec<(String, String)> {
    let mut params = vec![
        ("token_embedder/embedding".to_string(), EMBED.to_string()),
        ("decoder/decoder_norm/scale".to_string(), FINAL_NORM.to_string()),
    ];
    if !dims.tie_word_embeddings {
        params.push(("decoder/logits_dense/kernel".to_string(), LM_HEAD.to_string()));
    }
    params.extend(
        block
            .iter()
            .map(|(internal, external)| (block_path(stacked, internal), layer(external))),
    );
    params
}

fn common_shapes(dims: &ModelDims) -> Vec<(String, Vec<usize>)> {
    let emb = dims.hidden_size;
    vec![
        (EMBED.to_string(), vec![dims.vocab_size, emb]),
        (FINAL_NORM.to_string(), vec![emb]),
        (LM_HEAD.to_string(), vec![dims.vocab_size, emb]),
        (layer("input_layernorm.weight"), vec![emb]),
        (layer("self_attn.q_proj.weight"), vec![dims.q_dim(), emb]),
        (layer("self_attn.k_proj.weight"), vec![dims.kv_dim(), emb]),
        (layer("self_attn.v_proj.weight"), vec![dims.kv_dim(), emb]),
        (layer("self_attn.o_proj.weight"), vec![emb, dims.q_dim()]),
        (layer("post_attention_layernorm.weight"), vec![emb]),
        (layer("mlp.gate_proj.weight"), vec![dims.intermediate_size, emb]),
        (layer("mlp.up_proj.weight"), vec![dims.intermediate_size, emb]),
        (layer("mlp.down_proj.weight"), vec![emb, dims.intermediate_size]),
    ]
}

/// Kernel hooks shared by both families
///
/// The internal query kernel has `1/sqrt(head_dim)` folded in, so export
/// multiplies it back out.
fn common_hooks(dims: &ModelDims) -> Vec<(String, Hook)> {
    let emb = dims.hidden_size;
    let hd = dims.head_dim();
    let heads = dims.num_attention_heads;
    let kv = dims.num_key_value_heads;
    let query_scale = (hd as f32).sqrt();
    vec![
        (LM_HEAD.to_string(), Hook::transpose()),
        (
            layer("self_attn.q_proj.weight"),
            Hook::new(vec![HookOp::Scale(query_scale)]).chain(Hook::fuse_heads_in(emb, heads, hd)),
        ),
        (layer("self_attn.k_proj.weight"), Hook::fuse_heads_in(emb, kv, hd)),
        (layer("self_attn.v_proj.weight"), Hook::fuse_heads_in(emb, kv, hd)),
        (layer("self_attn.o_proj.weight"), Hook::fuse_heads_out(heads, hd, emb)),
        (layer("mlp.gate_proj.weight"), Hook::transpose()),
        (layer("mlp.up_proj.weight"), Hook::transpose()),
        (layer("mlp.down_proj.weight"), Hook::transpose()),
    ]
}

fn llama3_params(dims: &ModelDims, stacked: bool) -> Vec<(String, String)> {
    common_params(dims, stacked, &BLOCK_PARAMS)
}

fn llama3_shapes(dims: &ModelDims) -> Vec<(String, Vec<usize>)> {
    common_shapes(dims)
}

/// Llama checkpoints on the hub keep rotary pairs as split halves, the
/// internal layout interleaves them; query and key rows are permuted.
fn llama3_hooks(dims: &ModelDims) -> Vec<(String, Hook)> {
    let emb = dims.hidden_size;
    let hd = dims.head_dim();
    let q_name = layer("self_attn.q_proj.weight");
    let k_name = layer("self_attn.k_proj.weight");
    common_hooks(dims)
        .into_iter()
        .map(|(name, hook)| {
            if name == q_name {
                let hook = hook.chain(Hook::rope_interleaved_to_halves(dims.num_attention_heads, hd, emb));
                (name, hook)
            } else if name == k_name {
                let hook = hook.chain(Hook::rope_interleaved_to_halves(dims.num_key_value_heads, hd, emb));
                (name, hook)
            } else {
                (name, hook)
            }
        })
        .collect()
}

fn qwen3_params(dims: &ModelDims, stacked: bool) -> Vec<(String, String)> {
    let block: Vec<(&str, &str)> = BLOCK_PARAMS.iter().chain(QK_NORM_PARAMS.iter()).copied().collect();
    common_params(dims, stacked, &block)
}

fn qwen3_shapes(dims: &ModelDims) -> Vec<(String, Vec<usize>)> {
    let mut shapes = common_shapes(dims);
    shapes.push((layer("self_attn.q_norm.weight"), vec![dims.head_dim()]));
    shapes.push((layer("self_attn.k_norm.weight"), vec![dims.head_dim()]));
    shapes
}

fn qwen3_hooks(dims: &ModelDims) -> Vec<(String, Hook)> {
    common_hooks(dims)
}
