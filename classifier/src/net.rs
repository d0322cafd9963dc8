use bytemuck::pod_collect_to_vec;
use half::f16;
use safetensors::{SafeTensors, tensor::Dtype};
use std::path::Path;
use tch::{Tensor, nn, nn::ModuleT};

use crate::error::{ClassifierError, Result};

/// Output width of the feature extractor.
pub const FEATURE_DIM: i64 = 1280;

/// MobileNetV2 stage table: (expansion, channels, repeats, stride).
const STAGE_CFG: [(i64, i64, i64, i64); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

fn relu6(x: &Tensor) -> Tensor {
    x.clamp(0.0, 6.0)
}

/// Inverted-residual bottleneck: 1x1 expand, 3x3 depthwise, 1x1 project.
#[derive(Debug)]
struct Bottleneck {
    expand_conv: Option<nn::Conv2D>,
    expand_bn: Option<nn::BatchNorm>,
    depthwise_conv: nn::Conv2D,
    depthwise_bn: nn::BatchNorm,
    project_conv: nn::Conv2D,
    project_bn: nn::BatchNorm,
    residual: bool,
}

impl Bottleneck {
    fn new(vs: &nn::Path, in_c: i64, out_c: i64, stride: i64, expansion: i64) -> Self {
        let hidden = in_c * expansion;
        let expand_vs = vs / "expand";
        let dw_vs = vs / "dw";
        let project_vs = vs / "project";

        let (expand_conv, expand_bn) = if expansion != 1 {
            (
                Some(nn::conv2d(
                    &expand_vs,
                    in_c,
                    hidden,
                    1,
                    nn::ConvConfig { bias: false, ..Default::default() },
                )),
                Some(nn::batch_norm2d(&expand_vs / "bn", hidden, Default::default())),
            )
        } else {
            (None, None)
        };

        let depthwise_conv = nn::conv2d(
            &dw_vs,
            hidden,
            hidden,
            3,
            nn::ConvConfig {
                stride,
                padding: 1,
                groups: hidden,
                bias: false,
                ..Default::default()
            },
        );
        let depthwise_bn = nn::batch_norm2d(&dw_vs / "bn", hidden, Default::default());

        let project_conv = nn::conv2d(
            &project_vs,
            hidden,
            out_c,
            1,
            nn::ConvConfig { bias: false, ..Default::default() },
        );
        let project_bn = nn::batch_norm2d(&project_vs / "bn", out_c, Default::default());

        Self {
            expand_conv,
            expand_bn,
            depthwise_conv,
            depthwise_bn,
            project_conv,
            project_bn,
            residual: stride == 1 && in_c == out_c,
        }
    }
}

impl nn::ModuleT for Bottleneck {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut x = xs.shallow_clone();
        if let (Some(conv), Some(bn)) = (&self.expand_conv, &self.expand_bn) {
            x = relu6(&bn.forward_t(&conv.forward_t(&x, train), train));
        }
        x = relu6(&self.depthwise_bn.forward_t(&self.depthwise_conv.forward_t(&x, train), train));
        x = self.project_bn.forward_t(&self.project_conv.forward_t(&x, train), train);
        if self.residual { xs + x } else { x }
    }
}

/// MobileNetV2 feature extractor ending in a `[B, 1280, 7, 7]` map.
fn feature_extractor(vs: &nn::Path) -> nn::SequentialT {
    let mut seq = nn::seq_t();

    let stem_vs = vs / "stem";
    seq = seq
        .add(nn::conv2d(
            &stem_vs,
            3,
            32,
            3,
            nn::ConvConfig { stride: 2, padding: 1, bias: false, ..Default::default() },
        ))
        .add(nn::batch_norm2d(&stem_vs / "bn", 32, Default::default()))
        .add_fn(|x| relu6(x));

    let mut in_c = 32;
    for (stage, &(expansion, out_c, repeats, stride)) in STAGE_CFG.iter().enumerate() {
        for rep in 0..repeats {
            let block_stride = if rep == 0 { stride } else { 1 };
            let block_vs = vs / format!("block{stage}_{rep}");
            seq = seq.add(Bottleneck::new(&block_vs, in_c, out_c, block_stride, expansion));
            in_c = out_c;
        }
    }

    let top_vs = vs / "top";
    seq.add(nn::conv2d(
        &top_vs,
        in_c,
        FEATURE_DIM,
        1,
        nn::ConvConfig { bias: false, ..Default::default() },
    ))
    .add(nn::batch_norm2d(&top_vs / "bn", FEATURE_DIM, Default::default()))
    .add_fn(|x| relu6(x))
}

/// Classification head: global average pool, dropout 0.2, 512-unit ReLU
/// layer, dropout 0.3, linear output. Emits logits; softmax is applied at
/// the serving/eval boundary.
fn classification_head(vs: &nn::Path, num_classes: i64) -> nn::SequentialT {
    nn::seq_t()
        .add_fn(|x| x.adaptive_avg_pool2d(&[1, 1]).flatten(1, -1))
        .add_fn_t(|x, train| x.dropout(0.2, train))
        .add(nn::linear(vs / "fc1", FEATURE_DIM, 512, Default::default()))
        .add_fn(|x| x.relu())
        .add_fn_t(|x, train| x.dropout(0.3, train))
        .add(nn::linear(vs / "out", 512, num_classes, Default::default()))
}

/// Transfer-learning classifier: pretrained extractor under `base.*`,
/// trainable head under `head.*`.
#[derive(Debug)]
pub struct KidneyNet {
    base: nn::SequentialT,
    head: nn::SequentialT,
}

impl KidneyNet {
    pub fn new(vs: &nn::Path, num_classes: i64) -> Self {
        Self {
            base: feature_extractor(&(vs / "base")),
            head: classification_head(&(vs / "head"), num_classes),
        }
    }
}

impl nn::ModuleT for KidneyNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.head.forward_t(&self.base.forward_t(xs, train), train)
    }
}

/// Disables gradients for every `base.*` variable. Returns the count frozen.
pub fn freeze_base(vs: &nn::VarStore) -> usize {
    let mut frozen = 0;
    for (name, var) in vs.variables() {
        if name.starts_with("base.") {
            let _ = var.set_requires_grad(false);
            frozen += 1;
        }
    }
    frozen
}

/// Variable-name prefixes for the deepest part of the extractor: the last two
/// inverted-residual stages plus the final 1x1 conv. Unfreezing these is the
/// tch rendition of "unfreeze the last ~30 layers".
const FINE_TUNE_PREFIXES: [&str; 5] = [
    "base.block5_0.",
    "base.block5_1.",
    "base.block5_2.",
    "base.block6_0.",
    "base.top.",
];

/// Re-enables gradients on the top of the extractor for the fine-tune phase.
pub fn unfreeze_top_of_base(vs: &nn::VarStore) -> usize {
    let mut unfrozen = 0;
    for (name, var) in vs.variables() {
        if FINE_TUNE_PREFIXES.iter().any(|p| name.starts_with(p)) {
            let _ = var.set_requires_grad(true);
            unfrozen += 1;
        }
    }
    unfrozen
}

/// Copies `base.*` tensors from an external safetensors checkpoint into the
/// var store, skipping anything with a mismatched name or shape. Returns the
/// number of tensors copied; zero matches is an error since it means the
/// checkpoint has nothing usable.
pub fn load_pretrained_base(vs: &mut nn::VarStore, path: &Path) -> Result<usize> {
    let bytes = std::fs::read(path)?;
    let st = SafeTensors::deserialize(&bytes)
        .map_err(|e| ClassifierError::Config(format!("{}: {e}", path.display())))?;

    let mut target = vs.variables();
    let mut copied = 0usize;

    for name in st.names() {
        if !name.starts_with("base.") {
            continue;
        }
        let view = st
            .tensor(name)
            .map_err(|e| ClassifierError::Config(format!("{}: {e}", path.display())))?;
        let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
        let src = match view.dtype() {
            Dtype::F32 => {
                let data: Vec<f32> = pod_collect_to_vec(view.data());
                Tensor::from_slice(&data).reshape(&shape)
            }
            Dtype::F16 => {
                let bits: Vec<u16> = pod_collect_to_vec(view.data());
                let floats: Vec<f32> = bits.iter().map(|&b| f16::from_bits(b).to_f32()).collect();
                Tensor::from_slice(&floats).reshape(&shape)
            }
            other => {
                log::warn!("skipping pretrained tensor {name} with dtype {other:?}");
                continue;
            }
        };

        if let Some(dst) = target.get_mut(name) {
            if dst.size() == src.size() {
                tch::no_grad(|| dst.copy_(&src));
                copied += 1;
            } else {
                log::warn!(
                    "shape mismatch for pretrained tensor {name}: {:?} vs {:?}",
                    src.size(),
                    dst.size()
                );
            }
        }
    }

    if copied == 0 {
        return Err(ClassifierError::Config(format!(
            "no usable base tensors in pretrained checkpoint {}",
            path.display()
        )));
    }
    Ok(copied)
}
