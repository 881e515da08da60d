//! EfficientNet backbone with the fine-tuned classification head.
//!
//! Tensor names follow the torchvision layout checkpoints were trained with:
//! `features.0` stem, `features.1..=7` MBConv stages, `features.8` final 1x1
//! projection, then `classifier.{1,3,5}` for linear, batch-norm and linear.
//! Dropout slots (`classifier.0`, `classifier.4`) carry no weights.

use std::collections::BTreeMap;

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};

use crate::inspector::Variant;

const BN_EPS: f64 = 1e-5;

/// expand ratio, kernel, stride, input, output, layers (before scaling)
const BASE_STAGES: [(usize, usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 32, 16, 1),
    (6, 3, 2, 16, 24, 2),
    (6, 5, 2, 24, 40, 2),
    (6, 3, 2, 40, 80, 3),
    (6, 5, 1, 80, 112, 3),
    (6, 5, 2, 112, 192, 4),
    (6, 3, 1, 192, 320, 1),
];

pub type Manifest = BTreeMap<String, Vec<usize>>;

/// Rounds a scaled channel count to a multiple of `divisor`, never dropping
/// more than 10% below `v`.
pub fn make_divisible(v: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let mut rounded = (((v + d / 2.0) / d).floor() as usize * divisor).max(divisor);
    if (rounded as f64) < 0.9 * v {
        rounded += divisor;
    }
    rounded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbConv {
    pub expand_ratio: usize,
    pub kernel: usize,
    pub stride: usize,
    pub input: usize,
    pub output: usize,
}

impl MbConv {
    pub fn expanded(&self) -> usize { make_divisible((self.input * self.expand_ratio) as f64, 8) }
    pub fn squeeze(&self) -> usize { (self.input / 4).max(1) }
    pub fn has_expand(&self) -> bool { self.expanded() != self.input }
    pub fn residual(&self) -> bool { self.stride == 1 && self.input == self.output }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneConfig {
    pub stem: usize,
    pub stages: Vec<Vec<MbConv>>,
    pub features: usize,
}

impl BackboneConfig {
    pub fn for_variant(variant: Variant) -> Self {
        let (width, depth) = match variant {
            Variant::Small => (1.0, 1.0),
            Variant::Large => (1.2, 1.4),
        };
        let stages: Vec<Vec<MbConv>> = BASE_STAGES
            .iter()
            .map(|&(expand_ratio, kernel, stride, input, output, layers)| {
                let input = make_divisible(input as f64 * width, 8);
                let output = make_divisible(output as f64 * width, 8);
                let layers = (layers as f64 * depth).ceil() as usize;
                (0..layers)
                    .map(|j| MbConv {
                        expand_ratio,
                        kernel,
                        stride: if j == 0 { stride } else { 1 },
                        input: if j == 0 { input } else { output },
                        output,
                    })
                    .collect()
            })
            .collect();
        let stem = stages[0][0].input;
        let last = stages[stages.len() - 1][0].output;
        Self { stem, stages, features: 4 * last }
    }

    fn projection_prefix(&self) -> String { format!("features.{}", self.stages.len() + 1) }

    /// Every parameter and buffer the backbone reads, with its shape.
    pub fn manifest(&self, out: &mut Manifest) {
        conv_norm_manifest(out, "features.0", 3, self.stem, 3, 1);
        for (s, stage) in self.stages.iter().enumerate() {
            for (j, block) in stage.iter().enumerate() {
                let prefix = format!("features.{}.{j}.block", s + 1);
                let expanded = block.expanded();
                let mut idx = 0;
                if block.has_expand() {
                    conv_norm_manifest(out, &format!("{prefix}.{idx}"), block.input, expanded, 1, 1);
                    idx += 1;
                }
                conv_norm_manifest(out, &format!("{prefix}.{idx}"), expanded, expanded, block.kernel, expanded);
                idx += 1;
                let se = format!("{prefix}.{idx}");
                let squeeze = block.squeeze();
                out.insert(format!("{se}.fc1.weight"), vec![squeeze, expanded, 1, 1]);
                out.insert(format!("{se}.fc1.bias"), vec![squeeze]);
                out.insert(format!("{se}.fc2.weight"), vec![expanded, squeeze, 1, 1]);
                out.insert(format!("{se}.fc2.bias"), vec![expanded]);
                idx += 1;
                conv_norm_manifest(out, &format!("{prefix}.{idx}"), expanded, block.output, 1, 1);
            }
        }
        let last = self.stages[self.stages.len() - 1][0].output;
        conv_norm_manifest(out, &self.projection_prefix(), last, self.features, 1, 1);
    }
}

fn conv_norm_manifest(out: &mut Manifest, prefix: &str, cin: usize, cout: usize, kernel: usize, groups: usize) {
    out.insert(format!("{prefix}.0.weight"), vec![cout, cin / groups, kernel, kernel]);
    batch_norm_manifest(out, &format!("{prefix}.1"), cout);
}

fn batch_norm_manifest(out: &mut Manifest, prefix: &str, n: usize) {
    for field in ["weight", "bias", "running_mean", "running_var"] {
        out.insert(format!("{prefix}.{field}"), vec![n]);
    }
}

/// `dropout → linear → ReLU → BatchNorm1d → dropout → linear`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadShape {
    pub features: usize,
    pub hidden: usize,
    pub classes: usize,
}

impl HeadShape {
    pub fn manifest(&self, out: &mut Manifest) {
        out.insert("classifier.1.weight".into(), vec![self.hidden, self.features]);
        out.insert("classifier.1.bias".into(), vec![self.hidden]);
        batch_norm_manifest(out, "classifier.3", self.hidden);
        out.insert("classifier.5.weight".into(), vec![self.classes, self.hidden]);
        out.insert("classifier.5.bias".into(), vec![self.classes]);
    }
}

#[derive(Debug)]
struct ConvNorm {
    conv: Conv2d,
    bn: BatchNorm,
    activate: bool,
}

impl ConvNorm {
    fn load(vb: VarBuilder, cin: usize, cout: usize, kernel: usize, stride: usize, groups: usize, activate: bool) -> Result<Self> {
        let cfg = Conv2dConfig { padding: (kernel - 1) / 2, stride, groups, ..Default::default() };
        let conv = candle_nn::conv2d_no_bias(cin, cout, kernel, cfg, vb.pp("0"))?;
        let bn = candle_nn::batch_norm(cout, BN_EPS, vb.pp("1"))?;
        Ok(Self { conv, bn, activate })
    }
}

impl Module for ConvNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.apply(&self.conv)?.apply_t(&self.bn, false)?;
        if self.activate { candle_nn::ops::silu(&ys) } else { Ok(ys) }
    }
}

#[derive(Debug)]
struct SqueezeExcite {
    fc1: Conv2d,
    fc2: Conv2d,
}

impl SqueezeExcite {
    fn load(vb: VarBuilder, channels: usize, squeeze: usize) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::conv2d(channels, squeeze, 1, Conv2dConfig::default(), vb.pp("fc1"))?,
            fc2: candle_nn::conv2d(squeeze, channels, 1, Conv2dConfig::default(), vb.pp("fc2"))?,
        })
    }
}

impl Module for SqueezeExcite {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let scale = xs.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
        let scale = candle_nn::ops::silu(&scale.apply(&self.fc1)?)?;
        let scale = candle_nn::ops::sigmoid(&scale.apply(&self.fc2)?)?;
        xs.broadcast_mul(&scale)
    }
}

#[derive(Debug)]
struct MbConvBlock {
    expand: Option<ConvNorm>,
    depthwise: ConvNorm,
    se: SqueezeExcite,
    project: ConvNorm,
    residual: bool,
}

impl MbConvBlock {
    fn load(vb: VarBuilder, cfg: &MbConv) -> Result<Self> {
        let expanded = cfg.expanded();
        let mut idx = 0usize;
        let mut next = || {
            let p = vb.pp(idx.to_string());
            idx += 1;
            p
        };
        let expand = if cfg.has_expand() {
            Some(ConvNorm::load(next(), cfg.input, expanded, 1, 1, 1, true)?)
        } else {
            None
        };
        let depthwise = ConvNorm::load(next(), expanded, expanded, cfg.kernel, cfg.stride, expanded, true)?;
        let se = SqueezeExcite::load(next(), expanded, cfg.squeeze())?;
        let project = ConvNorm::load(next(), expanded, cfg.output, 1, 1, 1, false)?;
        Ok(Self { expand, depthwise, se, project, residual: cfg.residual() })
    }
}

impl Module for MbConvBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut ys = match &self.expand {
            Some(expand) => xs.apply(expand)?,
            None => xs.clone(),
        };
        ys = ys.apply(&self.depthwise)?.apply(&self.se)?.apply(&self.project)?;
        if self.residual { ys + xs } else { Ok(ys) }
    }
}

#[derive(Debug)]
struct Head {
    fc1: Linear,
    bn: BatchNorm,
    fc2: Linear,
}

impl Module for Head {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?.relu()?.apply_t(&self.bn, false)?.apply(&self.fc2)
    }
}

/// Inference-only EfficientNet classifier. Dropout is the identity here.
#[derive(Debug)]
pub struct EfficientNet {
    stem: ConvNorm,
    blocks: Vec<MbConvBlock>,
    projection: ConvNorm,
    head: Head,
}

impl EfficientNet {
    pub fn load(cfg: &BackboneConfig, head: HeadShape, vb: VarBuilder) -> Result<Self> {
        let stem = ConvNorm::load(vb.pp("features.0"), 3, cfg.stem, 3, 2, 1, true)?;
        let mut blocks = Vec::new();
        for (s, stage) in cfg.stages.iter().enumerate() {
            let stage_vb = vb.pp(format!("features.{}", s + 1));
            for (j, block) in stage.iter().enumerate() {
                blocks.push(MbConvBlock::load(stage_vb.pp(j.to_string()).pp("block"), block)?);
            }
        }
        let last = cfg.stages[cfg.stages.len() - 1][0].output;
        let projection = ConvNorm::load(vb.pp(cfg.projection_prefix()), last, cfg.features, 1, 1, 1, true)?;
        let cls = vb.pp("classifier");
        let head = Head {
            fc1: candle_nn::linear(head.features, head.hidden, cls.pp("1"))?,
            bn: candle_nn::batch_norm(head.hidden, BN_EPS, cls.pp("3"))?,
            fc2: candle_nn::linear(head.hidden, head.classes, cls.pp("5"))?,
        };
        Ok(Self { stem, blocks, projection, head })
    }
}

impl Module for EfficientNet {
    /// `[N, 3, H, W]` → logits `[N, classes]`.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut ys = xs.apply(&self.stem)?;
        for block in &self.blocks {
            ys = ys.apply(block)?;
        }
        let pooled = ys.apply(&self.projection)?.mean(D::Minus1)?.mean(D::Minus1)?;
        pooled.apply(&self.head)
    }
}
