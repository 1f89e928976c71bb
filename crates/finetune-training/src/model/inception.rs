//! InceptionV3 feature extractor (no classification top).
//!
//! Block layout and channel counts follow the published architecture:
//! a five-convolution stem, three 35x35 blocks (`mixed0`..`mixed2`), a grid
//! reduction (`mixed3`), four 17x17 factorized-7x7 blocks (`mixed4`..`mixed7`),
//! a second reduction (`mixed8`) and two 8x8 expanded blocks (`mixed9`,
//! `mixed10`). The output has 2048 channels.
//!
//! Convolutions carry no bias; each is followed by batch-norm and ReLU.

use super::graph::{LayerGraph, LayerGraphBuilder, LayerKind};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

/// Channels produced by the final block
pub const FEATURE_CHANNELS: usize = 2048;

#[derive(Config, Debug)]
pub struct InceptionV3Config {
    #[config(default = "3")]
    pub in_channels: usize,

    #[config(default = "1e-3")]
    pub bn_epsilon: f64,

    /// Weight of the current batch in the running statistics
    #[config(default = "0.01")]
    pub bn_momentum: f64,
}

#[derive(Clone, Copy, Debug)]
enum Padding {
    Same,
    Valid,
}

/// Shared state while constructing blocks
struct BlockBuilder<'a, B: Backend> {
    graph: &'a mut LayerGraphBuilder,
    config: &'a InceptionV3Config,
    device: &'a B::Device,
}

impl<B: Backend> BlockBuilder<'_, B> {
    fn conv(&mut self, channels: [usize; 2], kernel: [usize; 2]) -> BasicConv2d<B> {
        self.conv_with(channels, kernel, [1, 1], Padding::Same)
    }

    fn conv_with(
        &mut self,
        channels: [usize; 2],
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: Padding,
    ) -> BasicConv2d<B> {
        let padding = match padding {
            Padding::Same => PaddingConfig2d::Explicit((kernel[0] - 1) / 2, (kernel[1] - 1) / 2),
            Padding::Valid => PaddingConfig2d::Valid,
        };

        let conv = Conv2dConfig::new(channels, kernel)
            .with_stride(stride)
            .with_padding(padding)
            .with_bias(false)
            .init(self.device);
        let bn = BatchNormConfig::new(channels[1])
            .with_epsilon(self.config.bn_epsilon)
            .with_momentum(self.config.bn_momentum)
            .init(self.device);

        let conv_index = self.graph.push(LayerKind::Conv2d);
        let bn_index = self.graph.push(LayerKind::BatchNorm);
        self.graph.push(LayerKind::Activation);

        BasicConv2d {
            conv,
            bn,
            conv_index,
            bn_index,
        }
    }

    /// 3x3, stride 1, same padding, padded cells excluded from the mean
    fn avg_pool(&mut self) -> AvgPool2d {
        self.graph.push(LayerKind::AvgPool);
        AvgPool2dConfig::new([3, 3])
            .with_strides([1, 1])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_count_include_pad(false)
            .init()
    }

    /// 3x3, stride 2, valid padding
    fn max_pool(&mut self) -> MaxPool2d {
        self.graph.push(LayerKind::MaxPool);
        MaxPool2dConfig::new([3, 3]).with_strides([2, 2]).init()
    }

    fn concat(&mut self, name: Option<String>) {
        match name {
            Some(name) => self.graph.push_named(LayerKind::Concatenate, name),
            None => self.graph.push(LayerKind::Concatenate),
        };
    }
}

/// Convolution + batch-norm + ReLU
#[derive(Module, Debug)]
pub struct BasicConv2d<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    conv_index: usize,
    bn_index: usize,
}

impl<B: Backend> BasicConv2d<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.bn.forward(self.conv.forward(x)))
    }

    /// Graph indices of the convolution and batch-norm layers
    pub fn layer_indices(&self) -> (usize, usize) {
        (self.conv_index, self.bn_index)
    }

    fn apply_trainable(&mut self, graph: &LayerGraph) {
        let conv_trainable = graph.is_trainable(self.conv_index);
        self.conv.weight = self.conv.weight.clone().set_require_grad(conv_trainable);
        self.conv.bias = self.conv.bias.take().map(|b| b.set_require_grad(conv_trainable));

        let bn_trainable = graph.is_trainable(self.bn_index);
        self.bn.gamma = self.bn.gamma.clone().set_require_grad(bn_trainable);
        self.bn.beta = self.bn.beta.clone().set_require_grad(bn_trainable);
    }
}

/// 35x35 block: 1x1, 5x5, double 3x3 and pooled branches
#[derive(Module, Debug)]
pub struct InceptionA<B: Backend> {
    branch1x1: BasicConv2d<B>,
    branch5x5_1: BasicConv2d<B>,
    branch5x5_2: BasicConv2d<B>,
    branch3x3dbl_1: BasicConv2d<B>,
    branch3x3dbl_2: BasicConv2d<B>,
    branch3x3dbl_3: BasicConv2d<B>,
    pool: AvgPool2d,
    branch_pool: BasicConv2d<B>,
}

impl<B: Backend> InceptionA<B> {
    fn new(b: &mut BlockBuilder<B>, in_channels: usize, pool_features: usize, name: String) -> Self {
        let block = Self {
            branch1x1: b.conv([in_channels, 64], [1, 1]),
            branch5x5_1: b.conv([in_channels, 48], [1, 1]),
            branch5x5_2: b.conv([48, 64], [5, 5]),
            branch3x3dbl_1: b.conv([in_channels, 64], [1, 1]),
            branch3x3dbl_2: b.conv([64, 96], [3, 3]),
            branch3x3dbl_3: b.conv([96, 96], [3, 3]),
            pool: b.avg_pool(),
            branch_pool: b.conv([in_channels, pool_features], [1, 1]),
        };
        b.concat(Some(name));
        block
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let branch1x1 = self.branch1x1.forward(x.clone());

        let branch5x5 = self.branch5x5_1.forward(x.clone());
        let branch5x5 = self.branch5x5_2.forward(branch5x5);

        let branch3x3dbl = self.branch3x3dbl_1.forward(x.clone());
        let branch3x3dbl = self.branch3x3dbl_2.forward(branch3x3dbl);
        let branch3x3dbl = self.branch3x3dbl_3.forward(branch3x3dbl);

        let branch_pool = self.branch_pool.forward(self.pool.forward(x));

        Tensor::cat(vec![branch1x1, branch5x5, branch3x3dbl, branch_pool], 1)
    }

    fn apply_trainable(&mut self, graph: &LayerGraph) {
        self.branch1x1.apply_trainable(graph);
        self.branch5x5_1.apply_trainable(graph);
        self.branch5x5_2.apply_trainable(graph);
        self.branch3x3dbl_1.apply_trainable(graph);
        self.branch3x3dbl_2.apply_trainable(graph);
        self.branch3x3dbl_3.apply_trainable(graph);
        self.branch_pool.apply_trainable(graph);
    }
}

/// 35x35 -> 17x17 grid reduction
#[derive(Module, Debug)]
pub struct InceptionB<B: Backend> {
    branch3x3: BasicConv2d<B>,
    branch3x3dbl_1: BasicConv2d<B>,
    branch3x3dbl_2: BasicConv2d<B>,
    branch3x3dbl_3: BasicConv2d<B>,
    pool: MaxPool2d,
}

impl<B: Backend> InceptionB<B> {
    fn new(b: &mut BlockBuilder<B>, in_channels: usize, name: String) -> Self {
        let block = Self {
            branch3x3: b.conv_with([in_channels, 384], [3, 3], [2, 2], Padding::Valid),
            branch3x3dbl_1: b.conv([in_channels, 64], [1, 1]),
            branch3x3dbl_2: b.conv([64, 96], [3, 3]),
            branch3x3dbl_3: b.conv_with([96, 96], [3, 3], [2, 2], Padding::Valid),
            pool: b.max_pool(),
        };
        b.concat(Some(name));
        block
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let branch3x3 = self.branch3x3.forward(x.clone());

        let branch3x3dbl = self.branch3x3dbl_1.forward(x.clone());
        let branch3x3dbl = self.branch3x3dbl_2.forward(branch3x3dbl);
        let branch3x3dbl = self.branch3x3dbl_3.forward(branch3x3dbl);

        let branch_pool = self.pool.forward(x);

        Tensor::cat(vec![branch3x3, branch3x3dbl, branch_pool], 1)
    }

    fn apply_trainable(&mut self, graph: &LayerGraph) {
        self.branch3x3.apply_trainable(graph);
        self.branch3x3dbl_1.apply_trainable(graph);
        self.branch3x3dbl_2.apply_trainable(graph);
        self.branch3x3dbl_3.apply_trainable(graph);
    }
}

/// 17x17 block with factorized 7x7 convolutions
#[derive(Module, Debug)]
pub struct InceptionC<B: Backend> {
    branch1x1: BasicConv2d<B>,
    branch7x7_1: BasicConv2d<B>,
    branch7x7_2: BasicConv2d<B>,
    branch7x7_3: BasicConv2d<B>,
    branch7x7dbl_1: BasicConv2d<B>,
    branch7x7dbl_2: BasicConv2d<B>,
    branch7x7dbl_3: BasicConv2d<B>,
    branch7x7dbl_4: BasicConv2d<B>,
    branch7x7dbl_5: BasicConv2d<B>,
    pool: AvgPool2d,
    branch_pool: BasicConv2d<B>,
}

impl<B: Backend> InceptionC<B> {
    fn new(b: &mut BlockBuilder<B>, in_channels: usize, c7: usize, name: String) -> Self {
        let block = Self {
            branch1x1: b.conv([in_channels, 192], [1, 1]),
            branch7x7_1: b.conv([in_channels, c7], [1, 1]),
            branch7x7_2: b.conv([c7, c7], [1, 7]),
            branch7x7_3: b.conv([c7, 192], [7, 1]),
            branch7x7dbl_1: b.conv([in_channels, c7], [1, 1]),
            branch7x7dbl_2: b.conv([c7, c7], [7, 1]),
            branch7x7dbl_3: b.conv([c7, c7], [1, 7]),
            branch7x7dbl_4: b.conv([c7, c7], [7, 1]),
            branch7x7dbl_5: b.conv([c7, 192], [1, 7]),
            pool: b.avg_pool(),
            branch_pool: b.conv([in_channels, 192], [1, 1]),
        };
        b.concat(Some(name));
        block
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let branch1x1 = self.branch1x1.forward(x.clone());

        let branch7x7 = self.branch7x7_1.forward(x.clone());
        let branch7x7 = self.branch7x7_2.forward(branch7x7);
        let branch7x7 = self.branch7x7_3.forward(branch7x7);

        let branch7x7dbl = self.branch7x7dbl_1.forward(x.clone());
        let branch7x7dbl = self.branch7x7dbl_2.forward(branch7x7dbl);
        let branch7x7dbl = self.branch7x7dbl_3.forward(branch7x7dbl);
        let branch7x7dbl = self.branch7x7dbl_4.forward(branch7x7dbl);
        let branch7x7dbl = self.branch7x7dbl_5.forward(branch7x7dbl);

        let branch_pool = self.branch_pool.forward(self.pool.forward(x));

        Tensor::cat(vec![branch1x1, branch7x7, branch7x7dbl, branch_pool], 1)
    }

    fn apply_trainable(&mut self, graph: &LayerGraph) {
        self.branch1x1.apply_trainable(graph);
        self.branch7x7_1.apply_trainable(graph);
        self.branch7x7_2.apply_trainable(graph);
        self.branch7x7_3.apply_trainable(graph);
        self.branch7x7dbl_1.apply_trainable(graph);
        self.branch7x7dbl_2.apply_trainable(graph);
        self.branch7x7dbl_3.apply_trainable(graph);
        self.branch7x7dbl_4.apply_trainable(graph);
        self.branch7x7dbl_5.apply_trainable(graph);
        self.branch_pool.apply_trainable(graph);
    }
}

/// 17x17 -> 8x8 grid reduction
#[derive(Module, Debug)]
pub struct InceptionD<B: Backend> {
    branch3x3_1: BasicConv2d<B>,
    branch3x3_2: BasicConv2d<B>,
    branch7x7x3_1: BasicConv2d<B>,
    branch7x7x3_2: BasicConv2d<B>,
    branch7x7x3_3: BasicConv2d<B>,
    branch7x7x3_4: BasicConv2d<B>,
    pool: MaxPool2d,
}

impl<B: Backend> InceptionD<B> {
    fn new(b: &mut BlockBuilder<B>, in_channels: usize, name: String) -> Self {
        let block = Self {
            branch3x3_1: b.conv([in_channels, 192], [1, 1]),
            branch3x3_2: b.conv_with([192, 320], [3, 3], [2, 2], Padding::Valid),
            branch7x7x3_1: b.conv([in_channels, 192], [1, 1]),
            branch7x7x3_2: b.conv([192, 192], [1, 7]),
            branch7x7x3_3: b.conv([192, 192], [7, 1]),
            branch7x7x3_4: b.conv_with([192, 192], [3, 3], [2, 2], Padding::Valid),
            pool: b.max_pool(),
        };
        b.concat(Some(name));
        block
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let branch3x3 = self.branch3x3_1.forward(x.clone());
        let branch3x3 = self.branch3x3_2.forward(branch3x3);

        let branch7x7x3 = self.branch7x7x3_1.forward(x.clone());
        let branch7x7x3 = self.branch7x7x3_2.forward(branch7x7x3);
        let branch7x7x3 = self.branch7x7x3_3.forward(branch7x7x3);
        let branch7x7x3 = self.branch7x7x3_4.forward(branch7x7x3);

        let branch_pool = self.pool.forward(x);

        Tensor::cat(vec![branch3x3, branch7x7x3, branch_pool], 1)
    }

    fn apply_trainable(&mut self, graph: &LayerGraph) {
        self.branch3x3_1.apply_trainable(graph);
        self.branch3x3_2.apply_trainable(graph);
        self.branch7x7x3_1.apply_trainable(graph);
        self.branch7x7x3_2.apply_trainable(graph);
        self.branch7x7x3_3.apply_trainable(graph);
        self.branch7x7x3_4.apply_trainable(graph);
    }
}

/// 8x8 block with expanded 1x3/3x1 filter banks
#[derive(Module, Debug)]
pub struct InceptionE<B: Backend> {
    branch1x1: BasicConv2d<B>,
    branch3x3_1: BasicConv2d<B>,
    branch3x3_2a: BasicConv2d<B>,
    branch3x3_2b: BasicConv2d<B>,
    branch3x3dbl_1: BasicConv2d<B>,
    branch3x3dbl_2: BasicConv2d<B>,
    branch3x3dbl_3a: BasicConv2d<B>,
    branch3x3dbl_3b: BasicConv2d<B>,
    pool: AvgPool2d,
    branch_pool: BasicConv2d<B>,
}

impl<B: Backend> InceptionE<B> {
    fn new(b: &mut BlockBuilder<B>, in_channels: usize, block_index: usize) -> Self {
        let branch1x1 = b.conv([in_channels, 320], [1, 1]);

        let branch3x3_1 = b.conv([in_channels, 384], [1, 1]);
        let branch3x3_2a = b.conv([384, 384], [1, 3]);
        let branch3x3_2b = b.conv([384, 384], [3, 1]);
        b.concat(Some(format!("mixed9_{}", block_index - 9)));

        let branch3x3dbl_1 = b.conv([in_channels, 448], [1, 1]);
        let branch3x3dbl_2 = b.conv([448, 384], [3, 3]);
        let branch3x3dbl_3a = b.conv([384, 384], [1, 3]);
        let branch3x3dbl_3b = b.conv([384, 384], [3, 1]);
        b.concat(None);

        let pool = b.avg_pool();
        let branch_pool = b.conv([in_channels, 192], [1, 1]);
        b.concat(Some(format!("mixed{block_index}")));

        Self {
            branch1x1,
            branch3x3_1,
            branch3x3_2a,
            branch3x3_2b,
            branch3x3dbl_1,
            branch3x3dbl_2,
            branch3x3dbl_3a,
            branch3x3dbl_3b,
            pool,
            branch_pool,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let branch1x1 = self.branch1x1.forward(x.clone());

        let branch3x3 = self.branch3x3_1.forward(x.clone());
        let branch3x3 = Tensor::cat(
            vec![
                self.branch3x3_2a.forward(branch3x3.clone()),
                self.branch3x3_2b.forward(branch3x3),
            ],
            1,
        );

        let branch3x3dbl = self.branch3x3dbl_1.forward(x.clone());
        let branch3x3dbl = self.branch3x3dbl_2.forward(branch3x3dbl);
        let branch3x3dbl = Tensor::cat(
            vec![
                self.branch3x3dbl_3a.forward(branch3x3dbl.clone()),
                self.branch3x3dbl_3b.forward(branch3x3dbl),
            ],
            1,
        );

        let branch_pool = self.branch_pool.forward(self.pool.forward(x));

        Tensor::cat(vec![branch1x1, branch3x3, branch3x3dbl, branch_pool], 1)
    }

    fn apply_trainable(&mut self, graph: &LayerGraph) {
        self.branch1x1.apply_trainable(graph);
        self.branch3x3_1.apply_trainable(graph);
        self.branch3x3_2a.apply_trainable(graph);
        self.branch3x3_2b.apply_trainable(graph);
        self.branch3x3dbl_1.apply_trainable(graph);
        self.branch3x3dbl_2.apply_trainable(graph);
        self.branch3x3dbl_3a.apply_trainable(graph);
        self.branch3x3dbl_3b.apply_trainable(graph);
        self.branch_pool.apply_trainable(graph);
    }
}

/// InceptionV3 without its classification top.
///
/// Repeated blocks are stored in heap-allocated vectors.
#[derive(Module, Debug)]
pub struct InceptionV3<B: Backend> {
    conv2d_1a: BasicConv2d<B>,
    conv2d_2a: BasicConv2d<B>,
    conv2d_2b: BasicConv2d<B>,
    maxpool1: MaxPool2d,
    conv2d_3b: BasicConv2d<B>,
    conv2d_4a: BasicConv2d<B>,
    maxpool2: MaxPool2d,
    /// `mixed0`..`mixed2`
    blocks_35: Vec<InceptionA<B>>,
    /// `mixed3`
    reduction_17: InceptionB<B>,
    /// `mixed4`..`mixed7`
    blocks_17: Vec<InceptionC<B>>,
    /// `mixed8`
    reduction_8: InceptionD<B>,
    /// `mixed9`, `mixed10`
    blocks_8: Vec<InceptionE<B>>,
}

impl InceptionV3Config {
    /// Builds the backbone, registering its 311 layers in `graph`.
    pub fn init<B: Backend>(&self, graph: &mut LayerGraphBuilder, device: &B::Device) -> InceptionV3<B> {
        graph.push_named(LayerKind::Input, "input_1");

        let mut b = BlockBuilder::<B> {
            graph,
            config: self,
            device,
        };

        let conv2d_1a = b.conv_with([self.in_channels, 32], [3, 3], [2, 2], Padding::Valid);
        let conv2d_2a = b.conv_with([32, 32], [3, 3], [1, 1], Padding::Valid);
        let conv2d_2b = b.conv([32, 64], [3, 3]);
        let maxpool1 = b.max_pool();
        let conv2d_3b = b.conv_with([64, 80], [1, 1], [1, 1], Padding::Valid);
        let conv2d_4a = b.conv_with([80, 192], [3, 3], [1, 1], Padding::Valid);
        let maxpool2 = b.max_pool();

        let blocks_35: Vec<InceptionA<B>> = [(192, 32), (256, 64), (288, 64)]
            .into_iter()
            .enumerate()
            .map(|(i, (in_channels, pool_features))| {
                InceptionA::new(&mut b, in_channels, pool_features, format!("mixed{i}"))
            })
            .collect();
        let reduction_17 = InceptionB::new(&mut b, 288, "mixed3".into());
        let blocks_17: Vec<InceptionC<B>> = [128, 160, 160, 192]
            .into_iter()
            .enumerate()
            .map(|(i, c7)| InceptionC::new(&mut b, 768, c7, format!("mixed{}", i + 4)))
            .collect();
        let reduction_8 = InceptionD::new(&mut b, 768, "mixed8".into());
        let blocks_8 = vec![
            InceptionE::new(&mut b, 1280, 9),
            InceptionE::new(&mut b, FEATURE_CHANNELS, 10),
        ];

        InceptionV3 {
            conv2d_1a,
            conv2d_2a,
            conv2d_2b,
            maxpool1,
            conv2d_3b,
            conv2d_4a,
            maxpool2,
            blocks_35,
            reduction_17,
            blocks_17,
            reduction_8,
            blocks_8,
        }
    }
}

impl<B: Backend> InceptionV3<B> {
    /// `[N, 3, H, W]` -> `[N, 2048, h, w]`; H and W must be at least 75.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv2d_1a.forward(x);
        let x = self.conv2d_2a.forward(x);
        let x = self.conv2d_2b.forward(x);
        let x = self.maxpool1.forward(x);
        let x = self.conv2d_3b.forward(x);
        let x = self.conv2d_4a.forward(x);
        let x = self.maxpool2.forward(x);

        let x = self.blocks_35.iter().fold(x, |x, block| block.forward(x));
        let x = self.reduction_17.forward(x);
        let x = self.blocks_17.iter().fold(x, |x, block| block.forward(x));
        let x = self.reduction_8.forward(x);
        self.blocks_8.iter().fold(x, |x, block| block.forward(x))
    }

    /// Sets `require_grad` on every parameter from its layer's flag.
    pub fn apply_trainable(&mut self, graph: &LayerGraph) {
        self.conv2d_1a.apply_trainable(graph);
        self.conv2d_2a.apply_trainable(graph);
        self.conv2d_2b.apply_trainable(graph);
        self.conv2d_3b.apply_trainable(graph);
        self.conv2d_4a.apply_trainable(graph);
        for block in self.blocks_35.iter_mut() {
            block.apply_trainable(graph);
        }
        self.reduction_17.apply_trainable(graph);
        for block in self.blocks_17.iter_mut() {
            block.apply_trainable(graph);
        }
        self.reduction_8.apply_trainable(graph);
        for block in self.blocks_8.iter_mut() {
            block.apply_trainable(graph);
        }
    }

    /// First stem convolution, exposed for parameter checks
    pub fn stem(&self) -> &BasicConv2d<B> {
        &self.conv2d_1a
    }

    /// First convolution of `mixed9`, the first block above the default
    /// fine-tuning boundary
    pub fn mixed9_entry(&self) -> Option<&BasicConv2d<B>> {
        self.blocks_8.first().map(|block| &block.branch1x1)
    }
}
