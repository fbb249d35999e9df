//! The fine-tuning model: a pretrained backbone plus a classification head.

use crate::{
    common::*,
    config::{BackboneKind, ModelConfig},
};
use tch_modules::{ClassifierHead, ClassifierHeadInit};

/// The variable namespace of the classification head.
pub const HEAD_NAMESPACE: &str = "head";

/// Output channels of the VGG16 convolutional layers. `None` marks a max pooling.
const VGG16_LAYERS: &[Option<i64>] = &[
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    None,
];

/// The image classifier.
#[derive(Debug)]
pub struct Model {
    backbone: Backbone,
    head: ClassifierHead,
}

#[derive(Debug)]
enum Backbone {
    Vgg16(Vgg16Features),
    ResNet(nn::FuncT<'static>),
}

impl Model {
    /// Build a model under `path`.
    ///
    /// Backbone variables are named after torchvision models, so that
    /// converted ImageNet weights can be loaded into the same variable store.
    pub fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        config: &ModelConfig,
        num_classes: usize,
    ) -> Result<Self> {
        let path = path.borrow();
        let ModelConfig {
            backbone, dropout, ..
        } = *config;

        let (backbone, num_features) = match backbone {
            BackboneKind::Vgg16 => {
                let features = Vgg16Features::new(path / "features");
                (Backbone::Vgg16(features), 512)
            }
            BackboneKind::Resnet18 => {
                let resnet = vision::resnet::resnet18_no_final_layer(path);
                (Backbone::ResNet(resnet), 512)
            }
            BackboneKind::Resnet34 => {
                let resnet = vision::resnet::resnet34_no_final_layer(path);
                (Backbone::ResNet(resnet), 512)
            }
        };

        let head = ClassifierHeadInit {
            dropout: dropout.raw(),
            ..ClassifierHeadInit::new(num_features, num_classes)
        }
        .build(path / HEAD_NAMESPACE)?;

        Ok(Self { backbone, head })
    }

    /// Compute `[batch, num_classes]` logits from `[batch, 3, H, W]` images.
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let (_b, channels, _h, _w) = input.size4()?;
        ensure!(
            channels == 3,
            "expect 3 input channels, but get {}",
            channels
        );

        let features = match &self.backbone {
            Backbone::Vgg16(features) => features.forward_t(input, train),
            Backbone::ResNet(resnet) => input.apply_t(resnet, train),
        };
        Ok(self.head.forward_t(&features, train))
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }
}

/// Disable gradients of every variable outside the classification head.
///
/// It returns the number of frozen variables.
pub fn freeze_backbone(vs: &nn::VarStore) -> usize {
    let prefix = format!("{}.", HEAD_NAMESPACE);

    vs.variables()
        .into_iter()
        .filter(|(name, tensor)| !name.starts_with(&prefix) && tensor.requires_grad())
        .map(|(_name, tensor)| {
            let _ = tensor.set_requires_grad(false);
        })
        .count()
}

/// The convolutional part of VGG16.
#[derive(Debug)]
struct Vgg16Features {
    layers: Vec<VggLayer>,
}

#[derive(Debug)]
enum VggLayer {
    Conv(nn::Conv2D),
    MaxPool,
}

impl Vgg16Features {
    fn new<'a>(path: impl Borrow<nn::Path<'a>>) -> Self {
        let path = path.borrow();
        let conv_config = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };

        // every conv is followed by a relu, so layer indexes skip by two
        let mut index = 0;
        let mut in_c = 3;
        let layers = VGG16_LAYERS
            .iter()
            .map(|out_c| match *out_c {
                Some(out_c) => {
                    let conv = nn::conv2d(path / index, in_c, out_c, 3, conv_config);
                    index += 2;
                    in_c = out_c;
                    VggLayer::Conv(conv)
                }
                None => {
                    index += 1;
                    VggLayer::MaxPool
                }
            })
            .collect();

        Self { layers }
    }
}

impl nn::ModuleT for Vgg16Features {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        self.layers
            .iter()
            .fold(xs.shallow_clone(), |xs, layer| match layer {
                VggLayer::Conv(conv) => xs.apply(conv).relu(),
                VggLayer::MaxPool => xs.max_pool2d_default(2),
            })
    }
}
