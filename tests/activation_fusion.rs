//! Every activation kind fused into the store, fp32 and bf16 destinations.

mod common;

use bf16_conv_kernels::{ActivationKind, ConvParam, TensorType};
use common::{assert_close, engines, options, tolerance, Case};

#[test]
fn test_every_activation_kind() {
    for engine in engines() {
        for kind in ActivationKind::ALL {
            for dst in [TensorType::F32, TensorType::Bf16] {
                let p = ConvParam::new(1, 12, 5, 6, 19)
                    .kernel(3, 3)
                    .pad(1)
                    .activation(kind)
                    .types(TensorType::F32, dst);
                let case = Case::new(p, 31);
                let got = case.run(&options(engine));
                assert_close(&got, &case.reference(), tolerance(dst), &format!("{engine} {kind} {dst:?}"));
            }
        }
    }
}

#[test]
fn test_prelu_slopes_follow_channels_across_blocks() {
    // 40 channels: a 32-channel chunk and an 8-channel tail
    let p = ConvParam::new(1, 4, 4, 4, 40).activation(ActivationKind::Prelu);
    let case = Case::new(p, 77);
    for engine in engines() {
        let got = case.run(&options(engine));
        assert_close(&got, &case.reference(), 2e-3, &format!("{engine} prelu"));
    }
}
