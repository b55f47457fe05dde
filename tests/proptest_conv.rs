//! Property-based tests.
//!
//! - the bf16 codec agrees with the scalar reference on every bit pattern
//! - random small convolutions match the direct reference on every engine
//! - exact engines give the same bits under any cache blocking

mod common;

use proptest::prelude::*;

use bf16_conv_kernels::{
    bfloat16_to_float32, float32_to_bfloat16, ActivationKind, CacheSizes, ConvOptions, ConvParam, TensorType,
};
use common::{assert_close, engines, exact_engines, options, tolerance, Case};
use scalar_ops::bf16::{scalar_bf16_to_f32, scalar_f32_to_bf16};

proptest! {
    #[test]
    fn prop_codec_matches_reference(bits in any::<u32>()) {
        let x = f32::from_bits(bits);
        let got = float32_to_bfloat16(x);
        prop_assert_eq!(got, scalar_f32_to_bf16(x));
        if x.is_nan() {
            prop_assert!(bfloat16_to_float32(got).is_nan());
        }
    }

    #[test]
    fn prop_widening_is_exact(bits in any::<u16>()) {
        let x = bfloat16_to_float32(bits);
        prop_assert_eq!(x.to_bits(), scalar_bf16_to_f32(bits).to_bits());
        if !x.is_nan() {
            prop_assert_eq!(float32_to_bfloat16(x), bits);
        }
    }
}

fn arb_param() -> impl Strategy<Value = ConvParam> {
    (
        (1usize..=2, 1usize..=40, 3usize..=9, 3usize..=9, 1usize..=40),
        (1usize..=3, 1usize..=3, 1usize..=2, 1usize..=2, 0usize..=1),
        (any::<bool>(), any::<bool>(), 0usize..3),
    )
        .prop_map(|((batch, src_c, src_h, src_w, dst_c), (ky, kx, stride, dilation, pad), (bf_src, bf_dst, act))| {
            let ty = |bf| if bf { TensorType::Bf16 } else { TensorType::F32 };
            let activation = [ActivationKind::Identity, ActivationKind::Relu, ActivationKind::Swish][act];
            ConvParam::new(batch, src_c, src_h, src_w, dst_c)
                .kernel(ky, kx)
                .stride(stride, stride)
                .dilation(dilation, dilation)
                .pad(pad)
                .activation(activation)
                .types(ty(bf_src), ty(bf_dst))
        })
        .prop_filter("kernel must fit", |p| p.validate().is_ok())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_conv_matches_direct(p in arb_param(), seed in any::<u64>()) {
        let case = Case::new(p, seed);
        let expect = case.reference();
        for engine in engines() {
            let got = case.run(&options(engine));
            assert_close(&got, &expect, tolerance(p.dst_type), &format!("{engine} {}", p.info()));
        }
    }

    #[test]
    fn prop_blocking_is_bit_exact(
        p in arb_param(),
        l1 in 1usize..=8,
        l2 in 1usize..=16,
        l3 in 1usize..=16,
    ) {
        let case = Case::new(p, 11);
        let caches = CacheSizes::new(l1 * 512, l2 * 1024, l3 * 1024);
        for engine in exact_engines() {
            let blocked = case.run(&ConvOptions::default().engine(engine).caches(caches));
            let reference = case.run(&options(engine));
            prop_assert_eq!(blocked, reference, "{} {} {:?}", engine, p.info(), caches);
        }
    }
}
