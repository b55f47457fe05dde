//! Deconvolution16b against the direct scalar transposed convolution.

mod common;

use bf16_conv_kernels::{ActivationKind, ConvParam, Deconvolution16b, Tensor, TensorMut, TensorType};
use common::{assert_close, engines, init_logging, options, reference_activation, shape_of, tolerance, Case};
use half::bf16;
use scalar_ops::bf16::scalar_round_bf16_slice;
use scalar_ops::conv::scalar_deconv_nhwc;

fn reference(case: &Case, dst_h: usize, dst_w: usize) -> Vec<f32> {
    scalar_deconv_nhwc(
        &shape_of(&case.p),
        dst_h,
        dst_w,
        &scalar_round_bf16_slice(&case.src),
        &scalar_round_bf16_slice(&case.weight),
        Some(&case.bias),
        reference_activation(case.p.activation),
        &case.params,
    )
}

fn run(deconv: &mut Deconvolution16b, case: &Case, buf: Option<&mut [u8]>) -> Vec<f32> {
    let p = &case.p;
    let src16: Vec<bf16> = case.src.iter().map(|&v| bf16::from_f32(v)).collect();
    let src = match p.src_type {
        TensorType::F32 => Tensor::F32(&case.src),
        TensorType::Bf16 => Tensor::Bf16(&src16),
    };
    let len = p.batch * deconv.dst_size();
    match p.dst_type {
        TensorType::F32 => {
            let mut dst = vec![f32::NAN; len];
            deconv.forward(src, buf, TensorMut::F32(&mut dst)).unwrap();
            dst
        }
        TensorType::Bf16 => {
            let mut dst = vec![bf16::NAN; len];
            deconv.forward(src, buf, TensorMut::Bf16(&mut dst)).unwrap();
            dst.iter().map(|v| v.to_f32()).collect()
        }
    }
}

fn shapes() -> Vec<ConvParam> {
    vec![
        ConvParam::new(1, 16, 4, 4, 8).kernel(2, 2).stride(2, 2),
        ConvParam::new(2, 12, 5, 3, 20).kernel(3, 3).stride(2, 2).pad(1),
        ConvParam::new(1, 33, 6, 7, 17).kernel(4, 4).stride(2, 2).padding(1, 1, 2, 2),
        ConvParam::new(1, 8, 3, 5, 40).kernel(3, 2).stride(1, 3).dilation(2, 1),
        ConvParam::new(1, 64, 2, 2, 64),
    ]
}

#[test]
fn test_deconvolution_matches_reference() {
    init_logging();
    for engine in engines() {
        for base in shapes() {
            for (src_type, dst_type) in [(TensorType::F32, TensorType::F32), (TensorType::Bf16, TensorType::Bf16)] {
                let p = base.activation(ActivationKind::Relu).types(src_type, dst_type);
                let case = Case::new(p, (p.src_c * p.dst_c) as u64);
                let mut deconv = Deconvolution16b::with_options(&p, &options(engine)).unwrap();
                deconv.set_params(&case.weight, Some(&case.bias), &case.params).unwrap();
                let got = run(&mut deconv, &case, None);
                let expect = reference(&case, deconv.dst_h(), deconv.dst_w());
                assert_close(&got, &expect, tolerance(dst_type), &format!("{engine} {} {dst_type:?}", p.info()));
            }
        }
    }
}

#[test]
fn test_deconvolution_activations() {
    init_logging();
    for kind in ActivationKind::ALL {
        let p = ConvParam::new(1, 10, 3, 4, 21).kernel(3, 3).stride(2, 2).pad(1).activation(kind);
        let case = Case::new(p, 5);
        let mut deconv = Deconvolution16b::with_options(&p, &options(bf16_conv_kernels::EngineKind::Portable)).unwrap();
        deconv.set_params(&case.weight, Some(&case.bias), &case.params).unwrap();
        let got = run(&mut deconv, &case, None);
        let expect = reference(&case, deconv.dst_h(), deconv.dst_w());
        assert_close(&got, &expect, tolerance(TensorType::F32), &format!("{kind}"));
    }
}

#[test]
fn test_external_buffer_reused() {
    init_logging();
    let p = ConvParam::new(2, 24, 4, 5, 12).kernel(3, 3).stride(2, 2).pad(1);
    let case = Case::new(p, 8);
    let mut deconv = Deconvolution16b::with_options(&p, &options(bf16_conv_kernels::EngineKind::AmxEmulated)).unwrap();
    deconv.set_params(&case.weight, Some(&case.bias), &case.params).unwrap();
    let internal = run(&mut deconv, &case, None);
    let mut bytes = vec![0xFFu8; deconv.external_buffer_size() + 3];
    for round in 0..2 {
        let got = run(&mut deconv, &case, Some(&mut bytes[3..]));
        let same = got.iter().zip(&internal).all(|(g, w)| g.to_bits() == w.to_bits());
        assert!(same, "round {round}: external buffer changed the result");
    }
    let mut short = vec![0u8; deconv.external_buffer_size() - 1];
    let src = vec![0.0f32; p.batch * p.src_size()];
    let mut dst = vec![0.0f32; p.batch * deconv.dst_size()];
    assert!(matches!(
        deconv.forward(Tensor::F32(&src), Some(&mut short), TensorMut::F32(&mut dst)),
        Err(bf16_conv_kernels::ConvError::BufferTooSmall { .. })
    ));
}
