//! Construction and forward-time validation, caller-provided buffers.

mod common;

use bf16_conv_kernels::{
    ConvError, ConvOptions, ConvParam, Convolution16b, EngineKind, InnerProduct16b, Tensor, TensorMut, TensorType,
    ActivationKind,
};
use common::{options, Case};

#[test]
fn test_invalid_geometry_rejected_at_construction() {
    let bad = [
        ConvParam::new(1, 8, 8, 8, 0),
        ConvParam::new(1, 8, 2, 2, 8).kernel(3, 3),
        ConvParam::new(1, 6, 8, 8, 8).group(4),
        ConvParam::new(1, 8, 8, 8, 8).stride(0, 1),
    ];
    for p in bad {
        assert!(matches!(Convolution16b::new(&p), Err(ConvError::InvalidParam(_))), "{}", p.info());
    }
}

#[test]
fn test_forward_requires_params() {
    let p = ConvParam::new(1, 4, 4, 4, 4);
    let mut conv = Convolution16b::with_options(&p, &options(EngineKind::Portable)).unwrap();
    let src = vec![0.0f32; p.src_size()];
    let mut dst = vec![0.0f32; p.dst_size()];
    let err = conv.forward(Tensor::F32(&src), None, TensorMut::F32(&mut dst)).unwrap_err();
    assert!(matches!(err, ConvError::ParamsNotSet));
}

#[test]
fn test_slice_lengths_and_types_checked() {
    let p = ConvParam::new(1, 4, 4, 4, 4);
    let case = Case::new(p, 2);
    let mut conv = case.operator(&options(EngineKind::Portable));
    let mut dst = vec![0.0f32; p.dst_size()];
    let err = conv.forward(Tensor::F32(&case.src[1..]), None, TensorMut::F32(&mut dst)).unwrap_err();
    assert!(matches!(err, ConvError::SizeMismatch { what: "src", .. }));
    let mut short = vec![0.0f32; p.dst_size() - 1];
    let err = conv.forward(Tensor::F32(&case.src), None, TensorMut::F32(&mut short)).unwrap_err();
    assert!(matches!(err, ConvError::SizeMismatch { what: "dst", .. }));
    let mut bf = vec![half::bf16::ZERO; p.dst_size()];
    let err = conv.forward(Tensor::F32(&case.src), None, TensorMut::Bf16(&mut bf)).unwrap_err();
    assert!(matches!(err, ConvError::TypeMismatch { what: "dst", expected: TensorType::F32, .. }));
    let err = conv.set_params(&case.weight[1..], None, &[]).unwrap_err();
    assert!(matches!(err, ConvError::SizeMismatch { what: "weight", .. }));
}

#[test]
fn test_external_buffer() {
    let p = ConvParam::new(1, 64, 8, 8, 80).kernel(3, 3).pad(1).types(TensorType::F32, TensorType::Bf16);
    let case = Case::new(p, 6);
    let opts = ConvOptions::default()
        .engine(EngineKind::Portable)
        .caches(bf16_conv_kernels::CacheSizes::new(2048, 4096, 4096));
    let expect = case.run(&opts);
    let mut conv = case.operator(&opts);
    let size = conv.external_buffer_size();
    assert!(size > 0);

    // deliberately misaligned start
    let mut bytes = vec![0u8; size + 1];
    let mut dst = vec![half::bf16::ZERO; p.dst_size()];
    conv.forward(Tensor::F32(&case.src), Some(&mut bytes[1..]), TensorMut::Bf16(&mut dst)).unwrap();
    let got: Vec<f32> = dst.iter().map(|v| v.to_f32()).collect();
    assert_eq!(got, expect);

    let err = conv
        .forward(Tensor::F32(&case.src), Some(&mut bytes[..size - 1]), TensorMut::Bf16(&mut dst))
        .unwrap_err();
    assert!(matches!(err, ConvError::BufferTooSmall { required, .. } if required == size));
}

#[test]
fn test_unavailable_engine_is_an_error() {
    let p = ConvParam::new(1, 4, 4, 4, 4);
    for engine in [EngineKind::Amx, EngineKind::Avx512] {
        if engine.is_available() {
            continue;
        }
        let res = Convolution16b::with_options(&p, &ConvOptions::default().engine(engine));
        assert!(matches!(res, Err(ConvError::EngineUnavailable(_))));
    }
}

#[test]
fn test_inner_product_rejects_bad_bias() {
    let opts = ConvOptions::default().engine(EngineKind::Portable);
    let mut ip = InnerProduct16b::with_options(4, 3, 5, TensorType::F32, TensorType::F32, ActivationKind::Identity, &opts).unwrap();
    let err = ip.set_params(&[0.0; 15], Some(&[0.0; 2]), &[]).unwrap_err();
    assert!(matches!(err, ConvError::SizeMismatch { what: "bias", .. }));
}
