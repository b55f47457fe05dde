//! Fused post-processing: `activation(acc + bias)` stored as fp32 or bf16.
//!
//! The row function is picked once per operator from a table keyed by the
//! normalized activation kind and the destination type, so the four shape
//! kernels stay identical across activations.

use crate::activation::{self, ActivationKind, ActivationParams};
use crate::bf16::float32_to_bfloat16;
use crate::conv::TensorType;

/// Processes `cols` channels of one accumulator row.
pub type RowFn = unsafe fn(
    acc: *const f32,
    cols: usize,
    bias: *const f32,
    params: *const f32,
    scalars: &[f32; 2],
    dst: *mut u8,
);

/// Lane mask of the first `n` of 16 channels.
#[inline(always)]
pub fn tail_mask16(n: usize) -> u16 {
    if n >= 16 {
        u16::MAX
    } else {
        (1u16 << n) - 1
    }
}

trait Act {
    const PER_CHANNEL: bool = false;
    fn apply(x: f32, s: &[f32; 2], pc: f32) -> f32;
}

struct RestrictRange;
struct Prelu;
struct Elu;
struct Hswish;
struct Mish;
struct HardSigmoid;
struct Swish;
struct Gelu;

impl Act for RestrictRange {
    #[inline(always)]
    fn apply(x: f32, s: &[f32; 2], _: f32) -> f32 {
        activation::restrict_range(x, s[0], s[1])
    }
}

impl Act for Prelu {
    const PER_CHANNEL: bool = true;
    #[inline(always)]
    fn apply(x: f32, _: &[f32; 2], pc: f32) -> f32 {
        activation::leaky(x, pc)
    }
}

impl Act for Elu {
    #[inline(always)]
    fn apply(x: f32, s: &[f32; 2], _: f32) -> f32 {
        activation::elu(x, s[0])
    }
}

impl Act for Hswish {
    #[inline(always)]
    fn apply(x: f32, s: &[f32; 2], _: f32) -> f32 {
        activation::hswish(x, s[0], s[1])
    }
}

impl Act for Mish {
    #[inline(always)]
    fn apply(x: f32, s: &[f32; 2], _: f32) -> f32 {
        activation::mish(x, s[0])
    }
}

impl Act for HardSigmoid {
    #[inline(always)]
    fn apply(x: f32, s: &[f32; 2], _: f32) -> f32 {
        activation::hard_sigmoid(x, s[0], s[1])
    }
}

impl Act for Swish {
    #[inline(always)]
    fn apply(x: f32, s: &[f32; 2], _: f32) -> f32 {
        activation::swish(x, s[0])
    }
}

impl Act for Gelu {
    #[inline(always)]
    fn apply(x: f32, _: &[f32; 2], _: f32) -> f32 {
        activation::gelu(x)
    }
}

trait Out {
    unsafe fn store(dst: *mut u8, i: usize, v: f32);
}

struct F32Out;
struct Bf16Out;

impl Out for F32Out {
    #[inline(always)]
    unsafe fn store(dst: *mut u8, i: usize, v: f32) {
        (dst as *mut f32).add(i).write_unaligned(v);
    }
}

impl Out for Bf16Out {
    #[inline(always)]
    unsafe fn store(dst: *mut u8, i: usize, v: f32) {
        (dst as *mut u16).add(i).write_unaligned(float32_to_bfloat16(v));
    }
}

unsafe fn post_row<A: Act, O: Out>(
    acc: *const f32,
    cols: usize,
    bias: *const f32,
    params: *const f32,
    scalars: &[f32; 2],
    dst: *mut u8,
) {
    let mut start = 0;
    while start < cols {
        let mask = tail_mask16(cols - start);
        let mut vals = [0.0f32; 16];
        for (lane, v) in vals.iter_mut().enumerate() {
            if mask & (1 << lane) != 0 {
                let i = start + lane;
                let pc = if A::PER_CHANNEL { *params.add(i) } else { 0.0 };
                *v = A::apply(*acc.add(i) + *bias.add(i), scalars, pc);
            }
        }
        for (lane, &v) in vals.iter().enumerate() {
            if mask & (1 << lane) != 0 {
                O::store(dst, start + lane, v);
            }
        }
        start += 16;
    }
}

macro_rules! row_fn {
    ($kind:expr, $out:expr; $($($k:ident)|+ => $act:ty),+ $(,)?) => {
        match $kind {
            $(
                $(ActivationKind::$k)|+ => match $out {
                    TensorType::F32 => post_row::<$act, F32Out> as RowFn,
                    TensorType::Bf16 => post_row::<$act, Bf16Out> as RowFn,
                },
            )+
        }
    };
}

fn select_row_fn(kind: ActivationKind, out: TensorType) -> RowFn {
    row_fn!(kind, out;
        Identity | Relu | RestrictRange => RestrictRange,
        LeakyRelu | Prelu => Prelu,
        Elu => Elu,
        Hswish => Hswish,
        Mish => Mish,
        HardSigmoid => HardSigmoid,
        Swish => Swish,
        Gelu => Gelu,
    )
}

/// Post-processing strategy chosen at construction.
#[derive(Clone)]
pub struct PostOp {
    row: RowFn,
    scalars: [f32; 2],
    kind: ActivationKind,
    dst_type: TensorType,
}

impl PostOp {
    pub fn new(params: &ActivationParams, dst_type: TensorType) -> Self {
        let kind = params.kind();
        let data = params.as_slice();
        let scalars = if params.per_channel() {
            [0.0, 0.0]
        } else {
            [data.first().copied().unwrap_or(0.0), data.get(1).copied().unwrap_or(0.0)]
        };
        Self {
            row: select_row_fn(kind, dst_type),
            scalars,
            kind,
            dst_type,
        }
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }

    pub fn dst_type(&self) -> TensorType {
        self.dst_type
    }

    pub fn per_channel(&self) -> bool {
        self.kind == ActivationKind::Prelu
    }

    /// # Safety
    /// `acc` and `bias` hold `cols` floats, `params` too for per-channel
    /// kinds, and `dst` has room for `cols` destination elements.
    #[inline(always)]
    pub unsafe fn apply_row(&self, acc: *const f32, cols: usize, bias: *const f32, params: *const f32, dst: *mut u8) {
        (self.row)(acc, cols, bias, params, &self.scalars, dst)
    }
}

impl std::fmt::Debug for PostOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostOp")
            .field("kind", &self.kind)
            .field("dst_type", &self.dst_type)
            .field("scalars", &self.scalars)
            .finish()
    }
}
