use std::env;

use crate::cache_params::CacheSizes;
use crate::error::{ConvError, ConvResult};

/// Environment override for engine selection.
pub const ENGINE_ENV: &str = "BF16_CONV_ENGINE";

/// Micro-kernel realization used by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// AMX-BF16 tile registers.
    Amx,
    /// The AMX tile programs on a software tile file. Slow; for testing the
    /// tile path on machines without AMX.
    AmxEmulated,
    /// AVX-512F fused multiply-add.
    Avx512,
    /// Plain Rust.
    Portable,
}

impl EngineKind {
    pub fn name(self) -> &'static str {
        match self {
            EngineKind::Amx => "amx",
            EngineKind::AmxEmulated => "amx-emulated",
            EngineKind::Avx512 => "avx512",
            EngineKind::Portable => "portable",
        }
    }

    pub fn parse(value: &str) -> ConvResult<Self> {
        let value = value.trim();
        [EngineKind::Amx, EngineKind::AmxEmulated, EngineKind::Avx512, EngineKind::Portable]
            .into_iter()
            .find(|k| value.eq_ignore_ascii_case(k.name()))
            .ok_or_else(|| ConvError::InvalidEngineOverride(value.to_string()))
    }

    /// Reduction granularity of the engine's micro-kernels.
    pub fn micro_k(self) -> usize {
        match self {
            EngineKind::Amx | EngineKind::AmxEmulated => crate::kernels::tile::TILE_K,
            EngineKind::Avx512 | EngineKind::Portable => 2,
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            #[cfg(target_arch = "x86_64")]
            EngineKind::Amx => crate::kernels::tile::amx::is_available(),
            #[cfg(target_arch = "x86_64")]
            EngineKind::Avx512 => is_x86_feature_detected!("avx512f"),
            #[cfg(not(target_arch = "x86_64"))]
            EngineKind::Amx | EngineKind::Avx512 => false,
            EngineKind::AmxEmulated | EngineKind::Portable => true,
        }
    }

    /// Best engine this CPU supports: AMX, then AVX-512, then portable.
    pub fn detect() -> Self {
        let kind = [EngineKind::Amx, EngineKind::Avx512]
            .into_iter()
            .find(|k| k.is_available())
            .unwrap_or(EngineKind::Portable);
        log::debug!("detected conv engine: {}", kind.name());
        kind
    }

    /// Engine named by [`ENGINE_ENV`], or [`EngineKind::detect`] when unset.
    pub fn from_env() -> ConvResult<Self> {
        match env::var(ENGINE_ENV) {
            Ok(value) => {
                let kind = Self::parse(&value)?;
                if !kind.is_available() {
                    return Err(ConvError::EngineUnavailable(kind.name()));
                }
                log::debug!("{ENGINE_ENV} selects conv engine {}", kind.name());
                Ok(kind)
            }
            Err(_) => Ok(Self::detect()),
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Construction-time options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvOptions {
    /// Forces an engine instead of the environment or CPU detection.
    pub engine: Option<EngineKind>,
    /// Overrides the detected cache sizes that drive the blocking.
    pub caches: Option<CacheSizes>,
}

impl ConvOptions {
    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn caches(mut self, caches: CacheSizes) -> Self {
        self.caches = Some(caches);
        self
    }

    pub(crate) fn resolve_engine(&self) -> ConvResult<EngineKind> {
        match self.engine {
            Some(kind) if kind.is_available() => Ok(kind),
            Some(kind) => Err(ConvError::EngineUnavailable(kind.name())),
            None => EngineKind::from_env(),
        }
    }

    pub(crate) fn resolve_caches(&self) -> CacheSizes {
        self.caches.unwrap_or_else(CacheSizes::detected)
    }
}
