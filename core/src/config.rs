//! Configuration objects for the three external operations
//! (`spec.md` §6): embed, extract, remove.
//!
//! Each is built with a fluent builder, the same pattern the teacher
//! crate uses for its consensus [`Config`](crate::codec::CodecParams)
//! — callers customise only the fields they care about, everything
//! else falls back to the design's defaults (4-neighbor 1/4 averaging
//! kernel, stride 3, `t_hi` 0, bit depth inferred from the image).
//!
//! ```
//! use wmchain_core::config::EmbedConfigBuilder;
//!
//! let cfg = EmbedConfigBuilder::new(
//!         "images/ct_slice.dcm",
//!         "out/watermarked_ct_slice.dcm",
//!         "patient-042",
//!         "chain.json",
//!         "dcm",
//!     )
//!     .stride(4)
//!     .finish();
//! assert_eq!(cfg.stride, 4);
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::Kernel;

fn default_secret_key() -> String {
    "wmchain-default-key".to_string()
}

/// Configuration for an embed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedConfig {
    pub data_path: String,
    pub save_path: String,
    pub message: String,
    pub blockchain_path: String,
    pub data_type: String,
    pub kernel: Kernel,
    pub stride: usize,
    pub t_hi: u32,
    pub bit_depth: Option<u8>,
    pub secret_key: String,
}

pub struct EmbedConfigBuilder {
    inner: EmbedConfig,
}

impl EmbedConfigBuilder {
    pub fn new(
        data_path: impl Into<String>,
        save_path: impl Into<String>,
        message: impl Into<String>,
        blockchain_path: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            inner: EmbedConfig {
                data_path: data_path.into(),
                save_path: save_path.into(),
                message: message.into(),
                blockchain_path: blockchain_path.into(),
                data_type: data_type.into(),
                kernel: Kernel::four_neighbor_average(),
                stride: 3,
                t_hi: 0,
                bit_depth: None,
                secret_key: default_secret_key(),
            },
        }
    }

    pub fn kernel(mut self, kernel: Kernel) -> Self {
        self.inner.kernel = kernel;
        self
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.inner.stride = stride;
        self
    }

    pub fn t_hi(mut self, t_hi: u32) -> Self {
        self.inner.t_hi = t_hi;
        self
    }

    pub fn bit_depth(mut self, bit_depth: u8) -> Self {
        self.inner.bit_depth = Some(bit_depth);
        self
    }

    pub fn secret_key(mut self, key: impl Into<String>) -> Self {
        self.inner.secret_key = key.into();
        self
    }

    pub fn finish(self) -> EmbedConfig {
        self.inner
    }
}

/// Configuration for an extract (provenance lookup) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub data_path: String,
    pub blockchain_path: String,
    pub data_type: String,
}

impl ExtractConfig {
    pub fn new(
        data_path: impl Into<String>,
        blockchain_path: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            blockchain_path: blockchain_path.into(),
            data_type: data_type.into(),
        }
    }
}

/// Configuration for a remove (invert-the-embed) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveConfig {
    pub data_path: String,
    pub save_path: String,
    pub ext_wat_path: String,
    pub blockchain_path: String,
    pub data_type: String,
}

impl RemoveConfig {
    pub fn new(
        data_path: impl Into<String>,
        save_path: impl Into<String>,
        ext_wat_path: impl Into<String>,
        blockchain_path: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            save_path: save_path.into(),
            ext_wat_path: ext_wat_path.into(),
            blockchain_path: blockchain_path.into(),
            data_type: data_type.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_builder_overrides_fields() {
        let cfg = EmbedConfigBuilder::new("in.png", "out.png", "hello", "chain.json", "png")
            .stride(5)
            .t_hi(2)
            .bit_depth(8)
            .secret_key("mykey")
            .finish();
        assert_eq!(cfg.stride, 5);
        assert_eq!(cfg.t_hi, 2);
        assert_eq!(cfg.bit_depth, Some(8));
        assert_eq!(cfg.secret_key, "mykey");
    }

    #[test]
    fn embed_builder_defaults() {
        let cfg = EmbedConfigBuilder::new("in.png", "out.png", "hello", "chain.json", "png").finish();
        assert_eq!(cfg.stride, 3);
        assert_eq!(cfg.t_hi, 0);
        assert_eq!(cfg.kernel, Kernel::four_neighbor_average());
    }
}
