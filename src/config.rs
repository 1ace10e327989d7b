//! Tuning parameters for rebalancing and downsampling.
use serde::de::Error;

/// Tree configuration
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeConfig {
    /// A subtree is rebuilt once more than this fraction of its nodes is deleted.
    #[serde(default = "TreeConfig::default_delete_ratio_threshold")]
    pub delete_ratio_threshold: f32,

    /// A subtree is rebuilt once either child holds more than this fraction
    /// of its descendants.
    #[serde(default = "TreeConfig::default_balance_ratio_threshold")]
    pub balance_ratio_threshold: f32,

    /// Edge length of the downsampling grid, also the sampling step of
    /// line and ray collision checks.
    #[serde(default = "TreeConfig::default_voxel_size")]
    pub voxel_size: f32,

    #[serde(default = "TreeConfig::default_min_unbalanced_size")]
    pub min_unbalanced_size: usize,

    /// Subtrees at least this large are rebuilt on the background worker.
    #[serde(default = "TreeConfig::default_background_rebuild_size")]
    pub background_rebuild_size: usize,
}

impl TreeConfig {
    const fn default_delete_ratio_threshold() -> f32 {
        0.5
    }

    const fn default_balance_ratio_threshold() -> f32 {
        0.6
    }

    const fn default_voxel_size() -> f32 {
        0.2
    }

    const fn default_min_unbalanced_size() -> usize {
        10
    }

    const fn default_background_rebuild_size() -> usize {
        1500
    }

    pub fn with_delete_ratio_threshold(mut self, threshold: f32) -> Self {
        self.delete_ratio_threshold = threshold;
        self
    }

    pub fn with_balance_ratio_threshold(mut self, threshold: f32) -> Self {
        self.balance_ratio_threshold = threshold;
        self
    }

    pub fn with_voxel_size(mut self, size: f32) -> Self {
        self.voxel_size = size;
        self
    }

    pub fn with_min_unbalanced_size(mut self, size: usize) -> Self {
        self.min_unbalanced_size = size;
        self
    }

    pub fn with_background_rebuild_size(mut self, size: usize) -> Self {
        if size < 200 {
            log::warn!(
                "Background rebuild size of {} is very small; most rebuilds will be \
                handed to the worker thread",
                size
            );
        }
        self.background_rebuild_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.delete_ratio_threshold > 0.0 && self.delete_ratio_threshold <= 1.0) {
            return Err(format!(
                "Delete ratio threshold must be in (0, 1], got {}",
                self.delete_ratio_threshold
            ));
        }

        if !(self.balance_ratio_threshold >= 0.5 && self.balance_ratio_threshold < 1.0) {
            return Err(format!(
                "Balance ratio threshold must be in [0.5, 1), got {}",
                self.balance_ratio_threshold
            ));
        }

        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(format!(
                "Voxel size must be finite and positive, got {}",
                self.voxel_size
            ));
        }

        if self.background_rebuild_size <= self.min_unbalanced_size {
            return Err(format!(
                "Background rebuild size ({}) must exceed the minimum unbalanced size ({})",
                self.background_rebuild_size, self.min_unbalanced_size
            ));
        }

        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: TreeConfig = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        let config: TreeConfig = toml::from_str(toml_str)?;
        if let Err(e) = config.validate() {
            return Err(toml::de::Error::custom(e));
        }
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            delete_ratio_threshold: Self::default_delete_ratio_threshold(),
            balance_ratio_threshold: Self::default_balance_ratio_threshold(),
            voxel_size: Self::default_voxel_size(),
            min_unbalanced_size: Self::default_min_unbalanced_size(),
            background_rebuild_size: Self::default_background_rebuild_size(),
        }
    }
}
