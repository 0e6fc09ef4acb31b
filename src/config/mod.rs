mod loader;
mod types;

pub use loader::{ConfigError, DEFAULT_CONFIG_PATHS, load_config, write_template};
pub use types::{
    AggregatorConfig, CacheConfig, HalleyConfig, PLACEHOLDER_FEE_ACCOUNT, RpcUrl, SweepConfig,
    WalletConfig,
};
