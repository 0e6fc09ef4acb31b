use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use super::HalleyConfig;

pub const DEFAULT_CONFIG_PATHS: &[&str] = &["halley.toml", "config/halley.toml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
    #[error("refusing to overwrite existing config at {path} (use --force)")]
    AlreadyExists { path: PathBuf },
}

pub fn load_config(path: Option<PathBuf>) -> Result<HalleyConfig, ConfigError> {
    let candidate_paths = match path {
        Some(p) => vec![p],
        None => DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .collect::<Vec<PathBuf>>(),
    };

    for candidate in candidate_paths {
        if let Some(config) = try_load_file(&candidate)? {
            info!(target: "config", path = %candidate.display(), "已加载配置");
            return Ok(config);
        }
    }

    info!(target: "config", "未找到配置文件，使用默认配置");
    Ok(HalleyConfig::default())
}

fn try_load_file(path: &Path) -> Result<Option<HalleyConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let config: HalleyConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;

    Ok(Some(config))
}

pub const CONFIG_TEMPLATE: &str = r#"# halley 配置模版。所有字段均有默认值，按需取消注释。

# rpc_url = "https://api.mainnet-beta.solana.com"

[aggregator]
# base_url = "https://api.jup.ag/swap/v1"
# api_key = ""              # 亦可用环境变量 HALLEY_API_KEY
# request_timeout_ms = 10000
# min_interval_ms = 500     # 聚合器限速间隔，生产建议 1100

[sweep]
# fee_account = ""          # 平台手续费收款钱包（base58）
# min_dust_value_sol = 0.002
# max_batch_size = 10

[cache]
# dir = ".halley-cache"
# ttl_secs = 1800

[wallet]
# private_key = ""          # base58 / JSON 字节数组 / 逗号分隔字节
# keypair_path = "~/.config/solana/id.json"
"#;

pub fn write_template(dir: Option<PathBuf>, force: bool) -> Result<PathBuf, ConfigError> {
    let target = dir.unwrap_or_else(|| PathBuf::from(".")).join("halley.toml");
    if target.exists() && !force {
        return Err(ConfigError::AlreadyExists { path: target });
    }
    fs::write(&target, CONFIG_TEMPLATE).map_err(|source| ConfigError::Io {
        path: target.clone(),
        source,
    })?;
    Ok(target)
}
