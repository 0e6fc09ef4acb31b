use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use tracing::warn;

/// 手续费账户缺省占位：System Program，地址合法但不会真正收钱。
pub const PLACEHOLDER_FEE_ACCOUNT: Pubkey =
    solana_sdk::pubkey!("11111111111111111111111111111111");

pub const API_KEY_ENV: &str = "HALLEY_API_KEY";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HalleyConfig {
    pub rpc_url: RpcUrl,
    pub aggregator: AggregatorConfig,
    pub sweep: SweepConfig,
    pub cache: CacheConfig,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct RpcUrl(pub String);

impl Default for RpcUrl {
    fn default() -> Self {
        Self("https://api.mainnet-beta.solana.com".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub base_url: String,
    /// 配置文件里的 key 可被环境变量 `HALLEY_API_KEY` 覆盖。
    pub api_key: String,
    pub token_list_urls: Vec<String>,
    pub request_timeout_ms: u64,
    /// 相邻两次聚合器调用的最小间隔。
    pub min_interval_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.jup.ag/swap/v1".to_string(),
            api_key: String::new(),
            token_list_urls: vec![
                "https://token.jup.ag/strict".to_string(),
                "https://token.jup.ag/all".to_string(),
            ],
            request_timeout_ms: 10_000,
            min_interval_ms: 500,
        }
    }
}

impl AggregatorConfig {
    pub fn api_key(&self) -> Option<String> {
        if let Ok(value) = env::var(API_KEY_ENV) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        let trimmed = self.api_key.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// 平台手续费收款钱包（base58）。非法或缺失时退回占位地址。
    pub fee_account: String,
    /// 低于该 SOL 估值的粉尘不值得回收，直接丢弃。
    pub min_dust_value_sol: f64,
    /// 单批建议上限，仅用于 CLI 截断提示，编排器本身不强制。
    pub max_batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            fee_account: String::new(),
            min_dust_value_sol: 0.002,
            max_batch_size: 10,
        }
    }
}

impl SweepConfig {
    pub fn fee_account(&self) -> Pubkey {
        let trimmed = self.fee_account.trim();
        if trimmed.is_empty() {
            return PLACEHOLDER_FEE_ACCOUNT;
        }
        match Pubkey::from_str(trimmed) {
            Ok(pubkey) => pubkey,
            Err(err) => {
                warn!(
                    target: "config",
                    value = trimmed,
                    error = %err,
                    "sweep.fee_account 非法，退回占位地址"
                );
                PLACEHOLDER_FEE_ACCOUNT
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".halley-cache"),
            ttl_secs: crate::cache::DEFAULT_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WalletConfig {
    /// 私钥字符串：JSON 字节数组 / 逗号分隔字节 / base58。
    pub private_key: String,
    /// 或指向标准 JSON keypair 文件。两者都给时以文件为准。
    pub keypair_path: Option<PathBuf>,
}

impl WalletConfig {
    pub fn keypair(&self) -> anyhow::Result<Keypair> {
        if let Some(path) = &self.keypair_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|err| anyhow::anyhow!("读取 keypair 文件 {} 失败: {err}", path.display()))?;
            return parse_keypair_string(&contents)
                .map_err(|err| anyhow::anyhow!("keypair 文件 {} 非法: {err}", path.display()));
        }
        if !self.private_key.trim().is_empty() {
            return parse_keypair_string(&self.private_key)
                .map_err(|err| anyhow::anyhow!("wallet.private_key 非法: {err}"));
        }
        anyhow::bail!("缺少私钥配置，请提供 wallet.private_key 或 wallet.keypair_path")
    }
}

fn parse_keypair_string(raw: &str) -> anyhow::Result<Keypair> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        anyhow::bail!("keypair string empty");
    }

    if trimmed.starts_with('[') {
        let bytes: Vec<u8> = serde_json::from_str(trimmed)?;
        Ok(Keypair::try_from(bytes.as_slice())?)
    } else if trimmed.contains(',') {
        let bytes = trimmed
            .split(',')
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<u8>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Keypair::try_from(bytes.as_slice())?)
    } else {
        let data = bs58::decode(trimmed).into_vec()?;
        Ok(Keypair::try_from(data.as_slice())?)
    }
}
