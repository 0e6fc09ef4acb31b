use std::collections::HashMap;

use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use tracing::{info, warn};

use crate::api::serde_helpers::field_as_string;
use crate::sweeper::TokenBalance;

/// 社区代币目录里的一条元数据。
#[derive(Debug, Clone, Deserialize)]
pub struct TokenMetadata {
    #[serde(with = "field_as_string")]
    pub address: Pubkey,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    #[serde(default, rename = "logoURI")]
    pub logo_uri: Option<String>,
}

/// 只读代币目录。启动时整表拉一次，之后纯内存查询。
pub struct TokenDirectory {
    by_mint: HashMap<Pubkey, TokenMetadata>,
}

impl TokenDirectory {
    pub fn empty() -> Self {
        Self {
            by_mint: HashMap::new(),
        }
    }

    /// 按顺序拉取每个列表并合并：靠前的列表（严格名单）优先，
    /// 靠后的只补齐前面没有的 mint。单个列表失败不致命，代币
    /// 只是没有名字而已。
    pub async fn load(client: &reqwest::Client, urls: &[String]) -> Self {
        let mut directory = Self::empty();
        for url in urls {
            match fetch_list(client, url).await {
                Ok(entries) => {
                    let added = directory.fill_missing(entries);
                    info!(target: "wallet::directory", url, added, "代币目录已加载");
                }
                Err(err) => {
                    warn!(target: "wallet::directory", url, error = %err, "代币目录拉取失败");
                }
            }
        }
        directory
    }

    /// 只收录目录里还没有的 mint，返回新增条数。
    fn fill_missing(&mut self, entries: Vec<TokenMetadata>) -> usize {
        let before = self.by_mint.len();
        for entry in entries {
            self.by_mint.entry(entry.address).or_insert(entry);
        }
        self.by_mint.len() - before
    }

    pub fn get(&self, mint: &Pubkey) -> Option<&TokenMetadata> {
        self.by_mint.get(mint)
    }

    pub fn is_empty(&self) -> bool {
        self.by_mint.is_empty()
    }

    /// 就地补全余额条目的展示字段。目录里没有的保持原样。
    pub fn enrich(&self, balances: &mut [TokenBalance]) {
        for balance in balances {
            if let Some(meta) = self.by_mint.get(&balance.mint) {
                balance.symbol = Some(meta.symbol.clone());
                balance.name = Some(meta.name.clone());
                balance.logo_uri = meta.logo_uri.clone();
            }
        }
    }
}

async fn fetch_list(
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<TokenMetadata>, reqwest::Error> {
    client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<TokenMetadata>>()
        .await
}
