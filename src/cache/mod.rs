use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, warn};

use crate::api::serde_helpers::field_as_string;

pub const DEFAULT_TTL_SECS: u64 = 1800;

/// 单个命名空间的持久化 KV 缓存：一个 JSON 文件，条目带写入时间戳，
/// 全命名空间共用一个 TTL。读坏 / 解析失败一律当 miss 处理，不向上抛。
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    data: Value,
    timestamp: u64,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    /// 超过 TTL 的条目视同不存在，留给下一次写入统一清理。
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.load_entries();
        let entry = entries.get(key)?;
        if self.is_expired(entry.timestamp) {
            return None;
        }
        match serde_json::from_value(entry.data.clone()) {
            Ok(value) => {
                debug!(target: "cache", key, path = %self.path.display(), "缓存命中");
                Some(value)
            }
            Err(err) => {
                warn!(target: "cache", key, error = %err, "缓存条目反序列化失败，按 miss 处理");
                None
            }
        }
    }

    /// 写入前顺手淘汰同命名空间内全部过期条目，避免文件无界增长。
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(err) => {
                warn!(target: "cache", key, error = %err, "缓存条目序列化失败，放弃写入");
                return;
            }
        };

        let mut entries = self.load_entries();
        entries.insert(
            key.to_string(),
            PersistedEntry {
                data,
                timestamp: now_secs(),
            },
        );
        entries.retain(|_, entry| !self.is_expired(entry.timestamp));
        self.persist(&entries);
    }

    pub fn clear(&self) {
        if self.path.exists() {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(target: "cache", path = %self.path.display(), error = %err, "清空缓存失败");
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_expired(&self, timestamp: u64) -> bool {
        now_secs().saturating_sub(timestamp) >= self.ttl.as_secs()
    }

    fn load_entries(&self) -> BTreeMap<String, PersistedEntry> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str(&contents) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    target: "cache",
                    path = %self.path.display(),
                    error = %err,
                    "缓存文件损坏，按空缓存处理"
                );
                BTreeMap::new()
            }
        }
    }

    fn persist(&self, entries: &BTreeMap<String, PersistedEntry>) {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if let Err(err) = fs::create_dir_all(&parent) {
            warn!(target: "cache", path = %parent.display(), error = %err, "创建缓存目录失败");
            return;
        }

        let result = (|| -> std::io::Result<()> {
            let mut file = tempfile::NamedTempFile::new_in(&parent)?;
            serde_json::to_writer(&mut file, entries)?;
            file.flush()?;
            file.persist(&self.path).map_err(|err| err.error)?;
            Ok(())
        })();

        if let Err(err) = result {
            warn!(target: "cache", path = %self.path.display(), error = %err, "写入缓存失败");
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs())
        .unwrap_or_default()
}

/// 报价缓存条目。失败的报价同样入缓存（金额归零 + 错误码），
/// 避免在 TTL 窗口内反复询问一个已知换不动的代币。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteCacheData {
    #[serde(with = "field_as_string")]
    pub out_amount: u64,
    pub price_impact_pct: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl QuoteCacheData {
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.error_code.is_some()
    }
}

/// 报价按 (mint, 原始数量) 缓存：价格冲击随数量变化，金额必须精确参与键。
pub fn quote_cache_key(mint: &Pubkey, amount: u64) -> String {
    format!("{mint}-{amount}")
}
