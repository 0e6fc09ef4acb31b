use std::io::{BufRead, Write as _};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::Signer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod api;
mod cache;
mod config;
mod signer;
mod sweeper;
mod throttle;
mod wallet;

use api::AggregatorApiClient;
use cache::CacheStore;
use config::{HalleyConfig, load_config, write_template};
use signer::KeypairSigner;
use sweeper::quotes::QuoteReply;
use sweeper::{
    PipelineGateway, QuoteService, QuotedToken, RpcChainSink, SwapBuilder, SweepExecutor,
    collect_quotes,
};
use throttle::RateLimiter;
use wallet::{TokenDirectory, WSOL_MINT, format_amount, format_sol, load_balances};

#[derive(Parser, Debug)]
#[command(name = "halley", version, about = "Solana 钱包粉尘回收工具")]
struct Cli {
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "配置文件路径（默认查找 halley.toml 或 config/halley.toml）"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 扫描钱包余额并为每个代币估值
    Scan(ScanCmd),
    /// 扫描后把可回收的粉尘批量换成 SOL
    Sweep(SweepCmd),
    /// 请求单个代币的报价
    Quote(QuoteCmd),
    /// 初始化配置模版文件
    Init(InitCmd),
}

#[derive(Args, Debug)]
struct ScanCmd {
    #[arg(long, help = "忽略报价缓存，全部重新询价")]
    refresh: bool,
}

#[derive(Args, Debug)]
struct SweepCmd {
    #[arg(long, help = "忽略报价缓存，全部重新询价")]
    refresh: bool,
    #[arg(long, help = "跳过确认提示直接执行")]
    yes: bool,
    #[arg(long, help = "排除的代币 Mint 地址，可重复")]
    exclude: Vec<String>,
}

#[derive(Args, Debug)]
struct QuoteCmd {
    #[arg(long, help = "输入代币的 Mint 地址")]
    mint: String,
    #[arg(long, help = "交易数量（原始单位，lamports/atoms）")]
    amount: u64,
    #[arg(long, help = "绕过缓存取新鲜报价")]
    fresh: bool,
}

#[derive(Args, Debug)]
struct InitCmd {
    #[arg(long, value_name = "DIR", help = "可选输出目录（默认当前目录）")]
    output: Option<PathBuf>,
    #[arg(long, help = "若文件存在则覆盖")]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if let Command::Init(args) = &cli.command {
        let path = write_template(args.output.clone(), args.force)?;
        println!("配置模版已写入 {}", path.display());
        return Ok(());
    }

    let config = load_config(cli.config.clone())?;
    let app = App::new(&config)?;

    match cli.command {
        Command::Scan(args) => {
            let quoted = app.scan(&config, args.refresh).await?;
            print_scan_table(&quoted);
        }
        Command::Sweep(args) => {
            app.sweep(&config, args).await?;
        }
        Command::Quote(args) => {
            let mint = Pubkey::from_str(&args.mint)
                .map_err(|err| anyhow!("代币 Mint 无效 {}: {err}", args.mint))?;
            let fetch = app.quotes.fetch(mint, args.amount, !args.fresh).await;
            match fetch.reply {
                QuoteReply::Quote {
                    out_amount,
                    price_impact_pct,
                    payload,
                } => {
                    if let Some(payload) = payload {
                        println!("{}", serde_json::to_string_pretty(&payload.raw)?);
                    } else {
                        println!(
                            "缓存报价: {} (价格冲击 {price_impact_pct}%)",
                            format_sol(sweeper::lamports_to_sol(out_amount))
                        );
                    }
                }
                QuoteReply::Rejected { code, message } => {
                    println!("报价被拒绝 [{code}]: {message}");
                }
                QuoteReply::Unreachable { message } => {
                    return Err(anyhow!("聚合器不可达: {message}"));
                }
            }
        }
        Command::Init(_) => unreachable!("handled above"),
    }

    Ok(())
}

/// 按配置组装好的共享组件。
struct App {
    rpc: Arc<RpcClient>,
    http: reqwest::Client,
    quotes: QuoteService,
    cache: CacheStore,
    snapshot: CacheStore,
    limiter: Arc<RateLimiter>,
    api: AggregatorApiClient,
}

impl App {
    fn new(config: &HalleyConfig) -> Result<Self> {
        let rpc = Arc::new(RpcClient::new_with_commitment(
            config.rpc_url.0.clone(),
            CommitmentConfig::confirmed(),
        ));
        let http = reqwest::Client::builder().build()?;
        let api = AggregatorApiClient::new(
            http.clone(),
            config.aggregator.base_url.clone(),
            config.aggregator.api_key(),
            Duration::from_millis(config.aggregator.request_timeout_ms),
        );
        let cache = CacheStore::new(
            config.cache.dir.join("quotes.json"),
            Duration::from_secs(config.cache.ttl_secs),
        );
        let snapshot = CacheStore::new(
            config.cache.dir.join("wallet.json"),
            Duration::from_secs(config.cache.ttl_secs),
        );
        let quotes = QuoteService::new(Arc::new(api.clone()), cache.clone(), WSOL_MINT);
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(
            config.aggregator.min_interval_ms,
        )));

        Ok(Self {
            rpc,
            http,
            quotes,
            cache,
            snapshot,
            limiter,
            api,
        })
    }

    async fn scan(&self, config: &HalleyConfig, refresh: bool) -> Result<Vec<QuotedToken>> {
        if refresh {
            self.cache.clear();
        }

        let keypair = config.wallet.keypair()?;
        let owner = keypair.pubkey();
        info!(target: "halley", %owner, "开始扫描钱包");

        let directory =
            TokenDirectory::load(&self.http, &config.aggregator.token_list_urls).await;
        let mut balances = load_balances(&self.rpc, &self.snapshot, &owner, refresh).await?;
        directory.enrich(&mut balances);

        if balances.is_empty() {
            println!("钱包里没有非零 SPL 余额");
            return Ok(Vec::new());
        }

        let bar = ProgressBar::new(balances.len() as u64);
        if let Ok(style) = ProgressStyle::with_template("{spinner} 询价 {pos}/{len} {wide_bar}") {
            bar.set_style(style);
        }

        let quoted = collect_quotes(
            &self.quotes,
            &self.limiter,
            balances,
            config.sweep.min_dust_value_sol,
            |current, _total| bar.set_position(current as u64),
        )
        .await;
        bar.finish_and_clear();

        Ok(quoted)
    }

    async fn sweep(&self, config: &HalleyConfig, args: SweepCmd) -> Result<()> {
        let mut quoted = self.scan(config, args.refresh).await?;

        for raw in &args.exclude {
            let mint = Pubkey::from_str(raw)
                .map_err(|err| anyhow!("--exclude 的 Mint 无效 {raw}: {err}"))?;
            for token in quoted.iter_mut().filter(|t| t.token.mint == mint) {
                token.selected = false;
            }
        }

        print_scan_table(&quoted);

        let selected = quoted.iter().filter(|t| t.selected && t.tradeable).count();
        if selected == 0 {
            println!("没有可回收的代币");
            return Ok(());
        }
        if selected > config.sweep.max_batch_size {
            warn!(
                target: "halley",
                selected,
                max_batch_size = config.sweep.max_batch_size,
                "超过单批建议上限，钱包可能拒绝一次签太多笔"
            );
        }

        let estimated: f64 = quoted
            .iter()
            .filter(|t| t.selected && t.tradeable)
            .map(|t| t.quote_out_amount_ui)
            .sum();
        println!("预计回收 {}（共 {selected} 个代币）", format_sol(estimated));

        if !args.yes && !confirm("确认执行批量回收?")? {
            println!("已取消");
            return Ok(());
        }

        let keypair = config.wallet.keypair()?;
        let owner = keypair.pubkey();

        let gateway = PipelineGateway::new(
            QuoteService::new(Arc::new(self.api.clone()), self.cache.clone(), WSOL_MINT),
            self.limiter.clone(),
            SwapBuilder::new(self.api.clone(), config.sweep.fee_account(), WSOL_MINT),
        );
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let executor = SweepExecutor::new(
            Arc::new(gateway),
            Arc::new(KeypairSigner::new(keypair)),
            Arc::new(RpcChainSink::new(self.rpc.clone())),
        )
        .with_events(events_tx);

        let printer = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let status = if event.outcome.success { "完成" } else { "失败" };
                println!(
                    "[{}] {} {}{}",
                    event.phase.as_str(),
                    event.outcome.mint,
                    status,
                    event
                        .outcome
                        .error
                        .as_deref()
                        .map(|e| format!(": {e}"))
                        .unwrap_or_default(),
                );
            }
        });

        let outcomes = executor.sweep(&owner, &quoted).await;
        // 打印任务在发送端全部释放后自行退出。
        drop(executor);
        let _ = printer.await;

        // 结果已定，旧报价全部作废。
        self.cache.clear();

        let mut recovered = 0.0;
        println!("\n回收结果:");
        for outcome in &outcomes {
            if outcome.success {
                recovered += outcome.amount_out.unwrap_or(0.0);
                println!(
                    "  ✓ {} +{} ({})",
                    outcome.mint,
                    format_sol(outcome.amount_out.unwrap_or(0.0)),
                    outcome.signature.as_deref().unwrap_or("-"),
                );
            } else {
                let signature = outcome
                    .signature
                    .as_deref()
                    .map(|s| format!(" ({s})"))
                    .unwrap_or_default();
                println!(
                    "  ✗ {} {}{signature}",
                    outcome.mint,
                    outcome.error.as_deref().unwrap_or("unknown"),
                );
            }
        }
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        println!(
            "\n共 {} 项，成功 {succeeded}，合计回收 {}",
            outcomes.len(),
            format_sol(recovered)
        );

        Ok(())
    }
}

fn print_scan_table(quoted: &[QuotedToken]) {
    if quoted.is_empty() {
        return;
    }
    println!(
        "{:<12} {:>16} {:>14} {:<8} 说明",
        "代币", "余额", "估值", "可回收"
    );
    for item in quoted {
        let valuation = if item.tradeable {
            format_sol(item.quote_out_amount_ui)
        } else {
            "-".to_string()
        };
        let flag = match (item.tradeable, item.selected) {
            (true, true) => "是",
            (true, false) => "跳过",
            (false, _) => "否",
        };
        let note = item
            .error_reason
            .clone()
            .unwrap_or_else(|| item.token.display_name());
        println!(
            "{:<12} {:>16} {:>14} {:<8} {}",
            item.token.display_symbol(),
            format_amount(item.token.ui_amount),
            valuation,
            flag,
            note,
        );
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let answer = line.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}
