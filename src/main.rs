//! synctools 命令行：只计算差异，不执行传输

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use synctools_lib::config::{default_config_file, AppConfig};
use synctools_lib::core::filter::{Filter, FilterConfig, TimeRange};
use synctools_lib::core::strategy::{ChangeDetection, ChecksumSource};
use synctools_lib::core::{
    spawn_lister, ActionSummary, Comparator, Location, Strategies, SyncAction, SyncArgs, SyncMode,
};
use synctools_lib::logging;
use synctools_lib::storage::{create_store, ObjectStore};

#[derive(Debug, Parser)]
#[command(name = "synctools", version, about = "对象存储同步工具")]
struct Cli {
    /// 配置文件路径
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 比较源和目标，打印需要执行的动作
    Diff(DiffArgs),
}

#[derive(Debug, clap::Args)]
struct DiffArgs {
    /// 源位置：本地路径或 s3://bucket/prefix
    src: Location,
    /// 目标位置：本地路径或 s3://bucket/prefix
    dst: Location,

    /// 删除源中不存在的目标文件
    #[arg(long)]
    delete: bool,

    /// 两边都存在时的同步方式，默认取配置文件
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// 只包含匹配的路径（相对于根的 glob，可重复）
    #[arg(long)]
    include: Vec<String>,

    /// 排除匹配的路径（相对于根的 glob，可重复）
    #[arg(long)]
    exclude: Vec<String>,

    /// 只包含修改时间落在区间内的文件，格式 START,END
    #[arg(long)]
    include_time: Vec<TimeRange>,

    /// 排除修改时间落在区间内的文件，格式 START,END
    #[arg(long)]
    exclude_time: Vec<TimeRange>,

    /// 跟随本地符号链接
    #[arg(long)]
    follow_symlinks: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Always,
    Never,
    Metadata,
    Checksum,
    MetadataThenChecksum,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Always => SyncMode::Always,
            ModeArg::Never => SyncMode::Never,
            ModeArg::Metadata => SyncMode::Changed(ChangeDetection::Metadata),
            ModeArg::Checksum => SyncMode::Changed(ChangeDetection::Checksum),
            ModeArg::MetadataThenChecksum => {
                SyncMode::Changed(ChangeDetection::MetadataThenChecksum)
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_file = cli.config.clone().unwrap_or_else(default_config_file);
    let config = match AppConfig::load(&config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败: {}", e);
            return ExitCode::from(2);
        }
    };
    let _guard = logging::init(&config.log);

    let result = match cli.command {
        Commands::Diff(args) => run_diff(config, args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_diff(mut config: AppConfig, args: DiffArgs) -> Result<()> {
    if args.follow_symlinks {
        config.sync.follow_symlinks = true;
    }
    let mode = args
        .mode
        .map(SyncMode::from)
        .unwrap_or(SyncMode::Changed(config.sync.check_mode));

    let filter_config = FilterConfig {
        include: args.include,
        exclude: args.exclude,
        include_time: args.include_time,
        exclude_time: args.exclude_time,
    };
    // 模式相对于各自的根
    let src_filter = Filter::for_location(&filter_config, &args.src)?;
    let dst_filter = Filter::for_location(&filter_config, &args.dst)?;

    let src_store = store_for(&args.src, &config)?;
    let dst_store = store_for(&args.dst, &config)?;

    let src_lister = spawn_lister(&args.src, src_store.clone(), &config.sync, src_filter)
        .context("创建源列举器失败")?;
    let dst_lister = spawn_lister(&args.dst, dst_store.clone(), &config.sync, dst_filter.clone())
        .context("创建目标列举器失败")?;

    let strategies = Strategies::for_mode(
        mode,
        args.delete,
        dst_filter,
        checksum_source(&args.src, src_store),
        checksum_source(&args.dst, dst_store),
    );

    let mut sync_args = SyncArgs::new(args.src, args.dst);
    sync_args.concurrency = config.sync.concurrency.max(1);
    sync_args.delete = args.delete;
    sync_args.mode = mode;

    let mut stream = Comparator::spawn(
        src_lister,
        dst_lister,
        strategies,
        Arc::new(sync_args),
        config.sync.list_timeout(),
    );

    let mut summary = ActionSummary::default();
    loop {
        let action = stream.next().await?;
        summary.record(&action);
        match action {
            SyncAction::Copy {
                src_path, dst_path, ..
            } => println!("copy   {} -> {}", src_path, dst_path),
            SyncAction::Delete { dst_path, .. } => println!("delete {}", dst_path),
            SyncAction::Nothing { .. } => {}
            SyncAction::Error(e) => bail!("比较失败 [{}]: {}", e.code(), e),
            SyncAction::Ended => break,
        }
    }

    println!(
        "复制 {} 个文件 ({} 字节)，删除 {} 个文件",
        summary.copy_count, summary.copy_bytes, summary.delete_count
    );
    Ok(())
}

fn store_for(location: &Location, config: &AppConfig) -> Result<Option<Arc<dyn ObjectStore>>> {
    if !location.is_remote() {
        return Ok(None);
    }
    Ok(Some(create_store(&config.s3)?))
}

fn checksum_source(location: &Location, store: Option<Arc<dyn ObjectStore>>) -> ChecksumSource {
    match (location, store) {
        (Location::Remote { bucket, .. }, Some(store)) => ChecksumSource::Remote {
            store,
            bucket: bucket.clone(),
        },
        _ => ChecksumSource::Local,
    }
}
