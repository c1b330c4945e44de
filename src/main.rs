//! # 图片变换与上传流水线：命令行入口
//!
//! 读取本地图片 → 统一套用旋转/缩放/比例裁剪 → 并发提交 → 打印导出结果（JSON）。
//! 业务逻辑全部在库中，这里只做参数适配与日志初始化。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use image_upload_pipeline::error::AppError;
use image_upload_pipeline::settings;
use image_upload_pipeline::upload_pipeline::{
    CandidateFile, DisabledStore, HttpRemoteStore, RemoteStore, UploadOrchestrator,
};

#[derive(Parser, Debug)]
#[command(name = "image-upload-pipeline")]
#[command(about = "Crop, rotate and upload a set of images")]
#[command(version)]
struct Cli {
    /// 上传地址（multipart POST），未提供时需配合 --preview-only
    #[arg(long)]
    endpoint: Option<String>,

    /// 设置文件（JSON），缺省字段取默认值
    #[arg(long)]
    config: Option<PathBuf>,

    /// 远端目标目录，覆盖设置文件
    #[arg(long)]
    directory: Option<String>,

    /// 只渲染不上传
    #[arg(long)]
    preview_only: bool,

    /// 顺时针旋转角度
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    rotate: f64,

    /// 缩放倍数（≥ 1.0）
    #[arg(long, default_value_t = 1.0)]
    zoom: f64,

    /// 裁剪宽高比（宽 / 高），覆盖设置文件
    #[arg(long)]
    aspect: Option<f64>,

    /// 待处理的图片
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("❌ 执行失败: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = match &cli.config {
        Some(path) => settings::load_pipeline_config(path)?,
        None => Default::default(),
    };
    if let Some(directory) = cli.directory {
        config.target_directory = directory;
    }
    if cli.aspect.is_some() {
        config.aspect_ratio = cli.aspect;
    }
    config.preview_only |= cli.preview_only;

    let store: Arc<dyn RemoteStore> = match &cli.endpoint {
        Some(endpoint) => Arc::new(HttpRemoteStore::new(endpoint, &config)?),
        None => {
            if !config.preview_only {
                log::warn!("⚠️ 未提供 --endpoint，所有上传都会失败");
            }
            Arc::new(DisabledStore)
        }
    };

    let orchestrator = UploadOrchestrator::new(config, store)?;

    let mut candidates = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        match CandidateFile::from_path(path) {
            Ok(file) => candidates.push(file),
            Err(err) => log::warn!("⚠️ 无法读取文件 {}: {}", path.display(), err),
        }
    }

    let report = orchestrator.add(candidates)?;
    for rejection in &report.rejected {
        log::warn!(
            "⚠️ 已跳过 {} [{}]: {}",
            rejection.file_name,
            rejection.error.code(),
            rejection.error
        );
    }

    let transform_requested =
        cli.rotate != 0.0 || cli.zoom != 1.0 || orchestrator.config().aspect_ratio.is_some();
    if transform_requested {
        for id in &report.accepted {
            let viewport = orchestrator.centered_transform(*id, cli.zoom, cli.rotate)?;
            orchestrator.set_transform(*id, Some(viewport))?;
        }
    }

    orchestrator.commit_all().await?;

    let exported = orchestrator.export_set()?;
    let json = serde_json::to_string_pretty(&exported).map_err(std::io::Error::from)?;
    println!("{json}");

    orchestrator.close();
    Ok(())
}
