//! DreamFactory 命令行入口
//!
//! 初始化日志与配置，构建编排器，把子命令转换为阶段请求；结果以 JSON 打印到 stdout。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;

use dreamfactory::agent::create_orchestrator;
use dreamfactory::config::{load_config, AppConfig};
use dreamfactory::core::{SceneEdit, StageOrchestrator, StageReport, StageRequest};
use dreamfactory::observability;

#[derive(Parser, Debug)]
#[command(name = "dreamfactory", version, about = "AI film production pipeline")]
struct Cli {
    /// 额外配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON 行日志
    #[arg(long, global = true)]
    log_json: bool,

    /// 打印各阶段 Agent 的推理事件
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 识别意图并运行到下一个检查点
    Start {
        #[arg(short, long)]
        project: Option<String>,
        request: Vec<String>,
    },
    /// 一次生成多场景大纲
    Outline {
        #[arg(short, long)]
        project: Option<String>,
        topic: Vec<String>,
    },
    /// 确认剧本，开始生成候选草图
    Confirm { project: String, scene: String },
    /// 重新生成候选草图
    Redraw { project: String, scene: String },
    /// 选定候选图（引用、序号或文件名）
    Select {
        project: String,
        scene: String,
        candidate: String,
    },
    /// 生成视频
    Direct {
        project: String,
        scene: String,
        #[arg(long)]
        motion: Option<String>,
    },
    /// 人工修改剧本或提示
    Edit {
        project: String,
        scene: String,
        #[arg(long)]
        script: Option<String>,
        #[arg(long)]
        visual_prompt: Option<String>,
        #[arg(long)]
        motion_prompt: Option<String>,
    },
    /// 生成并保存运动镜头提示
    Motion { project: String, scene: String },
    /// 查看项目或单个场景
    Status {
        project: String,
        scene: Option<String>,
    },
    /// 列出全部项目
    Projects,
}

fn new_project_id() -> String {
    format!("project_{}", uuid::Uuid::new_v4().simple())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn report_exit(report: &StageReport) -> anyhow::Result<ExitCode> {
    print_json(report)?;
    Ok(if report.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// 在调度器上运行请求；Ctrl+C 时取消运行中的阶段
async fn run_stage(
    orchestrator: Arc<StageOrchestrator>,
    request: StageRequest,
) -> anyhow::Result<ExitCode> {
    let (_, handle) = orchestrator.spawn(request);
    tokio::select! {
        joined = handle => {
            let report = joined.context("Pipeline task panicked")?;
            report_exit(&report)
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, cancelling running stages");
            orchestrator.shutdown(Duration::from_secs(5)).await;
            Ok(ExitCode::from(130))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = match load_config(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Config load failed ({e}), using defaults");
            AppConfig::default()
        }
    };
    observability::init(cli.log_json || cfg.app.log_json);

    let mut orchestrator = create_orchestrator(&cfg)
        .await
        .context("Failed to build pipeline")?;
    if cli.verbose {
        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator = orchestrator.with_event_tx(tx);
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                tracing::info!(event = ?ev, "agent");
            }
        });
    }
    let orchestrator = Arc::new(orchestrator);

    match cli.command {
        Command::Start { project, request } => {
            let input = request.join(" ");
            anyhow::ensure!(!input.trim().is_empty(), "request text is required");
            let project_id = project.unwrap_or_else(new_project_id);
            run_stage(orchestrator, StageRequest::Start { project_id, input }).await
        }
        Command::Outline { project, topic } => {
            let topic = topic.join(" ");
            anyhow::ensure!(!topic.trim().is_empty(), "topic is required");
            let project_id = project.unwrap_or_else(new_project_id);
            run_stage(orchestrator, StageRequest::Outline { project_id, topic }).await
        }
        Command::Confirm { project, scene } => {
            run_stage(
                orchestrator,
                StageRequest::ConfirmScript {
                    project_id: project,
                    scene_id: scene,
                },
            )
            .await
        }
        Command::Redraw { project, scene } => {
            let report = orchestrator.regenerate_image(&project, &scene).await;
            report_exit(&report)
        }
        Command::Select {
            project,
            scene,
            candidate,
        } => {
            run_stage(
                orchestrator,
                StageRequest::SelectCandidate {
                    project_id: project,
                    scene_id: scene,
                    candidate,
                },
            )
            .await
        }
        Command::Direct {
            project,
            scene,
            motion,
        } => {
            run_stage(
                orchestrator,
                StageRequest::Direct {
                    project_id: project,
                    scene_id: scene,
                    motion_prompt: motion,
                },
            )
            .await
        }
        Command::Edit {
            project,
            scene,
            script,
            visual_prompt,
            motion_prompt,
        } => {
            let unit = orchestrator
                .edit_scene(
                    &project,
                    &scene,
                    SceneEdit {
                        script,
                        visual_prompt,
                        motion_prompt,
                    },
                )
                .await
                .context("Edit failed")?;
            print_json(&unit)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Motion { project, scene } => {
            let report = orchestrator.generate_motion_prompt(&project, &scene).await;
            report_exit(&report)
        }
        Command::Status { project, scene } => {
            match scene {
                Some(scene) => print_json(
                    &orchestrator
                        .scene_status(&project, &scene)
                        .await
                        .context("Status lookup failed")?,
                )?,
                None => print_json(
                    &orchestrator
                        .project_status(&project)
                        .await
                        .context("Status lookup failed")?,
                )?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Projects => {
            let projects = orchestrator
                .list_projects()
                .await
                .context("Project listing failed")?;
            print_json(&projects)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
