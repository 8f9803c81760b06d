mod mediator;
mod usacloud;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use fleetflow_config::ProvisionConfig;
use fleetflow_provision::flows::{DeployFile, provision_and_deploy};
use fleetflow_provision::{
    DeployComposeFlow, DeploySpec, FlowContext, Job, JobId, JobStatusKind, ProvisionInstanceFlow,
    ProvisionSpec, ProvisioningService, StateFactory,
};
use mediator::SakuraMediator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "fleet-provision")]
#[command(about = "サーバーを作成し、Docker Composeプロジェクトをデプロイする", long_about = None)]
struct Cli {
    /// 設定ファイルのパス（省略時は自動検索）
    #[arg(short, long, global = true, env = "FLEET_PROVISION_CONFIG")]
    config: Option<PathBuf>,

    /// 結果をJSONで出力
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ServerArgs {
    /// サーバー名
    name: String,
    /// プラン（例: 2core-4gb）
    #[arg(long)]
    plan: Option<String>,
    /// ディスクサイズ（GB）
    #[arg(long)]
    disk_size: Option<i32>,
    /// OSタイプ
    #[arg(long)]
    os_type: Option<String>,
    /// 追加でインストールするパッケージ（複数指定可）
    #[arg(long = "package")]
    packages: Vec<String>,
}

#[derive(Args)]
struct ComposeArgs {
    /// Composeプロジェクト名（省略時はサーバー名）
    #[arg(short, long)]
    project: Option<String>,
    /// Composeファイル
    #[arg(short = 'f', long, default_value = "compose.yaml")]
    compose: PathBuf,
    /// .envファイル（ログには出力されません）
    #[arg(short, long)]
    env_file: Option<PathBuf>,
    /// サーバー上の配置先ディレクトリ
    #[arg(long)]
    remote_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// サーバーを作成し、初期セットアップを行う
    Provision {
        #[command(flatten)]
        server: ServerArgs,
        /// 冪等キー（省略時はサーバー名）
        #[arg(short, long)]
        key: Option<String>,
    },
    /// 既存サーバーへデプロイ
    Deploy {
        /// サーバー名
        server: String,
        #[command(flatten)]
        compose: ComposeArgs,
        /// 冪等キー（省略時はサーバー名）
        #[arg(short, long)]
        key: Option<String>,
    },
    /// サーバー作成からデプロイまでを一括実行
    Up {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        compose: ComposeArgs,
        /// 冪等キー（省略時はサーバー名）
        #[arg(short, long)]
        key: Option<String>,
    },
}

fn provision_spec(args: ServerArgs, config: &ProvisionConfig) -> ProvisionSpec {
    ProvisionSpec {
        plan: args.plan.or_else(|| config.cloud.plan.clone()),
        disk_size: args.disk_size.or(config.cloud.disk_size),
        os_type: args.os_type.or_else(|| config.cloud.os_type.clone()),
        ssh_keys: config.cloud.ssh_keys.clone(),
        packages: args.packages,
        ..ProvisionSpec::new(args.name)
    }
}

fn deploy_spec(server: &str, args: ComposeArgs) -> anyhow::Result<DeploySpec> {
    let project = args.project.unwrap_or_else(|| server.to_string());
    let mut spec = DeploySpec::new(server, project);
    if let Some(remote_dir) = args.remote_dir {
        spec = spec.with_remote_dir(remote_dir);
    }

    let compose = std::fs::read(&args.compose).map_err(|e| {
        anyhow::anyhow!(
            "Composeファイル {} を読み込めません: {}",
            args.compose.display(),
            e
        )
    })?;
    let compose_file = spec.compose_file.clone();
    spec = spec.with_file(DeployFile::new(compose_file, compose));

    if let Some(env_file) = args.env_file {
        let contents = std::fs::read(&env_file).map_err(|e| {
            anyhow::anyhow!(".envファイル {} を読み込めません: {}", env_file.display(), e)
        })?;
        spec = spec.with_file(DeployFile::new(".env", contents).sensitive());
    }

    Ok(spec)
}

/// Poll the job until it ends, printing each new state. `None` on Ctrl-C.
async fn watch(service: &ProvisioningService, id: JobId) -> anyhow::Result<Option<Arc<Job>>> {
    let mut last_description = String::new();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                return Ok(None);
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }

        let job = service
            .get_job_by_id(id)
            .ok_or_else(|| anyhow::anyhow!("ジョブ {} が見つかりません", id))?;

        let description = job.description();
        if description != last_description && !job.is_ended() {
            println!("  → {}", description);
            last_description = description;
        }

        if job.is_ended() {
            return Ok(Some(job));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match &cli.config {
        Some(path) => fleetflow_config::load_config_from(path)?,
        None => fleetflow_config::load_config()?,
    };

    let mediator = Arc::new(SakuraMediator::new(&config));
    let context = FlowContext::new(mediator, StateFactory::from_config(&config));
    let service = Arc::new(ProvisioningService::from_config(&config, context));

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(service.clone().run(cancel.clone()));

    let scheduled = match cli.command {
        Commands::Provision { server, key } => {
            let key = key.unwrap_or_else(|| server.name.clone());
            println!("{}", format!("サーバー {} を準備します...", server.name).blue().bold());
            let flow = ProvisionInstanceFlow::new(provision_spec(server, &config));
            service.schedule_job(key, flow).await
        }
        Commands::Deploy {
            server,
            compose,
            key,
        } => {
            let key = key.unwrap_or_else(|| server.clone());
            println!("{}", format!("{} へデプロイします...", server).blue().bold());
            let flow = DeployComposeFlow::new(deploy_spec(&server, compose)?);
            service.schedule_job(key, flow).await
        }
        Commands::Up {
            server,
            compose,
            key,
        } => {
            let key = key.unwrap_or_else(|| server.name.clone());
            println!(
                "{}",
                format!("サーバー {} を準備してデプロイします...", server.name)
                    .blue()
                    .bold()
            );
            let deploy = deploy_spec(&server.name, compose)?;
            let flow = provision_and_deploy(provision_spec(server, &config), deploy);
            service.schedule_job(key, flow).await
        }
    };

    let outcome = match scheduled {
        Ok(job) => {
            println!("ジョブ: {}", job.id().to_string().cyan());
            watch(&service, job.id()).await
        }
        Err(e) => Err(e.into()),
    };

    cancel.cancel();
    runner.await?;

    let Some(job) = outcome? else {
        eprintln!("{}", "中断しました（実行中のステップは再実行時に再開されます）".yellow());
        std::process::exit(130);
    };

    let snapshot = job.snapshot();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    match snapshot.status {
        JobStatusKind::Succeeded => {
            println!("{}", "✓ 完了しました".green().bold());
            Ok(())
        }
        _ => {
            eprintln!("{}", "✗ 失敗しました".red().bold());
            if let Some(error) = &snapshot.error {
                eprintln!("  {}", error);
            }
            std::process::exit(1);
        }
    }
}
