use clap::{Parser, Subcommand};
use stackup::config::stack::StackConfig;
use stackup::core::{build_plan, CancelToken, HealthGate, Orchestrator};
use stackup::domain::model::{ExecutionPlan, RunOutcome, RunReport, RunState, ServiceDescriptor};
use stackup::utils::error::OrchError;
use stackup::utils::{logger, validation::Validate};
use stackup::{ProcessRuntime, ResolvedConfig};
use std::collections::HashMap;
use std::path::Path;

#[derive(Parser)]
#[command(name = "stackup")]
#[command(about = "Service startup orchestrator with dependency tiers and health gating")]
struct Cli {
    /// Path to the stack TOML file
    #[arg(short, long, default_value = "stack.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log system resource usage during the run
    #[arg(long)]
    monitor: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Resolve configuration, build the plan and bring the stack up
    Run {
        /// Show the plan and what would start, without executing
        #[arg(long)]
        dry_run: bool,

        /// Write the JSON run report to this path
        #[arg(long)]
        report: Option<String>,
    },
    /// Print the computed startup tiers and exit
    Plan,
    /// Stop all declared services in reverse plan order
    Teardown,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // 初始化日誌
    logger::init_cli_logger(cli.verbose);

    tracing::info!("📁 Loading stack file: {}", cli.config);

    // 載入並驗證 stack 宣告
    let stack = match StackConfig::from_file(&cli.config) {
        Ok(stack) => stack,
        Err(error) => {
            eprintln!("❌ Failed to load stack file '{}': {}", cli.config, error);
            eprintln!("💡 Make sure the file exists and is valid TOML");
            std::process::exit(error.exit_code());
        }
    };

    if let Err(error) = stack.validate() {
        fail(error);
    }

    let descriptors = match stack.descriptors() {
        Ok(descriptors) => descriptors,
        Err(error) => fail(error),
    };

    // 配置/圖錯誤都在任何服務啟動前浮現
    let plan = match build_plan(&descriptors) {
        Ok(plan) => plan,
        Err(error) => fail(error),
    };

    tracing::info!(
        "✅ Stack '{}' validated: {} services in {} tiers",
        stack.stack.name,
        plan.service_count(),
        plan.tiers.len()
    );

    match cli.command {
        CliCommand::Plan => {
            display_plan(&plan, &descriptors);
        }
        CliCommand::Run { dry_run, report } => {
            run_stack(&stack, &plan, &descriptors, cli.monitor, dry_run, report).await;
        }
        CliCommand::Teardown => {
            teardown_stack(&stack, &plan, &descriptors).await;
        }
    }
}

async fn run_stack(
    stack: &StackConfig,
    plan: &ExecutionPlan,
    descriptors: &[ServiceDescriptor],
    monitor: bool,
    dry_run: bool,
    report_path: Option<String>,
) {
    display_stack_summary(stack, plan, dry_run);

    if dry_run {
        tracing::info!("🔍 DRY RUN MODE - no services will be started");
        display_plan(plan, descriptors);
        return;
    }

    // 解析組態快照：env 檔 + 程序環境，程序環境優先
    let process_env: HashMap<String, String> = std::env::vars().collect();
    let required_keys = stack.required_keys();
    let resolved = match ResolvedConfig::resolve(
        stack.env_file().map(Path::new),
        &process_env,
        &required_keys,
    ) {
        Ok(resolved) => resolved,
        Err(error) => fail(error),
    };
    tracing::info!("✅ Configuration resolved ({} keys)", resolved.len());

    let gate = HealthGate::new(stack.health_settings());
    let orchestrator = Orchestrator::new(ProcessRuntime::new(), gate).with_monitoring(monitor);

    if monitor {
        tracing::info!("🔍 System monitoring enabled");
    }

    // Ctrl-C → 取消權杖 → 停止新 tier 並反向 teardown
    let token = CancelToken::new();
    let signal = token.signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Interrupt received, cancelling startup");
            token.cancel();
        }
    });

    let report = match orchestrator
        .run(&stack.stack.name, plan, descriptors, &resolved, signal)
        .await
    {
        Ok(report) => report,
        Err(error) => fail(error),
    };

    display_run_report(&report);

    if let Some(path) = report_path {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                if let Err(error) = std::fs::write(&path, json) {
                    tracing::warn!("⚠️ Could not write report to {}: {}", path, error);
                } else {
                    tracing::info!("📁 Run report written to {}", path);
                }
            }
            Err(error) => tracing::warn!("⚠️ Could not serialize report: {}", error),
        }
    }

    match report.outcome {
        RunOutcome::Completed => {
            println!("✅ Stack '{}' is up", report.stack);
        }
        RunOutcome::Failed => {
            let failed = report.failed_service.as_deref().unwrap_or("<unknown>");
            let cause = report.cause.as_deref().unwrap_or("unknown cause");
            eprintln!("❌ Stack '{}' failed to start: {} ({})", report.stack, failed, cause);
            eprintln!("💡 Already-started services were torn down in reverse order");
            std::process::exit(1);
        }
        RunOutcome::Cancelled => {
            eprintln!("🛑 Startup of '{}' was cancelled", report.stack);
            std::process::exit(1);
        }
    }
}

async fn teardown_stack(
    stack: &StackConfig,
    plan: &ExecutionPlan,
    descriptors: &[ServiceDescriptor],
) {
    tracing::info!("🧹 Tearing down stack '{}'", stack.stack.name);

    let gate = HealthGate::new(stack.health_settings());
    let orchestrator = Orchestrator::new(ProcessRuntime::new(), gate);

    match orchestrator.teardown(plan, descriptors).await {
        Ok(()) => println!("✅ Stack '{}' torn down", stack.stack.name),
        Err(error) => fail(error),
    }
}

fn display_stack_summary(stack: &StackConfig, plan: &ExecutionPlan, dry_run: bool) {
    println!("📋 Stack Summary:");
    println!(
        "  Stack: {} v{}",
        stack.stack.name,
        stack.stack.version.as_deref().unwrap_or("0.0.0")
    );
    if let Some(description) = &stack.stack.description {
        println!("  Description: {}", description);
    }
    println!("  Services: {}", plan.service_count());
    println!("  Tiers: {}", plan.tiers.len());
    if let Some(env_file) = stack.env_file() {
        println!("  Env file: {}", env_file);
    }

    let required = stack.required_keys();
    if !required.is_empty() {
        println!("  Required keys: {}", required.join(", "));
    }

    if dry_run {
        println!("  🔍 DRY RUN MODE ENABLED");
    }

    println!();
}

fn display_plan(plan: &ExecutionPlan, descriptors: &[ServiceDescriptor]) {
    let by_name: HashMap<&str, &ServiceDescriptor> =
        descriptors.iter().map(|d| (d.name.as_str(), d)).collect();

    println!("📋 Startup Plan:");
    for (idx, tier) in plan.tiers.iter().enumerate() {
        let marker = if tier.one_shot { " ⚡ one-shot" } else { "" };
        println!("  Tier {}:{}", idx + 1, marker);
        for name in &tier.services {
            let depends = by_name
                .get(name.as_str())
                .map(|d| d.depends_on.join(", "))
                .unwrap_or_default();
            if depends.is_empty() {
                println!("    - {}", name);
            } else {
                println!("    - {} (after: {})", name, depends);
            }
        }
    }
    println!();
}

fn display_run_report(report: &RunReport) {
    println!();
    println!("📊 Run Report for '{}':", report.stack);
    for (idx, tier) in report.tiers.iter().enumerate() {
        println!("  Tier {}:", idx + 1);
        for service in &tier.services {
            let glyph = match service.state {
                RunState::Ready => "✅",
                RunState::Stopped => "🛑",
                RunState::Failed => "❌",
                RunState::Starting => "⏳",
                RunState::Pending => "⏸️",
            };
            match service.duration_ms {
                Some(ms) => println!(
                    "    {} {} ({:?}, {}ms)",
                    glyph, service.name, service.state, ms
                ),
                None => println!("    {} {} ({:?})", glyph, service.name, service.state),
            }
        }
    }
    println!();
}

fn fail(error: OrchError) -> ! {
    // 記錄詳細錯誤信息
    tracing::error!(
        "❌ {} (Category: {:?}, Severity: {:?})",
        error,
        error.category(),
        error.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", error.recovery_suggestion());

    // 輸出用戶友好的錯誤信息
    eprintln!("❌ {}", error.user_friendly_message());
    eprintln!("💡 {}", error.recovery_suggestion());

    std::process::exit(error.exit_code());
}
