//! # CAN Bus CLI
//!
//! 模拟总线上的日志子系统交互工具。
//!
//! ```bash
//! # 交互模式
//! $ canbus-cli shell
//! can> can 1 start active 500
//! can> can log start tcpserver transmit crtd 3000
//! can> can 1 rx std 7e8 03 41 0d 32
//! can> exit
//!
//! # 批量执行（每个参数一行命令）
//! $ canbus-cli exec "can log start vfs crtd /tmp/can.crtd" "can 1 rx std 100 01"
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

mod config;
mod repl;
mod shell;

use config::CliConfig;
use shell::Shell;

#[derive(Parser, Debug)]
#[command(name = "canbus-cli")]
#[command(about = "Interactive shell for the CAN bus subsystem and its loggers", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件（默认 <config_dir>/canbus/config.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 启动交互式 Shell（默认）
    Shell,

    /// 依次执行命令，然后保持运行直到 Ctrl+C（有 Logger 时）或立即退出
    Exec {
        /// 每个参数是一行 shell 命令
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// 打印生效的配置
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("canbus_cli=info".parse()?)
                .add_directive("canbus_log=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;

    if let Some(Commands::Config) = cli.command {
        match CliConfig::default_path() {
            Some(path) => println!("default path: {}", path.display()),
            None => println!("default path: <none>"),
        }
        println!("{:#?}", config);
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::Release);
    })?;

    let shell = Shell::new(&config)?;
    let result = match cli.command {
        Some(Commands::Exec { commands }) => exec(&shell, &commands, &running),
        _ => repl::run(&shell, running),
    };
    shell.shutdown();
    result
}

fn exec(shell: &Shell, commands: &[String], running: &AtomicBool) -> Result<()> {
    for line in commands {
        println!("> {}", line);
        println!("{}", shell.execute(line)?);
    }

    if !shell.dispatch().loggers().is_empty() {
        println!("Logging; press Ctrl+C to stop");
        while running.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(100));
        }
    }
    Ok(())
}
