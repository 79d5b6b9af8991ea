//! 交互模式
//!
//! rustyline 的 `readline` 会阻塞，放在专用输入线程里；主线程从通道取命令执行，
//! 同时检查 Ctrl+C 设置的退出标志。

use crate::shell::{HELP, Shell};
use anyhow::Result;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::warn;

const PROMPT: &str = "can> ";
const EXIT: &str = "exit";

fn history_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("canbus").join("history.txt"))
}

/// 输入线程：逐行读取，发送到主线程
fn input_loop(tx: Sender<String>) {
    let mut editor: Editor<(), DefaultHistory> = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            warn!("failed to create line editor: {}", e);
            let _ = tx.send(EXIT.to_string());
            return;
        },
    };
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                let quit = line == EXIT || line == "quit";
                if tx.send(line).is_err() || quit {
                    break;
                }
            },
            Err(ReadlineError::Interrupted) => {
                println!("^C (type 'exit' to quit)");
            },
            Err(ReadlineError::Eof) => {
                let _ = tx.send(EXIT.to_string());
                break;
            },
            Err(e) => {
                warn!("readline error: {}", e);
                let _ = tx.send(EXIT.to_string());
                break;
            },
        }
    }

    if let Some(path) = &history {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let _ = editor.save_history(path);
    }
}

/// 运行交互 shell，直到 `exit` / Ctrl+D / Ctrl+C
pub fn run(shell: &Shell, running: Arc<AtomicBool>) -> Result<()> {
    println!("CAN bus shell. Type 'help' for commands.");

    let (tx, rx) = bounded::<String>(10);
    thread::Builder::new()
        .name("can-repl-input".to_string())
        .spawn(move || input_loop(tx))?;

    while running.load(Ordering::Acquire) {
        let line = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match line.as_str() {
            EXIT | "quit" => break,
            "help" => println!("{}", HELP),
            _ => match shell.execute(&line) {
                Ok(out) if out.is_empty() => {},
                Ok(out) => println!("{}", out),
                Err(e) => println!("Error: {:#}", e),
            },
        }
    }

    // 输入线程阻塞在 readline 上，随进程退出
    Ok(())
}
