//! `can log …` 命令
//!
//! 命令返回给人看的文本，由 shell 打印：
//!
//! ```text
//! can log start <transport> [<mode>] <format> <target> [filter…]
//! can log start monitor <format> [filter…]
//! can log stop [id]
//! can log status [id]
//! can log list
//! ```
//!
//! `<mode>`（discard / simulate / transmit）只对服务端传输有效。
//!
//! 回放：
//!
//! ```text
//! can play start vfs [<mode>] <format> <path> [filter…]
//! can play stop [id]
//! can play status [id]
//! can play list
//! can play speed <speed> [id]
//! ```

use crate::format::ServeMode;
use crate::logger::{LogContext, Logger, LoggerOptions};
use crate::player::{PlayerOptions, VfsPlayer};
use crate::sinks::TransportKind;
use canbus_driver::{CentralDispatch, Loggable, Player};
use canbus_protocol::FrameFilter;
use std::sync::Arc;
use tracing::warn;

pub const USAGE: &str = "\
Usage: can log start <transport> [<mode>] <format> <target> [filter1] ... [filterN]
       can log start monitor <format> [filter1] ... [filterN]
       can log stop [id]
       can log status [id]
       can log list
Transport: vfs | tcpclient | tcpserver | udpclient | udpserver | monitor
Mode: discard | simulate | transmit (servers only)
Format: crtd | gvret-a | gvret-b | lawricel | pcap | cs11
Filter: <bus> | <id>[-<id>] | <bus>:<id>[-<id>]
Example: can log start tcpserver transmit crtd 3000 2:2a0-37f";

const NOT_ACTIVE: &str = "CAN logging is not active";

const MONITOR_NOTE: &str =
    "Note: info logging is at debug log level, frame logging is at verbose, and errors as usual";

/// `can log` 命令集
pub struct LogCommands {
    dispatch: Arc<CentralDispatch>,
    ctx: LogContext,
}

impl LogCommands {
    /// 服务模式回放默认送回 `dispatch`
    pub fn new(dispatch: Arc<CentralDispatch>, ctx: LogContext) -> Self {
        let ctx = match ctx.target {
            Some(_) => ctx,
            None => ctx.with_target(dispatch.clone()),
        };
        Self { dispatch, ctx }
    }

    pub fn context(&self) -> &LogContext {
        &self.ctx
    }

    /// 执行 `can log` 之后的参数
    pub fn execute(&self, args: &[&str]) -> String {
        match args.split_first() {
            Some((&"start", rest)) => self.start(rest),
            Some((&"stop", rest)) => match parse_id(rest) {
                Ok(id) => self.stop(id),
                Err(e) => e,
            },
            Some((&"status", rest)) => match parse_id(rest) {
                Ok(id) => self.status(id),
                Err(e) => e,
            },
            Some((&"list", [])) => self.list(),
            _ => USAGE.to_string(),
        }
    }

    /// `start <transport> [<mode>] <format> <target> [filter…]`
    pub fn start(&self, args: &[&str]) -> String {
        let Some((&transport, mut rest)) = args.split_first() else {
            return USAGE.to_string();
        };
        let kind = match transport.parse::<TransportKind>() {
            Ok(kind) => kind,
            Err(e) => return format!("Error: {}", e),
        };

        let mut mode = ServeMode::default();
        if kind.is_server()
            && let Some((first, tail)) = rest.split_first()
            && let Ok(parsed) = first.parse::<ServeMode>()
        {
            mode = parsed;
            rest = tail;
        }

        let (format, target, filters) = match (kind.needs_target(), rest) {
            (false, [format, filters @ ..]) => (*format, "", filters),
            (true, [format, target, filters @ ..]) => (*format, *target, filters),
            _ => return USAGE.to_string(),
        };

        let mut options = LoggerOptions::new(kind, format, target).mode(mode);
        if !filters.is_empty() {
            match FrameFilter::from_specs(filters) {
                Ok(filter) => options = options.filter(filter),
                Err(e) => return format!("Error: {}", e),
            }
        }

        let logger = match Logger::new(options, self.ctx.clone()) {
            Ok(logger) => logger,
            Err(e) => {
                return format!(
                    "Error: Could not start CAN logging as {}: {}",
                    kind.label(),
                    e
                );
            },
        };

        match logger.open() {
            Ok(()) => {
                let info = logger.info();
                let id = self.dispatch.add_logger(logger);
                let line = format!("CAN logging as {}: {} (#{})", kind.label(), info, id);
                if kind == TransportKind::Monitor {
                    format!("{}\n{}", line, MONITOR_NOTE)
                } else {
                    line
                }
            },
            Err(e) => {
                warn!("could not start CAN logging as {}: {}", kind.label(), e);
                let line = format!(
                    "Error: Could not start CAN logging as {}: {}",
                    kind.label(),
                    logger.info()
                );
                logger.close();
                line
            },
        }
    }

    /// 关闭指定或全部 Logger
    pub fn stop(&self, id: Option<u32>) -> String {
        let targets: Vec<(u32, Arc<dyn Loggable>)> = match id {
            Some(id) => match self.dispatch.logger(id) {
                Some(logger) => vec![(id, logger)],
                None => return format!("Error: No logger #{}", id),
            },
            None => self.dispatch.loggers().iter().cloned().collect(),
        };
        if targets.is_empty() {
            return NOT_ACTIVE.to_string();
        }

        let mut out = Vec::new();
        for (id, logger) in targets {
            out.push(format!("Closing log #{}: {}", id, logger.info()));
            self.dispatch.remove_logger(id);
            out.push(format!("CAN logging stopped at {}", logger.stats()));
        }
        out.join("\n")
    }

    pub fn status(&self, id: Option<u32>) -> String {
        let targets: Vec<(u32, Arc<dyn Loggable>)> = match id {
            Some(id) => match self.dispatch.logger(id) {
                Some(logger) => vec![(id, logger)],
                None => return format!("Error: No logger #{}", id),
            },
            None => self.dispatch.loggers().iter().cloned().collect(),
        };
        if targets.is_empty() {
            return NOT_ACTIVE.to_string();
        }

        targets
            .iter()
            .map(|(id, logger)| {
                let state = if logger.is_open() { "active" } else { "waiting" };
                format!(
                    "#{}: CAN logging {}: {}\nStatistics: {}",
                    id,
                    state,
                    logger.info(),
                    logger.stats()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn list(&self) -> String {
        let loggers = self.dispatch.loggers();
        if loggers.is_empty() {
            return NOT_ACTIVE.to_string();
        }
        loggers
            .iter()
            .map(|(id, logger)| format!("#{}: {}", id, logger.info()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub const PLAY_USAGE: &str = "\
Usage: can play start vfs [<mode>] <format> <path> [filter1] ... [filterN]
       can play stop [id]
       can play status [id]
       can play list
       can play speed <speed> [id]
Mode: discard | simulate | transmit (default simulate)
Speed: multiple of recorded time, 0 plays as fast as possible";

const NOT_PLAYING: &str = "CAN playing inactive";

/// `can play` 命令集
pub struct PlayCommands {
    dispatch: Arc<CentralDispatch>,
    ctx: LogContext,
}

impl PlayCommands {
    /// 回放的帧默认送回 `dispatch`
    pub fn new(dispatch: Arc<CentralDispatch>, ctx: LogContext) -> Self {
        let ctx = match ctx.target {
            Some(_) => ctx,
            None => ctx.with_target(dispatch.clone()),
        };
        Self { dispatch, ctx }
    }

    /// 执行 `can play` 之后的参数
    pub fn execute(&self, args: &[&str]) -> String {
        match args.split_first() {
            Some((&"start", rest)) => self.start(rest),
            Some((&"stop", rest)) => match parse_id(rest) {
                Ok(id) => self.stop(id),
                Err(_) => PLAY_USAGE.to_string(),
            },
            Some((&"status", rest)) => match parse_id(rest) {
                Ok(id) => self.status(id),
                Err(_) => PLAY_USAGE.to_string(),
            },
            Some((&"list", [])) => self.list(),
            Some((&"speed", [speed, rest @ ..])) => match (speed.parse::<u32>(), parse_id(rest)) {
                (Ok(speed), Ok(id)) => self.speed(speed, id),
                _ => PLAY_USAGE.to_string(),
            },
            _ => PLAY_USAGE.to_string(),
        }
    }

    /// `start vfs [<mode>] <format> <path> [filter…]`
    pub fn start(&self, args: &[&str]) -> String {
        let Some((&"vfs", mut rest)) = args.split_first() else {
            return PLAY_USAGE.to_string();
        };
        let mut mode = ServeMode::Simulate;
        if let Some((first, tail)) = rest.split_first()
            && let Ok(parsed) = first.parse::<ServeMode>()
        {
            mode = parsed;
            rest = tail;
        }
        let [format, path, filters @ ..] = rest else {
            return PLAY_USAGE.to_string();
        };

        let mut options = PlayerOptions::new(format, path).mode(mode);
        if !filters.is_empty() {
            match FrameFilter::from_specs(filters) {
                Ok(filter) => options = options.filter(filter),
                Err(e) => return format!("Error: {}", e),
            }
        }

        match VfsPlayer::start(options, self.ctx.clone()) {
            Ok(player) => {
                let info = player.info();
                let id = self.dispatch.add_player(player);
                format!("CAN playing from VFS active: {} (#{})", info, id)
            },
            Err(e) => {
                warn!("could not start CAN playing from {}: {}", path, e);
                format!("Error: Could not start CAN playing from: {}: {}", path, e)
            },
        }
    }

    pub fn stop(&self, id: Option<u32>) -> String {
        if self.dispatch.players().is_empty() {
            return "Error: No players running".to_string();
        }
        match id {
            None => {
                self.dispatch.remove_players();
                "Stopping all players".to_string()
            },
            Some(id) if self.dispatch.remove_player(id) => "Stopped player".to_string(),
            Some(_) => "Error: Cannot find specified player".to_string(),
        }
    }

    pub fn status(&self, id: Option<u32>) -> String {
        let players: Vec<(u32, Arc<dyn Player>)> = match id {
            Some(id) => match self.dispatch.player(id) {
                Some(player) => vec![(id, player)],
                None => return "Error: Cannot find specified can player".to_string(),
            },
            None => self.dispatch.players().iter().cloned().collect(),
        };
        if players.is_empty() {
            return NOT_PLAYING.to_string();
        }
        players
            .iter()
            .map(|(id, player)| {
                let state = if player.is_open() { "" } else { " (finished)" };
                format!(
                    "CAN player #{}{}: {}\n  Statistics: {}",
                    id,
                    state,
                    player.info(),
                    player.stats()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn list(&self) -> String {
        let players = self.dispatch.players();
        if players.is_empty() {
            return NOT_PLAYING.to_string();
        }
        players
            .iter()
            .map(|(id, player)| format!("#{}: {}", id, player.info()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn speed(&self, speed: u32, id: Option<u32>) -> String {
        match id {
            Some(id) => match self.dispatch.player(id) {
                Some(player) => player.set_speed(speed),
                None => return "Error: Cannot find specified player".to_string(),
            },
            None => {
                if self.dispatch.players().is_empty() {
                    return "Error: No players running".to_string();
                }
                for (_, player) in self.dispatch.players().iter() {
                    player.set_speed(speed);
                }
            },
        }
        format!("CAN playing speed set to {}x", speed)
    }
}

fn parse_id(args: &[&str]) -> Result<Option<u32>, String> {
    match args {
        [] => Ok(None),
        [id] => id
            .trim_start_matches('#')
            .parse()
            .map(Some)
            .map_err(|_| format!("Error: invalid logger id '{}'", id)),
        _ => Err(USAGE.to_string()),
    }
}
