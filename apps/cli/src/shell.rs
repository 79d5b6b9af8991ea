//! Shell 命令
//!
//! 总线由 [`SimController`] 模拟；`network` / `sd` / `event` / `metric` 命令通过事件总线
//! 模拟宿主系统，驱动 Logger 的挂起和恢复。

use crate::config::CliConfig;
use anyhow::{Context, Result, anyhow, bail};
use canbus_driver::{
    AcceptanceFilter, BusMode, BusSpeed, CentralDispatch, DispatchBuilder, SimController,
    WriteOutcome,
};
use canbus_log::events::{
    CONFIG_CHANGED, METRIC_PREFIX, NETWORK_DOWN, NETWORK_UP, SD_MOUNTED, SD_UNMOUNTING,
};
use canbus_log::{EventBus, FormatRegistry, LogCommands, LogContext, PlayCommands, SharedConfig};
use canbus_protocol::{CanFrame, MAX_DLC};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const HELP: &str = "\
Bus commands:
  can list
  can <n> start <listen|active> <kbps>
  can <n> stop | status | clear
  can <n> tx <std|ext> <id> [byte…]        send a frame (active mode)
  can <n> rx <std|ext> <id> [byte…]        simulate a received frame
  can <n> setaccfilter <single|dual> <mask> <code>
Logging:
  can log start <transport> [<mode>] <format> <target> [filter…]
  can log start monitor <format> [filter…]
  can log stop [id] | status [id] | list
  formats: crtd gvret-a gvret-b lawricel pcap cs11
Playback:
  can play start vfs [<mode>] <format> <path> [filter…]
  can play stop [id] | status [id] | list
  can play speed <speed> [id]
Host simulation:
  network up|down
  sd mount|unmount
  event <name> [payload]
  metric <name> <value>
  config events|metrics [pattern…]
Other:
  help, exit";

/// Shell 状态：分发器、模拟控制器、事件总线、日志和回放命令
pub struct Shell {
    dispatch: Arc<CentralDispatch>,
    sims: Vec<SimController>,
    events: Arc<EventBus>,
    config: SharedConfig,
    log: LogCommands,
    play: PlayCommands,
}

impl Shell {
    /// 按配置创建总线并启动分发线程
    pub fn new(config: &CliConfig) -> Result<Self> {
        let mut builder = DispatchBuilder::new().config(config.dispatch.clone());
        let mut sims = Vec::with_capacity(config.bus.len());
        for _ in &config.bus {
            let sim = SimController::new().with_auto_complete(true);
            builder = builder.bus(Box::new(sim.clone()));
            sims.push(sim);
        }
        let dispatch = Arc::new(builder.build());

        for (bus, entry) in dispatch.buses().iter().zip(&config.bus) {
            let mode = entry.mode()?;
            if mode != BusMode::Off {
                bus.start(mode, entry.speed()?)
                    .with_context(|| format!("Failed to start {}", bus.name()))?;
            }
        }
        dispatch.start()?;

        let events = Arc::new(EventBus::with_state(config.network_up, config.sd_mounted));
        let shared = config.log.clone().shared();
        let ctx = LogContext::new(
            Arc::new(FormatRegistry::with_builtin()),
            shared.clone(),
            events.clone(),
        );
        let log = LogCommands::new(dispatch.clone(), ctx.clone());
        let play = PlayCommands::new(dispatch.clone(), ctx);

        Ok(Self {
            dispatch,
            sims,
            events,
            config: shared,
            log,
            play,
        })
    }

    pub fn dispatch(&self) -> &Arc<CentralDispatch> {
        &self.dispatch
    }

    /// 停止回放、关闭所有 Logger 并停止分发线程
    pub fn shutdown(&self) {
        self.dispatch.remove_players();
        let closed = self.dispatch.remove_loggers();
        self.dispatch.shutdown();
        info!("shell stopped ({} loggers closed)", closed);
    }

    /// 执行一行命令，返回要打印的文本
    pub fn execute(&self, line: &str) -> Result<String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] => Ok(String::new()),
            ["help"] => Ok(HELP.to_string()),
            ["can", "log", rest @ ..] => Ok(self.log.execute(rest)),
            ["can", "play", rest @ ..] => Ok(self.play.execute(rest)),
            ["can", "list"] => Ok(self.list()),
            ["can", bus, rest @ ..] => self.bus_command(bus, rest),
            ["network", "up"] => Ok(self.publish(NETWORK_UP, "")),
            ["network", "down"] => Ok(self.publish(NETWORK_DOWN, "")),
            ["sd", "mount"] => Ok(self.publish(SD_MOUNTED, "")),
            ["sd", "unmount"] => Ok(self.publish(SD_UNMOUNTING, "")),
            ["event", name, payload @ ..] => Ok(self.publish(name, &payload.join(" "))),
            ["metric", name, value] => {
                Ok(self.publish(&format!("{}{}", METRIC_PREFIX, name), value))
            },
            ["config", key @ ("events" | "metrics"), patterns @ ..] => {
                self.set_patterns(key, patterns)
            },
            _ => bail!("Unknown command: {} (try 'help')", line.trim()),
        }
    }

    fn publish(&self, name: &str, payload: &str) -> String {
        let handlers = self.events.publish(name, payload);
        format!("Event {} delivered to {} subscriber(s)", name, handlers)
    }

    fn set_patterns(&self, key: &str, patterns: &[&str]) -> Result<String> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        {
            let mut config = self.config.write();
            if key == "events" {
                config.event_filters = patterns.clone();
            } else {
                config.metric_filters = patterns.clone();
            }
        }
        self.events.publish(CONFIG_CHANGED, "can");
        Ok(format!("Forwarding {}: {}", key, patterns.join(" ")))
    }

    fn list(&self) -> String {
        let mut out = String::new();
        for bus in self.dispatch.buses() {
            let s = bus.status();
            let _ = writeln!(
                out,
                "{}: {} {} rx={} tx={} errflags={:#x}",
                bus.name(),
                bus.mode(),
                bus.speed(),
                s.packets_rx,
                s.packets_tx,
                s.error_flags
            );
        }
        out.trim_end().to_string()
    }

    fn bus_command(&self, bus: &str, args: &[&str]) -> Result<String> {
        let number: u8 = bus
            .parse()
            .map_err(|_| anyhow!("Invalid bus '{}' (try 'help')", bus))?;
        let handle = self
            .dispatch
            .bus(number)
            .ok_or_else(|| anyhow!("No bus can{}", number))?;

        match args {
            ["start", mode, speed] => {
                let mode: BusMode = mode.parse().map_err(anyhow::Error::msg)?;
                let speed: BusSpeed = speed.parse().map_err(anyhow::Error::msg)?;
                handle.start(mode, speed)?;
                Ok(format!("{} started in {} mode at {}", handle.name(), mode, speed))
            },
            ["stop"] => {
                handle.stop();
                Ok(format!("{} stopped", handle.name()))
            },
            ["status"] => Ok(handle.status_report().trim_end().to_string()),
            ["clear"] => {
                handle.clear_status();
                Ok(format!("{} status cleared", handle.name()))
            },
            ["tx", format, id, bytes @ ..] => {
                let frame = parse_frame(format, id, bytes)?;
                let outcome = self.dispatch.write(number, frame, Duration::ZERO)?;
                // 模拟控制器立即完成发送，由分发线程处理发送完成中断
                self.dispatch.raise_interrupt(number);
                Ok(match outcome {
                    WriteOutcome::Sent => "Sent".to_string(),
                    WriteOutcome::Queued => "Queued".to_string(),
                })
            },
            ["rx", format, id, bytes @ ..] => {
                let frame = parse_frame(format, id, bytes)?;
                let sim = self
                    .sims
                    .get(usize::from(number) - 1)
                    .ok_or_else(|| anyhow!("No bus can{}", number))?;
                if !sim.inject_rx(&frame) {
                    return Ok(format!("{} did not accept the frame", handle.name()));
                }
                self.dispatch.raise_interrupt(number);
                Ok(format!("{} received frame", handle.name()))
            },
            ["setaccfilter", mode, mask, code] => {
                let filter = AcceptanceFilter::parse(mode, mask, code)?;
                handle.set_acceptance_filter(&filter)?;
                Ok(format!("{} acceptance filter set", handle.name()))
            },
            _ => bail!("Unknown bus command (try 'help')"),
        }
    }
}

/// `<std|ext> <id> [byte…]`，全部十六进制
fn parse_frame(format: &str, id: &str, bytes: &[&str]) -> Result<CanFrame> {
    if bytes.len() > MAX_DLC {
        bail!("At most {} data bytes", MAX_DLC);
    }
    let id = parse_hex(id).with_context(|| format!("Invalid id '{}'", id))?;
    let data = bytes
        .iter()
        .map(|b| {
            let value = parse_hex(b).with_context(|| format!("Invalid byte '{}'", b))?;
            u8::try_from(value).map_err(|_| anyhow!("Invalid byte '{}'", b))
        })
        .collect::<Result<Vec<u8>>>()?;

    match format {
        "std" if id <= 0x7FF => Ok(CanFrame::new_standard(id, &data)),
        "std" => bail!("Standard id {:#x} out of range", id),
        "ext" if id <= 0x1FFF_FFFF => Ok(CanFrame::new_extended(id, &data)),
        "ext" => bail!("Extended id {:#x} out of range", id),
        other => bail!("Unknown frame format '{}' (std|ext)", other),
    }
}

fn parse_hex(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    Ok(u32::from_str_radix(digits, 16)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusEntry;
    use std::time::Instant;

    fn shell() -> Shell {
        let mut config = CliConfig::default();
        config.bus[0] = BusEntry {
            mode: "active".to_string(),
            speed: "500".to_string(),
        };
        Shell::new(&config).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_parse_frame() {
        let frame = parse_frame("std", "7e8", &["03", "41", "0d"]).unwrap();
        assert_eq!(frame.data_slice(), &[0x03, 0x41, 0x0D]);
        assert!(!frame.is_extended());
        assert!(parse_frame("ext", "0x18DAF110", &[]).unwrap().is_extended());

        assert!(parse_frame("std", "800", &[]).is_err());
        assert!(parse_frame("std", "1", &["100"]).is_err());
        assert!(parse_frame("fd", "1", &[]).is_err());
        assert!(parse_frame("std", "1", &["0"; 9]).is_err());
    }

    #[test]
    fn test_bus_commands() {
        let shell = shell();
        assert!(shell.execute("can list").unwrap().starts_with("can1: Active"));

        assert_eq!(shell.execute("can 1 tx std 123 aa bb").unwrap(), "Sent");
        assert!(wait_until(|| shell.sims[0].transmitted().len() == 1));
        assert_eq!(shell.sims[0].transmitted()[0].data_slice(), &[0xAA, 0xBB]);

        // 未启动的总线不能发送
        assert!(shell.execute("can 2 tx std 123").is_err());
        assert!(shell.execute("can 9 status").is_err());
        assert!(shell.execute("can x status").is_err());

        shell.execute("can 2 start listen 250").unwrap();
        assert!(shell.execute("can 2 status").unwrap().contains("Mode:      Listen"));
        assert_eq!(shell.execute("can 2 stop").unwrap(), "can2 stopped");
        shell.shutdown();
    }

    #[test]
    fn test_rx_reaches_file_logger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell.crtd");
        let shell = shell();

        let out = shell
            .execute(&format!("can log start vfs crtd {}", path.display()))
            .unwrap();
        assert!(out.ends_with("(#1)"), "{}", out);

        shell.execute("can 1 rx std 100 01 02").unwrap();
        assert!(wait_until(|| {
            shell
                .execute("can log status 1")
                .unwrap()
                .contains("total messages: 1")
        }));

        let out = shell.execute("can log stop").unwrap();
        assert!(out.contains("CAN logging stopped at"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().any(|l| l.ends_with(" 1R11 100 01 02")));
        shell.shutdown();
    }

    /// 回放的帧经分发线程进入另一个文件日志
    #[test]
    fn test_play_reaches_file_logger() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.crtd");
        let copy = dir.path().join("copy.crtd");
        std::fs::write(&source, "1700000000.000000 1R11 7E8 03 41 0d 32\n").unwrap();
        let shell = shell();

        shell
            .execute(&format!("can log start vfs crtd {}", copy.display()))
            .unwrap();
        let out = shell
            .execute(&format!("can play start vfs crtd {}", source.display()))
            .unwrap();
        assert!(out.starts_with("CAN playing from VFS active"), "{}", out);
        assert!(wait_until(|| {
            shell
                .execute("can log status 1")
                .unwrap()
                .contains("total messages: 1")
        }));
        assert_eq!(shell.execute("can play stop").unwrap(), "Stopping all players");

        shell.execute("can log stop").unwrap();
        let text = std::fs::read_to_string(&copy).unwrap();
        assert!(text.lines().any(|l| l.ends_with(" 1R11 7E8 03 41 0d 32")));
        shell.shutdown();
    }

    #[test]
    fn test_host_events() {
        let shell = shell();
        shell.execute("network down").unwrap();
        assert!(!shell.events.network_up());
        shell.execute("network up").unwrap();
        assert!(shell.events.network_up());

        shell.execute("config metrics v.b.*").unwrap();
        assert_eq!(shell.config.read().metric_filters, vec!["v.b.*".to_string()]);
        assert!(shell.execute("metric v.b.soc 80").unwrap().starts_with("Event metric.v.b.soc"));

        assert!(shell.execute("bogus").is_err());
        assert_eq!(shell.execute("  ").unwrap(), "");
        shell.shutdown();
    }
}
