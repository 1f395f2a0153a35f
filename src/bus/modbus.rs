//! Field-bus access to annunciator hardware.
//!
//! The wire protocol is an opaque register read/write concern behind the
//! [`RegisterBus`] trait; [`ModbusTcpBus`] is the production
//! implementation. [`Annunciator`] layers the device register map
//! (two-line LCD, clock, buzzer) on top of any bus.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, Timelike};
use thiserror::Error;
use tokio::time::timeout;
use tokio_modbus::prelude::*;
use tracing::debug;

use crate::domain::LineColor;

/// Modbus unit id of the display controller
pub const DISPLAY_UNIT: u8 = 1;
/// Modbus unit id of the buzzer controller
pub const BUZZER_UNIT: u8 = 2;

/// Current time: year, month, day, hour, minute
pub const REG_TIME: u16 = 0;
/// Buzzer on/off
pub const REG_BUZZER: u16 = 4;
/// Page select
pub const REG_PAGE: u16 = 5;
/// Alarm line 1 text
pub const REG_LINE1: u16 = 6;
/// Alarm line 2 text
pub const REG_LINE2: u16 = 14;
/// Idle page title text
pub const REG_TITLE: u16 = 24;
pub const REG_LINE1_COLOR: u16 = 48;
pub const REG_LINE2_COLOR: u16 = 49;
pub const REG_TITLE_COLOR: u16 = 50;

/// Idle/title page
pub const PAGE_IDLE: u16 = 0;
/// Alarm page
pub const PAGE_ALARM: u16 = 1;

/// Fixed line width in characters; two characters pack into one register.
pub const LINE_WIDTH: usize = 16;

/// Field-bus error with a human-readable reason for logging.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("write of register {addr} rejected: {reason}")]
    Write { addr: u16, reason: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Opaque register read/write client for one device.
#[async_trait]
pub trait RegisterBus: Send {
    async fn write_register(&mut self, unit: u8, addr: u16, value: u16) -> Result<(), BusError>;

    async fn write_registers(&mut self, unit: u8, addr: u16, values: &[u16])
        -> Result<(), BusError>;

    /// Drop any cached connection and dial again.
    async fn reconnect(&mut self) -> Result<(), BusError>;

    /// Best-effort close; errors are swallowed.
    async fn close(&mut self);
}

/// Produces one bus handle per roster device.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn open(&self, ip: &str, port: u16) -> Box<dyn RegisterBus>;
}

/// Modbus TCP implementation of [`RegisterBus`].
///
/// Connects lazily on first write and drops the connection on any
/// failure, so the next write (or a recovery probe) dials fresh.
pub struct ModbusTcpBus {
    addr: String,
    io_timeout: Duration,
    ctx: Option<client::Context>,
}

impl ModbusTcpBus {
    pub fn new(addr: String, io_timeout: Duration) -> Self {
        Self {
            addr,
            io_timeout,
            ctx: None,
        }
    }

    async fn dial(addr: &str, io_timeout: Duration) -> Result<client::Context, BusError> {
        let socket_addr: SocketAddr = addr.parse().map_err(|e| BusError::Connect {
            addr: addr.to_string(),
            reason: format!("invalid address: {}", e),
        })?;

        debug!("connecting to annunciator at {}", socket_addr);
        match timeout(io_timeout, client::tcp::connect(socket_addr)).await {
            Ok(Ok(ctx)) => Ok(ctx),
            Ok(Err(e)) => Err(BusError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(BusError::Timeout(io_timeout)),
        }
    }

    async fn take_ctx(&mut self) -> Result<client::Context, BusError> {
        match self.ctx.take() {
            Some(ctx) => Ok(ctx),
            None => Self::dial(&self.addr, self.io_timeout).await,
        }
    }
}

#[async_trait]
impl RegisterBus for ModbusTcpBus {
    async fn write_register(&mut self, unit: u8, addr: u16, value: u16) -> Result<(), BusError> {
        let mut ctx = self.take_ctx().await?;
        ctx.set_slave(Slave(unit));
        match timeout(self.io_timeout, ctx.write_single_register(addr, value)).await {
            Ok(Ok(())) => {
                self.ctx = Some(ctx);
                Ok(())
            }
            // connection is dropped on failure; the next call redials
            Ok(Err(e)) => Err(BusError::Write {
                addr,
                reason: e.to_string(),
            }),
            Err(_) => Err(BusError::Timeout(self.io_timeout)),
        }
    }

    async fn write_registers(
        &mut self,
        unit: u8,
        addr: u16,
        values: &[u16],
    ) -> Result<(), BusError> {
        let mut ctx = self.take_ctx().await?;
        ctx.set_slave(Slave(unit));
        match timeout(self.io_timeout, ctx.write_multiple_registers(addr, values)).await {
            Ok(Ok(())) => {
                self.ctx = Some(ctx);
                Ok(())
            }
            Ok(Err(e)) => Err(BusError::Write {
                addr,
                reason: e.to_string(),
            }),
            Err(_) => Err(BusError::Timeout(self.io_timeout)),
        }
    }

    async fn reconnect(&mut self) -> Result<(), BusError> {
        self.ctx = None;
        self.ctx = Some(Self::dial(&self.addr, self.io_timeout).await?);
        Ok(())
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            debug!("closed connection to {}", self.addr);
        }
    }
}

/// Connector building [`ModbusTcpBus`] handles.
pub struct ModbusConnector {
    io_timeout: Duration,
}

impl ModbusConnector {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

#[async_trait]
impl BusConnector for ModbusConnector {
    async fn open(&self, ip: &str, port: u16) -> Box<dyn RegisterBus> {
        Box::new(ModbusTcpBus::new(format!("{}:{}", ip, port), self.io_timeout))
    }
}

/// Which display line to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayLine {
    Line1,
    Line2,
}

/// Pack a display line as two ASCII characters per 16-bit register,
/// truncated or space-padded to [`LINE_WIDTH`].
pub fn pack_line(text: &str) -> [u16; LINE_WIDTH / 2] {
    let mut bytes: Vec<u8> = text.bytes().take(LINE_WIDTH).collect();
    bytes.resize(LINE_WIDTH, b' ');

    let mut registers = [0u16; LINE_WIDTH / 2];
    for (i, pair) in bytes.chunks(2).enumerate() {
        registers[i] = (u16::from(pair[0]) << 8) | u16::from(pair[1]);
    }
    registers
}

/// Register-map operations of one annunciator unit.
pub struct Annunciator<'a> {
    bus: &'a mut dyn RegisterBus,
}

impl<'a> Annunciator<'a> {
    pub fn new(bus: &'a mut dyn RegisterBus) -> Self {
        Self { bus }
    }

    pub async fn switch_page(&mut self, page: u16) -> Result<(), BusError> {
        self.bus.write_register(DISPLAY_UNIT, REG_PAGE, page).await
    }

    pub async fn write_line(
        &mut self,
        line: DisplayLine,
        text: &str,
        color: LineColor,
    ) -> Result<(), BusError> {
        let (text_reg, color_reg) = match line {
            DisplayLine::Line1 => (REG_LINE1, REG_LINE1_COLOR),
            DisplayLine::Line2 => (REG_LINE2, REG_LINE2_COLOR),
        };
        self.bus
            .write_registers(DISPLAY_UNIT, text_reg, &pack_line(text))
            .await?;
        self.bus
            .write_register(DISPLAY_UNIT, color_reg, color.code())
            .await
    }

    pub async fn set_title(&mut self, title: &str) -> Result<(), BusError> {
        self.bus
            .write_registers(DISPLAY_UNIT, REG_TITLE, &pack_line(title))
            .await?;
        // title is always rendered green
        self.bus
            .write_register(DISPLAY_UNIT, REG_TITLE_COLOR, LineColor::Green.code())
            .await
    }

    pub async fn set_clock(&mut self, now: DateTime<Local>) -> Result<(), BusError> {
        let values = [
            now.year() as u16,
            now.month() as u16,
            now.day() as u16,
            now.hour() as u16,
            now.minute() as u16,
        ];
        self.bus
            .write_registers(DISPLAY_UNIT, REG_TIME, &values)
            .await
    }

    pub async fn set_buzzer(&mut self, on: bool) -> Result<(), BusError> {
        self.bus
            .write_register(BUZZER_UNIT, REG_BUZZER, u16::from(on))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_line_pads_short_text() {
        let registers = pack_line("AB");
        assert_eq!(registers[0], (u16::from(b'A') << 8) | u16::from(b'B'));
        for reg in &registers[1..] {
            assert_eq!(*reg, (u16::from(b' ') << 8) | u16::from(b' '));
        }
    }

    #[test]
    fn test_pack_line_truncates_long_text() {
        let registers = pack_line("0123456789abcdefOVERFLOW");
        assert_eq!(registers.len(), 8);
        assert_eq!(registers[7], (u16::from(b'e') << 8) | u16::from(b'f'));
    }

    #[test]
    fn test_pack_line_empty() {
        let blank = (u16::from(b' ') << 8) | u16::from(b' ');
        assert_eq!(pack_line(""), [blank; 8]);
    }
}
