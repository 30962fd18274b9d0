//! Query command registry
//!
//! Every named command lives in one ordered table. Lookup walks the table
//! and the first name match wins, so telegram commands shadow field
//! shortcuts, which shadow combined commands. A command that matches no name
//! but starts with a non-zero integer is read as a SunSpec field id and
//! answered from the latest register block.

use crate::modbus::registers::{AC_ENERGY, AC_POWER};
use crate::modbus::{descriptors, lookup};
use crate::store::{RegisterBlock, Telegram};
use crate::telegram::{self, KILO};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;

pub const NOT_IMPLEMENTED: &str = "not implemented, run 'help' for an overview";

/// Data a combined command may draw from
#[derive(Debug, Clone, Copy, Default)]
pub struct Sources<'a> {
    pub telegram: Option<&'a Telegram>,
    pub registers: Option<&'a RegisterBlock>,
}

impl<'a> Sources<'a> {
    /// Telegram text, empty before the first telegram
    pub fn text(&self) -> Cow<'a, str> {
        self.telegram.map(Telegram::text).unwrap_or_default()
    }

    /// Decoded register value, `None` without a block or for unknown ids
    pub fn register(&self, field_id: u16) -> Option<f64> {
        self.registers
            .and_then(|block| crate::modbus::register_value(&block.registers, field_id))
    }
}

/// How a named command computes its answer
#[derive(Debug, Clone, Copy)]
pub enum CommandKind {
    /// Derived from the telegram text alone
    Telegram(fn(&str) -> String),
    /// One telegram field, scaled
    Field { code: &'static str, scale: f64 },
    /// Telegram and register block together
    Combined(fn(&Sources<'_>) -> String),
}

#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: CommandKind,
}

const fn telegram_cmd(
    name: &'static str,
    description: &'static str,
    f: fn(&str) -> String,
) -> Command {
    Command {
        name,
        description,
        kind: CommandKind::Telegram(f),
    }
}

const fn field_cmd(
    name: &'static str,
    code: &'static str,
    description: &'static str,
    scale: f64,
) -> Command {
    Command {
        name,
        description,
        kind: CommandKind::Field { code, scale },
    }
}

const fn combined_cmd(
    name: &'static str,
    description: &'static str,
    f: fn(&Sources<'_>) -> String,
) -> Command {
    Command {
        name,
        description,
        kind: CommandKind::Combined(f),
    }
}

static COMMANDS: &[Command] = &[
    telegram_cmd("help", "show this help", |_| help_text()),
    telegram_cmd("10s", "current power usage (W)", |t| {
        number(telegram::phase_consumption(t))
    }),
    telegram_cmd("test", "simple test command", |_| test_reply()),
    telegram_cmd("volt", "voltage L1", |t| {
        number(telegram::field_number(t, telegram::VOLTAGE_L1))
    }),
    telegram_cmd("gas", "total gas used", |t| number(telegram::gas_total(t))),
    telegram_cmd("net", "net total used (curused - curproduced) (Wh)", |t| {
        number(telegram::net_total(t))
    }),
    telegram_cmd("cur", "total used (Wh)", |t| number(telegram::total_used(t))),
    telegram_cmd("curused", "total used (Wh)", |t| {
        number(telegram::total_used(t))
    }),
    telegram_cmd("curproduced", "total produced (Wh)", |t| {
        number(telegram::total_produced(t))
    }),
    telegram_cmd("pcuruse", "power currently used (W)", |t| {
        number(telegram::phase_consumption(t))
    }),
    telegram_cmd("pcurprod", "power currently produced (W)", |t| {
        number(telegram::phase_production(t))
    }),
    telegram_cmd(
        "pcurnet",
        "power currently net used (used - produced) (W)",
        |t| number(telegram::phase_net(t)),
    ),
    telegram_cmd("all", "complete telegram", |t| t.to_string()),
    field_cmd("VL1", "1-0:32.7.0", "Voltage L1", 1.0),
    field_cmd("VL2", "1-0:52.7.0", "Voltage L2", 1.0),
    field_cmd("VL3", "1-0:72.7.0", "Voltage L3", 1.0),
    field_cmd("PL1+", "1-0:21.7.0", "Power L1 consumption (W)", KILO),
    field_cmd("PL2+", "1-0:41.7.0", "Power L2 consumption (W)", KILO),
    field_cmd("PL3+", "1-0:61.7.0", "Power L3 consumption (W)", KILO),
    field_cmd("PL1-", "1-0:22.7.0", "Power L1 production (W)", KILO),
    field_cmd("PL2-", "1-0:42.7.0", "Power L2 production (W)", KILO),
    field_cmd("PL3-", "1-0:62.7.0", "Power L3 production (W)", KILO),
    field_cmd(
        "gastime",
        "0-1:24.2.1",
        "Time when gas measurement took place",
        1.0,
    ),
    field_cmd(
        "usagetariff1",
        "1-0:1.8.1",
        "Total electricity usage tariff 1 (kWh)",
        1.0,
    ),
    field_cmd(
        "usagetariff2",
        "1-0:1.8.2",
        "Total electricity usage tariff 2 (kWh)",
        1.0,
    ),
    field_cmd(
        "timestamp",
        "0-0:1.0.0",
        "Timestamp when telegram was measured",
        1.0,
    ),
    combined_cmd(
        "consumption",
        "Consumption: net P1 usage + SunSpec production (W)",
        consumption,
    ),
    combined_cmd("json", "json output of relevant fields", json_snapshot),
];

/// All named commands in lookup order
pub fn commands() -> &'static [Command] {
    COMMANDS
}

/// First command registered under `name`
pub fn resolve(name: &str) -> Option<&'static Command> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// Answer one query
///
/// Only the text before the first line terminator is treated as the command.
pub fn handle(
    command: &str,
    telegram: Option<&Telegram>,
    registers: Option<&RegisterBlock>,
) -> String {
    let command = command
        .split(['\r', '\n'])
        .next()
        .unwrap_or_default();
    let sources = Sources {
        telegram,
        registers,
    };

    if let Some(found) = resolve(command) {
        return match found.kind {
            CommandKind::Telegram(f) => f(&sources.text()),
            CommandKind::Field { code, scale } => {
                number(telegram::field_number(&sources.text(), code) * scale)
            }
            CommandKind::Combined(f) => f(&sources),
        };
    }

    let field_id = leading_int(command);
    if field_id != 0
        && let Ok(field_id) = u16::try_from(field_id)
        && lookup(field_id).is_some()
        && let Some(value) = sources.register(field_id)
    {
        return number(value);
    }

    NOT_IMPLEMENTED.to_string()
}

/// Fixed six-decimal formatting used by every numeric reply
pub fn number(value: f64) -> String {
    format!("{:.6}", value)
}

/// Leading decimal integer of `s` with optional sign; 0 when there is none
fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value.saturating_mul(10).saturating_add(i64::from(b - b'0'));
    }
    if negative { -value } else { value }
}

fn test_reply() -> String {
    format!("{} {} is alive", env!("CARGO_PKG_NAME"), env!("APP_VERSION"))
}

/// Overview of every command and every known register field
pub fn help_text() -> String {
    let width = COMMANDS.iter().map(|c| c.name.len()).max().unwrap_or(0);
    let mut out = String::from("P1 commands:\n");
    for c in COMMANDS {
        out.push_str(&format!("{:<width$} {}\n", c.name, c.description));
    }
    out.push_str("SunSpec commands:\n");
    out.push_str(&format!("{:<width$} {:<4} Description\n", "Field", "Unit"));
    for d in descriptors() {
        out.push_str(&format!(
            "{:<width$} {:<4} {}\n",
            d.field_id, d.unit, d.name
        ));
    }
    out
}

fn consumption(sources: &Sources<'_>) -> String {
    let inverter = sources.register(AC_POWER).unwrap_or(0.0);
    number(telegram::meter_net_power(&sources.text()) + inverter)
}

#[derive(Debug, Serialize)]
struct EnergySnapshot {
    unit: &'static str,
    p1consumedtariff1: Option<f64>,
    p1consumedtariff2: Option<f64>,
    p1producedtariff1: Option<f64>,
    p1producedtariff2: Option<f64>,
    sunspecproduced: Option<f64>,
}

#[derive(Debug, Serialize)]
struct PowerSnapshot {
    unit: &'static str,
    p1consuming: Option<f64>,
    p1producing: Option<f64>,
    sunspecproducing: Option<f64>,
    netconsuming: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Snapshot {
    energy: EnergySnapshot,
    power: PowerSnapshot,
    p1timestamp: Option<f64>,
    modbustimestamp: Option<f64>,
}

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) / 1e9
}

fn kilo(value: Option<f64>) -> Option<f64> {
    value.map(|v| v * KILO)
}

fn json_snapshot(sources: &Sources<'_>) -> String {
    let text = sources.text();
    let p1_value = |code: &str| kilo(telegram::field_value(&text, code));

    let consuming = p1_value(telegram::POWER_USED);
    let producing = p1_value(telegram::POWER_PRODUCED);
    let inverter = sources.register(AC_POWER);
    let net = match (consuming, inverter, producing) {
        (Some(c), Some(i), Some(p)) => Some(c + i - p),
        _ => None,
    };

    let snapshot = Snapshot {
        energy: EnergySnapshot {
            unit: "Wh",
            p1consumedtariff1: p1_value(telegram::TARIFF1_USED),
            p1consumedtariff2: p1_value(telegram::TARIFF2_USED),
            p1producedtariff1: p1_value(telegram::TARIFF1_PRODUCED),
            p1producedtariff2: p1_value(telegram::TARIFF2_PRODUCED),
            sunspecproduced: sources.register(AC_ENERGY),
        },
        power: PowerSnapshot {
            unit: "W",
            p1consuming: consuming,
            p1producing: producing,
            sunspecproducing: inverter,
            netconsuming: net,
        },
        p1timestamp: sources.telegram.map(|t| epoch_seconds(t.captured_at)),
        modbustimestamp: sources.registers.map(|r| epoch_seconds(r.captured_at)),
    };

    serde_json::to_string(&snapshot).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
}
