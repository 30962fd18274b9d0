//! SunSpec inverter model (model 101-103) register descriptors

use super::decode::Decoder;

/// Register number of the first word in a polled block
pub const MODBUS_BASE: u16 = 40001;

/// Number of registers polled per block
pub const MODBUS_REG_COUNT: u16 = 109;

/// One logical inverter value inside the polled register block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDescriptor {
    /// SunSpec register number of the value word
    pub field_id: u16,
    /// Distance from the value word to its scale-factor word
    pub exponent_offset: usize,
    /// Number of value words
    pub word_length: usize,
    pub name: &'static str,
    pub unit: &'static str,
    pub decoder: Decoder,
}

const fn descriptor(
    field_id: u16,
    exponent_offset: usize,
    word_length: usize,
    name: &'static str,
    unit: &'static str,
    decoder: Decoder,
) -> RegisterDescriptor {
    RegisterDescriptor {
        field_id,
        exponent_offset,
        word_length,
        name,
        unit,
        decoder,
    }
}

/// Known fields, ordered by register number
static DESCRIPTORS: &[RegisterDescriptor] = &[
    descriptor(40072, 4, 1, "I_AC_Current", "A", Decoder::Uint16),
    descriptor(40073, 3, 1, "I_AC_CurrentA", "A", Decoder::Uint16),
    descriptor(40074, 2, 1, "I_AC_CurrentB", "A", Decoder::Uint16),
    descriptor(40075, 1, 1, "I_AC_CurrentC", "A", Decoder::Uint16),
    descriptor(40077, 6, 1, "I_AC_VoltageAB", "V", Decoder::Uint16),
    descriptor(40078, 5, 1, "I_AC_VoltageBC", "V", Decoder::Uint16),
    descriptor(40079, 4, 1, "I_AC_VoltageCA", "V", Decoder::Uint16),
    descriptor(40080, 3, 1, "I_AC_VoltageAN", "V", Decoder::Uint16),
    descriptor(40081, 2, 1, "I_AC_VoltageBN", "V", Decoder::Uint16),
    descriptor(40082, 1, 1, "I_AC_VoltageCN", "V", Decoder::Uint16),
    descriptor(40084, 1, 1, "I_AC_Power", "W", Decoder::Int16),
    descriptor(40086, 1, 1, "I_AC_Frequency", "Hz", Decoder::Uint16),
    descriptor(40088, 1, 1, "I_AC_VA", "VA", Decoder::Int16),
    descriptor(40090, 1, 1, "I_AC_VAR", "VAR", Decoder::Int16),
    descriptor(40092, 1, 1, "I_AC_PF", "%", Decoder::Int16),
    descriptor(40094, 2, 2, "I_AC_Energy_WH", "Wh", Decoder::Acc32),
    descriptor(40097, 1, 1, "I_DC_Current", "A", Decoder::Uint16),
    descriptor(40099, 1, 1, "I_DC_Voltage", "V", Decoder::Uint16),
    descriptor(40101, 1, 1, "I_DC_Power", "W", Decoder::Int16),
    descriptor(40104, 1, 1, "I_Temp_Sink", "C", Decoder::Int16),
];

/// SunSpec field id of the inverter's instantaneous AC power
pub const AC_POWER: u16 = 40084;

/// SunSpec field id of the inverter's lifetime AC energy
pub const AC_ENERGY: u16 = 40094;

/// All descriptors in table order
pub fn descriptors() -> &'static [RegisterDescriptor] {
    DESCRIPTORS
}

/// Find the descriptor for `field_id`; `0` yields the first descriptor
pub fn lookup(field_id: u16) -> Option<&'static RegisterDescriptor> {
    if field_id == 0 {
        return DESCRIPTORS.first();
    }
    DESCRIPTORS.iter().find(|d| d.field_id == field_id)
}

impl RegisterDescriptor {
    /// Decode this field from a full register block
    ///
    /// Returns `None` when the block is too short to hold the value and its
    /// scale word.
    pub fn value(&self, registers: &[u16]) -> Option<f64> {
        let start = usize::from(self.field_id).checked_sub(usize::from(MODBUS_BASE))?;
        let span = self.word_length.max(self.exponent_offset + 1);
        let window = registers.get(start..start + span)?;
        Some(self.decoder.decode(window, self.exponent_offset))
    }
}

/// Decode the field `field_id` from a full register block
pub fn register_value(registers: &[u16], field_id: u16) -> Option<f64> {
    lookup(field_id).and_then(|d| d.value(registers))
}
