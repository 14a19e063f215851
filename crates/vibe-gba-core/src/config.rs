#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
/// What the CPU does when it decodes an instruction the ARM7TDMI does not
/// implement (coprocessor ops, undefined encodings).
pub enum IllegalInstructionPolicy {
    /// Stop execution and report the fault. The machine stays faulted until
    /// [`crate::gba::Machine::reset`].
    #[default]
    Strict,
    /// Log the opcode and carry on as if it were a no-op.
    Compatible,
}

/// Machine-wide knobs that are fixed for the lifetime of a [`crate::gba::Machine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineConfig {
    pub illegal_instruction: IllegalInstructionPolicy,
    /// Value returned by reads that hit no backing region.
    pub open_bus_value: u32,
    /// Start directly at the cartridge entry point even when a BIOS image is
    /// loaded.
    pub skip_bios: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            illegal_instruction: IllegalInstructionPolicy::Strict,
            open_bus_value: 0,
            skip_bios: false,
        }
    }
}

impl MachineConfig {
    pub fn compatible() -> Self {
        Self {
            illegal_instruction: IllegalInstructionPolicy::Compatible,
            ..Self::default()
        }
    }
}
