//! Cartridge backup memory: battery SRAM, Flash and serial EEPROM.

pub const SRAM_SIZE: usize = 0x8000;
pub const FLASH_BANK_SIZE: usize = 0x1_0000;
pub const EEPROM_SIZE: usize = 0x2000;
const EEPROM_SMALL_SIZE: usize = 0x200;
/// Bits shifted out per EEPROM read: 4 dummy bits then 64 data bits.
pub const EEPROM_READ_BITS: u32 = 68;

// Device IDs reported in Flash ID mode (manufacturer, device).
const FLASH64_ID: [u8; 2] = [0x32, 0x1B]; // Panasonic MN63F805MNP
const FLASH128_ID: [u8; 2] = [0x62, 0x13]; // Sanyo LE26FV10N1TS

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FlashMode {
    #[default]
    Ready,
    /// Saw AA at 5555.
    Command1,
    /// Saw 55 at 2AAA; next write is the command byte.
    Command2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flash {
    pub data: Vec<u8>,
    pub mode: FlashMode,
    pub id_mode: bool,
    pub erase_armed: bool,
    pub write_next: bool,
    pub bank_next: bool,
    pub bank: u8,
}

impl Flash {
    pub fn new(banks: usize) -> Self {
        Self {
            data: vec![0xFF; FLASH_BANK_SIZE * banks],
            mode: FlashMode::Ready,
            id_mode: false,
            erase_armed: false,
            write_next: false,
            bank_next: false,
            bank: 0,
        }
    }

    pub(crate) fn banks(&self) -> usize {
        self.data.len() / FLASH_BANK_SIZE
    }

    fn offset(&self, addr: u16) -> usize {
        self.bank as usize * FLASH_BANK_SIZE + addr as usize
    }

    pub fn read(&self, addr: u16) -> u8 {
        if self.id_mode && addr < 2 {
            let id = if self.banks() > 1 {
                FLASH128_ID
            } else {
                FLASH64_ID
            };
            return id[addr as usize];
        }
        self.data.get(self.offset(addr)).copied().unwrap_or(0xFF)
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        if self.write_next {
            self.write_next = false;
            let offset = self.offset(addr);
            if let Some(byte) = self.data.get_mut(offset) {
                *byte = val;
            }
            return;
        }
        if self.bank_next {
            self.bank_next = false;
            if addr == 0 {
                self.bank = val & (self.banks() as u8 - 1);
            }
            return;
        }

        match self.mode {
            FlashMode::Ready => {
                if addr == 0x5555 && val == 0xAA {
                    self.mode = FlashMode::Command1;
                } else if val == 0xF0 {
                    self.id_mode = false;
                }
            }
            FlashMode::Command1 => {
                self.mode = if addr == 0x2AAA && val == 0x55 {
                    FlashMode::Command2
                } else {
                    FlashMode::Ready
                };
            }
            FlashMode::Command2 => {
                self.mode = FlashMode::Ready;
                if self.erase_armed {
                    self.erase_armed = false;
                    if addr == 0x5555 && val == 0x10 {
                        self.data.fill(0xFF);
                    } else if val == 0x30 {
                        let start = self.offset(addr & 0xF000);
                        let end = (start + 0x1000).min(self.data.len());
                        self.data[start..end].fill(0xFF);
                    }
                    return;
                }
                if addr != 0x5555 {
                    return;
                }
                match val {
                    0x90 => self.id_mode = true,
                    0xF0 => self.id_mode = false,
                    0x80 => self.erase_armed = true,
                    0xA0 => self.write_next = true,
                    0xB0 if self.banks() > 1 => self.bank_next = true,
                    _ => log::debug!("unknown flash command {val:02X}"),
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EepromState {
    #[default]
    Idle,
    /// Collecting a command from the serial stream.
    Receiving,
    /// Shifting out 4 dummy bits then 64 data bits.
    Reading { pos: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Eeprom {
    pub data: Vec<u8>,
    pub state: EepromState,
    /// 6 (512 byte part) or 14 (8 KiB part); learned from the first DMA.
    pub addr_bits: Option<u32>,
    pub buffer: u128,
    pub received: u32,
    pub read_addr: u32,
}

impl Eeprom {
    pub fn new() -> Self {
        Self {
            data: vec![0xFF; EEPROM_SIZE],
            state: EepromState::Idle,
            addr_bits: None,
            buffer: 0,
            received: 0,
            read_addr: 0,
        }
    }

    /// Guess the address width from the DMA length used to talk to the chip.
    pub fn hint_transfer_len(&mut self, units: u32) {
        if self.addr_bits.is_some() {
            return;
        }
        self.addr_bits = match units {
            9 | 73 => Some(6),
            17 | 81 => Some(14),
            _ => None,
        };
        if let Some(bits) = self.addr_bits {
            log::debug!("EEPROM uses {bits}-bit addressing");
        }
    }

    fn addr_bits(&self) -> u32 {
        self.addr_bits.unwrap_or(14)
    }

    /// Length of a write request, the longest command the chip accepts.
    pub(crate) fn longest_command(&self) -> u32 {
        2 + self.addr_bits() + 64 + 1
    }

    fn block_offset(&self, addr: u32) -> usize {
        let blocks = if self.addr_bits() == 6 { 0x40 } else { 0x400 };
        (addr as usize & (blocks - 1)) * 8
    }

    /// Bytes that belong in a battery save file.
    pub fn persisted(&self) -> &[u8] {
        if self.addr_bits == Some(6) {
            &self.data[..EEPROM_SMALL_SIZE]
        } else {
            &self.data
        }
    }

    pub fn load_persisted(&mut self, bytes: &[u8]) {
        if bytes.len() == EEPROM_SMALL_SIZE {
            self.addr_bits = Some(6);
        }
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn read_bit(&mut self) -> u16 {
        match self.state {
            EepromState::Reading { pos } => {
                let bit = if pos < 4 {
                    0
                } else {
                    let n = pos - 4;
                    let byte = self.data[self.block_offset(self.read_addr) + (n / 8) as usize];
                    (byte >> (7 - n % 8)) as u16 & 1
                };
                self.state = if pos + 1 >= EEPROM_READ_BITS {
                    EepromState::Idle
                } else {
                    EepromState::Reading { pos: pos + 1 }
                };
                bit
            }
            // Ready.
            _ => 1,
        }
    }

    pub fn write_bit(&mut self, value: u16) {
        if !matches!(self.state, EepromState::Receiving) {
            self.state = EepromState::Receiving;
            self.buffer = 0;
            self.received = 0;
        }
        self.buffer = (self.buffer << 1) | (value & 1) as u128;
        self.received += 1;

        if self.received < 2 {
            return;
        }
        let addr_bits = self.addr_bits();
        let command = (self.buffer >> (self.received - 2)) & 0b11;
        match command {
            0b11 if self.received == 2 + addr_bits + 1 => {
                self.read_addr = ((self.buffer >> 1) & ((1 << addr_bits) - 1)) as u32;
                self.state = EepromState::Reading { pos: 0 };
            }
            0b10 if self.received == 2 + addr_bits + 64 + 1 => {
                let addr = ((self.buffer >> 65) & ((1 << addr_bits) - 1)) as u32;
                let payload = (self.buffer >> 1) as u64;
                let offset = self.block_offset(addr);
                self.data[offset..offset + 8].copy_from_slice(&payload.to_be_bytes());
                self.state = EepromState::Idle;
            }
            0b00 | 0b01 => {
                log::debug!("EEPROM: ignoring unknown command bits");
                self.state = EepromState::Idle;
            }
            _ if self.received >= self.longest_command() => {
                log::debug!("EEPROM: dropping overlong command");
                self.state = EepromState::Idle;
            }
            _ => {}
        }
    }
}

impl Default for Eeprom {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backup {
    None,
    Sram(Vec<u8>),
    Flash(Flash),
    Eeprom(Eeprom),
}

impl Backup {
    /// Raw bytes of the backing store.
    pub fn storage(&self) -> &[u8] {
        match self {
            Backup::None => &[],
            Backup::Sram(data) => data,
            Backup::Flash(flash) => &flash.data,
            Backup::Eeprom(eeprom) => &eeprom.data,
        }
    }

    /// Bytes written to a `.sav` file.
    pub fn persisted(&self) -> &[u8] {
        match self {
            Backup::Eeprom(eeprom) => eeprom.persisted(),
            other => other.storage(),
        }
    }

    pub fn load_persisted(&mut self, bytes: &[u8]) {
        match self {
            Backup::None => {}
            Backup::Sram(data) => {
                let n = bytes.len().min(data.len());
                data[..n].copy_from_slice(&bytes[..n]);
            }
            Backup::Flash(flash) => {
                let n = bytes.len().min(flash.data.len());
                flash.data[..n].copy_from_slice(&bytes[..n]);
            }
            Backup::Eeprom(eeprom) => eeprom.load_persisted(bytes),
        }
    }

    /// Byte access in the 0x0E00_0000 window.
    pub fn read_sram_window(&self, addr: u32) -> Option<u8> {
        match self {
            Backup::Sram(data) => Some(data[addr as usize & (SRAM_SIZE - 1)]),
            Backup::Flash(flash) => Some(flash.read(addr as u16)),
            _ => None,
        }
    }

    pub fn write_sram_window(&mut self, addr: u32, val: u8) {
        match self {
            Backup::Sram(data) => data[addr as usize & (SRAM_SIZE - 1)] = val,
            Backup::Flash(flash) => flash.write(addr as u16, val),
            _ => {}
        }
    }

    pub fn is_eeprom(&self) -> bool {
        matches!(self, Backup::Eeprom(_))
    }
}
