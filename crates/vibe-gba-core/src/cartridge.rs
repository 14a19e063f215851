use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::backup::{Backup, Eeprom, Flash, SRAM_SIZE};

/// Smallest image that still holds a complete header (0x00-0xBF).
pub const MIN_ROM_SIZE: usize = 0xC0;
pub const MAX_ROM_SIZE: usize = 0x200_0000;
pub const BIOS_SIZE: usize = 0x4000;

const HEADER_TITLE: std::ops::Range<usize> = 0xA0..0xAC;
const HEADER_GAME_CODE: std::ops::Range<usize> = 0xAC..0xB0;
const HEADER_FIXED_OFFSET: usize = 0xB2;
const HEADER_FIXED_VALUE: u8 = 0x96;
const HEADER_CHECKSUM_OFFSET: usize = 0xBD;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("image is {len} bytes, smaller than the 192-byte header")]
    TooSmall { len: usize },

    #[error("image is {len} bytes, larger than the 32 MiB cartridge window")]
    TooLarge { len: usize },

    #[error("invalid cartridge header: {0}")]
    InvalidHeader(&'static str),

    #[error("BIOS image must be exactly 16384 bytes, got {len}")]
    BiosSize { len: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveType {
    None,
    Sram,
    Flash64K,
    Flash128K,
    Eeprom,
}

impl SaveType {
    /// Detect the backup chip from the library ID strings Nintendo's SDK
    /// links into the ROM.
    pub fn detect(rom: &[u8]) -> Self {
        const IDS: [(&[u8], SaveType); 5] = [
            (b"EEPROM_V", SaveType::Eeprom),
            (b"SRAM_V", SaveType::Sram),
            (b"FLASH1M_V", SaveType::Flash128K),
            (b"FLASH512_V", SaveType::Flash64K),
            (b"FLASH_V", SaveType::Flash64K),
        ];
        for (id, kind) in IDS {
            if rom.windows(id.len()).any(|w| w == id) {
                return kind;
            }
        }
        SaveType::None
    }

    pub fn new_backup(self) -> Backup {
        match self {
            SaveType::None => Backup::None,
            SaveType::Sram => Backup::Sram(vec![0xFF; SRAM_SIZE]),
            SaveType::Flash64K => Backup::Flash(Flash::new(1)),
            SaveType::Flash128K => Backup::Flash(Flash::new(2)),
            SaveType::Eeprom => Backup::Eeprom(Eeprom::new()),
        }
    }
}

#[derive(Debug)]
pub struct Cartridge {
    pub rom: Vec<u8>,
    pub title: String,
    pub game_code: String,
    pub save_type: SaveType,
    pub backup: Backup,
    save_path: Option<PathBuf>,
}

impl Cartridge {
    pub fn load(data: Vec<u8>) -> Result<Self, LoadError> {
        if data.len() < MIN_ROM_SIZE {
            return Err(LoadError::TooSmall { len: data.len() });
        }
        if data.len() > MAX_ROM_SIZE {
            return Err(LoadError::TooLarge { len: data.len() });
        }
        let header = Header::parse(&data);
        if !header.has_fixed_byte() {
            return Err(LoadError::InvalidHeader("missing fixed value 0x96 at 0xB2"));
        }
        if !header.checksum_ok() {
            log::warn!(
                "header checksum mismatch (stored {:02X}, computed {:02X})",
                header.stored_checksum(),
                header.computed_checksum()
            );
        }

        let save_type = SaveType::detect(&data);
        let title = header.title();
        let game_code = header.game_code();
        log::info!("Loaded ROM: {title} [{game_code}] (save: {save_type:?})");

        Ok(Self {
            rom: data,
            title,
            game_code,
            save_type,
            backup: save_type.new_backup(),
            save_path: None,
        })
    }

    /// Load a ROM and, when the cartridge has backup memory, the battery
    /// save that sits next to it (`game.gba` -> `game.sav`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let data = fs::read(&path)?;
        let mut cart = Self::load(data)?;

        if cart.save_type != SaveType::None {
            let save = path.as_ref().with_extension("sav");
            if let Ok(bytes) = fs::read(&save) {
                cart.backup.load_persisted(&bytes);
                log::info!("Loaded battery save {}", save.display());
            }
            cart.save_path = Some(save);
        }
        Ok(cart)
    }

    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }

    pub fn save_backup(&self) -> io::Result<()> {
        if let Some(path) = &self.save_path {
            let bytes = self.backup.persisted();
            if !bytes.is_empty() {
                fs::write(path, bytes)?;
            }
        }
        Ok(())
    }

    /// Halfword read inside the 32 MiB ROM window. Past the end of the image
    /// the game pak bus returns the low address bits.
    #[inline]
    pub fn read_rom16(&self, offset: u32) -> u16 {
        let offset = (offset & 0x01FF_FFFE) as usize;
        match self.rom.get(offset..offset + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => (offset >> 1) as u16,
        }
    }

    /// EEPROM is selected for the upper window on 32 MiB carts and for the
    /// whole 0x0D window otherwise.
    pub fn eeprom_selected(&self, addr: u32) -> bool {
        if !self.backup.is_eeprom() || addr >> 24 != 0x0D {
            return false;
        }
        self.rom.len() <= 0x100_0000 || addr >= 0x0DFF_FF00
    }
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn ascii(&self, range: std::ops::Range<usize>) -> String {
        let mut slice = &self.data[range];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn title(&self) -> String {
        self.ascii(HEADER_TITLE)
    }

    fn game_code(&self) -> String {
        self.ascii(HEADER_GAME_CODE)
    }

    fn has_fixed_byte(&self) -> bool {
        self.data[HEADER_FIXED_OFFSET] == HEADER_FIXED_VALUE
    }

    fn stored_checksum(&self) -> u8 {
        self.data[HEADER_CHECKSUM_OFFSET]
    }

    fn computed_checksum(&self) -> u8 {
        self.data[0xA0..0xBD]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_sub(b))
            .wrapping_sub(0x19)
    }

    fn checksum_ok(&self) -> bool {
        self.stored_checksum() == self.computed_checksum()
    }
}
