//! Cartridge mappers
//!
//! A mapper owns the cartridge image plus 8 KiB of work RAM at $6000-$7FFF
//! and reshapes the PRG window ($8000-$FFFF, CPU side) and the CHR window
//! ($0000-$1FFF, PPU side) as the program writes to its registers. Variants
//! are a closed enumeration dispatched by direct matching; the bus never
//! goes through a vtable for a memory access.
//!
//! Every PRG read in $8000-$FFFF resolves to some ROM byte: bank indices
//! are reduced modulo the bank count, so an out-of-range register value
//! mirrors instead of faulting.

use crate::cartridge::{
    mapper_name, mapper_supported, Cartridge, CartridgeError, Mirroring, CHR_BANK_SIZE,
    SAVE_RAM_SIZE,
};
use crate::cpu::{Interrupt, InterruptLine};
use crate::snapshot::{SnapshotError, SnapshotReader, SnapshotWriter};

const PRG_8K: usize = 8 * 1024;
const PRG_16K: usize = 16 * 1024;
const PRG_32K: usize = 32 * 1024;
const CHR_1K: usize = 1024;

/// MMC3 register file, shared by mapper 4 and the mapper 198 derivative.
#[derive(Debug, Clone, Default)]
struct Mmc3 {
    bank_select: u8,
    bank_regs: [u8; 8],
    wram_enabled: bool,
    irq_latch: u8,
    irq_counter: u8,
    irq_reload: bool,
    irq_enabled: bool,
}

/// Jaleco SS8806 register file.
#[derive(Debug, Clone, Default)]
struct Ss8806 {
    prg: [u8; 3],
    chr: [u8; 8],
    wram_enabled: bool,
    irq_reload: u16,
    irq_counter: u16,
    irq_ctrl: u8,
}

impl Ss8806 {
    /// Active counter width selected by the control register.
    fn irq_mask(&self) -> u16 {
        if self.irq_ctrl & 0x08 != 0 {
            0x000F
        } else if self.irq_ctrl & 0x04 != 0 {
            0x00FF
        } else if self.irq_ctrl & 0x02 != 0 {
            0x0FFF
        } else {
            0xFFFF
        }
    }
}

#[derive(Debug, Clone)]
enum Kind {
    Nrom,
    Mmc1 {
        shift: u8,
        control: u8,
        chr0: u8,
        chr1: u8,
        prg: u8,
    },
    Uxrom {
        prg: u8,
    },
    Cnrom {
        chr: u8,
    },
    Mmc3(Mmc3),
    Axrom {
        prg: u8,
    },
    Mmc2 {
        prg: u8,
        chr_fd0: u8,
        chr_fe0: u8,
        chr_fd1: u8,
        chr_fe1: u8,
        latch0_fe: bool,
        latch1_fe: bool,
    },
    ColorDreams {
        reg: u8,
    },
    Ss8806(Ss8806),
    /// MMC3 derivative with 640 KiB PRG space and 4 KiB of extra,
    /// non-backed work RAM at $5000-$5FFF.
    Mapper198 {
        regs: Mmc3,
        wram5: Vec<u8>,
    },
}

/// The active mapper: cartridge image, work RAM and the variant registers.
#[derive(Debug, Clone)]
pub struct Mapper {
    cart: Cartridge,
    kind: Kind,
    mirroring: Mirroring,
    wram: Vec<u8>,
    wram_dirty: bool,
}

impl Mapper {
    /// Instantiate the mapper declared by the cartridge header. Numbers off
    /// the whitelist refuse the load.
    pub fn new(cart: Cartridge) -> Result<Self, CartridgeError> {
        let id = cart.mapper_id();
        if !mapper_supported(id) {
            return Err(CartridgeError::UnsupportedMapper {
                id,
                name: mapper_name(id),
            });
        }
        log::debug!("using mapper {} ({})", id, mapper_name(id));

        let kind = match id {
            0 => Kind::Nrom,
            1 => Kind::Mmc1 {
                shift: 0x10,
                control: 0x0C,
                chr0: 0,
                chr1: 0,
                prg: 0,
            },
            2 => Kind::Uxrom { prg: 0 },
            3 => Kind::Cnrom { chr: 0 },
            4 => Kind::Mmc3(Mmc3::default()),
            7 => Kind::Axrom { prg: 0 },
            9 => Kind::Mmc2 {
                prg: 0,
                chr_fd0: 0,
                chr_fe0: 0,
                chr_fd1: 0,
                chr_fe1: 0,
                latch0_fe: true,
                latch1_fe: true,
            },
            11 => Kind::ColorDreams { reg: 0 },
            18 => Kind::Ss8806(Ss8806::default()),
            198 => Kind::Mapper198 {
                regs: Mmc3::default(),
                wram5: vec![0; 4 * 1024],
            },
            _ => unreachable!("whitelist checked above"),
        };

        let mirroring = cart.mirroring();
        Ok(Self {
            cart,
            kind,
            mirroring,
            wram: vec![0; SAVE_RAM_SIZE],
            wram_dirty: false,
        })
    }

    pub fn cartridge(&self) -> &Cartridge {
        &self.cart
    }

    /// Current nametable arrangement; the bus forwards changes to the PPU.
    pub fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    /// Battery-backed save RAM contents, when the board has one.
    pub fn save_ram(&self) -> Option<&[u8]> {
        self.cart.has_battery().then_some(self.wram.as_slice())
    }

    pub fn load_save_ram(&mut self, data: &[u8]) {
        let n = data.len().min(self.wram.len());
        self.wram[..n].copy_from_slice(&data[..n]);
    }

    /// True when save RAM changed since the last call.
    pub fn take_save_dirty(&mut self) -> bool {
        std::mem::take(&mut self.wram_dirty)
    }

    // ------------------------------------------------------------------
    // Window helpers. All bank indices wrap modulo the bank table.

    fn prg_byte(&self, bank: usize, bank_size: usize, offset: usize) -> u8 {
        let prg = self.cart.prg();
        let banks = (prg.len() / bank_size).max(1);
        // Images smaller than the window mirror instead of faulting.
        prg[((bank % banks) * bank_size + offset) % prg.len()]
    }

    fn prg_banks(&self, bank_size: usize) -> usize {
        (self.cart.prg().len() / bank_size).max(1)
    }

    fn chr_index(&self, bank: usize, bank_size: usize, offset: usize) -> usize {
        let len = self.cart.chr().len();
        let banks = (len / bank_size).max(1);
        ((bank % banks) * bank_size + offset) % len
    }

    fn wram_enabled(&self) -> bool {
        match &self.kind {
            Kind::Mmc3(regs) | Kind::Mapper198 { regs, .. } => regs.wram_enabled,
            Kind::Ss8806(ss) => ss.wram_enabled,
            _ => true,
        }
    }

    // ------------------------------------------------------------------
    // CPU side

    /// Read in $4018-$FFFF. `None` leaves the bus to supply its open-bus
    /// value.
    pub fn cpu_read(&mut self, addr: u16) -> Option<u8> {
        match addr {
            0x5000..=0x5FFF => {
                if let Kind::Mapper198 { wram5, .. } = &self.kind {
                    Some(wram5[(addr & 0x0FFF) as usize])
                } else {
                    None
                }
            }
            0x6000..=0x7FFF => self
                .wram_enabled()
                .then(|| self.wram[(addr & 0x1FFF) as usize]),
            0x8000..=0xFFFF => Some(self.prg_read(addr)),
            _ => None,
        }
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x5000..=0x5FFF => {
                if let Kind::Mapper198 { wram5, .. } = &mut self.kind {
                    wram5[(addr & 0x0FFF) as usize] = value;
                }
            }
            0x6000..=0x7FFF => {
                if self.wram_enabled() {
                    self.wram[(addr & 0x1FFF) as usize] = value;
                    if self.cart.has_battery() {
                        self.wram_dirty = true;
                    }
                }
            }
            0x8000..=0xFFFF => self.register_write(addr, value),
            _ => {}
        }
    }

    fn prg_read(&self, addr: u16) -> u8 {
        let a = addr as usize;
        match &self.kind {
            Kind::Nrom | Kind::Cnrom { .. } => {
                // 16 KiB boards mirror into the upper half.
                let prg = self.cart.prg();
                prg[(a - 0x8000) % prg.len()]
            }
            Kind::Mmc1 {
                control, prg: bank, ..
            } => {
                let bank = *bank as usize;
                let offset = a & 0x3FFF;
                match (control >> 2) & 0x03 {
                    0 | 1 => self.prg_byte(bank >> 1, PRG_32K, a & 0x7FFF),
                    2 => {
                        if addr < 0xC000 {
                            self.prg_byte(0, PRG_16K, offset)
                        } else {
                            self.prg_byte(bank, PRG_16K, offset)
                        }
                    }
                    _ => {
                        if addr < 0xC000 {
                            self.prg_byte(bank, PRG_16K, offset)
                        } else {
                            self.prg_byte(self.prg_banks(PRG_16K) - 1, PRG_16K, offset)
                        }
                    }
                }
            }
            Kind::Uxrom { prg } => {
                if addr < 0xC000 {
                    self.prg_byte(*prg as usize, PRG_16K, a & 0x3FFF)
                } else {
                    self.prg_byte(self.prg_banks(PRG_16K) - 1, PRG_16K, a & 0x3FFF)
                }
            }
            Kind::Mmc3(regs) | Kind::Mapper198 { regs, .. } => {
                let banks = self.prg_banks(PRG_8K);
                let swap = regs.bank_select & 0x40 != 0;
                let bank = match addr {
                    0x8000..=0x9FFF if !swap => regs.bank_regs[6] as usize,
                    0x8000..=0x9FFF => banks - 2,
                    0xA000..=0xBFFF => regs.bank_regs[7] as usize,
                    0xC000..=0xDFFF if swap => regs.bank_regs[6] as usize,
                    0xC000..=0xDFFF => banks - 2,
                    _ => banks - 1,
                };
                self.prg_byte(bank, PRG_8K, a & 0x1FFF)
            }
            Kind::Axrom { prg } => self.prg_byte(*prg as usize, PRG_32K, a & 0x7FFF),
            Kind::ColorDreams { reg } => {
                self.prg_byte((reg & 0x03) as usize, PRG_32K, a & 0x7FFF)
            }
            Kind::Mmc2 { prg, .. } => {
                let banks = self.prg_banks(PRG_8K);
                let bank = match addr {
                    0x8000..=0x9FFF => (*prg & 0x0F) as usize,
                    0xA000..=0xBFFF => banks - 3,
                    0xC000..=0xDFFF => banks - 2,
                    _ => banks - 1,
                };
                self.prg_byte(bank, PRG_8K, a & 0x1FFF)
            }
            Kind::Ss8806(ss) => {
                let bank = match addr {
                    0x8000..=0x9FFF => ss.prg[0] as usize,
                    0xA000..=0xBFFF => ss.prg[1] as usize,
                    0xC000..=0xDFFF => ss.prg[2] as usize,
                    _ => self.prg_banks(PRG_8K) - 1,
                };
                self.prg_byte(bank, PRG_8K, a & 0x1FFF)
            }
        }
    }

    fn register_write(&mut self, addr: u16, value: u8) {
        match &mut self.kind {
            Kind::Nrom => {}
            Kind::Mmc1 {
                shift,
                control,
                chr0,
                chr1,
                prg,
            } => {
                if value & 0x80 != 0 {
                    *shift = 0x10;
                    *control |= 0x0C;
                } else {
                    let commit = *shift & 0x01 != 0;
                    *shift = (*shift >> 1) | ((value & 0x01) << 4);
                    if commit {
                        let data = *shift;
                        match (addr >> 13) & 0x03 {
                            0 => *control = data,
                            1 => *chr0 = data,
                            2 => *chr1 = data,
                            _ => *prg = data & 0x0F,
                        }
                        *shift = 0x10;
                    }
                }
                let control = *control;
                self.mirroring = match control & 0x03 {
                    0 => Mirroring::SingleScreen0,
                    1 => Mirroring::SingleScreen1,
                    2 => Mirroring::Vertical,
                    _ => Mirroring::Horizontal,
                };
            }
            Kind::Uxrom { prg } => *prg = value & 0x0F,
            Kind::Cnrom { chr } => *chr = value & 0x03,
            Kind::Mmc3(regs) | Kind::Mapper198 { regs, .. } => {
                let four_screen = self.mirroring == Mirroring::FourScreen;
                match addr & 0xE001 {
                    0x8000 => regs.bank_select = value,
                    0x8001 => {
                        let slot = (regs.bank_select & 0x07) as usize;
                        // The two 2 KiB CHR slots ignore the low bank bit.
                        regs.bank_regs[slot] = if slot <= 1 { value & 0xFE } else { value };
                    }
                    0xA000 => {
                        if !four_screen {
                            self.mirroring = if value & 0x01 == 0 {
                                Mirroring::Vertical
                            } else {
                                Mirroring::Horizontal
                            };
                        }
                    }
                    0xA001 => regs.wram_enabled = value & 0x80 != 0,
                    0xC000 => regs.irq_latch = value,
                    0xC001 => regs.irq_reload = true,
                    0xE000 => regs.irq_enabled = false,
                    _ => regs.irq_enabled = true,
                }
            }
            Kind::Axrom { prg } => {
                *prg = value & 0x07;
                self.mirroring = if value & 0x10 != 0 {
                    Mirroring::SingleScreen1
                } else {
                    Mirroring::SingleScreen0
                };
            }
            Kind::Mmc2 {
                prg,
                chr_fd0,
                chr_fe0,
                chr_fd1,
                chr_fe1,
                ..
            } => match addr & 0xF000 {
                0xA000 => *prg = value & 0x0F,
                0xB000 => *chr_fd0 = value & 0x1F,
                0xC000 => *chr_fe0 = value & 0x1F,
                0xD000 => *chr_fd1 = value & 0x1F,
                0xE000 => *chr_fe1 = value & 0x1F,
                0xF000 => {
                    self.mirroring = if value & 0x01 == 0 {
                        Mirroring::Vertical
                    } else {
                        Mirroring::Horizontal
                    };
                }
                _ => {}
            },
            Kind::ColorDreams { reg } => *reg = value,
            Kind::Ss8806(ss) => {
                // Every SS8806 register takes one nibble at a time.
                let v = value & 0x0F;
                match addr & 0xF003 {
                    0x8000 => ss.prg[0] = (ss.prg[0] & 0xF0) | v,
                    0x8001 => ss.prg[0] = (ss.prg[0] & 0x0F) | (v << 4),
                    0x8002 => ss.prg[1] = (ss.prg[1] & 0xF0) | v,
                    0x8003 => ss.prg[1] = (ss.prg[1] & 0x0F) | (v << 4),
                    0x9000 => ss.prg[2] = (ss.prg[2] & 0xF0) | v,
                    0x9001 => ss.prg[2] = (ss.prg[2] & 0x0F) | (v << 4),
                    0x9002 => ss.wram_enabled = value & 0x03 != 0,
                    reg @ 0xA000..=0xD003 => {
                        let slot = ((reg >> 12) as usize - 0xA) * 2 + ((reg & 0x03) as usize >> 1);
                        let cur = ss.chr[slot];
                        ss.chr[slot] = if reg & 0x01 == 0 {
                            (cur & 0xF0) | v
                        } else {
                            (cur & 0x0F) | (v << 4)
                        };
                    }
                    0xE000 => ss.irq_reload = (ss.irq_reload & 0xFFF0) | v as u16,
                    0xE001 => ss.irq_reload = (ss.irq_reload & 0xFF0F) | ((v as u16) << 4),
                    0xE002 => ss.irq_reload = (ss.irq_reload & 0xF0FF) | ((v as u16) << 8),
                    0xE003 => ss.irq_reload = (ss.irq_reload & 0x0FFF) | ((v as u16) << 12),
                    0xF000 => ss.irq_counter = ss.irq_reload,
                    0xF001 => ss.irq_ctrl = value & 0x0F,
                    0xF002 => {
                        self.mirroring = match value & 0x03 {
                            0 => Mirroring::Horizontal,
                            1 => Mirroring::Vertical,
                            2 => Mirroring::SingleScreen0,
                            _ => Mirroring::SingleScreen1,
                        };
                    }
                    _ => {}
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // PPU side

    pub fn ppu_read(&mut self, addr: u16) -> u8 {
        let idx = self.chr_map(addr & 0x1FFF);
        let value = self.cart.chr()[idx];
        self.mmc2_latch(addr & 0x1FFF);
        value
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8) {
        if self.cart.chr_is_ram() {
            let idx = self.chr_map(addr & 0x1FFF);
            self.cart.chr_mut()[idx] = value;
        }
    }

    fn chr_map(&self, addr: u16) -> usize {
        let a = addr as usize;
        match &self.kind {
            Kind::Nrom | Kind::Uxrom { .. } | Kind::Axrom { .. } => a % self.cart.chr().len(),
            Kind::Ss8806(ss) => self.chr_index(ss.chr[a / CHR_1K] as usize, CHR_1K, a & 0x03FF),
            Kind::Cnrom { chr } => self.chr_index(*chr as usize, 2 * CHR_BANK_SIZE, a),
            Kind::Mmc1 {
                control,
                chr0,
                chr1,
                ..
            } => {
                if control & 0x10 == 0 {
                    self.chr_index((chr0 & 0x1E) as usize >> 1, 2 * CHR_BANK_SIZE, a)
                } else if a < CHR_BANK_SIZE {
                    self.chr_index(*chr0 as usize, CHR_BANK_SIZE, a)
                } else {
                    self.chr_index(*chr1 as usize, CHR_BANK_SIZE, a - CHR_BANK_SIZE)
                }
            }
            Kind::Mmc3(regs) | Kind::Mapper198 { regs, .. } => {
                let r = &regs.bank_regs;
                let slots = if regs.bank_select & 0x80 == 0 {
                    [
                        r[0] & 0xFE,
                        (r[0] & 0xFE) + 1,
                        r[1] & 0xFE,
                        (r[1] & 0xFE) + 1,
                        r[2],
                        r[3],
                        r[4],
                        r[5],
                    ]
                } else {
                    [
                        r[2],
                        r[3],
                        r[4],
                        r[5],
                        r[0] & 0xFE,
                        (r[0] & 0xFE) + 1,
                        r[1] & 0xFE,
                        (r[1] & 0xFE) + 1,
                    ]
                };
                self.chr_index(slots[a / CHR_1K] as usize, CHR_1K, a & 0x03FF)
            }
            Kind::Mmc2 {
                chr_fd0,
                chr_fe0,
                chr_fd1,
                chr_fe1,
                latch0_fe,
                latch1_fe,
                ..
            } => {
                let bank = if a < CHR_BANK_SIZE {
                    if *latch0_fe {
                        *chr_fe0
                    } else {
                        *chr_fd0
                    }
                } else if *latch1_fe {
                    *chr_fe1
                } else {
                    *chr_fd1
                };
                self.chr_index(bank as usize, CHR_BANK_SIZE, a & 0x0FFF)
            }
            Kind::ColorDreams { reg } => self.chr_index((reg >> 4) as usize, 2 * CHR_BANK_SIZE, a),
        }
    }

    /// MMC2 tile latches flip after the PPU fetches the trigger tiles.
    fn mmc2_latch(&mut self, addr: u16) {
        if let Kind::Mmc2 {
            latch0_fe,
            latch1_fe,
            ..
        } = &mut self.kind
        {
            match addr {
                0x0FD8 => *latch0_fe = false,
                0x0FE8 => *latch0_fe = true,
                0x1FD8..=0x1FDF => *latch1_fe = false,
                0x1FE8..=0x1FEF => *latch1_fe = true,
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Scanline clocking

    /// Clock the scanline counter once. Mappers with an IRQ counter may
    /// assert the maskable interrupt line here.
    pub fn on_scanline(&mut self, _scanline: u16, irq: &mut InterruptLine) {
        match &mut self.kind {
            Kind::Mmc3(regs) | Kind::Mapper198 { regs, .. } => {
                if regs.irq_counter == 0 || regs.irq_reload {
                    regs.irq_counter = regs.irq_latch;
                    regs.irq_reload = false;
                } else {
                    regs.irq_counter -= 1;
                    if regs.irq_counter == 0 && regs.irq_enabled {
                        irq.request(Interrupt::Maskable);
                    }
                }
            }
            Kind::Ss8806(ss) => {
                // The board counts CPU cycles; one NTSC scanline is ~114 of
                // them, which is close enough for the games on this mapper.
                if ss.irq_ctrl & 0x01 != 0 {
                    let mask = ss.irq_mask();
                    let count = ss.irq_counter & mask;
                    if count <= 114 {
                        ss.irq_counter = (ss.irq_counter & !mask) | (ss.irq_reload & mask);
                        irq.request(Interrupt::Maskable);
                    } else {
                        ss.irq_counter = (ss.irq_counter & !mask) | (count - 114);
                    }
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Snapshots

    pub fn save_state(&self, w: &mut SnapshotWriter) {
        w.put_u8(1);
        match &self.kind {
            Kind::Nrom => {}
            Kind::Mmc1 {
                shift,
                control,
                chr0,
                chr1,
                prg,
            } => {
                w.put_u8(*shift);
                w.put_u8(*control);
                w.put_u8(*chr0);
                w.put_u8(*chr1);
                w.put_u8(*prg);
            }
            Kind::Uxrom { prg } => w.put_u8(*prg),
            Kind::Cnrom { chr } => w.put_u8(*chr),
            Kind::Mmc3(regs) => save_mmc3(w, regs),
            Kind::Axrom { prg } => w.put_u8(*prg),
            Kind::Mmc2 {
                prg,
                chr_fd0,
                chr_fe0,
                chr_fd1,
                chr_fe1,
                latch0_fe,
                latch1_fe,
            } => {
                w.put_u8(*prg);
                w.put_u8(*chr_fd0);
                w.put_u8(*chr_fe0);
                w.put_u8(*chr_fd1);
                w.put_u8(*chr_fe1);
                w.put_u8(*latch0_fe as u8);
                w.put_u8(*latch1_fe as u8);
            }
            Kind::ColorDreams { reg } => w.put_u8(*reg),
            Kind::Ss8806(ss) => {
                for b in ss.prg {
                    w.put_u8(b);
                }
                for b in ss.chr {
                    w.put_u8(b);
                }
                w.put_u8(ss.wram_enabled as u8);
                w.put_u32(ss.irq_reload as u32);
                w.put_u32(ss.irq_counter as u32);
                w.put_u8(ss.irq_ctrl);
            }
            Kind::Mapper198 { regs, wram5 } => {
                save_mmc3(w, regs);
                w.put_bytes(wram5);
            }
        }
        w.put_u8(mirroring_tag(self.mirroring));
        w.put_bytes(&self.wram);
        if self.cart.chr_is_ram() {
            w.put_bytes(self.cart.chr());
        }
    }

    pub fn load_state(&mut self, r: &mut SnapshotReader) -> Result<(), SnapshotError> {
        let version = r.get_u8()?;
        if version != 1 {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        match &mut self.kind {
            Kind::Nrom => {}
            Kind::Mmc1 {
                shift,
                control,
                chr0,
                chr1,
                prg,
            } => {
                *shift = r.get_u8()?;
                *control = r.get_u8()?;
                *chr0 = r.get_u8()?;
                *chr1 = r.get_u8()?;
                *prg = r.get_u8()?;
            }
            Kind::Uxrom { prg } => *prg = r.get_u8()?,
            Kind::Cnrom { chr } => *chr = r.get_u8()?,
            Kind::Mmc3(regs) => load_mmc3(r, regs)?,
            Kind::Axrom { prg } => *prg = r.get_u8()?,
            Kind::Mmc2 {
                prg,
                chr_fd0,
                chr_fe0,
                chr_fd1,
                chr_fe1,
                latch0_fe,
                latch1_fe,
            } => {
                *prg = r.get_u8()?;
                *chr_fd0 = r.get_u8()?;
                *chr_fe0 = r.get_u8()?;
                *chr_fd1 = r.get_u8()?;
                *chr_fe1 = r.get_u8()?;
                *latch0_fe = r.get_u8()? != 0;
                *latch1_fe = r.get_u8()? != 0;
            }
            Kind::ColorDreams { reg } => *reg = r.get_u8()?,
            Kind::Ss8806(ss) => {
                for b in &mut ss.prg {
                    *b = r.get_u8()?;
                }
                for b in &mut ss.chr {
                    *b = r.get_u8()?;
                }
                ss.wram_enabled = r.get_u8()? != 0;
                ss.irq_reload = r.get_u32()? as u16;
                ss.irq_counter = r.get_u32()? as u16;
                ss.irq_ctrl = r.get_u8()?;
            }
            Kind::Mapper198 { regs, wram5 } => {
                load_mmc3(r, regs)?;
                let len = wram5.len();
                wram5.copy_from_slice(r.get_bytes(len)?);
            }
        }
        self.mirroring = mirroring_from_tag(r.get_u8()?)?;
        let len = self.wram.len();
        self.wram.copy_from_slice(r.get_bytes(len)?);
        if self.cart.chr_is_ram() {
            let len = self.cart.chr().len();
            let data = r.get_bytes(len)?.to_vec();
            self.cart.chr_mut().copy_from_slice(&data);
        }
        Ok(())
    }
}

fn save_mmc3(w: &mut SnapshotWriter, regs: &Mmc3) {
    w.put_u8(regs.bank_select);
    for b in regs.bank_regs {
        w.put_u8(b);
    }
    w.put_u8(regs.wram_enabled as u8);
    w.put_u8(regs.irq_latch);
    w.put_u8(regs.irq_counter);
    w.put_u8(regs.irq_reload as u8);
    w.put_u8(regs.irq_enabled as u8);
}

fn load_mmc3(r: &mut SnapshotReader, regs: &mut Mmc3) -> Result<(), SnapshotError> {
    regs.bank_select = r.get_u8()?;
    for b in &mut regs.bank_regs {
        *b = r.get_u8()?;
    }
    regs.wram_enabled = r.get_u8()? != 0;
    regs.irq_latch = r.get_u8()?;
    regs.irq_counter = r.get_u8()?;
    regs.irq_reload = r.get_u8()? != 0;
    regs.irq_enabled = r.get_u8()? != 0;
    Ok(())
}

fn mirroring_tag(m: Mirroring) -> u8 {
    match m {
        Mirroring::Horizontal => 0,
        Mirroring::Vertical => 1,
        Mirroring::FourScreen => 2,
        Mirroring::SingleScreen0 => 3,
        Mirroring::SingleScreen1 => 4,
    }
}

fn mirroring_from_tag(tag: u8) -> Result<Mirroring, SnapshotError> {
    Ok(match tag {
        0 => Mirroring::Horizontal,
        1 => Mirroring::Vertical,
        2 => Mirroring::FourScreen,
        3 => Mirroring::SingleScreen0,
        4 => Mirroring::SingleScreen1,
        _ => return Err(SnapshotError::Corrupt),
    })
}
