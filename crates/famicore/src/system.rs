//! Machine integration and the frame driver
//!
//! [`Machine`] owns the CPU and the bus and runs the single-threaded
//! cooperative loop: one instruction, then the peripherals catch up on the
//! cycles it took. The loop has no suspension points inside an instruction;
//! cancellation is observed between frames only.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::apu::AudioUnit;
use crate::bus::Bus;
use crate::cartridge::{to_hex, Cartridge, CartridgeError};
use crate::cpu::{Cpu, Interrupt};
use crate::input::ControllerPort;
use crate::mapper::Mapper;
use crate::ppu::VideoUnit;
use crate::snapshot::{SnapshotError, SnapshotReader, SnapshotWriter};

/// How a frame run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The picture unit reported a complete frame
    Complete,
    /// The CPU hit an unofficial opcode and latched its crash flag
    Crashed,
    /// The host's stop flag was observed between frames
    Stopped,
}

/// A complete emulated console.
pub struct Machine {
    cpu: Cpu,
    bus: Bus,
    pal: bool,
    /// Counts instructions toward the next PAL stretch cycle
    pal_counter: u8,
    frame_count: u64,
    save_failed: bool,
}

impl Machine {
    pub fn new() -> Self {
        Self::with_bus(Bus::new())
    }

    /// Wire in host-provided picture, audio and input units.
    pub fn with_collaborators(
        ppu: Box<dyn VideoUnit>,
        apu: Box<dyn AudioUnit>,
        input: Box<dyn ControllerPort>,
    ) -> Self {
        Self::with_bus(Bus::with_collaborators(ppu, apu, input))
    }

    fn with_bus(bus: Bus) -> Self {
        Self {
            cpu: Cpu::new(),
            bus,
            pal: false,
            pal_counter: 0,
            frame_count: 0,
            save_failed: false,
        }
    }

    /// Parse an iNES image, build its mapper and attach it. Fails without
    /// touching machine state when the image or mapper is unusable.
    pub fn load_rom(&mut self, data: &[u8]) -> Result<(), CartridgeError> {
        let cart = Cartridge::from_ines(data)?;
        let mapper = Mapper::new(cart)?;
        self.bus.attach_mapper(mapper);
        Ok(())
    }

    /// Restore battery RAM saved by an earlier session.
    pub fn load_save_ram(&mut self, data: &[u8]) {
        if let Some(mapper) = self.bus.mapper_mut() {
            mapper.load_save_ram(data);
        }
    }

    pub fn set_pal(&mut self, pal: bool) {
        self.pal = pal;
    }

    pub fn reset(&mut self) {
        self.cpu.reset(&mut self.bus);
        self.pal_counter = 0;
        self.frame_count = 0;
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.bus.mapper().map(Mapper::cartridge)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn crashed(&self) -> bool {
        self.cpu.crashed()
    }

    pub fn request_interrupt(&mut self, kind: Interrupt) {
        self.cpu.request_interrupt(kind);
    }

    /// Execute one instruction and run the peripherals over its cycles.
    /// Returns the CPU cycles spent and whether a frame finished.
    fn step_once(&mut self) -> (u32, bool) {
        let mut cycles = self.cpu.step(&mut self.bus);
        if cycles == 0 {
            return (0, false);
        }
        if self.pal {
            self.pal_counter += 1;
            if self.pal_counter == 5 {
                self.pal_counter = 0;
                cycles += 1;
            }
        }
        let tick = self.bus.tick(cycles, self.cpu.irq_line_mut());
        (cycles, tick.frame_complete)
    }

    /// One instruction; returns elapsed CPU cycles (0 once crashed).
    pub fn step(&mut self) -> u32 {
        let (cycles, frame_complete) = self.step_once();
        if frame_complete {
            self.frame_count += 1;
        }
        cycles
    }

    /// Step until the picture unit completes a frame or the CPU crashes.
    pub fn run_frame(&mut self) -> FrameOutcome {
        loop {
            let (cycles, frame_complete) = self.step_once();
            if cycles == 0 {
                return FrameOutcome::Crashed;
            }
            if frame_complete {
                self.frame_count += 1;
                return FrameOutcome::Complete;
            }
        }
    }

    /// Run whole frames until the count is reached, the CPU crashes, or the
    /// host raises the stop flag.
    pub fn run_frames(&mut self, frames: u64, stop: Option<&AtomicBool>) -> FrameOutcome {
        for _ in 0..frames {
            if let Some(flag) = stop {
                if flag.load(Ordering::Relaxed) {
                    return FrameOutcome::Stopped;
                }
            }
            if self.run_frame() == FrameOutcome::Crashed {
                return FrameOutcome::Crashed;
            }
        }
        FrameOutcome::Complete
    }

    /// Emit the battery-RAM save line when it changed since the last flush.
    /// After the first write failure persistence stops; memory writes keep
    /// working.
    pub fn flush_save(&mut self, sink: &mut dyn io::Write) {
        let Some(mapper) = self.bus.mapper_mut() else {
            return;
        };
        if !mapper.take_save_dirty() || self.save_failed {
            return;
        }
        let Some(ram) = mapper.save_ram() else {
            return;
        };
        let line = format!(
            "save:{} data:{}\n",
            mapper.cartridge().hash(),
            to_hex(ram)
        );
        if let Err(err) = sink.write_all(line.as_bytes()) {
            self.save_failed = true;
            log::warn!("failed to persist battery RAM: {err}");
        }
    }

    /// Serialize CPU, internal RAM and mapper state.
    pub fn save_snapshot(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new();
        self.cpu.save_state(&mut w);
        self.bus.save_state(&mut w);
        if let Some(mapper) = self.bus.mapper() {
            mapper.save_state(&mut w);
        }
        w.into_bytes()
    }

    pub fn restore_snapshot(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        let mut r = SnapshotReader::new(data);
        self.cpu.load_state(&mut r)?;
        self.bus.load_state(&mut r)?;
        if let Some(mapper) = self.bus.mapper_mut() {
            mapper.load_state(&mut r)?;
        }
        Ok(())
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{CHR_BANK_SIZE, PRG_BANK_SIZE};
    use crate::cpu::CpuBus;

    /// One 16 KiB PRG bank of NOPs with the reset vector at $C000 and the
    /// requested bytes patched in from that address.
    fn nop_cart(program: &[u8]) -> Vec<u8> {
        let mut prg = vec![0xEAu8; PRG_BANK_SIZE];
        prg[..program.len()].copy_from_slice(program);
        prg[0x3FFC] = 0x00;
        prg[0x3FFD] = 0xC0;
        let mut rom = Vec::new();
        rom.extend_from_slice(b"NES\x1A");
        rom.push(1);
        rom.push(1);
        rom.extend_from_slice(&[0u8; 10]);
        rom.extend_from_slice(&prg);
        rom.extend_from_slice(&[0u8; 2 * CHR_BANK_SIZE]);
        rom
    }

    #[test]
    fn reset_loads_vector_and_documented_state() {
        let mut machine = Machine::new();
        machine.load_rom(&nop_cart(&[])).unwrap();
        machine.reset();
        assert_eq!(machine.cpu().registers().pc, 0xC000);
        assert_eq!(machine.cpu().registers().sp, 0xFD);
        assert_eq!(machine.cpu().status().pack(), 0x24);
    }

    #[test]
    fn lda_immediate_through_the_whole_stack() {
        let mut machine = Machine::new();
        machine.load_rom(&nop_cart(&[0xA9, 0x42])).unwrap();
        machine.reset();
        let cycles = machine.step();
        assert_eq!(cycles, 2);
        assert_eq!(machine.cpu().registers().a, 0x42);
        assert_eq!(machine.cpu().registers().pc, 0xC002);
        assert!(!machine.cpu().status().zero());
        assert!(!machine.cpu().status().negative());
    }

    #[test]
    fn run_frame_reaches_the_frame_boundary() {
        let mut machine = Machine::new();
        machine.load_rom(&nop_cart(&[])).unwrap();
        machine.reset();
        assert_eq!(machine.run_frame(), FrameOutcome::Complete);
        assert_eq!(machine.frame_count(), 1);
        // A NTSC frame is ~29780.5 CPU cycles.
        let cycles = machine.cpu().total_cycles();
        assert!((29_000..31_000).contains(&cycles), "cycles = {cycles}");
    }

    #[test]
    fn illegal_opcode_latches_crash_and_stops_the_loop() {
        let mut machine = Machine::new();
        machine.load_rom(&nop_cart(&[0x02])).unwrap();
        machine.reset();
        assert_eq!(machine.run_frame(), FrameOutcome::Crashed);
        assert!(machine.crashed());
        assert_eq!(machine.step(), 0);
    }

    #[test]
    fn pal_stretch_adds_a_cycle_every_fifth_instruction() {
        let mut ntsc = Machine::new();
        ntsc.load_rom(&nop_cart(&[])).unwrap();
        ntsc.reset();
        let mut pal = Machine::new();
        pal.load_rom(&nop_cart(&[])).unwrap();
        pal.set_pal(true);
        pal.reset();
        let ntsc_total: u32 = (0..10).map(|_| ntsc.step()).sum();
        let pal_total: u32 = (0..10).map(|_| pal.step()).sum();
        assert_eq!(pal_total, ntsc_total + 2);
    }

    #[test]
    fn stop_flag_is_observed_between_frames() {
        let mut machine = Machine::new();
        machine.load_rom(&nop_cart(&[])).unwrap();
        machine.reset();
        let stop = AtomicBool::new(true);
        assert_eq!(machine.run_frames(5, Some(&stop)), FrameOutcome::Stopped);
        assert_eq!(machine.frame_count(), 0);
    }

    #[test]
    fn save_flush_emits_once_and_only_when_dirty() {
        let mut machine = Machine::new();
        let mut rom = nop_cart(&[]);
        rom[6] = 0x02; // battery bit
        machine.load_rom(&rom).unwrap();
        machine.reset();

        let mut sink = Vec::new();
        machine.flush_save(&mut sink);
        assert!(sink.is_empty());

        machine.bus_mut().write(0x6000, 0xAB);
        machine.flush_save(&mut sink);
        let line = String::from_utf8(sink).unwrap();
        assert!(line.starts_with("save:"));
        assert!(line.contains(" data:ab"));
        assert_eq!(line.len(), "save:".len() + 64 + " data:".len() + 2 * 8192 + 1);
    }

    #[test]
    fn snapshot_roundtrip_restores_cpu_and_ram() {
        let mut machine = Machine::new();
        machine.load_rom(&nop_cart(&[0xA9, 0x55, 0x85, 0x10])).unwrap();
        machine.reset();
        machine.step();
        machine.step();
        let snapshot = machine.save_snapshot();

        let mut other = Machine::new();
        other.load_rom(&nop_cart(&[0xA9, 0x55, 0x85, 0x10])).unwrap();
        other.reset();
        other.restore_snapshot(&snapshot).unwrap();
        assert_eq!(other.cpu().registers().a, 0x55);
        assert_eq!(other.cpu().registers().pc, 0xC004);
        assert_eq!(other.bus_mut().read(0x0010), 0x55);
    }
}
