//! A host-side executor for entry-point stubs.
//!
//! [`ThunkDispatcher`] interprets just enough real-mode code to run the
//! status stubs modules put at their entry points:
//!
//! | bytes      | instruction    |
//! |------------|----------------|
//! | `B8 iw`    | `MOV AX, imm16`|
//! | `BA iw`    | `MOV DX, imm16`|
//! | `31 C0` / `33 C0` | `XOR AX, AX` |
//! | `31 D2` / `33 D2` | `XOR DX, DX` |
//! | `40` / `48`| `INC AX` / `DEC AX` |
//! | `90`       | `NOP`          |
//! | `F8` / `F9`| `CLC` / `STC`  |
//! | `C3` / `CB`| `RET` / `RETF` |
//!
//! Every byte is fetched through the arena and only from memory the module
//! still owns, so a stub in a discarded cold region cannot run.

use crate::{
    Result,
    addr::FarPtr,
    arena::Arena,
    error::custom_error,
    lifecycle::{EntryCall, EntryDispatcher, EntryOutcome},
    segment::ModuleSegments,
};
use alloc::format;

/// Default limit on executed instructions per call.
pub const MAX_STEPS: usize = 256;

/// Interpreter for entry-point stubs.
#[derive(Clone, Copy, Debug)]
pub struct ThunkDispatcher {
    max_steps: usize,
}

impl Default for ThunkDispatcher {
    fn default() -> Self {
        Self {
            max_steps: MAX_STEPS,
        }
    }
}

impl ThunkDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the instruction limit after which a call is reported as runaway.
    pub fn with_step_limit(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

struct Cpu<'a, A: Arena> {
    arena: &'a A,
    segments: &'a ModuleSegments,
    ip: u16,
    ax: u16,
    dx: u16,
    carry: bool,
}

impl<A: Arena> Cpu<'_, A> {
    fn fetch(&mut self) -> Result<u8> {
        let ip = self.ip;
        if !self.segments.is_live(ip as usize, 1) {
            return Err(custom_error(format!(
                "instruction fetch at {} outside live module memory",
                FarPtr::new(self.segments.base(), ip)
            )));
        }
        let mut byte = [0u8];
        self.arena
            .read(FarPtr::new(self.segments.base(), ip), &mut byte)?;
        self.ip = ip.wrapping_add(1);
        Ok(byte[0])
    }

    fn fetch_u16(&mut self) -> Result<u16> {
        let lo = self.fetch()?;
        let hi = self.fetch()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Executes one instruction. Returns `true` on a return instruction.
    fn step(&mut self) -> Result<bool> {
        let at = self.ip;
        let op = self.fetch()?;
        match op {
            0xB8 => self.ax = self.fetch_u16()?,
            0xBA => self.dx = self.fetch_u16()?,
            0x31 | 0x33 => {
                match self.fetch()? {
                    0xC0 => self.ax = 0,
                    0xD2 => self.dx = 0,
                    modrm => return Err(unsupported(self.segments, at, &[op, modrm])),
                }
                self.carry = false;
            }
            0x40 => self.ax = self.ax.wrapping_add(1),
            0x48 => self.ax = self.ax.wrapping_sub(1),
            0x90 => {}
            0xF8 => self.carry = false,
            0xF9 => self.carry = true,
            0xC3 | 0xCB => return Ok(true),
            _ => return Err(unsupported(self.segments, at, &[op])),
        }
        Ok(false)
    }
}

#[cold]
fn unsupported(segments: &ModuleSegments, at: u16, bytes: &[u8]) -> crate::Error {
    custom_error(format!(
        "unsupported instruction {:02x?} at {}",
        bytes,
        FarPtr::new(segments.base(), at)
    ))
}

impl EntryDispatcher for ThunkDispatcher {
    fn call<A: Arena>(
        &mut self,
        arena: &mut A,
        segments: &ModuleSegments,
        call: EntryCall,
    ) -> Result<EntryOutcome> {
        if call.target.selector != segments.base() {
            return Err(custom_error(format!(
                "{:?} entry {} is not in the module at 0x{:04x}",
                call.kind,
                call.target,
                segments.base()
            )));
        }
        let mut cpu = Cpu {
            arena: &*arena,
            segments,
            ip: call.target.offset,
            ax: 0,
            dx: 0,
            carry: false,
        };
        for _ in 0..self.max_steps {
            if cpu.step()? {
                let outcome = EntryOutcome {
                    ax: cpu.ax,
                    dx: cpu.dx,
                    carry: cpu.carry,
                };
                #[cfg(feature = "log")]
                log::trace!(
                    "[Thunk] {:?} {} returned DX:AX {:04x}:{:04x}, CF {}",
                    call.kind,
                    call.target,
                    outcome.dx,
                    outcome.ax,
                    outcome.carry as u8
                );
                return Ok(outcome);
            }
        }
        Err(custom_error(format!(
            "{:?} entry {} did not return within {} instructions",
            call.kind, call.target, self.max_steps
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arena::ParagraphArena,
        header::ModuleHeader,
        lifecycle::EntryKind,
        segment::SegmentAllocator,
    };

    fn module(stub: &[u8], cold: u16) -> (ParagraphArena, ModuleSegments) {
        let mut raw = [0u8; 64];
        raw[0x08..0x0A].copy_from_slice(&12u16.to_le_bytes());
        raw[0x0A..0x0C].copy_from_slice(&(12 - cold).to_le_bytes());
        raw[0x0C..0x0E].copy_from_slice(&cold.to_le_bytes());
        let header = ModuleHeader::parse(&raw).unwrap();
        let mut image = alloc::vec![0u8; 128];
        image[0x40..0x40 + stub.len()].copy_from_slice(stub);
        let mut arena = ParagraphArena::default();
        let segs = SegmentAllocator::default()
            .reserve(&mut arena, &header, &image)
            .unwrap();
        (arena, segs)
    }

    fn run(arena: &mut ParagraphArena, segs: &ModuleSegments, offset: u16) -> Result<EntryOutcome> {
        ThunkDispatcher::new().call(
            arena,
            segs,
            EntryCall {
                kind: EntryKind::Export,
                target: FarPtr::new(segs.base(), offset),
                function: 0,
            },
        )
    }

    #[test]
    fn returns_dx_ax() {
        // mov ax, 0; mov dx, 1; retf
        let (mut arena, segs) = module(&[0xB8, 0x00, 0x00, 0xBA, 0x01, 0x00, 0xCB], 0);
        let outcome = run(&mut arena, &segs, 0x40).unwrap();
        assert_eq!(outcome.value(), 0x0001_0000);
        assert!(!outcome.carry);
    }

    #[test]
    fn carry_and_arithmetic() {
        // xor ax, ax; inc ax; inc ax; dec ax; nop; stc; ret
        let (mut arena, segs) = module(&[0x31, 0xC0, 0x40, 0x40, 0x48, 0x90, 0xF9, 0xC3], 0);
        let outcome = run(&mut arena, &segs, 0x40).unwrap();
        assert_eq!(outcome.ax, 1);
        assert!(outcome.carry);
    }

    #[test]
    fn rejects_unknown_and_runaway_code() {
        let (mut arena, segs) = module(&[0xCD, 0x21], 0);
        assert!(run(&mut arena, &segs, 0x40).is_err());
        let (mut arena, segs) = module(&[0x90; 64], 0);
        let err = ThunkDispatcher::new()
            .with_step_limit(16)
            .call(
                &mut arena,
                &segs,
                EntryCall {
                    kind: EntryKind::Init,
                    target: FarPtr::new(segs.base(), 0x40),
                    function: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, crate::Error::Custom { .. }));
    }

    #[test]
    fn refuses_to_fetch_from_reclaimed_memory() {
        // resident 0x00..0x80, cold 0x80..0xC0
        let (mut arena, mut segs) = module(&[0xC3], 4);
        arena.write(FarPtr::new(segs.base(), 0x90), &[0xC3]).unwrap();
        assert!(run(&mut arena, &segs, 0x90).is_ok());
        SegmentAllocator::default()
            .reclaim_cold_region(&mut arena, &mut segs)
            .unwrap();
        assert!(run(&mut arena, &segs, 0x90).is_err());
        assert!(run(&mut arena, &segs, 0x40).is_ok());
    }
}
