//! Reference toy-ISA executor.
//!
//! Fixed 32-bit little-endian instruction words, sixteen 64-bit registers
//! with `r0` hard-wired to zero, single-cycle execution. Field layout:
//! opcode `[31:24]`, rd `[23:16]`, rs `[15:8]`, imm16 `[15:0]`, off8 `[7:0]`
//! (signed, used by memory and branch forms).
//!
//! The executor owns no bus: fetches, loads, and stores go through the
//! attached [`CpuHost`], which also provides breakpoint checks and the trace
//! sink.

use std::sync::Arc;

use crate::cpu::{
    AccessKind, CpuExecutor, CpuHost, FaultInfo, FaultKind, MemAccess, StepResult,
};
use crate::trace::{BranchDetails, MemAccessEvent, TraceRecord};

const OP_NOP: u8 = 0x00;
const OP_LUI: u8 = 0x01;
const OP_ORI: u8 = 0x02;
const OP_LW: u8 = 0x03;
const OP_SW: u8 = 0x04;
const OP_BEQ: u8 = 0x05;
const OP_HALT: u8 = 0x7f;

const REG_COUNT: u32 = 16;
const INST_BYTES: u32 = 4;

fn opcode(inst: u32) -> u8 {
    (inst >> 24) as u8
}

fn rd(inst: u32) -> u8 {
    (inst >> 16) as u8
}

fn rs(inst: u32) -> u8 {
    (inst >> 8) as u8
}

fn imm16(inst: u32) -> u16 {
    inst as u16
}

fn off8(inst: u32) -> i8 {
    inst as u8 as i8
}

/// Instruction encoders for the toy ISA, used by tests and tooling.
pub mod asm {
    fn encode_rimm16(op: u8, rd: u8, imm: u16) -> u32 {
        (u32::from(op) << 24) | (u32::from(rd) << 16) | u32::from(imm)
    }

    fn encode_mem(op: u8, r0: u8, r1: u8, off: i8) -> u32 {
        (u32::from(op) << 24) | (u32::from(r0) << 16) | (u32::from(r1) << 8) | u32::from(off as u8)
    }

    pub fn nop() -> u32 {
        encode_rimm16(super::OP_NOP, 0, 0)
    }

    pub fn halt() -> u32 {
        encode_rimm16(super::OP_HALT, 0, 0)
    }

    pub fn lui(rd: u8, imm16: u16) -> u32 {
        encode_rimm16(super::OP_LUI, rd, imm16)
    }

    pub fn ori(rd: u8, imm16: u16) -> u32 {
        encode_rimm16(super::OP_ORI, rd, imm16)
    }

    /// `rd = mem[rs + off]`
    pub fn lw(rd: u8, rs: u8, off: i8) -> u32 {
        encode_mem(super::OP_LW, rd, rs, off)
    }

    /// `mem[base + off] = rs`
    pub fn sw(rs: u8, base: u8, off: i8) -> u32 {
        encode_mem(super::OP_SW, rs, base, off)
    }

    pub fn beq(r0: u8, r1: u8, off: i8) -> u32 {
        encode_mem(super::OP_BEQ, r0, r1, off)
    }
}

/// The reference executor over the toy ISA.
pub struct ToyCpu {
    regs: [u64; REG_COUNT as usize],
    pc: u64,
    cycle: u64,
    last_error: FaultInfo,
    host: Option<Arc<dyn CpuHost>>,
}

impl ToyCpu {
    pub fn new() -> Self {
        Self {
            regs: [0; REG_COUNT as usize],
            pc: 0,
            cycle: 0,
            last_error: FaultInfo::default(),
            host: None,
        }
    }

    fn reg(&self, index: u8) -> u64 {
        let index = u32::from(index);
        if index == 0 || index >= REG_COUNT {
            return 0;
        }
        self.regs[index as usize]
    }

    fn set_reg(&mut self, index: u8, value: u64) {
        let index = u32::from(index);
        if index == 0 || index >= REG_COUNT {
            return;
        }
        self.regs[index as usize] = value;
    }

    fn fault(&mut self, kind: FaultKind, address: u64, size: u32) {
        self.last_error = FaultInfo::new(kind, address, size);
    }

    fn event(kind: AccessKind, access: &MemAccess, data: u64, latency: u32) -> MemAccessEvent {
        MemAccessEvent {
            kind,
            address: access.address,
            size: access.size,
            data,
            latency_cycles: latency,
        }
    }

    /// Execute one instruction. Returns false when the step failed (fault or
    /// halt); the breakpoint gate lives in the caller.
    fn step_one(&mut self, host: &Arc<dyn CpuHost>) -> bool {
        let opts = host.trace_options();
        let mut record = opts.any().then(|| TraceRecord {
            pc: self.pc,
            cycle_begin: self.cycle,
            ..Default::default()
        });

        let fetch_access = MemAccess::fetch(self.pc, INST_BYTES);
        let fetch = host.bus_read(&fetch_access);
        if let Some(rec) = record.as_mut() {
            if opts.log_mem_events {
                rec.mem_events.push(Self::event(
                    AccessKind::Fetch,
                    &fetch_access,
                    fetch.data,
                    fetch.latency_cycles,
                ));
            }
        }
        if !fetch.ok {
            self.last_error = fetch.error;
            if opts.log_mem_events {
                if let Some(mut rec) = record {
                    rec.decoded = "FETCH_ERROR".into();
                    rec.cycle_end = self.cycle;
                    host.log_trace(&rec);
                }
            }
            return false;
        }
        let inst = fetch.data as u32;
        if let Some(rec) = record.as_mut() {
            rec.inst = inst;
        }

        let pc_before = self.pc;
        self.pc += u64::from(INST_BYTES);
        self.cycle += 1;

        let mut failed = false;
        let op = opcode(inst);
        match op {
            OP_NOP => {
                if let Some(rec) = record.as_mut() {
                    rec.decoded = "NOP".into();
                }
            }
            OP_HALT => {
                if let Some(rec) = record.as_mut() {
                    rec.decoded = "HALT".into();
                }
                self.fault(FaultKind::Halt, pc_before, INST_BYTES);
                failed = true;
            }
            OP_LUI => {
                let value = u64::from(imm16(inst)) << 16;
                self.set_reg(rd(inst), value);
                if let Some(rec) = record.as_mut() {
                    rec.decoded = format!("LUI r{}, 0x{:x}", rd(inst), imm16(inst));
                }
            }
            OP_ORI => {
                let value = self.reg(rd(inst)) | u64::from(imm16(inst));
                self.set_reg(rd(inst), value);
                if let Some(rec) = record.as_mut() {
                    rec.decoded = format!("ORI r{}, 0x{:x}", rd(inst), imm16(inst));
                }
            }
            OP_LW => {
                let base = rs(inst);
                let offset = off8(inst);
                let address = self.reg(base).wrapping_add(offset as u64);
                let access = MemAccess::read(address, 4);
                let resp = host.bus_read(&access);
                if let Some(rec) = record.as_mut() {
                    rec.decoded = format!("LW r{}, [r{}{:+}]", rd(inst), base, offset);
                    if opts.log_mem_events {
                        rec.mem_events.push(Self::event(
                            AccessKind::Read,
                            &access,
                            resp.data,
                            resp.latency_cycles,
                        ));
                    }
                }
                if resp.ok {
                    self.set_reg(rd(inst), resp.data & 0xffff_ffff);
                } else {
                    self.last_error = resp.error;
                    failed = true;
                }
            }
            OP_SW => {
                let source = rd(inst);
                let base = rs(inst);
                let offset = off8(inst);
                let address = self.reg(base).wrapping_add(offset as u64);
                let data = self.reg(source) & 0xffff_ffff;
                let access = MemAccess::write(address, 4, data);
                let resp = host.bus_write(&access);
                if let Some(rec) = record.as_mut() {
                    rec.decoded = format!("SW r{}, [r{}{:+}]", source, base, offset);
                    if opts.log_mem_events {
                        rec.mem_events.push(Self::event(
                            AccessKind::Write,
                            &access,
                            data,
                            resp.latency_cycles,
                        ));
                    }
                }
                if !resp.ok {
                    self.last_error = resp.error;
                    failed = true;
                }
            }
            OP_BEQ => {
                let a = rd(inst);
                let b = rs(inst);
                let offset = off8(inst);
                let taken = self.reg(a) == self.reg(b);
                // Offset is measured from the post-increment pc, in words.
                let fallthrough = self.pc;
                let target = fallthrough.wrapping_add((i64::from(offset) * 4) as u64);
                if taken {
                    self.pc = target;
                }
                if let Some(rec) = record.as_mut() {
                    rec.decoded = format!("BEQ r{}, r{}, {}", a, b, offset);
                    rec.is_branch = true;
                    rec.branch = BranchDetails {
                        taken,
                        target,
                        predicted_taken: false,
                        predicted_target: fallthrough,
                    };
                }
            }
            _ => {
                if let Some(rec) = record.as_mut() {
                    rec.decoded = format!("INVALID(0x{:02x})", op);
                }
                self.fault(FaultKind::InvalidOp, pc_before, INST_BYTES);
                failed = true;
            }
        }

        if let Some(mut rec) = record {
            rec.cycle_end = self.cycle;
            let yielded = opts.log_instruction
                || (opts.log_branch_prediction && rec.is_branch)
                || (opts.log_mem_events && !rec.mem_events.is_empty());
            if yielded {
                host.log_trace(&rec);
            }
        }

        !failed
    }
}

impl Default for ToyCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuExecutor for ToyCpu {
    fn reset(&mut self) {
        self.regs = [0; REG_COUNT as usize];
        self.pc = 0;
        self.cycle = 0;
        self.last_error = FaultInfo::default();
    }

    fn step(&mut self, max_instructions: u64, max_cycles: u64) -> StepResult {
        let mut result = StepResult::empty();
        let Some(host) = self.host.clone() else {
            self.fault(FaultKind::DeviceFault, self.pc, 0);
            result.ok = false;
            return result;
        };
        while result.instructions < max_instructions && result.cycles < max_cycles {
            if host.has_breakpoints() && host.is_breakpoint(self.pc) {
                // Stop before executing the breakpointed instruction; no
                // cycle is consumed and no error is recorded.
                result.ok = false;
                return result;
            }
            let cycle_before = self.cycle;
            let ok = self.step_one(&host);
            result.cycles += self.cycle - cycle_before;
            if self.cycle != cycle_before {
                result.instructions += 1;
            }
            if !ok {
                result.ok = false;
                return result;
            }
        }
        result
    }

    fn last_error(&self) -> FaultInfo {
        self.last_error
    }

    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn cycle(&self) -> u64 {
        self.cycle
    }

    fn register(&self, index: u32) -> u64 {
        if index == 0 || index >= REG_COUNT {
            return 0;
        }
        self.regs[index as usize]
    }

    fn set_register(&mut self, index: u32, value: u64) {
        if index == 0 || index >= REG_COUNT {
            return;
        }
        self.regs[index as usize] = value;
    }

    fn register_count(&self) -> u32 {
        REG_COUNT
    }

    fn attach_host(&mut self, host: Arc<dyn CpuHost>) {
        self.host = Some(host);
    }
}
