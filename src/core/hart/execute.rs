//! Instruction execution: the fetch -> decode -> execute -> retire loop.
//!
//! Dispatches a [`Decoded`] instruction to the RV64I base integer set, the M
//! (multiply/divide), A (atomic), F (single-precision float), and C (compressed,
//! via [`crate::isa::rvc::expand`]) extensions, plus the privileged `SYSTEM` opcode
//! (CSR access, `ECALL`/`EBREAK`, `MRET`/`SRET`, `WFI`, `SFENCE.VMA`).

use crate::common::data::AccessType;
use crate::common::error::Trap;
use crate::common::addr::VirtAddr;
use crate::core::arch::csr::{MSTATUS_MPRV, MSTATUS_MPP, MSTATUS_MPP_SHIFT, MSTATUS_TW};
use crate::core::arch::mode::PrivilegeMode;
use crate::core::hart::Hart;
use crate::core::units::lsu::{atomic_alu, unaligned, AtomicOp, MemWidth};
use crate::isa::instruction::Decoded;
use crate::isa::privileged::opcodes as sys;
use crate::isa::{rv64a, rv64f, rv64i, rv64m};
use crate::soc::interconnect::Bus;

/// Runs one fetch/decode/execute/retire cycle. Traps (synchronous exceptions from
/// this instruction, or an interrupt recognized beforehand) are delivered internally
/// and never returned to the caller: the machine's run loop just calls `step` in a
/// tight loop.
pub fn step(hart: &mut Hart, bus: &mut Bus) {
    hart.csrs.mcycle = hart.csrs.mcycle.wrapping_add(1);

    if let Some(irq) = crate::core::hart::trap::pending_interrupt(hart) {
        crate::core::hart::trap::deliver(hart, irq);
        return;
    }

    if hart.waiting_for_interrupt {
        return;
    }

    let pc = hart.pc;
    let raw = match fetch(hart, bus, pc) {
        Ok(raw) => raw,
        Err(trap) => {
            crate::core::hart::trap::deliver(hart, trap);
            return;
        }
    };

    let (decoded, len) = hart.decode_at(raw, pc);

    match dispatch(hart, bus, &decoded, pc, len) {
        Ok(next_pc) => {
            hart.pc = next_pc.unwrap_or(pc + len);
            hart.csrs.minstret = hart.csrs.minstret.wrapping_add(1);
            hart.instructions_retired += 1;
        }
        Err(trap) => crate::core::hart::trap::deliver(hart, trap),
    }
}

/// Fetches one instruction word at `pc`. Reads 2 bytes first to determine whether
/// the instruction is compressed (RVC) before deciding whether a second halfword is
/// needed, since a 4-byte instruction may straddle a page boundary.
fn fetch(hart: &mut Hart, bus: &mut Bus, pc: u64) -> Result<u32, Trap> {
    let paddr = translate(hart, bus, pc, AccessType::Fetch)?;
    let low = bus.read_u16(paddr.val()).ok_or(Trap::InstructionAccessFault(pc))?;
    if (low & 0b11) != 0b11 {
        return Ok(u32::from(low));
    }
    if paddr.val() & 0xFFF <= 0xFFC {
        let word = bus.read_u32(paddr.val()).ok_or(Trap::InstructionAccessFault(pc))?;
        return Ok(word);
    }
    let paddr_hi = translate(hart, bus, pc + 2, AccessType::Fetch)?;
    let high = bus.read_u16(paddr_hi.val()).ok_or(Trap::InstructionAccessFault(pc + 2))?;
    Ok(u32::from(low) | (u32::from(high) << 16))
}

fn effective_privilege_for(hart: &Hart, access: AccessType) -> PrivilegeMode {
    if access == AccessType::Fetch {
        return hart.privilege;
    }
    if hart.csrs.mstatus & MSTATUS_MPRV != 0 {
        let mpp = (hart.csrs.mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT;
        PrivilegeMode::from_u8(mpp as u8)
    } else {
        hart.privilege
    }
}

fn translate(hart: &mut Hart, bus: &mut Bus, vaddr: u64, access: AccessType) -> Result<crate::common::addr::PhysAddr, Trap> {
    let privilege = effective_privilege_for(hart, access);
    match hart.mmu.translate(VirtAddr::new(vaddr), access, privilege, &hart.csrs, bus) {
        crate::common::error::TranslationResult::Ok(p) => Ok(p),
        crate::common::error::TranslationResult::Fault(t) => Err(t),
    }
}

/// Loads `size` bytes from `vaddr`, checking alignment then translating and reading
/// through the bus.
fn load(hart: &mut Hart, bus: &mut Bus, vaddr: u64, size: u64) -> Result<u64, Trap> {
    if !unaligned::is_aligned(vaddr, size) {
        return Err(unaligned::load_misaligned_trap(vaddr));
    }
    let paddr = translate(hart, bus, vaddr, AccessType::Read)?;
    let val = match size {
        1 => u64::from(bus.read_u8(paddr.val()).ok_or(Trap::LoadAccessFault(vaddr))?),
        2 => u64::from(bus.read_u16(paddr.val()).ok_or(Trap::LoadAccessFault(vaddr))?),
        4 => u64::from(bus.read_u32(paddr.val()).ok_or(Trap::LoadAccessFault(vaddr))?),
        8 => bus.read_u64(paddr.val()).ok_or(Trap::LoadAccessFault(vaddr))?,
        _ => unreachable!("load size must be 1/2/4/8"),
    };
    Ok(val)
}

/// Stores `size` bytes of `val` to `vaddr`, checking alignment then translating and
/// writing through the bus.
fn store(hart: &mut Hart, bus: &mut Bus, vaddr: u64, val: u64, size: u64) -> Result<(), Trap> {
    if !unaligned::is_aligned(vaddr, size) {
        return Err(unaligned::store_misaligned_trap(vaddr));
    }
    let paddr = translate(hart, bus, vaddr, AccessType::Write)?;
    hart.reservation = None;
    let ok = match size {
        1 => bus.write_u8(paddr.val(), val as u8),
        2 => bus.write_u16(paddr.val(), val as u16),
        4 => bus.write_u32(paddr.val(), val as u32),
        8 => bus.write_u64(paddr.val(), val),
        _ => unreachable!("store size must be 1/2/4/8"),
    };
    if ok {
        Ok(())
    } else {
        Err(Trap::StoreAccessFault(vaddr))
    }
}

/// Dispatches one decoded instruction. Returns the next `pc` override (for
/// jumps/branches/traps-within-xret) or `None` to fall through to `pc + len`.
fn dispatch(hart: &mut Hart, bus: &mut Bus, d: &Decoded, pc: u64, len: u64) -> Result<Option<u64>, Trap> {
    use rv64i::opcodes as op;

    match d.opcode {
        op::OP_LUI => {
            hart.regs.write(d.rd, d.imm as u64);
            Ok(None)
        }
        op::OP_AUIPC => {
            hart.regs.write(d.rd, pc.wrapping_add(d.imm as u64));
            Ok(None)
        }
        op::OP_JAL => {
            hart.regs.write(d.rd, pc + len);
            Ok(Some(pc.wrapping_add(d.imm as u64)))
        }
        op::OP_JALR => {
            let target = (hart.regs.read(d.rs1).wrapping_add(d.imm as u64)) & !1;
            hart.regs.write(d.rd, pc + len);
            Ok(Some(target))
        }
        op::OP_BRANCH => exec_branch(hart, d, pc, len),
        op::OP_LOAD => exec_load(hart, bus, d),
        op::OP_STORE => exec_store(hart, bus, d),
        op::OP_IMM => {
            hart.regs.write(d.rd, exec_op_imm(hart.regs.read(d.rs1), d));
            Ok(None)
        }
        op::OP_IMM_32 => {
            let result = exec_op_imm_32(hart.regs.read(d.rs1), d)?;
            hart.regs.write(d.rd, result);
            Ok(None)
        }
        op::OP_REG => {
            let result = exec_op_reg(hart, d)?;
            hart.regs.write(d.rd, result);
            Ok(None)
        }
        op::OP_REG_32 => {
            let result = exec_op_reg_32(hart, d)?;
            hart.regs.write(d.rd, result);
            Ok(None)
        }
        op::OP_MISC_MEM => {
            if d.funct3 == rv64i::funct3::FENCE_I {
                hart.flush_decode_cache();
            }
            Ok(None) // FENCE: no reordering model to enforce; treated as a no-op
        }
        sys::OP_SYSTEM => exec_system(hart, d, pc),
        rv64a::opcodes::OP_AMO => exec_amo(hart, bus, d),
        rv64f::opcodes::OP_LOAD_FP => {
            let vaddr = hart.regs.read(d.rs1).wrapping_add(d.imm as u64);
            let val = load(hart, bus, vaddr, 4)?;
            hart.regs.write_f(d.rd, nan_box(val as u32));
            Ok(None)
        }
        rv64f::opcodes::OP_STORE_FP => {
            let vaddr = hart.regs.read(d.rs1).wrapping_add(d.imm as u64);
            let bits = hart.regs.read_f(d.rs2) as u32;
            store(hart, bus, vaddr, u64::from(bits), 4)?;
            Ok(None)
        }
        rv64f::opcodes::OP_FP => exec_fp(hart, d),
        _ => Err(Trap::IllegalInstruction(d.raw)),
    }
}

fn exec_branch(hart: &mut Hart, d: &Decoded, pc: u64, len: u64) -> Result<Option<u64>, Trap> {
    use rv64i::funct3 as f3;
    let a = hart.regs.read(d.rs1);
    let b = hart.regs.read(d.rs2);
    let taken = match d.funct3 {
        f3::BEQ => a == b,
        f3::BNE => a != b,
        f3::BLT => (a as i64) < (b as i64),
        f3::BGE => (a as i64) >= (b as i64),
        f3::BLTU => a < b,
        f3::BGEU => a >= b,
        _ => return Err(Trap::IllegalInstruction(d.raw)),
    };
    if taken {
        let target = pc.wrapping_add(d.imm as u64);
        if target & 1 != 0 {
            return Err(Trap::InstructionAddressMisaligned(target));
        }
        Ok(Some(target))
    } else {
        Ok(Some(pc + len))
    }
}

fn exec_load(hart: &mut Hart, bus: &mut Bus, d: &Decoded) -> Result<Option<u64>, Trap> {
    use rv64i::funct3 as f3;
    let vaddr = hart.regs.read(d.rs1).wrapping_add(d.imm as u64);
    let val = match d.funct3 {
        f3::LB => load(hart, bus, vaddr, 1)? as i8 as i64 as u64,
        f3::LH => load(hart, bus, vaddr, 2)? as i16 as i64 as u64,
        f3::LW => load(hart, bus, vaddr, 4)? as i32 as i64 as u64,
        f3::LD => load(hart, bus, vaddr, 8)?,
        f3::LBU => load(hart, bus, vaddr, 1)?,
        f3::LHU => load(hart, bus, vaddr, 2)?,
        f3::LWU => load(hart, bus, vaddr, 4)?,
        _ => return Err(Trap::IllegalInstruction(d.raw)),
    };
    hart.regs.write(d.rd, val);
    Ok(None)
}

fn exec_store(hart: &mut Hart, bus: &mut Bus, d: &Decoded) -> Result<Option<u64>, Trap> {
    use rv64i::funct3 as f3;
    let vaddr = hart.regs.read(d.rs1).wrapping_add(d.imm as u64);
    let val = hart.regs.read(d.rs2);
    match d.funct3 {
        f3::SB => store(hart, bus, vaddr, val, 1)?,
        f3::SH => store(hart, bus, vaddr, val, 2)?,
        f3::SW => store(hart, bus, vaddr, val, 4)?,
        f3::SD => store(hart, bus, vaddr, val, 8)?,
        _ => return Err(Trap::IllegalInstruction(d.raw)),
    }
    Ok(None)
}

fn exec_op_imm(rs1: u64, d: &Decoded) -> u64 {
    use rv64i::funct3 as f3;
    let imm = d.imm as u64;
    match d.funct3 {
        f3::ADD_SUB => rs1.wrapping_add(imm),
        f3::SLT => u64::from((rs1 as i64) < (d.imm)),
        f3::SLTU => u64::from(rs1 < imm),
        f3::XOR => rs1 ^ imm,
        f3::OR => rs1 | imm,
        f3::AND => rs1 & imm,
        f3::SLL => rs1 << (imm & 0x3F),
        f3::SRL_SRA => {
            let shamt = imm & 0x3F;
            if d.funct7 & 0b0100000 != 0 {
                ((rs1 as i64) >> shamt) as u64
            } else {
                rs1 >> shamt
            }
        }
        _ => unreachable!("funct3 is a 3-bit field with all eight values handled"),
    }
}

fn exec_op_imm_32(rs1: u64, d: &Decoded) -> Result<u64, Trap> {
    use rv64i::funct3 as f3;
    let rs1 = rs1 as i32;
    let imm = d.imm as i32;
    let result = match d.funct3 {
        f3::ADD_SUB => rs1.wrapping_add(imm),
        f3::SLL => rs1.wrapping_shl((imm & 0x1F) as u32),
        f3::SRL_SRA => {
            let shamt = (imm & 0x1F) as u32;
            if d.funct7 & 0b0100000 != 0 {
                rs1 >> shamt
            } else {
                ((rs1 as u32) >> shamt) as i32
            }
        }
        _ => return Err(Trap::IllegalInstruction(d.raw)),
    };
    Ok(result as i64 as u64)
}

fn exec_op_reg(hart: &Hart, d: &Decoded) -> Result<u64, Trap> {
    use rv64i::{funct3 as f3, funct7};
    use rv64m::{funct3 as m3, opcodes::M_EXTENSION};
    let a = hart.regs.read(d.rs1);
    let b = hart.regs.read(d.rs2);
    if d.funct7 == M_EXTENSION {
        return Ok(match d.funct3 {
            m3::MUL => a.wrapping_mul(b),
            m3::MULH => (((a as i64) as i128 * (b as i64) as i128) >> 64) as u64,
            m3::MULHSU => (((a as i64) as i128 * b as i128) >> 64) as u64,
            m3::MULHU => ((u128::from(a) * u128::from(b)) >> 64) as u64,
            m3::DIV => {
                if b == 0 {
                    u64::MAX
                } else if a as i64 == i64::MIN && b as i64 == -1 {
                    a
                } else {
                    ((a as i64).wrapping_div(b as i64)) as u64
                }
            }
            m3::DIVU => if b == 0 { u64::MAX } else { a / b },
            m3::REM => {
                if b == 0 {
                    a
                } else if a as i64 == i64::MIN && b as i64 == -1 {
                    0
                } else {
                    ((a as i64).wrapping_rem(b as i64)) as u64
                }
            }
            m3::REMU => if b == 0 { a } else { a % b },
            _ => return Err(Trap::IllegalInstruction(d.raw)),
        });
    }
    Ok(match (d.funct3, d.funct7) {
        (f3::ADD_SUB, funct7::DEFAULT) => a.wrapping_add(b),
        (f3::ADD_SUB, funct7::SUB) => a.wrapping_sub(b),
        (f3::SLL, _) => a << (b & 0x3F),
        (f3::SLT, _) => u64::from((a as i64) < (b as i64)),
        (f3::SLTU, _) => u64::from(a < b),
        (f3::XOR, _) => a ^ b,
        (f3::SRL_SRA, funct7::DEFAULT) => a >> (b & 0x3F),
        (f3::SRL_SRA, funct7::SUB) => ((a as i64) >> (b & 0x3F)) as u64,
        (f3::OR, _) => a | b,
        (f3::AND, _) => a & b,
        _ => return Err(Trap::IllegalInstruction(d.raw)),
    })
}

fn exec_op_reg_32(hart: &Hart, d: &Decoded) -> Result<u64, Trap> {
    use rv64i::{funct3 as f3, funct7};
    use rv64m::{funct3 as m3, opcodes::M_EXTENSION};
    let a = hart.regs.read(d.rs1) as i32;
    let b = hart.regs.read(d.rs2) as i32;
    if d.funct7 == M_EXTENSION {
        return Ok(match d.funct3 {
            m3::MUL => (a.wrapping_mul(b)) as i64 as u64,
            m3::DIV => {
                if b == 0 {
                    u64::MAX
                } else if a == i32::MIN && b == -1 {
                    a as i64 as u64
                } else {
                    (a.wrapping_div(b)) as i64 as u64
                }
            }
            m3::DIVU => {
                if b == 0 {
                    u64::MAX
                } else {
                    ((a as u32) / (b as u32)) as i32 as i64 as u64
                }
            }
            m3::REM => {
                if b == 0 {
                    a as i64 as u64
                } else if a == i32::MIN && b == -1 {
                    0
                } else {
                    (a.wrapping_rem(b)) as i64 as u64
                }
            }
            m3::REMU => {
                if b == 0 {
                    a as i64 as u64
                } else {
                    ((a as u32) % (b as u32)) as i32 as i64 as u64
                }
            }
            _ => return Err(Trap::IllegalInstruction(d.raw)),
        });
    }
    let result = match (d.funct3, d.funct7) {
        (f3::ADD_SUB, funct7::DEFAULT) => a.wrapping_add(b),
        (f3::ADD_SUB, funct7::SUB) => a.wrapping_sub(b),
        (f3::SLL, _) => a.wrapping_shl((b & 0x1F) as u32),
        (f3::SRL_SRA, funct7::DEFAULT) => ((a as u32) >> (b & 0x1F) as u32) as i32,
        (f3::SRL_SRA, funct7::SUB) => a >> (b & 0x1F),
        _ => return Err(Trap::IllegalInstruction(d.raw)),
    };
    Ok(result as i64 as u64)
}

fn exec_amo(hart: &mut Hart, bus: &mut Bus, d: &Decoded) -> Result<Option<u64>, Trap> {
    use rv64a::{funct3, funct5};
    let addr = hart.regs.read(d.rs1);
    let width = match d.funct3 {
        funct3::WIDTH_32 => MemWidth::Word,
        funct3::WIDTH_64 => MemWidth::Double,
        _ => return Err(Trap::IllegalInstruction(d.raw)),
    };
    let size = if width == MemWidth::Word { 4 } else { 8 };
    let op5 = d.funct7 >> 2;

    if op5 == funct5::LR {
        let val = load(hart, bus, addr, size)?;
        let sign_extended = if size == 4 { val as i32 as i64 as u64 } else { val };
        hart.regs.write(d.rd, sign_extended);
        hart.reservation = Some(addr);
        return Ok(None);
    }
    if op5 == funct5::SC {
        if hart.reservation == Some(addr) {
            let val = hart.regs.read(d.rs2);
            store(hart, bus, addr, val, size)?;
            hart.regs.write(d.rd, 0);
        } else {
            hart.regs.write(d.rd, 1);
        }
        hart.reservation = None;
        return Ok(None);
    }

    let op = match op5 {
        funct5::AMOSWAP => AtomicOp::Swap,
        funct5::AMOADD => AtomicOp::Add,
        funct5::AMOXOR => AtomicOp::Xor,
        funct5::AMOAND => AtomicOp::And,
        funct5::AMOOR => AtomicOp::Or,
        funct5::AMOMIN => AtomicOp::Min,
        funct5::AMOMAX => AtomicOp::Max,
        funct5::AMOMINU => AtomicOp::Minu,
        funct5::AMOMAXU => AtomicOp::Maxu,
        _ => return Err(Trap::IllegalInstruction(d.raw)),
    };
    let mem_val = load(hart, bus, addr, size)?;
    let reg_val = hart.regs.read(d.rs2);
    let new_val = atomic_alu(op, mem_val, reg_val, width);
    store(hart, bus, addr, new_val, size)?;
    let loaded = if size == 4 { mem_val as i32 as i64 as u64 } else { mem_val };
    hart.regs.write(d.rd, loaded);
    Ok(None)
}

/// NaN-boxes a single-precision value into the 64-bit float register representation.
fn nan_box(bits: u32) -> u64 {
    0xFFFF_FFFF_0000_0000 | u64::from(bits)
}

/// Reads `idx` as a single-precision value, returning the canonical quiet NaN if the
/// register does not hold a properly NaN-boxed single value.
fn read_f32(hart: &Hart, idx: usize) -> f32 {
    let bits = hart.regs.read_f(idx);
    if bits >> 32 == 0xFFFF_FFFF {
        f32::from_bits(bits as u32)
    } else {
        f32::NAN
    }
}

fn write_f32(hart: &mut Hart, idx: usize, val: f32) {
    hart.regs.write_f(idx, nan_box(val.to_bits()));
}

fn exec_fp(hart: &mut Hart, d: &Decoded) -> Result<Option<u64>, Trap> {
    use rv64f::{funct3, funct7};
    let a = read_f32(hart, d.rs1);
    let b = read_f32(hart, d.rs2);

    match d.funct7 {
        funct7::FADD => write_f32(hart, d.rd, a + b),
        funct7::FSUB => write_f32(hart, d.rd, a - b),
        funct7::FMUL => write_f32(hart, d.rd, a * b),
        funct7::FDIV => write_f32(hart, d.rd, a / b),
        funct7::FSQRT => write_f32(hart, d.rd, a.sqrt()),
        funct7::FSGNJ => {
            let result = match d.funct3 {
                funct3::FSGNJ => a.copysign(b),
                funct3::FSGNJN => a.copysign(-b),
                funct3::FSGNJX => f32::from_bits(a.to_bits() ^ (b.to_bits() & 0x8000_0000)),
                _ => return Err(Trap::IllegalInstruction(d.raw)),
            };
            write_f32(hart, d.rd, result);
        }
        funct7::FMIN_MAX => {
            let result = match d.funct3 {
                funct3::FMIN => a.min(b),
                funct3::FMAX => a.max(b),
                _ => return Err(Trap::IllegalInstruction(d.raw)),
            };
            write_f32(hart, d.rd, result);
        }
        funct7::FCMP => {
            let result = match d.funct3 {
                funct3::FEQ => u64::from(a == b),
                funct3::FLT => u64::from(a < b),
                funct3::FLE => u64::from(a <= b),
                _ => return Err(Trap::IllegalInstruction(d.raw)),
            };
            hart.regs.write(d.rd, result);
        }
        funct7::FCLASS_MV_X_F => {
            if d.funct3 == funct3::FCLASS {
                hart.regs.write(d.rd, fclass(a));
            } else {
                hart.regs.write(d.rd, i64::from(a.to_bits() as i32) as u64);
            }
        }
        funct7::FCVT_W_F => {
            let signed = d.rs2 == 0;
            let val = if signed {
                (a as i32) as i64 as u64
            } else {
                (a as u32) as u64
            };
            hart.regs.write(d.rd, val);
        }
        funct7::FCVT_F_W => {
            let signed = d.rs2 == 0;
            let src = hart.regs.read(d.rs1);
            let result = if signed { src as i32 as f32 } else { src as u32 as f32 };
            write_f32(hart, d.rd, result);
        }
        funct7::FMV_F_X => {
            let bits = hart.regs.read(d.rs1) as u32;
            hart.regs.write_f(d.rd, nan_box(bits));
        }
        _ => return Err(Trap::IllegalInstruction(d.raw)),
    }
    Ok(None)
}

fn fclass(v: f32) -> u64 {
    let bits = v.to_bits();
    let sign = bits >> 31 != 0;
    if v.is_nan() {
        let quiet = bits & 0x0040_0000 != 0;
        return if quiet { 1 << 9 } else { 1 << 8 };
    }
    if v.is_infinite() {
        return if sign { 1 << 0 } else { 1 << 7 };
    }
    if v == 0.0 {
        return if sign { 1 << 3 } else { 1 << 4 };
    }
    let is_subnormal = v.is_subnormal();
    match (sign, is_subnormal) {
        (true, true) => 1 << 2,
        (true, false) => 1 << 1,
        (false, true) => 1 << 5,
        (false, false) => 1 << 6,
    }
}

fn exec_system(hart: &mut Hart, d: &Decoded, pc: u64) -> Result<Option<u64>, Trap> {
    use crate::isa::instruction::InstructionBits;
    use crate::isa::privileged::opcodes::{CSRRC, CSRRCI, CSRRS, CSRRSI, CSRRW, CSRRWI};

    /// `SFENCE.VMA`'s `funct7` selector (bits 31:25); `rs1`/`rs2` vary per invocation,
    /// so it cannot be matched as a single fixed encoding the way `MRET`/`WFI` can.
    const SFENCE_VMA_FUNCT7: u32 = 0b0001001;

    if d.funct3 == 0 {
        if d.funct7 == SFENCE_VMA_FUNCT7 {
            let rs1 = d.rs1;
            let rs2 = d.rs2;
            if rs1 == 0 && rs2 == 0 {
                hart.mmu.flush_all();
            } else if rs2 == 0 {
                hart.mmu.dtlb.flush_addr(hart.regs.read(rs1));
                hart.mmu.itlb.flush_addr(hart.regs.read(rs1));
            } else {
                let asid = hart.regs.read(rs2) as u16;
                hart.mmu.dtlb.flush_asid(asid);
                hart.mmu.itlb.flush_asid(asid);
            }
            hart.flush_decode_cache();
            return Ok(None);
        }
        return match d.raw {
            sys::ECALL => Err(match hart.privilege {
                PrivilegeMode::User => Trap::EnvironmentCallFromUMode,
                PrivilegeMode::Supervisor => Trap::EnvironmentCallFromSMode,
                PrivilegeMode::Machine => Trap::EnvironmentCallFromMMode,
            }),
            sys::EBREAK => Err(Trap::Breakpoint(pc)),
            sys::MRET => crate::core::hart::trap::xret(hart, true).map(|()| Some(hart.pc)),
            sys::SRET => crate::core::hart::trap::xret(hart, false).map(|()| Some(hart.pc)),
            sys::WFI => {
                let traps = hart.privilege == PrivilegeMode::User
                    || (hart.privilege == PrivilegeMode::Supervisor && hart.csrs.mstatus & MSTATUS_TW != 0);
                if traps {
                    return Err(Trap::IllegalInstruction(d.raw));
                }
                hart.waiting_for_interrupt = true;
                Ok(None)
            }
            _ => Err(Trap::IllegalInstruction(d.raw)),
        };
    }

    let addr = InstructionBits::csr(&d.raw);
    let is_imm = d.funct3 == CSRRWI || d.funct3 == CSRRSI || d.funct3 == CSRRCI;
    let is_write_only = d.funct3 == CSRRW || d.funct3 == CSRRWI;
    let source = if is_imm { d.rs1 as u64 } else { hart.regs.read(d.rs1) };

    let old = if is_write_only && d.rd == 0 {
        0
    } else {
        hart.read_csr(addr).ok_or(Trap::IllegalInstruction(d.raw))?
    };

    let rs1_is_zero = d.rs1 == 0;
    let should_write = is_write_only || !rs1_is_zero;
    if should_write {
        let new_val = match d.funct3 {
            f if f == CSRRW || f == CSRRWI => source,
            f if f == CSRRS || f == CSRRSI => old | source,
            f if f == CSRRC || f == CSRRCI => old & !source,
            _ => return Err(Trap::IllegalInstruction(d.raw)),
        };
        if !hart.write_csr(addr, new_val) {
            return Err(Trap::IllegalInstruction(d.raw));
        }
    }
    hart.regs.write(d.rd, old);
    Ok(None)
}
