//! Fastmem fault path: a JIT-emitted `load`/`store` that
//! touches a dynamic (MMIO) page faults against `protected_base`, since that
//! alias is left `PROT_NONE` over dynamic pages ([`AddressSpace::mount`]).
//! [`X64Backend::handle_exception`] decodes the faulting `mov`, re-derives
//! the guest address from the same registers the instruction was about to
//! use, performs the access through [`AddressSpace`]'s slow, checked path,
//! then rewrites the saved `rip` to skip the faulting instruction so the
//! block resumes as if the `mov` had completed normally.
//!
//! A block that has ever taken this path is marked `BF_SLOWMEM` and
//! recompiled without fastmem lowering the next time it's invalidated
//! (`BlockCache::mark_slowmem_and_invalidate`), since a fault on the hot
//! path is expensive enough that it isn't worth eating again every time.

use crate::address_space::AddressSpace;
use crate::exception::{Exception, ThreadState};

use super::mov_decoder::{decode_mov, DecodedMov};

/// Reads `mov.reg`'s current value out of the captured register file.
fn read_gpr(state: &ThreadState, index: u8) -> u64 {
    match index {
        0 => state.rax as u64,
        1 => state.rcx as u64,
        2 => state.rdx as u64,
        3 => state.rbx as u64,
        4 => state.rsp as u64,
        5 => state.rbp as u64,
        6 => state.rsi as u64,
        7 => state.rdi as u64,
        8 => state.r8 as u64,
        9 => state.r9 as u64,
        10 => state.r10 as u64,
        11 => state.r11 as u64,
        12 => state.r12 as u64,
        13 => state.r13 as u64,
        14 => state.r14 as u64,
        15 => state.r15 as u64,
        _ => 0,
    }
}

fn write_gpr(state: &mut ThreadState, index: u8, value: u64) {
    let slot = match index {
        0 => &mut state.rax,
        1 => &mut state.rcx,
        2 => &mut state.rdx,
        3 => &mut state.rbx,
        4 => &mut state.rsp,
        5 => &mut state.rbp,
        6 => &mut state.rsi,
        7 => &mut state.rdi,
        8 => &mut state.r8,
        9 => &mut state.r9,
        10 => &mut state.r10,
        11 => &mut state.r11,
        12 => &mut state.r12,
        13 => &mut state.r13,
        14 => &mut state.r14,
        15 => &mut state.r15,
        _ => return,
    };
    *slot = value as usize;
}

/// Every fastmem access this backend emits indexes `[vbase + addr]` with no
/// scale and no displacement (`asm::load_mem_indexed`/`store_mem_indexed`),
/// so the guest address is always exactly the `index` register's low 32
/// bits — recovering it needs no knowledge of which register held `vbase`.
fn guest_addr_of(mov: &DecodedMov, state: &ThreadState) -> Option<u32> {
    if !mov.has_index {
        return None;
    }
    Some(read_gpr(state, mov.index) as u32)
}

/// Attempts to service `ex` as a fastmem fault. Returns `true` (and rewrites
/// `ex.thread_state.rip` to skip the instruction) if `ex.pc` decoded as one
/// of this backend's `load`/`store` encodings and the memory access
/// completed.
pub fn handle(memory: &AddressSpace, ex: &mut Exception) -> bool {
    let Some(mov) = (unsafe { decode_mov(ex.pc as *const u8) }) else {
        return false;
    };
    let Some(addr) = guest_addr_of(&mov, &ex.thread_state) else {
        return false;
    };

    if mov.is_load {
        let value = match mov.operand_size {
            1 => memory.read8(addr) as u64,
            2 => memory.read16(addr) as u64,
            4 => memory.read32(addr) as u64,
            8 => memory.read64(addr),
            _ => return false,
        };
        write_gpr(&mut ex.thread_state, mov.reg, value);
    } else {
        let value = read_gpr(&ex.thread_state, mov.reg);
        match mov.operand_size {
            1 => memory.write8(addr, value as u8),
            2 => memory.write16(addr, value as u16),
            4 => memory.write32(addr, value as u32),
            8 => memory.write64(addr, value),
            _ => return false,
        }
    }

    ex.thread_state.rip += mov.length;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_addr_recovered_from_index_register() {
        let mov = DecodedMov { has_index: true, index: 6, operand_size: 4, is_load: true, reg: 0, length: 3, ..Default::default() };
        let mut state = ThreadState::default();
        state.rsi = 0x0c00_1000;
        assert_eq!(guest_addr_of(&mov, &state), Some(0x0c00_1000));
    }

    #[test]
    fn non_indexed_encoding_is_not_our_fastmem_shape() {
        let mov = DecodedMov { has_index: false, ..Default::default() };
        assert_eq!(guest_addr_of(&mov, &ThreadState::default()), None);
    }
}
