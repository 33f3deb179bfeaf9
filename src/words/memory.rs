//! Arena access words.

use crate::vm::{CELL, Cell, VM_MEMORY_SIZE, Vm};

pub(crate) fn register(vm: &mut Vm) {
    vm.define_primitive("@", fetch);
    vm.define_primitive("!", store);
    vm.define_primitive("C@", c_fetch);
    vm.define_primitive("C!", c_store);
    vm.define_primitive("+!", plus_store);
    vm.define_primitive("FILL", fill);
    vm.define_primitive("ERASE", erase);
    vm.define_primitive("HERE", here);
    vm.define_primitive("ALLOT", allot);
    vm.define_primitive(",", comma);
    vm.define_primitive("C,", c_comma);
    vm.define_primitive("ALIGN", align);
    vm.define_primitive("CELLS", cells);
    vm.define_primitive("CELL+", cell_plus);
    vm.define_primitive("COUNT", count);
}

fn fetch(vm: &mut Vm) {
    let Some(addr) = vm.pop_vaddr() else { return };
    let v = vm.load_cell(addr);
    if !vm.error {
        vm.push(v);
    }
}

fn store(vm: &mut Vm) {
    let Some(addr) = vm.pop_vaddr() else { return };
    let v = vm.pop();
    if !vm.error {
        vm.store_cell(addr, v);
    }
}

fn c_fetch(vm: &mut Vm) {
    let Some(addr) = vm.pop_vaddr() else { return };
    let v = vm.load_u8(addr);
    if !vm.error {
        vm.push(Cell::from(v));
    }
}

fn c_store(vm: &mut Vm) {
    let Some(addr) = vm.pop_vaddr() else { return };
    let v = vm.pop();
    if !vm.error {
        vm.store_u8(addr, v as u8);
    }
}

fn plus_store(vm: &mut Vm) {
    let Some(addr) = vm.pop_vaddr() else { return };
    let n = vm.pop();
    if vm.error {
        return;
    }
    let v = vm.load_cell(addr);
    if !vm.error {
        vm.store_cell(addr, v.wrapping_add(n));
    }
}

fn fill_with(vm: &mut Vm, byte: Option<u8>) {
    let byte = match byte {
        Some(b) => b,
        None => {
            let v = vm.pop();
            if vm.error {
                return;
            }
            v as u8
        }
    };
    let n = vm.pop();
    let Some(addr) = vm.pop_vaddr() else { return };
    if vm.error {
        return;
    }
    if n < 0 || addr as usize + n as usize > VM_MEMORY_SIZE {
        vm.fail("FILL: range outside VM memory");
        return;
    }
    for i in 0..n as u32 {
        vm.store_u8(addr + i, byte);
    }
}

fn fill(vm: &mut Vm) {
    fill_with(vm, None);
}

fn erase(vm: &mut Vm) {
    fill_with(vm, Some(0));
}

fn here(vm: &mut Vm) {
    let h = vm.here() as Cell;
    vm.push(h);
}

fn allot(vm: &mut Vm) {
    let n = vm.pop();
    if vm.error {
        return;
    }
    if n >= 0 {
        vm.allot(n as usize);
    } else {
        let back = vm.here().saturating_sub(n.unsigned_abs() as usize);
        vm.reclaim_to(back);
    }
}

fn comma(vm: &mut Vm) {
    let v = vm.pop();
    if !vm.error {
        vm.comma(v);
    }
}

fn c_comma(vm: &mut Vm) {
    let v = vm.pop();
    if vm.error {
        return;
    }
    if let Some(at) = vm.allot(1) {
        vm.store_u8(at, v as u8);
    }
}

fn align(vm: &mut Vm) {
    vm.align();
}

fn cells(vm: &mut Vm) {
    let n = vm.pop();
    if !vm.error {
        vm.push(n.wrapping_mul(CELL as Cell));
    }
}

fn cell_plus(vm: &mut Vm) {
    let n = vm.pop();
    if !vm.error {
        vm.push(n.wrapping_add(CELL as Cell));
    }
}

fn count(vm: &mut Vm) {
    let Some(addr) = vm.pop_vaddr() else { return };
    let len = vm.load_u8(addr);
    if !vm.error {
        vm.push(Cell::from(addr) + 1);
        vm.push(Cell::from(len));
    }
}
