//! Console output words.

use super::compile_ref;
use crate::vm::{CELL, Cell, Mode, VAddr, Vm};

pub(crate) fn register(vm: &mut Vm) {
    vm.define_primitive(".", dot);
    vm.define_primitive(".S", dot_s);
    vm.define_primitive("EMIT", emit);
    vm.define_primitive("CR", cr);
    vm.define_primitive("SPACE", space);
    vm.define_primitive("SPACES", spaces);
    vm.define_primitive("BL", bl);
    vm.define_primitive("TYPE", type_w);
    vm.define_primitive("(.\")", dot_quote_rt);
    vm.define_immediate(".\"", dot_quote);
    vm.define_immediate("(", paren_comment);
    vm.define_immediate("\\", line_comment);
}

fn dot(vm: &mut Vm) {
    let v = vm.pop();
    if vm.error {
        return;
    }
    let s = vm.format_cell(v);
    vm.print(&s);
    vm.print(" ");
}

fn dot_s(vm: &mut Vm) {
    let cells: Vec<Cell> = vm.data_stack.clone();
    let mut line = format!("<{}> ", cells.len());
    for v in cells {
        line.push_str(&vm.format_cell(v));
        line.push(' ');
    }
    vm.print(&line);
}

fn emit(vm: &mut Vm) {
    let v = vm.pop();
    if vm.error {
        return;
    }
    let c = char::from_u32(v as u32).unwrap_or('?');
    vm.print_char(c);
}

fn cr(vm: &mut Vm) {
    vm.print("\n");
}

fn space(vm: &mut Vm) {
    vm.print(" ");
}

fn spaces(vm: &mut Vm) {
    let n = vm.pop();
    if vm.error {
        return;
    }
    for _ in 0..n.max(0) {
        vm.print(" ");
    }
}

fn bl(vm: &mut Vm) {
    vm.push(Cell::from(b' '));
}

fn type_w(vm: &mut Vm) {
    let len = vm.pop();
    let Some(addr) = vm.pop_vaddr() else { return };
    if vm.error || len <= 0 {
        return;
    }
    let mut text = Vec::with_capacity(len as usize);
    for i in 0..len as u32 {
        text.push(vm.load_u8(addr + i));
        if vm.error {
            return;
        }
    }
    vm.print(&String::from_utf8_lossy(&text));
}

/// Runtime of `."`: an inline counted string follows the reference; print
/// it and resume past the cell-aligned end.
fn dot_quote_rt(vm: &mut Vm) {
    let Some(at) = vm.rtop_mut().map(|t| *t) else {
        return;
    };
    let len = vm.load_cell(at as VAddr);
    if vm.error || len < 0 {
        return;
    }
    let start = at as VAddr + CELL as VAddr;
    let mut text = Vec::with_capacity(len as usize);
    for i in 0..len as u32 {
        text.push(vm.load_u8(start + i));
        if vm.error {
            return;
        }
    }
    vm.print(&String::from_utf8_lossy(&text));

    let end = (at as usize + CELL + len as usize).next_multiple_of(CELL);
    if let Some(t) = vm.rtop_mut() {
        *t = end as Cell;
    }
}

fn dot_quote(vm: &mut Vm) {
    vm.skip_one_blank();
    let text = vm.parse_until(b'"');
    if vm.mode() != Mode::Compile {
        vm.print(&String::from_utf8_lossy(&text));
        return;
    }
    compile_ref(vm, "(.\")");
    vm.comma(text.len() as Cell);
    if let Some(at) = vm.allot(text.len()) {
        for (i, &b) in text.iter().enumerate() {
            vm.store_u8(at + i as VAddr, b);
        }
    }
    vm.align();
}

fn paren_comment(vm: &mut Vm) {
    vm.parse_until(b')');
}

fn line_comment(vm: &mut Vm) {
    // Consume the rest of the input line.
    vm.parse_until(0);
}
