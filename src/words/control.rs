//! Control flow.
//!
//! The immediate compiling words lay down absolute branch targets after
//! the runtime reference; the runtimes implement the jump by rewriting the
//! resume address sitting on top of the return stack. Loop parameters live
//! on the return stack beneath the resume address.

use super::{compile_ref, must_compile};
use crate::vm::{CELL, Cell, VAddr, Vm};

pub(crate) fn register(vm: &mut Vm) {
    vm.define_primitive("(BRANCH)", branch_rt);
    vm.define_primitive("(0BRANCH)", zero_branch_rt);
    vm.define_primitive("(DO)", do_rt);
    vm.define_primitive("(LOOP)", loop_rt);
    vm.define_primitive("(+LOOP)", plus_loop_rt);
    vm.define_primitive("I", loop_i);
    vm.define_primitive("J", loop_j);
    vm.define_primitive("LEAVE", leave);

    vm.define_immediate("IF", if_w);
    vm.define_immediate("ELSE", else_w);
    vm.define_immediate("THEN", then_w);
    vm.define_immediate("BEGIN", begin_w);
    vm.define_immediate("UNTIL", until_w);
    vm.define_immediate("AGAIN", again_w);
    vm.define_immediate("WHILE", while_w);
    vm.define_immediate("REPEAT", repeat_w);
    vm.define_immediate("DO", do_w);
    vm.define_immediate("LOOP", loop_w);
    vm.define_immediate("+LOOP", plus_loop_w);
}

// ===== runtimes =====

fn resume(vm: &mut Vm) -> Option<Cell> {
    vm.rtop_mut().map(|t| *t)
}

fn set_resume(vm: &mut Vm, target: Cell) {
    if let Some(t) = vm.rtop_mut() {
        *t = target;
    }
}

/// Unconditional jump: the cell at the resume address is the target.
fn branch_rt(vm: &mut Vm) {
    let Some(at) = resume(vm) else { return };
    let target = vm.load_cell(at as VAddr);
    if !vm.error {
        set_resume(vm, target);
    }
}

/// Jump when the popped flag is zero, otherwise step over the target cell.
fn zero_branch_rt(vm: &mut Vm) {
    let flag = vm.pop();
    if vm.error {
        return;
    }
    let Some(at) = resume(vm) else { return };
    if flag == 0 {
        let target = vm.load_cell(at as VAddr);
        if !vm.error {
            set_resume(vm, target);
        }
    } else {
        set_resume(vm, at + CELL as Cell);
    }
}

/// `( limit index -- )` moves the loop parameters to the return stack.
fn do_rt(vm: &mut Vm) {
    let index = vm.pop();
    let limit = vm.pop();
    if vm.error {
        return;
    }
    vm.rpush_user(limit);
    vm.rpush_user(index);
}

fn finish_loop(vm: &mut Vm, continues: bool, limit: Cell, next: Cell) {
    let Some(at) = resume(vm) else { return };
    if continues {
        vm.rpush_user(limit);
        vm.rpush_user(next);
        let target = vm.load_cell(at as VAddr);
        if !vm.error {
            set_resume(vm, target);
        }
    } else {
        set_resume(vm, at + CELL as Cell);
    }
}

fn loop_rt(vm: &mut Vm) {
    let index = vm.rpop_user();
    let limit = vm.rpop_user();
    if vm.error {
        return;
    }
    let next = index.wrapping_add(1);
    finish_loop(vm, next < limit, limit, next);
}

fn plus_loop_rt(vm: &mut Vm) {
    let step = vm.pop();
    let index = vm.rpop_user();
    let limit = vm.rpop_user();
    if vm.error {
        return;
    }
    let next = index.wrapping_add(step);
    let done = if step >= 0 { next >= limit } else { next < limit };
    finish_loop(vm, !done, limit, next);
}

fn loop_i(vm: &mut Vm) {
    let v = vm.rpeek_user(0);
    if !vm.error {
        vm.push(v);
    }
}

fn loop_j(vm: &mut Vm) {
    let v = vm.rpeek_user(2);
    if !vm.error {
        vm.push(v);
    }
}

/// Force the enclosing loop to terminate at its next LOOP.
fn leave(vm: &mut Vm) {
    let _index = vm.rpop_user();
    let limit = vm.rpop_user();
    if vm.error {
        return;
    }
    vm.rpush_user(limit);
    vm.rpush_user(limit);
}

// ===== compilers =====

/// Compile a runtime reference plus a placeholder target; push the
/// placeholder's vaddr for later resolution.
fn open_forward(vm: &mut Vm, runtime: &str) {
    compile_ref(vm, runtime);
    vm.align();
    let orig = vm.here() as Cell;
    vm.comma(0);
    vm.push(orig);
}

fn resolve_forward(vm: &mut Vm) {
    let Some(orig) = vm.pop_vaddr() else { return };
    let here = vm.here() as Cell;
    vm.store_cell(orig, here);
}

fn if_w(vm: &mut Vm) {
    if must_compile(vm, "IF") {
        open_forward(vm, "(0BRANCH)");
    }
}

fn else_w(vm: &mut Vm) {
    if !must_compile(vm, "ELSE") {
        return;
    }
    let Some(orig) = vm.pop_vaddr() else { return };
    open_forward(vm, "(BRANCH)");
    let here = vm.here() as Cell;
    vm.store_cell(orig, here);
}

fn then_w(vm: &mut Vm) {
    if must_compile(vm, "THEN") {
        resolve_forward(vm);
    }
}

fn begin_w(vm: &mut Vm) {
    if !must_compile(vm, "BEGIN") {
        return;
    }
    vm.align();
    let dest = vm.here() as Cell;
    vm.push(dest);
}

fn close_backward(vm: &mut Vm, runtime: &str) {
    let dest = vm.pop();
    if vm.error {
        return;
    }
    compile_ref(vm, runtime);
    vm.comma(dest);
}

fn until_w(vm: &mut Vm) {
    if must_compile(vm, "UNTIL") {
        close_backward(vm, "(0BRANCH)");
    }
}

fn again_w(vm: &mut Vm) {
    if must_compile(vm, "AGAIN") {
        close_backward(vm, "(BRANCH)");
    }
}

fn while_w(vm: &mut Vm) {
    if !must_compile(vm, "WHILE") {
        return;
    }
    let dest = vm.pop();
    if vm.error {
        return;
    }
    open_forward(vm, "(0BRANCH)");
    let orig = vm.pop();
    if vm.error {
        return;
    }
    vm.push(orig);
    vm.push(dest);
}

fn repeat_w(vm: &mut Vm) {
    if !must_compile(vm, "REPEAT") {
        return;
    }
    close_backward(vm, "(BRANCH)");
    resolve_forward(vm);
}

fn do_w(vm: &mut Vm) {
    if !must_compile(vm, "DO") {
        return;
    }
    compile_ref(vm, "(DO)");
    vm.align();
    let dest = vm.here() as Cell;
    vm.push(dest);
}

fn loop_w(vm: &mut Vm) {
    if must_compile(vm, "LOOP") {
        close_backward(vm, "(LOOP)");
    }
}

fn plus_loop_w(vm: &mut Vm) {
    if must_compile(vm, "+LOOP") {
        close_backward(vm, "(+LOOP)");
    }
}
