//! Stack manipulation words.

use crate::vm::{Cell, Vm};

pub(crate) fn register(vm: &mut Vm) {
    vm.define_primitive("DUP", dup);
    vm.define_primitive("?DUP", question_dup);
    vm.define_primitive("DROP", drop_top);
    vm.define_primitive("SWAP", swap);
    vm.define_primitive("OVER", over);
    vm.define_primitive("ROT", rot);
    vm.define_primitive("PICK", pick);
    vm.define_primitive("DEPTH", depth);
    vm.define_primitive(">R", to_r);
    vm.define_primitive("R>", r_from);
    vm.define_primitive("R@", r_fetch);
}

fn dup(vm: &mut Vm) {
    let v = vm.peek(0);
    if !vm.error {
        vm.push(v);
    }
}

fn question_dup(vm: &mut Vm) {
    let v = vm.peek(0);
    if !vm.error && v != 0 {
        vm.push(v);
    }
}

fn drop_top(vm: &mut Vm) {
    vm.pop();
}

fn swap(vm: &mut Vm) {
    let a = vm.pop();
    let b = vm.pop();
    if vm.error {
        return;
    }
    vm.push(a);
    vm.push(b);
}

fn over(vm: &mut Vm) {
    let v = vm.peek(1);
    if !vm.error {
        vm.push(v);
    }
}

fn rot(vm: &mut Vm) {
    let c = vm.pop();
    let b = vm.pop();
    let a = vm.pop();
    if vm.error {
        return;
    }
    vm.push(b);
    vm.push(c);
    vm.push(a);
}

fn pick(vm: &mut Vm) {
    let n = vm.pop();
    if vm.error {
        return;
    }
    if n < 0 {
        vm.fail("PICK: negative index");
        return;
    }
    let v = vm.peek(n as usize);
    if !vm.error {
        vm.push(v);
    }
}

fn depth(vm: &mut Vm) {
    let d = vm.depth() as Cell;
    vm.push(d);
}

fn to_r(vm: &mut Vm) {
    let v = vm.pop();
    if !vm.error {
        vm.rpush_user(v);
    }
}

fn r_from(vm: &mut Vm) {
    let v = vm.rpop_user();
    if !vm.error {
        vm.push(v);
    }
}

fn r_fetch(vm: &mut Vm) {
    let v = vm.rpeek_user(0);
    if !vm.error {
        vm.push(v);
    }
}
