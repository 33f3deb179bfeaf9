//! Forth-79 core word set.
//!
//! Primitives are plain `fn(&mut Vm)` registered into the dictionary at
//! boot. Compile-time control words are IMMEDIATE and lay down references
//! to runtime primitives whose names are parenthesised, `(0BRANCH)` style;
//! those runtimes steer the inner interpreter by patching the resume
//! address on top of the return stack.

mod arith;
mod blocks;
mod control;
mod defining;
mod io;
mod memory;
mod stack;
mod telemetry;

use crate::vm::Vm;

/// Register the boot word set. Called once from `Vm::new` before the
/// FORGET fence is placed.
pub fn register_core(vm: &mut Vm) {
    defining::register(vm);
    stack::register(vm);
    arith::register(vm);
    memory::register(vm);
    control::register(vm);
    io::register(vm);
    blocks::register(vm);
    telemetry::register(vm);
}

/// Compile a reference to a named primitive into the open body.
pub(crate) fn compile_ref(vm: &mut Vm, name: &str) {
    match vm.dict.probe(name.as_bytes()) {
        Some(id) => vm.compile_word(id),
        None => vm.fail(&format!("{name} not found")),
    }
}

/// Control words are only meaningful inside a definition.
pub(crate) fn must_compile(vm: &mut Vm, word: &str) -> bool {
    if vm.mode() != crate::vm::Mode::Compile {
        vm.fail(&format!("{word} outside a definition"));
        return false;
    }
    true
}
